pub use nom;

mod command;
mod envelope;
mod reply;

pub use command::{Command, CommandError, Params, Verb};
pub use envelope::{
    next_crlf, Email, Hostname, Localpart, NextCrLfState, DOMAIN_MAXLEN, LOCALPART_MAXLEN,
    PATH_MAXLEN, TEXT_LINE_MAXLEN,
};
pub use reply::{
    EnhancedCode, EnhancedCodeSubject, Reply, ReplyCode, ReplyCodeKind, ReplyLine,
    MAX_REPLY_LINES,
};

#[cfg(test)]
use std::str;

/// Used as `println!("{:?}", show_bytes(b))`
#[cfg(test)]
pub(crate) fn show_bytes(b: &[u8]) -> String {
    if b.len() > 128 {
        "{too long}".into()
    } else if let Ok(s) = str::from_utf8(b) {
        s.into()
    } else {
        format!("{:?}", b)
    }
}
