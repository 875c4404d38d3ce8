use std::fmt;

/// A reply is aborted as malformed past this many continuation lines.
pub const MAX_REPLY_LINES: usize = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyCode(u16);

#[allow(dead_code)]
impl ReplyCode {
    pub const SERVICE_READY: ReplyCode = ReplyCode(220);
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode(221);
    pub const OKAY: ReplyCode = ReplyCode(250);
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode(354);
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode(421);
    pub const MAILBOX_UNAVAILABLE_TRANSIENT: ReplyCode = ReplyCode(450);
    pub const LOCAL_ERROR: ReplyCode = ReplyCode(451);
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode(452);
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode(500);
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode(501);
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode(502);
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode(503);
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode(550);
    pub const USER_NOT_LOCAL: ReplyCode = ReplyCode(551);
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode(552);

    pub fn custom(code: u16) -> ReplyCode {
        assert!((100..1000).contains(&code));
        ReplyCode(code)
    }

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn kind(self) -> ReplyCodeKind {
        match self.0 / 100 {
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

/// RFC 3463 enhanced status code, always included in replies that carry one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnhancedCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

#[allow(dead_code)]
impl EnhancedCode {
    pub const SUCCESS_UNDEFINED: EnhancedCode = EnhancedCode::new(2, 0, 0);
    pub const SUCCESS_SENDER: EnhancedCode = EnhancedCode::new(2, 1, 0);
    pub const SUCCESS_DEST_VALID: EnhancedCode = EnhancedCode::new(2, 1, 5);
    pub const TRANSIENT_SERVICE_SHUTDOWN: EnhancedCode = EnhancedCode::new(4, 7, 0);
    pub const TRANSIENT_TOO_MUCH_MAIL: EnhancedCode = EnhancedCode::new(4, 7, 1);
    pub const TRANSIENT_TRY_AGAIN: EnhancedCode = EnhancedCode::new(4, 3, 2);
    pub const TRANSIENT_NO_DISK: EnhancedCode = EnhancedCode::new(4, 4, 5);
    pub const TRANSIENT_TOO_MANY_RECIPIENTS: EnhancedCode = EnhancedCode::new(4, 5, 3);
    pub const PERMANENT_INVALID_COMMAND: EnhancedCode = EnhancedCode::new(5, 5, 1);
    pub const PERMANENT_UNDEFINED: EnhancedCode = EnhancedCode::new(5, 0, 0);
    pub const PERMANENT_SENDER_SYNTAX: EnhancedCode = EnhancedCode::new(5, 1, 7);
    pub const PERMANENT_MAILBOX_SYNTAX: EnhancedCode = EnhancedCode::new(5, 1, 3);
    pub const PERMANENT_BAD_ARGUMENTS: EnhancedCode = EnhancedCode::new(5, 5, 2);
    pub const PERMANENT_COMMAND_SYNTAX: EnhancedCode = EnhancedCode::new(5, 5, 4);
    pub const PERMANENT_WRONG_SEQUENCE: EnhancedCode = EnhancedCode::new(5, 5, 0);
    pub const PERMANENT_BAD_DEST_MAILBOX: EnhancedCode = EnhancedCode::new(5, 1, 1);
    pub const PERMANENT_NOT_LOCAL: EnhancedCode = EnhancedCode::new(5, 1, 6);
    pub const PERMANENT_MSG_TOO_BIG: EnhancedCode = EnhancedCode::new(5, 2, 3);

    pub const fn new(class: u8, subject: u16, detail: u16) -> EnhancedCode {
        EnhancedCode { class, subject, detail }
    }

    pub fn subject(&self) -> EnhancedCodeSubject {
        match self.subject {
            1 => EnhancedCodeSubject::Addressing,
            2 => EnhancedCodeSubject::Mailbox,
            3 => EnhancedCodeSubject::MailSystem,
            4 => EnhancedCodeSubject::Network,
            5 => EnhancedCodeSubject::Protocol,
            6 => EnhancedCodeSubject::Content,
            7 => EnhancedCodeSubject::Security,
            _ => EnhancedCodeSubject::Other,
        }
    }
}

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedCodeSubject {
    Other,
    Addressing,
    Mailbox,
    MailSystem,
    Network,
    Protocol,
    Content,
    Security,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply<S = String> {
    pub code: ReplyCode,
    pub ecode: Option<EnhancedCode>,
    pub text: Vec<S>,
}

impl<S: AsRef<str>> Reply<S> {
    /// Render the reply as CRLF-terminated wire lines, `-`-continued on all
    /// but the last.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let code = self.code.code();
        let digits = [
            b'0' + (code / 100 % 10) as u8,
            b'0' + (code / 10 % 10) as u8,
            b'0' + (code % 10) as u8,
        ];
        let nlines = self.text.len().max(1);
        for i in 0..nlines {
            out.extend_from_slice(&digits);
            out.push(if i + 1 == nlines { b' ' } else { b'-' });
            if let Some(e) = &self.ecode {
                out.extend_from_slice(e.to_string().as_bytes());
                if self.text.get(i).is_some() {
                    out.push(b' ');
                }
            }
            if let Some(line) = self.text.get(i) {
                out.extend_from_slice(line.as_ref().as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.write_to(&mut out);
        out
    }
}

impl<S: AsRef<str>> fmt::Display for Reply<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.code())?;
        if let Some(e) = &self.ecode {
            write!(f, " {}", e)?;
        }
        for line in &self.text {
            write!(f, " {}", line.as_ref())?;
        }
        Ok(())
    }
}

/// One line of a peer's reply, as read by the outbound engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplyLine<'a> {
    pub code: u16,
    pub is_last: bool,
    pub text: &'a [u8],
}

impl<'a> ReplyLine<'a> {
    /// Parse one complete CRLF-terminated reply line.
    pub fn parse(line: &'a [u8]) -> Result<ReplyLine<'a>, ()> {
        if line.len() < 5 || !line.ends_with(b"\r\n") {
            return Err(());
        }
        if !line[..3].iter().all(|b| b.is_ascii_digit()) {
            return Err(());
        }
        let code = line[..3]
            .iter()
            .fold(0u16, |acc, &b| acc * 10 + u16::from(b - b'0'));
        if !(100..600).contains(&code) {
            return Err(());
        }
        let (is_last, text) = match line[3] {
            b'-' => (false, &line[4..line.len() - 2]),
            b' ' => (true, &line[4..line.len() - 2]),
            b'\r' => (true, &line[3..3]),
            _ => return Err(()),
        };
        Ok(ReplyLine { code, is_last, text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_single_line() {
        let r = Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedCode::SUCCESS_SENDER),
            text: vec!["Sender ok"],
        };
        assert_eq!(r.to_wire(), b"250 2.1.0 Sender ok\r\n");
    }

    #[test]
    fn render_multi_line() {
        let r = Reply {
            code: ReplyCode::OKAY,
            ecode: None,
            text: vec!["example.org", "8BITMIME", "SIZE 16777216", "CHUNKING"],
        };
        assert_eq!(
            r.to_wire(),
            &b"250-example.org\r\n250-8BITMIME\r\n250-SIZE 16777216\r\n250 CHUNKING\r\n"[..]
        );
    }

    #[test]
    fn render_no_text() {
        let r = Reply::<String> {
            code: ReplyCode::custom(221),
            ecode: Some(EnhancedCode::SUCCESS_UNDEFINED),
            text: vec![],
        };
        assert_eq!(r.to_wire(), b"221 2.0.0\r\n");
    }

    #[test]
    fn parse_reply_lines() {
        let tests: &[(&[u8], ReplyLine)] = &[
            (
                b"250 All is well\r\n",
                ReplyLine { code: 250, is_last: true, text: b"All is well" },
            ),
            (
                b"450-Temporary\r\n",
                ReplyLine { code: 450, is_last: false, text: b"Temporary" },
            ),
            (b"250\r\n", ReplyLine { code: 250, is_last: true, text: b"" }),
            (
                b"354 Enter mail\r\n",
                ReplyLine { code: 354, is_last: true, text: b"Enter mail" },
            ),
        ];
        for (inp, out) in tests {
            assert_eq!(ReplyLine::parse(inp).as_ref(), Ok(out));
        }
    }

    #[test]
    fn parse_reply_line_invalid() {
        let tests: &[&[u8]] = &[b"25 ok\r\n", b"abc ok\r\n", b"250_ok\r\n", b"099 nope\r\n", b"\r\n"];
        for inp in tests {
            assert!(ReplyLine::parse(inp).is_err());
        }
    }
}
