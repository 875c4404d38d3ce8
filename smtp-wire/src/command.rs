use std::fmt;

use crate::envelope::{Email, Hostname, Localpart};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verb {
    Bdat,
    Data,
    Ehlo,
    Expn,
    Helo,
    Help,
    Mail,
    Noop,
    Quit,
    Rcpt,
    Rset,
    Vrfy,
}

impl Verb {
    fn from_bytes(b: &[u8]) -> Option<Verb> {
        if b.len() != 4 {
            return None;
        }
        let mut v = [0u8; 4];
        v.copy_from_slice(b);
        v.make_ascii_uppercase();
        match &v {
            b"BDAT" => Some(Verb::Bdat),
            b"DATA" => Some(Verb::Data),
            b"EHLO" => Some(Verb::Ehlo),
            b"EXPN" => Some(Verb::Expn),
            b"HELO" => Some(Verb::Helo),
            b"HELP" => Some(Verb::Help),
            b"MAIL" => Some(Verb::Mail),
            b"NOOP" => Some(Verb::Noop),
            b"QUIT" => Some(Verb::Quit),
            b"RCPT" => Some(Verb::Rcpt),
            b"RSET" => Some(Verb::Rset),
            b"VRFY" => Some(Verb::Vrfy),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Bdat => "BDAT",
            Verb::Data => "DATA",
            Verb::Ehlo => "EHLO",
            Verb::Expn => "EXPN",
            Verb::Helo => "HELO",
            Verb::Help => "HELP",
            Verb::Mail => "MAIL",
            Verb::Noop => "NOOP",
            Verb::Quit => "QUIT",
            Verb::Rcpt => "RCPT",
            Verb::Rset => "RSET",
            Verb::Vrfy => "VRFY",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ESMTP parameters trailing a MAIL or RCPT argument, `KEY[=VALUE]` each.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Params<S = String>(pub Vec<(S, Option<S>)>);

impl<S: AsRef<str>> Params<S> {
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(k, _)| k.as_ref().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref().map(|v| v.as_ref()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Params<&str> {
    pub fn to_owned(self) -> Params<String> {
        Params(
            self.0
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.map(|v| v.to_owned())))
                .collect(),
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command<S = String> {
    Bdat { chunk_size: u64, last: bool },
    Data,
    Ehlo { hostname: Hostname<S> },
    Expn { name: S },
    Helo { hostname: Hostname<S> },
    Help { subject: Option<S> },
    Mail { from: Option<Email<S>>, params: Params<S> },
    Noop,
    Quit,
    Rcpt { to: Email<S>, params: Params<S> },
    Rset,
    Vrfy { name: S },
}

/// How a command line failed to parse, mapped to 500/501 by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandError {
    /// 500: the verb (or its mandatory `FROM:`/`TO:` tag) was not recognized.
    Unrecognized,
    /// 501: the verb wants an argument and none was given.
    MissingArgument(Verb),
    /// 501: an argument was given but does not match the grammar.
    InvalidArgument(Verb),
}

fn skip_ws(buf: &[u8]) -> &[u8] {
    let n = buf.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
    &buf[n..]
}

fn is_crlf(buf: &[u8]) -> bool {
    buf.starts_with(b"\r\n")
}

fn starts_with_ignore_case(buf: &[u8], tag: &[u8]) -> bool {
    buf.len() >= tag.len() && buf[..tag.len()].eq_ignore_ascii_case(tag)
}

/// An envelope path argument: optional angle brackets, optional (skipped)
/// source route, mailbox. Returns the email, whether the bracketed
/// non-routed form was used, and the remainder of the line.
fn parse_path(arg: &[u8]) -> Result<(Email<&str>, bool, &[u8]), ()> {
    let mut ptr = arg;
    let bracketed = ptr.first() == Some(&b'<');
    if bracketed {
        ptr = &ptr[1..];
    }
    let mut routed = false;
    if ptr.first() == Some(&b'@') {
        // A-d-l ":" — skip the source route
        routed = true;
        let colon = ptr
            .iter()
            .position(|&b| b == b':' || b == b'\r')
            .ok_or(())?;
        if ptr[colon] != b':' {
            return Err(());
        }
        ptr = &ptr[colon + 1..];
    }
    let (rem, email) = if bracketed {
        Email::parse_until(b">", b">@")(ptr).map_err(|_| ())?
    } else {
        Email::parse_until(b" \t\r", b" \t\r@")(ptr).map_err(|_| ())?
    };
    let rem = if bracketed {
        if rem.first() != Some(&b'>') {
            return Err(());
        }
        &rem[1..]
    } else {
        rem
    };
    Ok((email, bracketed && !routed, rem))
}

/// Reverse-path: either the null path `<>` or a mailbox with a domain.
fn parse_reverse_path(arg: &[u8]) -> Result<(Option<Email<&str>>, &[u8]), ()> {
    if arg.starts_with(b"<>") {
        match arg.get(2) {
            Some(&b) if b > b' ' => return Err(()),
            _ => return Ok((None, &arg[2..])),
        }
    }
    let (email, _, rem) = parse_path(arg)?;
    if email.hostname.is_none() {
        return Err(());
    }
    Ok((Some(email), rem))
}

/// Forward-path: a mailbox with a domain, or the bracketed domainless
/// `<postmaster>` alias.
fn parse_forward_path(arg: &[u8]) -> Result<(Email<&str>, &[u8]), ()> {
    let (email, plain_bracketed, rem) = parse_path(arg)?;
    if email.hostname.is_none() {
        let ok = plain_bracketed
            && matches!(&email.localpart,
                        Localpart::Ascii { raw } if raw.eq_ignore_ascii_case("postmaster"));
        if !ok {
            return Err(());
        }
    }
    Ok((email, rem))
}

/// `KEY[=VALUE]` parameters up to the CRLF.
fn parse_params(arg: &[u8]) -> Result<Params<&str>, ()> {
    let mut params = Vec::new();
    let mut ptr = skip_ws(arg);
    while !ptr.starts_with(b"\r") {
        let len = ptr.iter().take_while(|&&b| b > b' ').count();
        if len == 0 {
            return Err(());
        }
        let token = std::str::from_utf8(&ptr[..len]).map_err(|_| ())?;
        match token.split_once('=') {
            Some((_, "")) => return Err(()),
            Some((k, v)) => params.push((k, Some(v))),
            None => params.push((token, None)),
        }
        ptr = skip_ws(&ptr[len..]);
    }
    if !is_crlf(ptr) {
        return Err(());
    }
    Ok(Params(params))
}

/// `chunk-size [SP "LAST"] CRLF`
fn parse_bdat_args(arg: &[u8]) -> Result<(u64, bool), ()> {
    let ndigits = arg.iter().take_while(|b| b.is_ascii_digit()).count();
    if ndigits == 0 {
        return Err(());
    }
    let mut size: u64 = 0;
    for &b in &arg[..ndigits] {
        size = size
            .checked_mul(10)
            .and_then(|s| s.checked_add(u64::from(b - b'0')))
            .ok_or(())?;
    }
    let rest = skip_ws(&arg[ndigits..]);
    if is_crlf(rest) {
        return Ok((size, false));
    }
    if !starts_with_ignore_case(rest, b"LAST") {
        return Err(());
    }
    let rest = skip_ws(&rest[4..]);
    if !is_crlf(rest) {
        return Err(());
    }
    Ok((size, true))
}

/// `domain *WSP CRLF`, the EHLO/HELO argument shape.
fn parse_domain_arg(arg: &[u8]) -> Result<Hostname<&str>, ()> {
    let (rem, hostname) = Hostname::parse_until(b" \t\r")(arg).map_err(|_| ())?;
    if !is_crlf(skip_ws(rem)) {
        return Err(());
    }
    Ok(hostname)
}

fn free_text(arg: &[u8]) -> &str {
    let len = arg.iter().take_while(|&&b| b != b'\r' && b != b'\n').count();
    std::str::from_utf8(&arg[..len]).unwrap_or("")
}

impl<'a> Command<&'a str> {
    /// Parse one complete CRLF-terminated command line.
    pub fn parse(line: &'a [u8]) -> Result<Command<&'a str>, CommandError> {
        use CommandError::*;

        let line = skip_ws(line);
        let verb_len = line.iter().take_while(|&&b| b > b' ').count();
        let verb = Verb::from_bytes(&line[..verb_len]).ok_or(Unrecognized)?;
        let arg = skip_ws(&line[verb_len..]);

        match verb {
            Verb::Bdat => {
                if arg.starts_with(b"\r") {
                    return Err(MissingArgument(verb));
                }
                let (chunk_size, last) =
                    parse_bdat_args(arg).map_err(|()| InvalidArgument(verb))?;
                Ok(Command::Bdat { chunk_size, last })
            }
            Verb::Data => {
                // RFC 5321 §4.1.1: commands specified without parameters
                // reject any parameter as a syntax error
                if !is_crlf(arg) {
                    return Err(InvalidArgument(verb));
                }
                Ok(Command::Data)
            }
            Verb::Ehlo | Verb::Helo => {
                if arg.starts_with(b"\r") {
                    return Err(MissingArgument(verb));
                }
                let hostname = parse_domain_arg(arg).map_err(|()| InvalidArgument(verb))?;
                match verb {
                    Verb::Ehlo => Ok(Command::Ehlo { hostname }),
                    _ => Ok(Command::Helo { hostname }),
                }
            }
            Verb::Expn => Ok(Command::Expn { name: free_text(arg) }),
            Verb::Help => {
                let subject = free_text(arg);
                Ok(Command::Help {
                    subject: if subject.is_empty() { None } else { Some(subject) },
                })
            }
            Verb::Mail => {
                if !starts_with_ignore_case(arg, b"FROM:") {
                    return Err(Unrecognized);
                }
                let arg = skip_ws(&arg[5..]);
                if arg.starts_with(b"\r") {
                    return Err(MissingArgument(verb));
                }
                let (from, rem) =
                    parse_reverse_path(arg).map_err(|()| InvalidArgument(verb))?;
                let params = parse_params(rem).map_err(|()| InvalidArgument(verb))?;
                Ok(Command::Mail { from, params })
            }
            Verb::Noop => Ok(Command::Noop),
            Verb::Quit => {
                if !is_crlf(arg) {
                    return Err(InvalidArgument(verb));
                }
                Ok(Command::Quit)
            }
            Verb::Rcpt => {
                if !starts_with_ignore_case(arg, b"TO:") {
                    return Err(Unrecognized);
                }
                let arg = skip_ws(&arg[3..]);
                if arg.starts_with(b"\r") {
                    return Err(MissingArgument(verb));
                }
                let (to, rem) = parse_forward_path(arg).map_err(|()| InvalidArgument(verb))?;
                let params = parse_params(rem).map_err(|()| InvalidArgument(verb))?;
                Ok(Command::Rcpt { to, params })
            }
            Verb::Rset => {
                if !is_crlf(arg) {
                    return Err(InvalidArgument(verb));
                }
                Ok(Command::Rset)
            }
            Verb::Vrfy => Ok(Command::Vrfy { name: free_text(arg) }),
        }
    }

    pub fn to_owned(self) -> Command<String> {
        match self {
            Command::Bdat { chunk_size, last } => Command::Bdat { chunk_size, last },
            Command::Data => Command::Data,
            Command::Ehlo { hostname } => Command::Ehlo { hostname: hostname.to_owned() },
            Command::Expn { name } => Command::Expn { name: name.to_owned() },
            Command::Helo { hostname } => Command::Helo { hostname: hostname.to_owned() },
            Command::Help { subject } => {
                Command::Help { subject: subject.map(|s| s.to_owned()) }
            }
            Command::Mail { from, params } => Command::Mail {
                from: from.map(|f| f.to_owned()),
                params: params.to_owned(),
            },
            Command::Noop => Command::Noop,
            Command::Quit => Command::Quit,
            Command::Rcpt { to, params } => {
                Command::Rcpt { to: to.to_owned(), params: params.to_owned() }
            }
            Command::Rset => Command::Rset,
            Command::Vrfy { name } => Command::Vrfy { name: name.to_owned() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::show_bytes;

    #[test]
    fn valid_commands() {
        let tests: Vec<(&[u8], Command<&str>)> = vec![
            (b"DATA\r\n", Command::Data),
            (b"data\r\n", Command::Data),
            (
                b"EHLO foo.bar.baz\r\n",
                Command::Ehlo { hostname: Hostname::AsciiDomain { raw: "foo.bar.baz" } },
            ),
            (
                b"EhLo foo.bar.baz \t \r\n",
                Command::Ehlo { hostname: Hostname::AsciiDomain { raw: "foo.bar.baz" } },
            ),
            (
                b"HELO c\r\n",
                Command::Helo { hostname: Hostname::AsciiDomain { raw: "c" } },
            ),
            (
                b"MAIL FROM:<hello@world.example>\r\n",
                Command::Mail {
                    from: Some(Email {
                        localpart: Localpart::Ascii { raw: "hello" },
                        hostname: Some(Hostname::AsciiDomain { raw: "world.example" }),
                    }),
                    params: Params(vec![]),
                },
            ),
            (
                b"MAIL FROM: bob@ext.net\r\n",
                Command::Mail {
                    from: Some(Email {
                        localpart: Localpart::Ascii { raw: "bob" },
                        hostname: Some(Hostname::AsciiDomain { raw: "ext.net" }),
                    }),
                    params: Params(vec![]),
                },
            ),
            (
                b"MAIL FROM:<>\r\n",
                Command::Mail { from: None, params: Params(vec![]) },
            ),
            (
                b"MAIL FROM:<> SIZE=1024\r\n",
                Command::Mail { from: None, params: Params(vec![("SIZE", Some("1024"))]) },
            ),
            (
                b"MAIL FROM:<a@b.c> size=42 BODY=8BITMIME\r\n",
                Command::Mail {
                    from: Some(Email {
                        localpart: Localpart::Ascii { raw: "a" },
                        hostname: Some(Hostname::AsciiDomain { raw: "b.c" }),
                    }),
                    params: Params(vec![("size", Some("42")), ("BODY", Some("8BITMIME"))]),
                },
            ),
            (b"NOOP\r\n", Command::Noop),
            (b"NOOP ignored\r\n", Command::Noop),
            (b"QUIT\r\n", Command::Quit),
            (
                b"rCpT To: foo@bar.baz\r\n",
                Command::Rcpt {
                    to: Email {
                        localpart: Localpart::Ascii { raw: "foo" },
                        hostname: Some(Hostname::AsciiDomain { raw: "bar.baz" }),
                    },
                    params: Params(vec![]),
                },
            ),
            (
                b"RCPT to:<@foo.bar,@bar.baz:baz@quux.foo>\r\n",
                Command::Rcpt {
                    to: Email {
                        localpart: Localpart::Ascii { raw: "baz" },
                        hostname: Some(Hostname::AsciiDomain { raw: "quux.foo" }),
                    },
                    params: Params(vec![]),
                },
            ),
            (
                b"RCPT TO:<postmaster>\r\n",
                Command::Rcpt {
                    to: Email {
                        localpart: Localpart::Ascii { raw: "postmaster" },
                        hostname: None,
                    },
                    params: Params(vec![]),
                },
            ),
            (
                b"RCPT TO:<alice@[192.168.0.7]>\r\n",
                Command::Rcpt {
                    to: Email {
                        localpart: Localpart::Ascii { raw: "alice" },
                        hostname: Some(Hostname::Ipv4 {
                            raw: "[192.168.0.7]",
                            ip: "192.168.0.7".parse().unwrap(),
                        }),
                    },
                    params: Params(vec![]),
                },
            ),
            (b"RSET\r\n", Command::Rset),
            (b"BDAT 4096\r\n", Command::Bdat { chunk_size: 4096, last: false }),
            (b"BDAT 4 LAST\r\n", Command::Bdat { chunk_size: 4, last: true }),
            (b"BDAT 0 last\r\n", Command::Bdat { chunk_size: 0, last: true }),
            (b"VRFY  root\r\n", Command::Vrfy { name: "root" }),
            (b"EXPN mailing.list\r\n", Command::Expn { name: "mailing.list" }),
            (b"HELP\r\n", Command::Help { subject: None }),
            (b"HELP DATA\r\n", Command::Help { subject: Some("DATA") }),
        ];
        for (inp, expected) in tests {
            println!("Test: {:?}", show_bytes(inp));
            let got = Command::parse(inp);
            println!("Got : {:?}", got);
            assert_eq!(got, Ok(expected));
        }
    }

    #[test]
    fn unrecognized_commands() {
        let tests: &[&[u8]] = &[
            b"THISISNOTACOMMAND\r\n",
            b"XYZ\r\n",
            b"MAIL TO:<a@b.c>\r\n",
            b"RCPT FROM:<a@b.c>\r\n",
            b"MAI L FROM:<a@b.c>\r\n",
        ];
        for inp in tests {
            println!("Test: {:?}", show_bytes(inp));
            assert_eq!(Command::parse(inp), Err(CommandError::Unrecognized));
        }
    }

    #[test]
    fn syntax_errors() {
        use CommandError::*;
        let tests: Vec<(&[u8], CommandError)> = vec![
            (b"EHLO\r\n", MissingArgument(Verb::Ehlo)),
            (b"EHLO -bad-\r\n", InvalidArgument(Verb::Ehlo)),
            (b"HELO\r\n", MissingArgument(Verb::Helo)),
            (b"MAIL FROM:\r\n", MissingArgument(Verb::Mail)),
            (b"MAIL FROM:<@foo.bar>\r\n", InvalidArgument(Verb::Mail)),
            (b"MAIL FROM:<postmaster>\r\n", InvalidArgument(Verb::Mail)),
            (b"MAIL FROM:<a@b.c> SIZE=\r\n", InvalidArgument(Verb::Mail)),
            (b"RCPT TO:\r\n", MissingArgument(Verb::Rcpt)),
            (b"RCPT TO:postmaster\r\n", InvalidArgument(Verb::Rcpt)),
            (b"RCPT TO:<nodomain>\r\n", InvalidArgument(Verb::Rcpt)),
            (b"DATA now\r\n", InvalidArgument(Verb::Data)),
            (b"RSET please\r\n", InvalidArgument(Verb::Rset)),
            (b"QUIT now\r\n", InvalidArgument(Verb::Quit)),
            (b"BDAT\r\n", MissingArgument(Verb::Bdat)),
            (b"BDAT x\r\n", InvalidArgument(Verb::Bdat)),
            (b"BDAT 4 FIRST\r\n", InvalidArgument(Verb::Bdat)),
        ];
        for (inp, expected) in tests {
            println!("Test: {:?}", show_bytes(inp));
            assert_eq!(Command::parse(inp), Err(expected));
        }
    }

    #[test]
    fn null_path_roundtrip() {
        match Command::parse(b"MAIL FROM:<>\r\n") {
            Ok(Command::Mail { from: None, .. }) => (),
            x => panic!("Unexpected result: {:?}", x),
        }
    }
}
