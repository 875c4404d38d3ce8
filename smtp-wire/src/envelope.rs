use std::{fmt, net::Ipv4Addr, str};

use nom::IResult;

/// RFC 5321 §4.5.3.1.1
pub const LOCALPART_MAXLEN: usize = 64;
/// RFC 5321 §4.5.3.1.2
pub const DOMAIN_MAXLEN: usize = 255;
/// RFC 5321 §4.5.3.1.3
pub const PATH_MAXLEN: usize = 256;
/// RFC 5321 §4.5.3.1.4, counted with the trailing CRLF
pub const TEXT_LINE_MAXLEN: usize = 1024;

pub(crate) fn is_atext(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'|'
                | b'}'
                | b'~'
        )
}

fn is_no_ws_ctl(b: u8) -> bool {
    matches!(b, 1..=8 | 11 | 12 | 14..=31 | 127)
}

fn is_qtext(b: u8) -> bool {
    is_no_ws_ctl(b) || b == 33 || (35..=91).contains(&b) || (93..=126).contains(&b)
}

fn is_text(b: u8) -> bool {
    matches!(b, 1..=9 | 11 | 12 | 14..=127)
}

fn err(input: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
}

fn peek_term<'a>(input: &'a [u8], term: &[u8]) -> Result<(), nom::Err<nom::error::Error<&'a [u8]>>> {
    match input.first() {
        Some(b) if term.contains(b) => Ok(()),
        _ => Err(err(input)),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NextCrLfState {
    Start,
    CrPassed,
}

/// Returns the index of the `\n` of the first CRLF in `buf`, or `None` if
/// none has been seen yet. `state` carries a trailing `\r` across calls:
/// start with [`NextCrLfState::Start`] and keep passing the same reference
/// until a position is returned.
pub fn next_crlf(buf: &[u8], state: &mut NextCrLfState) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    if *state == NextCrLfState::CrPassed && buf[0] == b'\n' {
        return Some(0);
    }
    if let Some(p) = buf.windows(2).position(|w| w == b"\r\n") {
        Some(p + 1)
    } else {
        *state = if buf[buf.len() - 1] == b'\r' {
            NextCrLfState::CrPassed
        } else {
            NextCrLfState::Start
        };
        None
    }
}

/// Scan a `sub-domain *("." sub-domain)` prefix, returning its length.
///
/// Sub-domains are let-dig with interior hyphens; neither a hyphen nor a dot
/// may end the domain.
fn scan_domain(buf: &[u8]) -> Result<usize, ()> {
    match buf.first() {
        Some(&b) if b.is_ascii_alphanumeric() => (),
        _ => return Err(()),
    }
    let mut len = 1;
    // 0: after let-dig, 1: after hyphen, 2: after dot
    let mut state = 0u8;
    for &b in &buf[1..] {
        match state {
            0 => {
                if b == b'-' {
                    state = 1;
                } else if b == b'.' {
                    state = 2;
                } else if !b.is_ascii_alphanumeric() {
                    return Ok(len);
                }
            }
            _ => {
                if !b.is_ascii_alphanumeric() {
                    return Err(());
                }
                state = 0;
            }
        }
        len += 1;
        if len > DOMAIN_MAXLEN {
            return Err(());
        }
    }
    if state == 0 {
        Ok(len)
    } else {
        Err(())
    }
}

/// Scan a `"[" IPv4-address-literal "]"` prefix, returning its length and
/// the address. Leading zeros are tolerated, out-of-range octets are not.
fn scan_ipv4_literal(buf: &[u8]) -> Result<(usize, Ipv4Addr), ()> {
    if buf.first() != Some(&b'[') {
        return Err(());
    }
    let mut octets = [0u32; 4];
    let mut nocts = 0;
    let mut ndigits = 0;
    let mut len = 1;
    for &b in &buf[1..] {
        len += 1;
        match b {
            b'0'..=b'9' => {
                if nocts == 4 {
                    return Err(());
                }
                octets[nocts] = octets[nocts] * 10 + u32::from(b - b'0');
                if octets[nocts] > 255 {
                    return Err(());
                }
                ndigits += 1;
            }
            b'.' => {
                if ndigits == 0 || nocts >= 3 {
                    return Err(());
                }
                nocts += 1;
                ndigits = 0;
            }
            b']' => {
                if ndigits == 0 || nocts != 3 {
                    return Err(());
                }
                let ip = Ipv4Addr::new(
                    octets[0] as u8,
                    octets[1] as u8,
                    octets[2] as u8,
                    octets[3] as u8,
                );
                return Ok((len, ip));
            }
            _ => return Err(()),
        }
    }
    Err(())
}

/// Scan a quoted-string localpart (including both quotes), returning its
/// length. The quoted content is capped at [`LOCALPART_MAXLEN`].
fn scan_quoted_localpart(buf: &[u8]) -> Result<usize, ()> {
    if buf.first() != Some(&b'"') {
        return Err(());
    }
    let mut content = 0;
    let mut backslash = false;
    let mut len = 1;
    for &b in &buf[1..] {
        len += 1;
        if backslash {
            if !is_text(b) {
                return Err(());
            }
            backslash = false;
        } else if b == b'\\' {
            backslash = true;
        } else if b == b'"' {
            if content == 0 {
                return Err(());
            }
            return Ok(len);
        } else if !is_qtext(b) {
            return Err(());
        }
        content += 1;
        if content > LOCALPART_MAXLEN {
            return Err(());
        }
    }
    Err(())
}

/// Scan a dot-string localpart, returning its length.
fn scan_dot_string(buf: &[u8]) -> Result<usize, ()> {
    match buf.first() {
        Some(&b) if is_atext(b) => (),
        _ => return Err(()),
    }
    let mut len = 1;
    let mut after_dot = false;
    for &b in &buf[1..] {
        if after_dot {
            if !is_atext(b) {
                return Err(());
            }
            after_dot = false;
        } else if b == b'.' {
            after_dot = true;
        } else if !is_atext(b) {
            return Ok(len);
        }
        len += 1;
        if len > LOCALPART_MAXLEN {
            return Err(());
        }
    }
    if after_dot {
        Err(())
    } else {
        Ok(len)
    }
}

#[derive(Clone, Debug, Eq)]
pub enum Hostname<S = String> {
    AsciiDomain { raw: S },
    Ipv4 { raw: S, ip: Ipv4Addr },
}

impl<S> Hostname<S> {
    pub fn parse_until<'a, 'b>(
        term: &'b [u8],
    ) -> impl 'b + Fn(&'a [u8]) -> IResult<&'a [u8], Hostname<S>>
    where
        'a: 'b,
        S: 'b + From<&'a str>,
    {
        move |buf: &'a [u8]| {
            if buf.first() == Some(&b'[') {
                let (len, ip) = scan_ipv4_literal(buf).map_err(|()| err(buf))?;
                peek_term(&buf[len..], term)?;
                // Scanner only accepts ascii, so the below cannot panic
                let raw = str::from_utf8(&buf[..len]).unwrap();
                Ok((&buf[len..], Hostname::Ipv4 { raw: raw.into(), ip }))
            } else {
                let len = scan_domain(buf).map_err(|()| err(buf))?;
                peek_term(&buf[len..], term)?;
                let raw = str::from_utf8(&buf[..len]).unwrap();
                Ok((&buf[len..], Hostname::AsciiDomain { raw: raw.into() }))
            }
        }
    }

    #[inline]
    pub fn raw(&self) -> &S {
        match self {
            Hostname::AsciiDomain { raw } => raw,
            Hostname::Ipv4 { raw, .. } => raw,
        }
    }

    pub fn is_ip_literal(&self) -> bool {
        matches!(self, Hostname::Ipv4 { .. })
    }
}

impl Hostname<String> {
    /// Validate a full string as a domain, the grammar used for directory
    /// names and EHLO arguments.
    pub fn parse_complete(s: &str) -> Option<Hostname<String>> {
        // Append a CR so the scanner has a terminator to stop at
        let buf = [s.as_bytes(), b"\r"].concat();
        let (rem, host) = Hostname::<String>::parse_until(b"\r")(&buf).ok()?;
        if rem == b"\r" {
            Some(host)
        } else {
            None
        }
    }
}

/// Note: comparison happens only on the `raw` field, so differently-cased
/// spellings of one domain compare unequal; use [`Hostname::eq_ignore_case`]
/// where wire semantics are wanted.
impl<S: PartialEq> PartialEq for Hostname<S> {
    fn eq(&self, o: &Hostname<S>) -> bool {
        self.raw() == o.raw()
    }
}

impl<S: AsRef<str>> Hostname<S> {
    pub fn eq_ignore_case(&self, o: &Hostname<S>) -> bool {
        self.raw().as_ref().eq_ignore_ascii_case(o.raw().as_ref())
    }
}

impl<S: AsRef<str>> fmt::Display for Hostname<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw().as_ref())
    }
}

impl Hostname<&str> {
    pub fn to_owned(self) -> Hostname<String> {
        match self {
            Hostname::AsciiDomain { raw } => Hostname::AsciiDomain { raw: raw.to_owned() },
            Hostname::Ipv4 { raw, ip } => Hostname::Ipv4 { raw: raw.to_owned(), ip },
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Localpart<S = String> {
    Ascii { raw: S },
    QuotedAscii { raw: S },
}

impl<S> Localpart<S> {
    pub fn parse_until<'a, 'b>(
        term: &'b [u8],
    ) -> impl 'b + Fn(&'a [u8]) -> IResult<&'a [u8], Localpart<S>>
    where
        'a: 'b,
        S: 'b + From<&'a str>,
    {
        move |buf: &'a [u8]| {
            if buf.first() == Some(&b'"') {
                let len = scan_quoted_localpart(buf).map_err(|()| err(buf))?;
                peek_term(&buf[len..], term)?;
                let raw = str::from_utf8(&buf[..len]).map_err(|_| err(buf))?;
                Ok((&buf[len..], Localpart::QuotedAscii { raw: raw.into() }))
            } else {
                let len = scan_dot_string(buf).map_err(|()| err(buf))?;
                peek_term(&buf[len..], term)?;
                let raw = str::from_utf8(&buf[..len]).unwrap();
                Ok((&buf[len..], Localpart::Ascii { raw: raw.into() }))
            }
        }
    }

    #[inline]
    pub fn raw(&self) -> &S {
        match self {
            Localpart::Ascii { raw } => raw,
            Localpart::QuotedAscii { raw } => raw,
        }
    }
}

impl Localpart<String> {
    /// Validate a full string as a dot-string localpart, the grammar used
    /// for mailbox directory names.
    pub fn is_valid_dot_string(s: &str) -> bool {
        matches!(scan_dot_string(s.as_bytes()), Ok(len) if len == s.len())
    }
}

impl<S: AsRef<str>> Localpart<S> {
    /// The localpart with quoting removed, suitable for mailbox lookup.
    pub fn unquote(&self) -> String {
        match self {
            Localpart::Ascii { raw } => raw.as_ref().to_owned(),
            Localpart::QuotedAscii { raw } => {
                let mut out = String::new();
                let mut backslash = false;
                for c in raw.as_ref()[1..raw.as_ref().len() - 1].chars() {
                    if backslash {
                        out.push(c);
                        backslash = false;
                    } else if c == '\\' {
                        backslash = true;
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }
}

impl<S: AsRef<str>> fmt::Display for Localpart<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw().as_ref())
    }
}

impl Localpart<&str> {
    pub fn to_owned(self) -> Localpart<String> {
        match self {
            Localpart::Ascii { raw } => Localpart::Ascii { raw: raw.to_owned() },
            Localpart::QuotedAscii { raw } => Localpart::QuotedAscii { raw: raw.to_owned() },
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Email<S = String> {
    pub localpart: Localpart<S>,
    pub hostname: Option<Hostname<S>>,
}

impl<S> Email<S> {
    /// `term_with_atsign` must be `term` plus `b"@"`.
    pub fn parse_until<'a, 'b>(
        term: &'b [u8],
        term_with_atsign: &'b [u8],
    ) -> impl 'b + Fn(&'a [u8]) -> IResult<&'a [u8], Email<S>>
    where
        'a: 'b,
        S: 'b + From<&'a str> + AsRef<str>,
    {
        move |buf: &'a [u8]| {
            let (rem, localpart) = Localpart::<S>::parse_until(term_with_atsign)(buf)?;
            let lplen = localpart.raw().as_ref().len();
            if rem.first() == Some(&b'@') {
                let (rem, hostname) = Hostname::<S>::parse_until(term)(&rem[1..])?;
                if lplen + 1 + hostname.raw().as_ref().len() > PATH_MAXLEN {
                    return Err(err(buf));
                }
                Ok((rem, Email { localpart, hostname: Some(hostname) }))
            } else {
                Ok((rem, Email { localpart, hostname: None }))
            }
        }
    }
}

impl<S: AsRef<str>> fmt::Display for Email<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(h) => write!(f, "{}@{}", self.localpart, h),
            None => self.localpart.fmt(f),
        }
    }
}

impl Email<&str> {
    pub fn to_owned(self) -> Email<String> {
        Email {
            localpart: self.localpart.to_owned(),
            hostname: self.hostname.map(|h| h.to_owned()),
        }
    }
}
