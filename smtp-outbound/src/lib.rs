//! Outbound SMTP engine.
//!
//! [`Client`] turns a resolved destination into a connected [`Sender`];
//! a [`Sender`] speaks one upstream session and can push any number of mail
//! transactions through it back to back, reporting per-recipient acceptance
//! for each. The [`DnsCache`] sits in front of the resolver with the TTL,
//! negative-interval and bounded-reset behavior the relay relies on.

use std::{net::Ipv4Addr, ops::Range, sync::Arc};

use chrono::Utc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use rand::prelude::SliceRandom;
use smol::future::FutureExt;
use tracing::trace;

use smtp_wire::{
    Email, EnhancedCode, EnhancedCodeSubject, Reply, ReplyCode, ReplyCodeKind, ReplyLine,
    MAX_REPLY_LINES, TEXT_LINE_MAXLEN,
};

mod dnscache;

pub use dnscache::{
    CacheEntry, DnsCache, DnsStatus, HostTarget, QType, Resolve, RrHost, MAX_DNS_ENTRIES,
    MAX_HOSTS, QUERY_MIN_INTERVAL,
};

pub const SMTP_PORT: u16 = 25;

const RDBUF_SIZE: usize = 16 * 1024;
const DATABUF_SIZE: usize = 16 * 1024;

const ZERO_DURATION: std::time::Duration = std::time::Duration::from_secs(0);

pub trait Config: Send + Sync {
    /// The domain this client greets as.
    fn helo_hostname(&self) -> String;

    fn smtp_port(&self) -> u16 {
        SMTP_PORT
    }

    fn connect_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(1)
    }

    fn banner_read_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn command_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn helo_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn mail_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn rcpt_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn data_init_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(2)
    }

    fn data_block_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(3)
    }

    fn data_end_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(10)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connecting to ‘{0}’ port ‘{1}’")]
    Connecting(Ipv4Addr, u16, #[source] std::io::Error),

    #[error("Timed out connecting to ‘{0}’ port ‘{1}’")]
    TimedOutConnecting(Ipv4Addr, u16),

    #[error("No reachable host for the destination")]
    NoReachableHost,

    #[error("Receiving reply bytes")]
    ReceivingReplyBytes(#[source] std::io::Error),

    #[error("Timed out while waiting for a reply")]
    TimedOutWaitingForReply,

    #[error("Connection aborted")]
    ConnectionAborted,

    #[error("Reply line does not fit in buffer: ‘{0}’")]
    TooLongReply(String),

    #[error("Reply has more than {} lines", MAX_REPLY_LINES)]
    TooManyReplyLines,

    #[error("Syntax error parsing as a reply: ‘{0}’")]
    SyntaxError(String),

    #[error("Timed out while sending a command")]
    TimedOutSendingCommand,

    #[error("Sending command")]
    SendingCommand(#[source] std::io::Error),

    #[error("Mail-level transient issue: {0}")]
    TransientMail(Reply),

    #[error("Mailbox-level transient issue: {0}")]
    TransientMailbox(Reply),

    #[error("Mail system-level transient issue: {0}")]
    TransientMailSystem(Reply),

    #[error("Mail-level permanent issue: {0}")]
    PermanentMail(Reply),

    #[error("Mailbox-level permanent issue: {0}")]
    PermanentMailbox(Reply),

    #[error("Mail system-level permanent issue: {0}")]
    PermanentMailSystem(Reply),

    #[error("Unexpected reply code: {0}")]
    UnexpectedReplyCode(Reply),

    #[error("Timed out while sending data")]
    TimedOutSendingData,

    #[error("Sending data")]
    SendingData(#[source] std::io::Error),

    #[error("Reading the mail from the provided reader")]
    ReadingMail(#[source] std::io::Error),
}

pub enum TransportErrorSeverity {
    Local,
    NetworkTransient,
    MailTransient,
    MailboxTransient,
    MailSystemTransient,
    MailPermanent,
    MailboxPermanent,
    MailSystemPermanent,
}

impl TransportError {
    pub fn severity(&self) -> TransportErrorSeverity {
        match self {
            TransportError::Connecting(_, _, _) => TransportErrorSeverity::NetworkTransient,
            TransportError::TimedOutConnecting(_, _) => TransportErrorSeverity::NetworkTransient,
            TransportError::NoReachableHost => TransportErrorSeverity::NetworkTransient,
            TransportError::ReceivingReplyBytes(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::TimedOutWaitingForReply => TransportErrorSeverity::NetworkTransient,
            TransportError::ConnectionAborted => TransportErrorSeverity::NetworkTransient,
            TransportError::TooLongReply(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::TooManyReplyLines => TransportErrorSeverity::NetworkTransient,
            TransportError::SyntaxError(_) => TransportErrorSeverity::MailSystemTransient,
            TransportError::TimedOutSendingCommand => TransportErrorSeverity::NetworkTransient,
            TransportError::SendingCommand(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::TransientMail(_) => TransportErrorSeverity::MailTransient,
            TransportError::TransientMailbox(_) => TransportErrorSeverity::MailboxTransient,
            TransportError::TransientMailSystem(_) => {
                TransportErrorSeverity::MailSystemTransient
            }
            TransportError::PermanentMail(_) => TransportErrorSeverity::MailPermanent,
            TransportError::PermanentMailbox(_) => TransportErrorSeverity::MailboxPermanent,
            TransportError::PermanentMailSystem(_) => {
                TransportErrorSeverity::MailSystemPermanent
            }
            TransportError::UnexpectedReplyCode(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::TimedOutSendingData => TransportErrorSeverity::NetworkTransient,
            TransportError::SendingData(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::ReadingMail(_) => TransportErrorSeverity::Local,
        }
    }
}

/// A `c.s.d` enhanced code at the head of a reply line's text.
fn parse_ecode(text: &[u8]) -> Option<EnhancedCode> {
    let mut fields = [0u16; 3];
    let mut pos = 0;
    for (i, field) in fields.iter_mut().enumerate() {
        let digits = text[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 || digits > 3 {
            return None;
        }
        *field = text[pos..pos + digits]
            .iter()
            .fold(0u16, |acc, &b| acc * 10 + u16::from(b - b'0'));
        pos += digits;
        if i < 2 {
            if text.get(pos) != Some(&b'.') {
                return None;
            }
            pos += 1;
        }
    }
    match text.get(pos) {
        None | Some(&b' ') => Some(EnhancedCode::new(fields[0] as u8, fields[1], fields[2])),
        _ => None,
    }
}

fn verify_reply(r: Reply, expected: ReplyCodeKind) -> Result<Reply, TransportError> {
    use EnhancedCodeSubject::*;
    use ReplyCodeKind::*;
    use TransportError::*;
    match (r.code.kind(), r.ecode.map(|e| e.subject())) {
        (k, _) if k == expected => Ok(r),
        (TransientNegative, Some(Mailbox)) => Err(TransientMailbox(r)),
        (PermanentNegative, Some(Mailbox)) => Err(PermanentMailbox(r)),
        (TransientNegative, Some(MailSystem)) => Err(TransientMailSystem(r)),
        (PermanentNegative, Some(MailSystem)) => Err(PermanentMailSystem(r)),
        (TransientNegative, _) => Err(TransientMail(r)),
        (PermanentNegative, _) => Err(PermanentMail(r)),
        (_, _) => Err(UnexpectedReplyCode(r)),
    }
}

/// What one transaction achieved on the session.
#[derive(Debug, Eq, PartialEq)]
pub struct TransactionResult {
    /// Per recipient, in the order given: did the peer take it?
    pub accepted: Vec<bool>,
    /// Did the message body get a positive completion? Always false when no
    /// recipient was accepted (the body is not even offered then).
    pub delivered: bool,
}

pub struct Client<Cfg> {
    cfg: Arc<Cfg>,
}

impl<Cfg: Config> Client<Cfg> {
    pub fn new(cfg: Arc<Cfg>) -> Client<Cfg> {
        Client { cfg }
    }

    /// Connect to the destination held by a cache entry: hosts are tried in
    /// preference order (ties shuffled), MX target names resolved through
    /// the same cache. Only connection-level failures move on to the next
    /// host; once a TCP session is up, its fate is the session's fate.
    pub async fn connect<R: Resolve>(
        &self,
        cache: &mut DnsCache<R>,
        entry_index: usize,
        now: i64,
    ) -> Result<Sender<smol::net::TcpStream, Cfg>, TransportError> {
        let mut hosts = cache.entry(entry_index).hosts.clone();

        // Shuffle within equal-preference runs
        let mut i = 0;
        while i < hosts.len() {
            let pref = hosts[i].preference;
            let j = hosts[i..]
                .iter()
                .position(|h| h.preference != pref)
                .map(|p| i + p)
                .unwrap_or(hosts.len());
            hosts[i..j].shuffle(&mut rand::thread_rng());
            i = j;
        }

        let mut first_error = None;
        for host in &hosts {
            let ips = match &host.target {
                HostTarget::Ipv4(ip) => vec![*ip],
                HostTarget::Name(name) => {
                    let (status, index) = cache.lookup(name, QType::A, now).await;
                    if status != DnsStatus::Success {
                        continue;
                    }
                    cache
                        .entry(index)
                        .hosts
                        .iter()
                        .filter_map(|h| match h.target {
                            HostTarget::Ipv4(ip) => Some(ip),
                            _ => None,
                        })
                        .collect()
                }
            };
            for ip in ips {
                match self.connect_to_ip(ip, self.cfg.smtp_port()).await {
                    Ok(stream) => return Sender::on_stream(stream, self.cfg.clone()).await,
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            }
        }
        Err(first_error.unwrap_or(TransportError::NoReachableHost))
    }

    pub async fn connect_to_ip(
        &self,
        ip: Ipv4Addr,
        port: u16,
    ) -> Result<smol::net::TcpStream, TransportError> {
        trace!(%ip, port, "Connecting");
        let stream = async {
            smol::net::TcpStream::connect((ip, port))
                .await
                .map_err(|e| TransportError::Connecting(ip, port, e))
        }
        .or(async {
            smol::Timer::after(
                self.cfg.connect_timeout().to_std().unwrap_or(ZERO_DURATION),
            )
            .await;
            Err(TransportError::TimedOutConnecting(ip, port))
        })
        .await?;
        // Nagle stays off; the body is batched by hand around the final dot
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

pub struct Sender<IO, Cfg> {
    io: BufWriter<IO>,
    rdbuf: Box<[u8; RDBUF_SIZE]>,
    unhandled: Range<usize>,
    cfg: Arc<Cfg>,
}

impl<IO, Cfg> Sender<IO, Cfg>
where
    IO: Send + Unpin + AsyncRead + AsyncWrite,
    Cfg: Config,
{
    /// Greet the peer on an established stream: banner, then HELO.
    pub async fn on_stream(io: IO, cfg: Arc<Cfg>) -> Result<Sender<IO, Cfg>, TransportError> {
        let mut sender = Sender {
            io: BufWriter::new(io),
            rdbuf: Box::new([0; RDBUF_SIZE]),
            unhandled: 0..0,
            cfg,
        };

        let banner = sender.read_reply(sender.cfg.banner_read_timeout()).await?;
        verify_reply(banner, ReplyCodeKind::PositiveCompletion)?;

        let helo = format!("HELO {}\r\n", sender.cfg.helo_hostname());
        sender.send_command(helo.as_bytes()).await?;
        let reply = sender.read_reply(sender.cfg.helo_reply_timeout()).await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        Ok(sender)
    }

    /// One MAIL→RCPT*→DATA transaction. A transport-level failure is an
    /// error and ends the session; recipient rejections and a refused DATA
    /// only degrade the result, leaving the session usable for the next
    /// transaction.
    pub async fn send_transaction<Body>(
        &mut self,
        from: Option<&Email>,
        recipients: &[Email],
        body: Body,
    ) -> Result<TransactionResult, TransportError>
    where
        Body: AsyncRead + Unpin,
    {
        let reverse = match from {
            Some(e) => format!("MAIL FROM:<{}>\r\n", e),
            None => "MAIL FROM:<>\r\n".to_owned(),
        };
        self.send_command(reverse.as_bytes()).await?;
        let reply = self.read_reply(self.cfg.mail_reply_timeout()).await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        let mut accepted = Vec::with_capacity(recipients.len());
        for to in recipients {
            let cmd = format!("RCPT TO:<{}>\r\n", to);
            self.send_command(cmd.as_bytes()).await?;
            let reply = self.read_reply(self.cfg.rcpt_reply_timeout()).await?;
            let ok = reply.code.kind() == ReplyCodeKind::PositiveCompletion;
            if !ok {
                trace!(recipient = %to, reply = %reply, "Recipient rejected");
            }
            accepted.push(ok);
        }

        if !accepted.iter().any(|&a| a) {
            return Ok(TransactionResult { accepted, delivered: false });
        }

        self.send_command(b"DATA\r\n").await?;
        let reply = self.read_reply(self.cfg.data_init_reply_timeout()).await?;
        if reply.code.kind() != ReplyCodeKind::PositiveIntermediate {
            trace!(reply = %reply, "DATA refused, skipping body");
            return Ok(TransactionResult { accepted, delivered: false });
        }

        self.send_body(body).await?;

        let reply = self.read_reply(self.cfg.data_end_reply_timeout()).await?;
        let delivered = reply.code.kind() == ReplyCodeKind::PositiveCompletion;
        Ok(TransactionResult { accepted, delivered })
    }

    pub async fn quit(mut self) {
        if self.send_command(b"QUIT\r\n").await.is_ok() {
            let _ = self.read_reply(self.cfg.helo_reply_timeout()).await;
        }
    }

    /// Stream the body and the terminating dot, flushing exactly once after
    /// the dot so the tail of the message and the terminator leave in one
    /// burst.
    async fn send_body<Body>(&mut self, mut body: Body) -> Result<(), TransportError>
    where
        Body: AsyncRead + Unpin,
    {
        let mut databuf = [0u8; DATABUF_SIZE];
        loop {
            let n = body.read(&mut databuf).await.map_err(TransportError::ReadingMail)?;
            if n == 0 {
                break;
            }
            let timeout = self.cfg.data_block_write_timeout();
            let io = &mut self.io;
            async { io.write_all(&databuf[..n]).await.map_err(TransportError::SendingData) }
                .or(async {
                    smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
                    Err(TransportError::TimedOutSendingData)
                })
                .await?;
        }
        let timeout = self.cfg.data_block_write_timeout();
        let io = &mut self.io;
        async {
            io.write_all(b".\r\n").await.map_err(TransportError::SendingData)?;
            io.flush().await.map_err(TransportError::SendingData)
        }
        .or(async {
            smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
            Err(TransportError::TimedOutSendingData)
        })
        .await
    }

    async fn send_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        trace!(cmd = %String::from_utf8_lossy(cmd).trim_end(), "Sending command");
        let timeout = self.cfg.command_write_timeout();
        let io = &mut self.io;
        async {
            io.write_all(cmd).await.map_err(TransportError::SendingCommand)?;
            io.flush().await.map_err(TransportError::SendingCommand)
        }
        .or(async {
            smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
            Err(TransportError::TimedOutSendingCommand)
        })
        .await
    }

    /// Read one full reply, folding continuation lines; the status is the
    /// last line's code.
    // TODO: share the buffered line scanner with smtp-inbound instead of
    // keeping two copies in step by hand
    async fn read_reply(
        &mut self,
        timeout: chrono::Duration,
    ) -> Result<Reply, TransportError> {
        let start = Utc::now();
        let mut text: Vec<String> = Vec::new();
        let mut nlines = 0usize;

        loop {
            let newline = self.rdbuf[self.unhandled.clone()]
                .iter()
                .position(|&b| b == b'\n');
            match newline {
                Some(p) => {
                    let end = self.unhandled.start + p + 1;
                    let line = &self.rdbuf[self.unhandled.start..end];
                    trace!(line = %String::from_utf8_lossy(line).trim_end(), "Reply line");
                    let parsed = ReplyLine::parse(line).map_err(|()| {
                        TransportError::SyntaxError(String::from_utf8_lossy(line).into_owned())
                    })?;
                    let code = parsed.code;
                    let is_last = parsed.is_last;
                    let line_text = String::from_utf8_lossy(parsed.text).into_owned();
                    self.unhandled.start = end;

                    nlines += 1;
                    if nlines > MAX_REPLY_LINES {
                        return Err(TransportError::TooManyReplyLines);
                    }
                    text.push(line_text);

                    if is_last {
                        let ecode = text.last().and_then(|t| parse_ecode(t.as_bytes()));
                        return Ok(Reply { code: ReplyCode::custom(code), ecode, text });
                    }
                }
                None => {
                    if self.unhandled.len() >= TEXT_LINE_MAXLEN {
                        return Err(TransportError::TooLongReply(
                            String::from_utf8_lossy(&self.rdbuf[self.unhandled.clone()])
                                .into_owned(),
                        ));
                    }
                    if self.unhandled.end == self.rdbuf.len() {
                        self.rdbuf.copy_within(self.unhandled.clone(), 0);
                        self.unhandled = 0..self.unhandled.len();
                    }
                    let io = &mut self.io;
                    let start_at = self.unhandled.end;
                    let rdbuf = &mut self.rdbuf[start_at..];
                    let read = async {
                        io.read(rdbuf).await.map_err(TransportError::ReceivingReplyBytes)
                    }
                    .or(async {
                        let max_delay = (start + timeout - Utc::now())
                            .to_std()
                            .unwrap_or(ZERO_DURATION);
                        smol::Timer::after(max_delay).await;
                        Err(TransportError::TimedOutWaitingForReply)
                    })
                    .await?;
                    if read == 0 {
                        return Err(TransportError::ConnectionAborted);
                    }
                    self.unhandled.end += read;
                }
            }
        }
    }
}
