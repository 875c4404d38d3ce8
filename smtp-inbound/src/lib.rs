//! Inbound SMTP engine.
//!
//! [`interact`] drives one client connection through the SMTP dialogue,
//! delegating every policy decision and all message storage to a [`Config`]
//! implementation. The engine owns line discipline, command sequencing,
//! DATA and BDAT capture (including the discard paths taken after a mid-body
//! rejection), and the idle timeout.

use std::{borrow::Cow, io, ops::Range, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use smol::future::FutureExt;
use tracing::trace;

use smtp_wire::{
    Command, CommandError, Email, EnhancedCode, Hostname, Reply, ReplyCode, Verb,
    TEXT_LINE_MAXLEN,
};

pub const RDBUF_SIZE: usize = 16 * 1024;

#[must_use]
pub enum Decision {
    Accept,
    Reject(Reply<Cow<'static, str>>),
    Kill {
        reply: Option<Reply<Cow<'static, str>>>,
        res: io::Result<()>,
    },
}

pub struct HelloInfo {
    pub is_ehlo: bool,
    pub hostname: String,
}

pub struct ConnectionMetadata<U> {
    pub user: U,
    pub hello: Option<HelloInfo>,
}

pub struct MailMetadata<U> {
    pub user: U,
    pub from: Option<Email>,
    pub to: Vec<Email>,
}

#[async_trait]
pub trait Config: Send + Sync {
    type ConnectionUserMeta: Send;
    type MailUserMeta: Send;

    /// The domain this server identifies as: banner, EHLO response, trace
    /// headers.
    fn hostname(&self) -> Cow<'static, str>;

    fn product_name(&self) -> Cow<'static, str> {
        "mailspool".into()
    }

    /// Advertised in the EHLO `SIZE` extension and quoted in 552 replies.
    fn max_message_size(&self) -> u64;

    /// Connections idle longer than this are closed without a reply.
    fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(300)
    }

    fn reply_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    async fn new_mail(
        &self,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Self::MailUserMeta;

    #[allow(unused_variables)]
    async fn filter_hello(
        &self,
        is_ehlo: bool,
        hostname: &Hostname<String>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision {
        Decision::Accept
    }

    /// Sees the reverse path and the MAIL parameters (`SIZE=` included).
    async fn filter_from(
        &self,
        from: &Option<Email>,
        params: &smtp_wire::Params,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision;

    /// May rewrite the recipient (postmaster aliasing). On `Accept` the
    /// engine appends it to the transaction.
    async fn filter_to(
        &self,
        to: &mut Email,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision;

    /// Called when message capture begins (DATA accepted, or first BDAT
    /// chunk). Storage is opened here. A rejection is *staged*: the body is
    /// still consumed and discarded, and the reply sent afterwards.
    async fn handle_mail_start(
        &self,
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision;

    /// One piece of message body: a line (DATA, terminator excluded, dot
    /// stuffing preserved) or a chunk fragment (BDAT). A rejection is staged
    /// and the remaining body discarded.
    async fn handle_mail_data(
        &self,
        data: &[u8],
        meta: &mut MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision;

    /// End of message (DATA terminator or BDAT LAST). `Accept` means the
    /// message is durably spooled.
    async fn handle_mail_done(
        &self,
        meta: MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision;

    /// Transaction abort: explicit RSET, implicit RSET on EHLO/HELO, or
    /// connection teardown with a transaction open. Any open storage must be
    /// discarded here.
    #[allow(unused_variables)]
    async fn handle_rset(
        &self,
        meta: &mut Option<MailMetadata<Self::MailUserMeta>>,
        conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision {
        Decision::Accept
    }

    fn welcome_banner(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::SERVICE_READY,
            ecode: None,
            text: vec![format!("{} Service ready - {}", self.hostname(), self.product_name())
                .into()],
        }
    }

    fn helo_okay(&self) -> Reply<Cow<'static, str>> {
        Reply { code: ReplyCode::OKAY, ecode: None, text: vec![self.hostname()] }
    }

    fn ehlo_okay(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::OKAY,
            ecode: None,
            text: vec![
                self.hostname(),
                "8BITMIME".into(),
                format!("SIZE {}", self.max_message_size()).into(),
                "CHUNKING".into(),
            ],
        }
    }

    fn okay(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedCode::SUCCESS_UNDEFINED),
            text: vec!["OK".into()],
        }
    }

    fn sender_okay(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedCode::SUCCESS_SENDER),
            text: vec!["Sender ok".into()],
        }
    }

    fn recipient_okay(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedCode::SUCCESS_DEST_VALID),
            text: vec!["Recipient ok".into()],
        }
    }

    fn reset_okay(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedCode::SUCCESS_UNDEFINED),
            text: vec!["Reset state".into()],
        }
    }

    fn message_accepted(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedCode::SUCCESS_UNDEFINED),
            text: vec!["Message accepted for delivery".into()],
        }
    }

    fn data_okay(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::START_MAIL_INPUT,
            ecode: None,
            text: vec!["Enter mail, end with \".\" on a line by itself".into()],
        }
    }

    fn closing_channel(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::CLOSING_CHANNEL,
            ecode: Some(EnhancedCode::SUCCESS_UNDEFINED),
            text: vec![format!("{} closing connection", self.hostname()).into()],
        }
    }

    fn service_not_available(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::SERVICE_NOT_AVAILABLE,
            ecode: Some(EnhancedCode::TRANSIENT_SERVICE_SHUTDOWN),
            text: vec![format!("{} closing connection", self.hostname()).into()],
        }
    }

    fn mailbox_unavailable(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::MAILBOX_UNAVAILABLE_TRANSIENT,
            ecode: None,
            text: vec!["Requested mail action not taken: mailbox unavailable".into()],
        }
    }

    fn try_again_later(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::LOCAL_ERROR,
            ecode: Some(EnhancedCode::TRANSIENT_TRY_AGAIN),
            text: vec!["Please try again later".into()],
        }
    }

    fn user_not_local(&self, forward_to: &str) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::USER_NOT_LOCAL,
            ecode: Some(EnhancedCode::PERMANENT_NOT_LOCAL),
            text: vec![format!("User not local; please try {}", forward_to).into()],
        }
    }

    fn too_many_transactions(&self, domain: &str) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::MAILBOX_UNAVAILABLE_TRANSIENT,
            ecode: Some(EnhancedCode::TRANSIENT_TOO_MUCH_MAIL),
            text: vec![format!("Error: too much mail from {}", domain).into()],
        }
    }

    fn insufficient_disk_space(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::INSUFFICIENT_STORAGE,
            ecode: Some(EnhancedCode::TRANSIENT_NO_DISK),
            text: vec!["Insufficient disk space; try again later".into()],
        }
    }

    fn too_many_recipients(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::INSUFFICIENT_STORAGE,
            ecode: Some(EnhancedCode::TRANSIENT_TOO_MANY_RECIPIENTS),
            text: vec!["Too many recipients".into()],
        }
    }

    fn command_unrecognized(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::COMMAND_UNRECOGNIZED,
            ecode: Some(EnhancedCode::PERMANENT_INVALID_COMMAND),
            text: vec!["Command unrecognized".into()],
        }
    }

    fn command_unimplemented(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::COMMAND_UNIMPLEMENTED,
            ecode: Some(EnhancedCode::PERMANENT_INVALID_COMMAND),
            text: vec!["Command not implemented".into()],
        }
    }

    fn syntax_error(&self, error: CommandError) -> Reply<Cow<'static, str>> {
        let (ecode, text): (Option<EnhancedCode>, Cow<'static, str>) = match error {
            CommandError::MissingArgument(Verb::Ehlo) => (
                Some(EnhancedCode::PERMANENT_UNDEFINED),
                "ehlo requires domain address".into(),
            ),
            CommandError::MissingArgument(Verb::Helo) => (
                Some(EnhancedCode::PERMANENT_UNDEFINED),
                "helo requires domain address".into(),
            ),
            CommandError::InvalidArgument(Verb::Ehlo)
            | CommandError::InvalidArgument(Verb::Helo) => {
                (Some(EnhancedCode::PERMANENT_UNDEFINED), "Invalid domain name".into())
            }
            CommandError::MissingArgument(Verb::Mail) => (
                Some(EnhancedCode::PERMANENT_BAD_ARGUMENTS),
                "Syntax error in parameters scanning \"from\"".into(),
            ),
            CommandError::InvalidArgument(Verb::Mail) => (
                Some(EnhancedCode::PERMANENT_SENDER_SYNTAX),
                "Syntax error in mailbox address".into(),
            ),
            CommandError::MissingArgument(Verb::Rcpt) => (
                Some(EnhancedCode::PERMANENT_BAD_ARGUMENTS),
                "Syntax error in parameters scanning \"to\"".into(),
            ),
            CommandError::InvalidArgument(Verb::Rcpt) => (
                Some(EnhancedCode::PERMANENT_MAILBOX_SYNTAX),
                "Syntax error in mailbox address".into(),
            ),
            CommandError::MissingArgument(Verb::Bdat)
            | CommandError::InvalidArgument(Verb::Bdat) => {
                (None, "Syntax: \"BDAT\" SP chunk-size[SP \"LAST\"]".into())
            }
            CommandError::InvalidArgument(Verb::Data) => {
                (Some(EnhancedCode::PERMANENT_COMMAND_SYNTAX), "Syntax: \"DATA\"".into())
            }
            CommandError::InvalidArgument(Verb::Rset) => {
                (Some(EnhancedCode::PERMANENT_COMMAND_SYNTAX), "Syntax: \"RSET\"".into())
            }
            CommandError::InvalidArgument(Verb::Quit) => {
                (Some(EnhancedCode::PERMANENT_COMMAND_SYNTAX), "Syntax: \"QUIT\"".into())
            }
            _ => (
                Some(EnhancedCode::PERMANENT_BAD_ARGUMENTS),
                "Syntax error in parameters or arguments".into(),
            ),
        };
        Reply { code: ReplyCode::SYNTAX_ERROR, ecode, text: vec![text] }
    }

    fn need_helo(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::BAD_SEQUENCE,
            ecode: Some(EnhancedCode::PERMANENT_UNDEFINED),
            text: vec!["Polite people say HELO first".into()],
        }
    }

    fn need_mail(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::BAD_SEQUENCE,
            ecode: Some(EnhancedCode::PERMANENT_UNDEFINED),
            text: vec!["Need MAIL before RCPT".into()],
        }
    }

    fn need_rcpt(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::BAD_SEQUENCE,
            ecode: Some(EnhancedCode::PERMANENT_UNDEFINED),
            text: vec!["Need RCPT (recipient)".into()],
        }
    }

    fn transaction_in_progress(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::BAD_SEQUENCE,
            ecode: Some(EnhancedCode::PERMANENT_INVALID_COMMAND),
            text: vec!["Error: MAIL transaction in progress".into()],
        }
    }

    fn sender_already_specified(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::BAD_SEQUENCE,
            ecode: Some(EnhancedCode::PERMANENT_WRONG_SEQUENCE),
            text: vec!["Sender already specified".into()],
        }
    }

    fn addressee_unknown(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::MAILBOX_UNAVAILABLE,
            ecode: Some(EnhancedCode::PERMANENT_BAD_DEST_MAILBOX),
            text: vec!["Addressee unknown".into()],
        }
    }

    fn message_too_big(&self) -> Reply<Cow<'static, str>> {
        Reply {
            code: ReplyCode::EXCEEDED_STORAGE,
            ecode: Some(EnhancedCode::PERMANENT_MSG_TOO_BIG),
            text: vec!["Message size exceeds maximum value".into()],
        }
    }
}

/// Cross-command BDAT state: the chunked transfer spans several commands,
/// unlike DATA which is captured within one.
enum BdatMode {
    Off,
    Receiving,
    Discarding(Reply<Cow<'static, str>>),
}

struct LineBuf {
    buf: Box<[u8; RDBUF_SIZE]>,
    unhandled: Range<usize>,
}

enum ReadOutcome {
    Data,
    Closed,
}

impl LineBuf {
    fn new() -> LineBuf {
        LineBuf { buf: Box::new([0; RDBUF_SIZE]), unhandled: 0..0 }
    }

    fn is_empty(&self) -> bool {
        self.unhandled.is_empty()
    }

    fn newline_pos(&self) -> Option<usize> {
        self.buf[self.unhandled.clone()]
            .iter()
            .position(|&b| b == b'\n')
    }

    /// Make room at the tail, moving the unhandled bytes to the front when
    /// the buffer end is reached.
    fn compact(&mut self) {
        if self.unhandled.end == self.buf.len() && self.unhandled.start != 0 {
            self.buf.copy_within(self.unhandled.clone(), 0);
            self.unhandled = 0..self.unhandled.len();
        }
    }

    fn is_full(&self) -> bool {
        self.unhandled.len() == self.buf.len()
    }
}

pub async fn interact<IO, Cfg>(
    io: IO,
    metadata: Cfg::ConnectionUserMeta,
    cfg: Arc<Cfg>,
) -> io::Result<()>
where
    IO: Send + AsyncRead + AsyncWrite,
    Cfg: Config,
{
    let mut conn_meta = ConnectionMetadata { user: metadata, hello: None };
    let mut mail_meta = None;
    let res = interact_impl(io, &mut conn_meta, &mut mail_meta, &cfg).await;
    // Idle timeouts, aborted peers and IO errors can leave a transaction
    // open; give the config a chance to unlink its partial spool file.
    if mail_meta.is_some() {
        let _ = cfg.handle_rset(&mut mail_meta, &mut conn_meta).await;
    }
    res
}

async fn interact_impl<IO, Cfg>(
    io: IO,
    conn_meta: &mut ConnectionMetadata<Cfg::ConnectionUserMeta>,
    mail_meta: &mut Option<MailMetadata<Cfg::MailUserMeta>>,
    cfg: &Arc<Cfg>,
) -> io::Result<()>
where
    IO: Send + AsyncRead + AsyncWrite,
    Cfg: Config,
{
    let (mut io_r, mut io_w) = io.split();
    let mut line_buf = LineBuf::new();
    let mut bdat_mode = BdatMode::Off;
    let mut last_activity: DateTime<Utc> = Utc::now();

    // A read racing the idle deadline. Timing out is a normal way for a
    // connection to end: the peer gets no reply, just a close.
    macro_rules! read_more {
        () => {{
            line_buf.compact();
            let deadline = last_activity + cfg.idle_timeout();
            let read = async {
                let start = line_buf.unhandled.end;
                io_r.read(&mut line_buf.buf[start..]).await.map(Some)
            }
            .or(async {
                let delay = (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(0));
                smol::Timer::after(delay).await;
                Ok(None)
            })
            .await?;
            match read {
                None => None, // idle timeout
                Some(0) => Some(ReadOutcome::Closed),
                Some(n) => {
                    line_buf.unhandled.end += n;
                    last_activity = Utc::now();
                    Some(ReadOutcome::Data)
                }
            }
        }};
    }

    macro_rules! send_reply {
        ($reply:expr) => {{
            let wire = $reply.to_wire();
            trace!(reply = %String::from_utf8_lossy(&wire).trim_end(), "Sending reply");
            async {
                io_w.write_all(&wire).await?;
                io_w.flush().await?;
                last_activity = Utc::now();
                Ok(())
            }
            .or(async {
                smol::Timer::after(
                    cfg.reply_write_timeout()
                        .to_std()
                        .unwrap_or(std::time::Duration::from_secs(0)),
                )
                .await;
                Err(io::Error::new(io::ErrorKind::TimedOut, "timed out sending a reply"))
            })
            .await?;
        }};
    }

    macro_rules! handle_decision {
        ($decision:expr, $accept:block) => {
            match $decision {
                Decision::Accept => $accept,
                Decision::Reject(r) => send_reply!(r),
                Decision::Kill { reply, res } => {
                    if let Some(r) = reply {
                        send_reply!(r);
                    }
                    return res;
                }
            }
        };
    }

    macro_rules! reset_transaction {
        () => {{
            if mail_meta.is_some() {
                let _ = cfg.handle_rset(mail_meta, conn_meta).await;
                *mail_meta = None;
            }
            bdat_mode = BdatMode::Off;
        }};
    }

    // Drain the rest of an overlong command line, then complain.
    macro_rules! discard_command_line {
        () => {{
            loop {
                match line_buf.newline_pos() {
                    Some(p) => {
                        line_buf.unhandled.start += p + 1;
                        break;
                    }
                    None => {
                        line_buf.unhandled = 0..0;
                        match read_more!() {
                            None => return Ok(()),
                            Some(ReadOutcome::Closed) => {
                                return Err(io::Error::new(
                                    io::ErrorKind::ConnectionAborted,
                                    "connection shutdown while draining an overlong line",
                                ))
                            }
                            Some(ReadOutcome::Data) => (),
                        }
                    }
                }
            }
            send_reply!(cfg.command_unrecognized());
        }};
    }

    send_reply!(cfg.welcome_banner());

    'command: loop {
        // Collect one complete command line.
        let line: Range<usize> = loop {
            if let Some(p) = line_buf.newline_pos() {
                let end = line_buf.unhandled.start + p + 1;
                let line = line_buf.unhandled.start..end;
                if line.len() > TEXT_LINE_MAXLEN {
                    line_buf.unhandled.start = end;
                    send_reply!(cfg.command_unrecognized());
                    continue 'command;
                }
                line_buf.unhandled.start = end;
                break line;
            }
            if line_buf.unhandled.len() >= TEXT_LINE_MAXLEN {
                discard_command_line!();
                continue 'command;
            }
            match read_more!() {
                None => return Ok(()), // idle timeout, close silently
                Some(ReadOutcome::Closed) => {
                    if line_buf.is_empty() {
                        // Orderly shutdown between commands
                        return Ok(());
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection shutdown with partial command",
                    ));
                }
                Some(ReadOutcome::Data) => (),
            }
        };

        // Too short to be a command, or not CRLF-terminated
        if line.len() < 6 || !line_buf.buf[line.clone()].ends_with(b"\r\n") {
            send_reply!(cfg.command_unrecognized());
            continue 'command;
        }

        let cmd = Command::parse(&line_buf.buf[line.clone()]);
        trace!(command = ?cmd, "Parsed command");

        match cmd {
            Err(CommandError::Unrecognized) => {
                send_reply!(cfg.command_unrecognized());
            }

            // Syntax errors rank below sequencing errors, like the commands
            // themselves.
            Err(e @ (CommandError::MissingArgument(v) | CommandError::InvalidArgument(v))) => {
                let reply = match v {
                    Verb::Mail => {
                        if mail_meta.is_some() {
                            cfg.sender_already_specified()
                        } else if conn_meta.hello.is_none() {
                            cfg.need_helo()
                        } else {
                            cfg.syntax_error(e)
                        }
                    }
                    Verb::Rcpt => {
                        if !matches!(bdat_mode, BdatMode::Off) {
                            cfg.transaction_in_progress()
                        } else if mail_meta.is_none() {
                            cfg.need_mail()
                        } else {
                            cfg.syntax_error(e)
                        }
                    }
                    Verb::Data => {
                        if !matches!(bdat_mode, BdatMode::Off) {
                            cfg.transaction_in_progress()
                        } else if mail_meta.as_ref().map_or(true, |m| m.to.is_empty()) {
                            cfg.need_rcpt()
                        } else {
                            cfg.syntax_error(e)
                        }
                    }
                    Verb::Bdat => {
                        if mail_meta.as_ref().map_or(true, |m| m.to.is_empty()) {
                            cfg.need_rcpt()
                        } else {
                            cfg.syntax_error(e)
                        }
                    }
                    _ => cfg.syntax_error(e),
                };
                send_reply!(reply);
            }

            Ok(Command::Ehlo { hostname }) => {
                let hostname = hostname.to_owned();
                handle_decision!(cfg.filter_hello(true, &hostname, conn_meta).await, {
                    conn_meta.hello =
                        Some(HelloInfo { is_ehlo: true, hostname: hostname.raw().clone() });
                    reset_transaction!();
                    send_reply!(cfg.ehlo_okay());
                });
            }

            Ok(Command::Helo { hostname }) => {
                let hostname = hostname.to_owned();
                handle_decision!(cfg.filter_hello(false, &hostname, conn_meta).await, {
                    conn_meta.hello =
                        Some(HelloInfo { is_ehlo: false, hostname: hostname.raw().clone() });
                    reset_transaction!();
                    send_reply!(cfg.helo_okay());
                });
            }

            Ok(Command::Mail { from, params }) => {
                if mail_meta.is_some() {
                    send_reply!(cfg.sender_already_specified());
                } else if conn_meta.hello.is_none() {
                    send_reply!(cfg.need_helo());
                } else {
                    let from = from.map(|f| f.to_owned());
                    let params = params.to_owned();
                    let mut meta = MailMetadata {
                        user: cfg.new_mail(conn_meta).await,
                        from: None,
                        to: Vec::with_capacity(4),
                    };
                    handle_decision!(cfg.filter_from(&from, &params, &mut meta, conn_meta).await, {
                        meta.from = from;
                        *mail_meta = Some(meta);
                        send_reply!(cfg.sender_okay());
                    });
                }
            }

            Ok(Command::Rcpt { to, params: _params }) => {
                if !matches!(bdat_mode, BdatMode::Off) {
                    send_reply!(cfg.transaction_in_progress());
                } else {
                    match mail_meta {
                        None => send_reply!(cfg.need_mail()),
                        Some(meta) => {
                            let mut to = to.to_owned();
                            handle_decision!(cfg.filter_to(&mut to, meta, conn_meta).await, {
                                meta.to.push(to);
                                send_reply!(cfg.recipient_okay());
                            });
                        }
                    }
                }
            }

            Ok(Command::Data) => {
                if !matches!(bdat_mode, BdatMode::Off) {
                    send_reply!(cfg.transaction_in_progress());
                    continue 'command;
                }
                if mail_meta.as_ref().map_or(true, |m| m.to.is_empty()) {
                    send_reply!(cfg.need_rcpt());
                    continue 'command;
                }
                let meta = mail_meta.as_mut().expect("checked above");
                // A start-up failure is staged: the 354 goes out, the body
                // is consumed and discarded, and the staged reply ends it.
                let mut staged = match cfg.handle_mail_start(meta, conn_meta).await {
                    Decision::Accept => None,
                    Decision::Reject(r) => Some(r),
                    Decision::Kill { reply, res } => {
                        if let Some(r) = reply {
                            send_reply!(r);
                        }
                        return res;
                    }
                };
                send_reply!(cfg.data_okay());

                let mut at_line_start = true;
                loop {
                    // One line, or a buffer-filling fragment of one
                    let (piece, ends_line): (Range<usize>, bool) =
                        match line_buf.newline_pos() {
                            Some(p) => {
                                let end = line_buf.unhandled.start + p + 1;
                                (line_buf.unhandled.start..end, true)
                            }
                            None if line_buf.is_full() => (line_buf.unhandled.clone(), false),
                            None => {
                                match read_more!() {
                                    None => return Ok(()),
                                    Some(ReadOutcome::Closed) => {
                                        return Err(io::Error::new(
                                            io::ErrorKind::ConnectionAborted,
                                            "connection shutdown during message data",
                                        ))
                                    }
                                    Some(ReadOutcome::Data) => (),
                                }
                                continue;
                            }
                        };
                    line_buf.unhandled.start = piece.end;

                    let bytes = &line_buf.buf[piece.clone()];
                    if at_line_start && ends_line && (bytes == b".\r\n" || bytes == b".\n") {
                        break;
                    }
                    at_line_start = ends_line;

                    if staged.is_none() {
                        match cfg.handle_mail_data(&line_buf.buf[piece], meta, conn_meta).await {
                            Decision::Accept => (),
                            Decision::Reject(r) => staged = Some(r),
                            Decision::Kill { reply, res } => {
                                if let Some(r) = reply {
                                    send_reply!(r);
                                }
                                return res;
                            }
                        }
                    }
                }

                match staged {
                    Some(reply) => {
                        // The capture failed mid-way; the transaction dies
                        // with it.
                        reset_transaction!();
                        send_reply!(reply);
                    }
                    None => {
                        let meta = mail_meta.take().expect("checked above");
                        handle_decision!(cfg.handle_mail_done(meta, conn_meta).await, {
                            send_reply!(cfg.message_accepted());
                        });
                    }
                }
            }

            Ok(Command::Bdat { chunk_size, last }) => {
                if mail_meta.as_ref().map_or(true, |m| m.to.is_empty()) {
                    send_reply!(cfg.need_rcpt());
                    continue 'command;
                }

                if matches!(bdat_mode, BdatMode::Off) {
                    let meta = mail_meta.as_mut().expect("checked above");
                    bdat_mode = match cfg.handle_mail_start(meta, conn_meta).await {
                        Decision::Accept => BdatMode::Receiving,
                        Decision::Reject(r) => BdatMode::Discarding(r),
                        Decision::Kill { reply, res } => {
                            if let Some(r) = reply {
                                send_reply!(r);
                            }
                            return res;
                        }
                    };
                }

                // Consume exactly chunk_size bytes, feeding or skipping them.
                let mut remaining = chunk_size;
                while remaining > 0 {
                    if line_buf.is_empty() {
                        match read_more!() {
                            None => return Ok(()),
                            Some(ReadOutcome::Closed) => {
                                return Err(io::Error::new(
                                    io::ErrorKind::ConnectionAborted,
                                    "connection shutdown inside a BDAT chunk",
                                ))
                            }
                            Some(ReadOutcome::Data) => (),
                        }
                        continue;
                    }
                    let take = (line_buf.unhandled.len() as u64).min(remaining) as usize;
                    let piece = line_buf.unhandled.start..line_buf.unhandled.start + take;
                    line_buf.unhandled.start = piece.end;
                    remaining -= take as u64;

                    if matches!(bdat_mode, BdatMode::Receiving) {
                        let meta = mail_meta.as_mut().expect("checked above");
                        match cfg.handle_mail_data(&line_buf.buf[piece], meta, conn_meta).await {
                            Decision::Accept => (),
                            Decision::Reject(r) => bdat_mode = BdatMode::Discarding(r),
                            Decision::Kill { reply, res } => {
                                if let Some(r) = reply {
                                    send_reply!(r);
                                }
                                return res;
                            }
                        }
                    }
                }

                if !last {
                    // Intermediate chunks are acknowledged even while
                    // discarding; a staged rejection lands on LAST.
                    send_reply!(cfg.okay());
                } else {
                    match std::mem::replace(&mut bdat_mode, BdatMode::Off) {
                        BdatMode::Discarding(reply) => {
                            reset_transaction!();
                            send_reply!(reply);
                        }
                        _ => {
                            let meta = mail_meta.take().expect("checked above");
                            handle_decision!(cfg.handle_mail_done(meta, conn_meta).await, {
                                send_reply!(cfg.message_accepted());
                            });
                        }
                    }
                }
            }

            Ok(Command::Rset) => {
                handle_decision!(cfg.handle_rset(mail_meta, conn_meta).await, {
                    *mail_meta = None;
                    bdat_mode = BdatMode::Off;
                    send_reply!(cfg.reset_okay());
                });
            }

            Ok(Command::Noop) => send_reply!(cfg.okay()),

            Ok(Command::Expn { .. }) | Ok(Command::Vrfy { .. }) | Ok(Command::Help { .. }) => {
                send_reply!(cfg.command_unimplemented())
            }

            Ok(Command::Quit) => {
                send_reply!(cfg.closing_channel());
                return Ok(());
            }
        }
    }
}
