//! mailspool: an SMTP receiver and relay spooling mail through the
//! filesystem.
//!
//! Three long-lived services share one cooperative executor: the receiver
//! accepts inbound SMTP sessions and spools accepted messages, delivery
//! splits spooled messages into local inboxes and relay hand-offs, and the
//! relay pushes outbound messages toward their destination MXs. The spool
//! directories are the only shared state between them.

use std::{
    convert::TryFrom,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context};
use futures::StreamExt;
use smol::future::FutureExt;
use structopt::StructOpt;
use tracing::{info, trace, warn};

use mail_spool::Spool;
use smtp_outbound::{Client, DnsCache};
use smtp_wire::{Command, Email};

mod allowlist;
mod config;
mod delivery;
mod directory;
mod maillog;
mod receiver;
mod relay;

use allowlist::RelayAllowlist;
use config::Config;
use directory::{DomainDirectory, MailboxLookup};
use maillog::MailLog;
use receiver::{ConnMeta, ReceiverConfig};
use relay::RelayConfig;

const DEFAULT_MAX_IDLE_TIME: i64 = 300;
const MAX_IDLE_TIME_LIMIT: i64 = 900;
const MAX_RECIPIENTS: usize = 100;
const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;
const MAX_TRANSACTIONS: u32 = 10;

#[derive(StructOpt)]
#[structopt(name = "mailspool", about = "An SMTP receiver and relay spooling mail through the filesystem.")]
pub struct Opt {
    /// Path to the configuration file
    #[structopt(
        short,
        long,
        parse(from_os_str),
        default_value = "/etc/mailspool/mailspool.conf"
    )]
    pub config: PathBuf,
}

/// The validated `General` section.
pub struct Settings {
    pub port: u16,
    pub domains_directory: PathBuf,
    pub incoming_directory: PathBuf,
    pub received_directory: PathBuf,
    pub relay_directory: PathBuf,
    pub error_directory: PathBuf,
    pub postmaster: Email,
    pub max_idle_time: i64,
    pub max_recipients: usize,
    pub max_message_size: u64,
    pub max_transactions: u32,
    pub log_mails: bool,
    pub log_file: Option<PathBuf>,
    pub user: Option<String>,
    pub relay_ips: Vec<String>,
}

fn required_directory(conf: &Config, key: &str) -> anyhow::Result<PathBuf> {
    let value = conf
        .get(&["General", key])
        .filter(|v| !v.is_empty())
        .with_context(|| format!("you must specify {}", key))?;
    let path = PathBuf::from(value);
    let meta = std::fs::metadata(&path)
        .with_context(|| format!("the directory {} doesn't exist", path.display()))?;
    if !meta.is_dir() {
        bail!("{} is not a directory but a file", path.display());
    }
    Ok(path)
}

/// Numeric key clamped to `1..=max`; missing or out-of-range values fall
/// back to the default.
fn bounded_number<T: Copy + Ord + std::str::FromStr + From<u8>>(
    conf: &Config,
    key: &str,
    max: T,
    default: T,
) -> T {
    conf.get(&["General", key])
        .and_then(|v| v.parse::<T>().ok())
        .filter(|&n| n >= T::from(1u8) && n <= max)
        .unwrap_or(default)
}

impl Settings {
    pub fn from_config(conf: &Config) -> anyhow::Result<Settings> {
        let port = conf
            .get(&["General", "Port"])
            .context("couldn't get port to bind to")?;
        let port = port
            .parse::<u32>()
            .ok()
            .filter(|&p| (1..=65535).contains(&p))
            .with_context(|| format!("port to bind to ({}) out of range (1 <= port <= 65535)", port))?
            as u16;

        let domains_directory = required_directory(conf, "DomainsDirectory")?;
        let incoming_directory = required_directory(conf, "IncomingDirectory")?;
        let received_directory = required_directory(conf, "ReceivedDirectory")?;
        let relay_directory = required_directory(conf, "RelayDirectory")?;
        let error_directory = required_directory(conf, "ErrorDirectory")?;

        let postmaster = conf
            .get(&["General", "Postmaster"])
            .filter(|v| !v.is_empty())
            .context("you must specify the mail address of the postmaster")?;
        let postmaster = parse_mailbox(postmaster)
            .with_context(|| format!("the postmaster's mail address {} is not valid", postmaster))?;

        let max_idle_time = bounded_number(
            conf,
            "MaxIdleTime",
            MAX_IDLE_TIME_LIMIT,
            DEFAULT_MAX_IDLE_TIME,
        );
        let max_recipients =
            bounded_number(conf, "MaxRecipients", MAX_RECIPIENTS, MAX_RECIPIENTS);
        let max_message_size =
            bounded_number(conf, "MaxMessageSize", MAX_MESSAGE_SIZE, MAX_MESSAGE_SIZE);
        let max_transactions =
            bounded_number(conf, "MaxTransactions", MAX_TRANSACTIONS, MAX_TRANSACTIONS);

        let log_mails = match conf.get(&["General", "LogMails"]) {
            None => true,
            Some(v) if v.eq_ignore_ascii_case("Enabled") => true,
            Some(v) if v.eq_ignore_ascii_case("Disabled") => false,
            Some(v) => {
                warn!(value = %v, "LogMails is neither \"Enabled\" nor \"Disabled\", taking \"Enabled\"");
                true
            }
        };
        let log_file = if log_mails {
            let path = conf
                .get(&["General", "LogFile"])
                .filter(|v| !v.is_empty())
                .context("you must specify the log file")?;
            Some(PathBuf::from(path))
        } else {
            None
        };

        let user = conf.get(&["General", "User"]).map(|u| u.to_owned());
        let relay_ips = conf
            .get_all(&["General", "IPsForRelay"])
            .into_iter()
            .map(|s| s.to_owned())
            .collect();

        Ok(Settings {
            port,
            domains_directory,
            incoming_directory,
            received_directory,
            relay_directory,
            error_directory,
            postmaster,
            max_idle_time,
            max_recipients,
            max_message_size,
            max_transactions,
            log_mails,
            log_file,
            user,
            relay_ips,
        })
    }
}

/// A mailbox address (`local@domain`, brackets optional), as the Postmaster
/// key wants it.
fn parse_mailbox(s: &str) -> Option<Email> {
    match Command::parse(format!("RCPT TO:{}\r\n", s).as_bytes()) {
        Ok(Command::Rcpt { to, .. }) if to.hostname.is_some() => Some(to.to_owned()),
        _ => None,
    }
}

pub fn run(opt: &Opt, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    info!("Mailspool starting up");

    let conf = Config::load(&opt.config)?;
    let settings = Settings::from_config(&conf)?;

    let directory = Arc::new(DomainDirectory::load(&settings.domains_directory)?);
    if directory.lookup_email(&settings.postmaster) != MailboxLookup::Mailbox {
        bail!("the postmaster mailbox {} does not exist", settings.postmaster);
    }
    if let Some(user) = &settings.user {
        // Privilege dropping is the service manager's business these days
        info!(user = %user, "Ignoring the User key; run under the target user directly");
    }

    let allowlist =
        RelayAllowlist::new(&settings.relay_ips.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    let maillog = match &settings.log_file {
        Some(path) => Some(Arc::new(
            MailLog::open(path)
                .with_context(|| format!("opening the log file {}", path.display()))?,
        )),
        None => None,
    };

    let listener = std::net::TcpListener::bind(("0.0.0.0", settings.port))
        .with_context(|| format!("binding on port {}", settings.port))?;

    let hostname = directory.first_domain().to_owned();
    let ex = smol::Executor::new();

    smol::block_on(ex.run(async {
        let spool = Arc::new(
            Spool::open(
                settings.incoming_directory.clone(),
                settings.received_directory.clone(),
                settings.relay_directory.clone(),
                settings.error_directory.clone(),
            )
            .await
            .context("opening the spool areas")?,
        );

        let resolver = async_std_resolver::resolver_from_system_conf()
            .await
            .context("configuring a resolver from system configuration")?;
        let dnscache = Arc::new(smol::lock::Mutex::new(DnsCache::new(resolver)));

        let (wake_tx, wake_rx) = smol::channel::bounded(1);

        let recv_cfg = Arc::new(ReceiverConfig {
            hostname: hostname.clone(),
            postmaster: settings.postmaster.clone(),
            max_message_size: settings.max_message_size,
            max_recipients: settings.max_recipients,
            max_transactions: settings.max_transactions,
            max_idle_time: settings.max_idle_time,
            directory: directory.clone(),
            allowlist,
            spool: spool.clone(),
            dnscache: dnscache.clone(),
            maillog,
            delivery_wake: wake_tx,
        });

        ex.spawn(delivery::run_delivery(spool.clone(), directory.clone(), wake_rx))
            .detach();

        let client = Client::new(Arc::new(RelayConfig {
            hostname: hostname.clone(),
            port: smtp_outbound::SMTP_PORT,
        }));
        ex.spawn(relay::run_relay(spool.clone(), client, dnscache.clone())).detach();

        // The signal flag is checked once a second; closing this channel is
        // the orderly-stop edge for the accept loop below.
        let (stop_tx, stop_rx) = smol::channel::bounded::<()>(1);
        {
            let stop = stop.clone();
            ex.spawn(async move {
                loop {
                    smol::Timer::after(Duration::from_secs(1)).await;
                    if stop.load(Ordering::Relaxed) {
                        drop(stop_tx);
                        return;
                    }
                }
            })
            .detach();
        }

        let listener =
            smol::net::TcpListener::try_from(listener).context("making listener async")?;
        let mut incoming = listener.incoming();
        info!(port = settings.port, domain = %hostname, "Receiver up, waiting for connections");

        loop {
            let next = incoming
                .next()
                .or(async {
                    let _ = stop_rx.recv().await;
                    None
                })
                .await;
            let stream = match next {
                None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "Accepting a connection failed");
                    continue;
                }
                Some(Ok(stream)) => stream,
            };
            let peer = match stream.peer_addr() {
                Ok(addr) => match addr.ip() {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(_) => continue, // v4 listener; never happens
                },
                Err(_) => Ipv4Addr::UNSPECIFIED,
            };
            trace!(%peer, "New incoming connection");
            let cfg = recv_cfg.clone();
            ex.spawn(async move {
                let meta = ConnMeta { peer, ntransactions: 0 };
                if let Err(e) = smtp_inbound::interact(stream, meta, cfg).await {
                    trace!(%peer, error = %e, "Connection closed with error");
                }
            })
            .detach();
        }

        info!("Stopping");
        Ok::<(), anyhow::Error>(())
    }))
}
