//! Relay: pushes spooled outbound messages toward their destination MXs.
//!
//! Every [`RELAY_EVERY`] seconds a burst of at most
//! [`MAX_MESSAGES_PER_BURST`] files is taken from `relay/`. Recipients are
//! grouped by destination domain, each destination resolved through the DNS
//! cache (MX, then A), and one upstream session is opened per distinct
//! cache entry — a session already open for the same entry is reused for
//! further transactions. After the burst every session QUITs and every
//! processed file is unlinked; parse failures go to `error/`.
//!
//! Delivery here is best effort: recipients the peer rejected, or messages
//! whose session died mid-way, are logged and dropped with the file. A
//! bounce to the reverse path is a future extension.

use std::{
    collections::{HashMap, HashSet},
    io::SeekFrom,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::io::{AsyncSeekExt, BufReader};
use tracing::{debug, warn};

use mail_spool::{read_pre_header, Spool};
use smtp_outbound::{Client, Config, DnsCache, Resolve, Sender};
use smtp_wire::Email;

pub const RELAY_EVERY: u64 = 2; // seconds
pub const MAX_MESSAGES_PER_BURST: usize = 10;

/// Outbound policy: greet as the first served domain.
pub struct RelayConfig {
    pub hostname: String,
    pub port: u16,
}

impl Config for RelayConfig {
    fn helo_hostname(&self) -> String {
        self.hostname.clone()
    }

    fn smtp_port(&self) -> u16 {
        self.port
    }
}

pub async fn run_relay<R: Resolve, C: Config>(
    spool: Arc<Spool>,
    client: Client<C>,
    cache: Arc<smol::lock::Mutex<DnsCache<R>>>,
) {
    loop {
        smol::Timer::after(Duration::from_secs(RELAY_EVERY)).await;
        if let Err(e) = relay_burst(&spool, &client, &cache).await {
            warn!(error = %e, "Relay scan failed");
        }
    }
}

/// One burst over `relay/`.
pub async fn relay_burst<R: Resolve, C: Config>(
    spool: &Spool,
    client: &Client<C>,
    cache: &smol::lock::Mutex<DnsCache<R>>,
) -> std::io::Result<()> {
    let names = spool.scan_relay(MAX_MESSAGES_PER_BURST).await?;
    if names.is_empty() {
        return Ok(());
    }
    let now = Utc::now().timestamp();

    // Sessions keyed by the DNS cache entry they target; destinations that
    // already failed are not retried within the burst.
    let mut sessions: HashMap<usize, Sender<smol::net::TcpStream, C>> = HashMap::new();
    let mut failed: HashSet<usize> = HashSet::new();

    for name in &names {
        let file = match spool.open_relay(name).await {
            Ok(f) => f,
            Err(e) => {
                warn!(name = %name, error = %e, "Couldn't open relay message");
                continue;
            }
        };
        let mut reader = BufReader::new(file);
        let (envelope, offset) = match read_pre_header(&mut reader).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(name = %name, error = %e, "Unparseable relay message, quarantining");
                spool.quarantine_relay(name).await;
                continue;
            }
        };
        drop(reader);

        for (domain, members) in envelope.by_domain() {
            let index = {
                let mut cache = cache.lock().await;
                cache.resolve_destination(&domain, now).await
            };
            let index = match index {
                Some(index) => index,
                None => {
                    warn!(name = %name, domain = %domain, "Destination domain is unreachable");
                    continue;
                }
            };
            if failed.contains(&index) {
                continue;
            }

            if !sessions.contains_key(&index) {
                let mut cache_guard = cache.lock().await;
                match client.connect(&mut cache_guard, index, now).await {
                    Ok(sender) => {
                        debug!(domain = %domain, "Opened relay session");
                        sessions.insert(index, sender);
                    }
                    Err(e) => {
                        warn!(domain = %domain, error = %e, "Couldn't open relay session");
                        failed.insert(index);
                        continue;
                    }
                }
            }
            let sender = sessions.get_mut(&index).expect("inserted above");

            let mut body = match spool.open_relay(name).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(name = %name, error = %e, "Relay message vanished mid-burst");
                    break;
                }
            };
            if let Err(e) = body.seek(SeekFrom::Start(offset)).await {
                warn!(name = %name, error = %e, "Couldn't seek past the pre-header");
                break;
            }

            let recipients: Vec<Email> = members.iter().map(|e| (*e).clone()).collect();
            match sender
                .send_transaction(envelope.reverse_path.as_ref(), &recipients, body)
                .await
            {
                Ok(result) => {
                    for (recipient, accepted) in recipients.iter().zip(&result.accepted) {
                        if !accepted || !result.delivered {
                            // Best effort: the message is dropped for this
                            // recipient, no retry, no bounce yet
                            warn!(
                                name = %name,
                                recipient = %recipient,
                                "Recipient not delivered"
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(name = %name, domain = %domain, error = %e, "Relay session failed");
                    for recipient in &recipients {
                        warn!(name = %name, recipient = %recipient, "Recipient not delivered");
                    }
                    sessions.remove(&index);
                    failed.insert(index);
                }
            }
        }

        if let Err(e) = spool.remove_relay(name).await {
            warn!(name = %name, error = %e, "Couldn't unlink relayed message");
        }
    }

    for (_, sender) in sessions {
        sender.quit().await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use futures::io::{AsyncBufReadExt, AsyncWriteExt};
    use smtp_outbound::{DnsStatus, HostTarget, QType, RrHost};
    use tempdir::TempDir;

    struct StubResolver {
        mx_port_host: &'static str,
    }

    #[async_trait]
    impl Resolve for StubResolver {
        async fn lookup(&self, name: &str, qtype: QType) -> (DnsStatus, Vec<RrHost>) {
            match (name, qtype) {
                ("foreign.example", QType::Mx) => (
                    DnsStatus::Success,
                    vec![RrHost {
                        preference: 10,
                        ttl: 300,
                        target: HostTarget::Name(self.mx_port_host.to_owned()),
                    }],
                ),
                ("mx.foreign.example", QType::A) => (
                    DnsStatus::Success,
                    vec![RrHost {
                        preference: 0,
                        ttl: 300,
                        target: HostTarget::Ipv4("127.0.0.1".parse().unwrap()),
                    }],
                ),
                _ => (DnsStatus::HostNotFound, Vec::new()),
            }
        }
    }

    /// A scripted upstream: accepts sessions, replies positively to
    /// everything, and records connections and MAIL commands.
    async fn upstream(
        listener: smol::net::TcpListener,
        connections: Arc<AtomicUsize>,
        commands: Arc<Mutex<Vec<String>>>,
    ) {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(x) => x,
                Err(_) => return,
            };
            connections.fetch_add(1, Ordering::SeqCst);
            let mut reader = BufReader::new(stream.clone());
            let mut stream = stream;
            let _ = stream.write_all(b"220 mx.foreign.example ready\r\n").await;
            let mut line = String::new();
            let mut in_data = false;
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                if in_data {
                    if line == ".\r\n" {
                        in_data = false;
                        let _ = stream.write_all(b"250 2.0.0 Accepted\r\n").await;
                    }
                    continue;
                }
                commands.lock().unwrap().push(line.trim_end().to_owned());
                let upper = line.to_ascii_uppercase();
                if upper.starts_with("HELO") {
                    let _ = stream.write_all(b"250 mx.foreign.example\r\n").await;
                } else if upper.starts_with("MAIL") || upper.starts_with("RCPT") {
                    let _ = stream.write_all(b"250 2.1.0 Ok\r\n").await;
                } else if upper.starts_with("DATA") {
                    in_data = true;
                    let _ = stream.write_all(b"354 Go ahead\r\n").await;
                } else if upper.starts_with("QUIT") {
                    let _ = stream.write_all(b"221 2.0.0 Bye\r\n").await;
                    break;
                }
            }
        }
    }

    fn spool_with(files: &[(&str, &str)]) -> (TempDir, Spool) {
        let tmp = TempDir::new("relay").unwrap();
        for dir in ["incoming", "received", "relay", "error"] {
            std::fs::create_dir(tmp.path().join(dir)).unwrap();
        }
        for (name, content) in files {
            std::fs::write(tmp.path().join("relay").join(name), content).unwrap();
        }
        let spool = futures::executor::block_on(Spool::open(
            tmp.path().join("incoming"),
            tmp.path().join("received"),
            tmp.path().join("relay"),
            tmp.path().join("error"),
        ))
        .unwrap();
        (tmp, spool)
    }

    #[test]
    fn burst_multiplexes_one_session_per_destination() {
        let (tmp, spool) = spool_with(&[
            (
                "1-0.eml",
                "MAIL FROM: bob@ext.net\r\nRCPT TO: a@foreign.example\r\n\r\nfirst body\r\n",
            ),
            (
                "1-1.eml",
                "MAIL FROM: <>\r\nRCPT TO: b@foreign.example\r\n\r\nsecond body\r\n",
            ),
        ]);

        let ex = smol::Executor::new();
        let connections = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        smol::block_on(ex.run(async {
            let listener = smol::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            ex.spawn(upstream(listener, connections.clone(), commands.clone())).detach();

            let cache = smol::lock::Mutex::new(DnsCache::new(StubResolver {
                mx_port_host: "mx.foreign.example",
            }));
            let client = Client::new(Arc::new(RelayConfig {
                hostname: "example.org".to_owned(),
                port,
            }));

            relay_burst(&spool, &client, &cache).await.unwrap();
        }));

        // Exactly one upstream TCP session for the shared destination
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        let commands = commands.lock().unwrap();
        println!("{:#?}", *commands);
        assert_eq!(commands.iter().filter(|c| c.starts_with("HELO")).count(), 1);
        assert_eq!(commands.iter().filter(|c| c.starts_with("MAIL")).count(), 2);
        assert!(commands.contains(&"MAIL FROM:<bob@ext.net>".to_owned()));
        assert!(commands.contains(&"MAIL FROM:<>".to_owned()));
        assert!(commands.contains(&"RCPT TO:<a@foreign.example>".to_owned()));
        assert_eq!(commands.iter().filter(|c| c.starts_with("QUIT")).count(), 1);

        // Both files were consumed
        assert_eq!(std::fs::read_dir(tmp.path().join("relay")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(tmp.path().join("error")).unwrap().count(), 0);
    }

    #[test]
    fn poison_relay_file_is_quarantined() {
        let (tmp, spool) = spool_with(&[("2-0.eml", "not a pre-header\r\n\r\nbody\r\n")]);

        let ex = smol::Executor::new();
        smol::block_on(ex.run(async {
            let cache = smol::lock::Mutex::new(DnsCache::new(StubResolver {
                mx_port_host: "mx.foreign.example",
            }));
            let client = Client::new(Arc::new(RelayConfig {
                hostname: "example.org".to_owned(),
                port: 1, // never reached
            }));
            relay_burst(&spool, &client, &cache).await.unwrap();
        }));

        assert!(tmp.path().join("error/2-0.eml").exists());
        assert_eq!(std::fs::read_dir(tmp.path().join("relay")).unwrap().count(), 0);
    }

    #[test]
    fn unreachable_destination_still_unlinks_the_file() {
        let (tmp, spool) = spool_with(&[(
            "3-0.eml",
            "MAIL FROM: a@b.c\r\nRCPT TO: x@nxdomain.example\r\n\r\nbody\r\n",
        )]);

        let ex = smol::Executor::new();
        smol::block_on(ex.run(async {
            let cache = smol::lock::Mutex::new(DnsCache::new(StubResolver {
                mx_port_host: "mx.foreign.example",
            }));
            let client = Client::new(Arc::new(RelayConfig {
                hostname: "example.org".to_owned(),
                port: 1,
            }));
            relay_burst(&spool, &client, &cache).await.unwrap();
        }));

        // Best-effort policy: the message is dropped, not retried
        assert_eq!(std::fs::read_dir(tmp.path().join("relay")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(tmp.path().join("error")).unwrap().count(), 0);
    }

    #[test]
    fn body_is_sent_verbatim_after_the_pre_header() {
        let (_tmp, spool) = spool_with(&[(
            "4-0.eml",
            "MAIL FROM: a@b.c\r\nRCPT TO: a@foreign.example\r\n\r\nLine 1\r\n..stuffed\r\n",
        )]);

        let ex = smol::Executor::new();
        let body = Arc::new(Mutex::new(Vec::new()));

        let body2 = body.clone();
        smol::block_on(ex.run(async {
            let listener = smol::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            // A capturing upstream for the DATA section
            ex.spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut reader = BufReader::new(stream.clone());
                let mut stream = stream;
                stream.write_all(b"220 ready\r\n").await.unwrap();
                let mut line = String::new();
                let mut in_data = false;
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        break;
                    }
                    if in_data {
                        if line == ".\r\n" {
                            in_data = false;
                            stream.write_all(b"250 ok\r\n").await.unwrap();
                        } else {
                            body2.lock().unwrap().extend_from_slice(line.as_bytes());
                        }
                        continue;
                    }
                    let upper = line.to_ascii_uppercase();
                    if upper.starts_with("DATA") {
                        in_data = true;
                        stream.write_all(b"354 go\r\n").await.unwrap();
                    } else if upper.starts_with("QUIT") {
                        stream.write_all(b"221 bye\r\n").await.unwrap();
                        break;
                    } else {
                        stream.write_all(b"250 ok\r\n").await.unwrap();
                    }
                }
            })
            .detach();

            let cache = smol::lock::Mutex::new(DnsCache::new(StubResolver {
                mx_port_host: "mx.foreign.example",
            }));
            let client = Client::new(Arc::new(RelayConfig {
                hostname: "example.org".to_owned(),
                port,
            }));
            relay_burst(&spool, &client, &cache).await.unwrap();
        }));

        assert_eq!(
            String::from_utf8(body.lock().unwrap().clone()).unwrap(),
            "Line 1\r\n..stuffed\r\n"
        );
    }
}
