//! Delivery: splits received messages into local inbox copies and a relay
//! hand-off.
//!
//! Runs every [`DELIVER_EVERY`] seconds and whenever the receiver signals a
//! fresh message. Each `received/*.eml` is re-parsed, its recipients split
//! into local and remote against the domain directory, the body fanned out
//! in lock step to every local inbox plus (when remote recipients exist) a
//! relay file carrying a fresh pre-header with only the remote paths.
//! Success unlinks the source; any failure unlinks the partial outputs and
//! quarantines the source in `error/`.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use futures::io::{AsyncWriteExt, BufReader};
use smol::future::FutureExt;
use tracing::{debug, warn};

use mail_spool::{copy_to_all, read_pre_header, Spool};

use crate::directory::{DomainDirectory, MailboxLookup};

pub const DELIVER_EVERY: u64 = 5; // seconds

pub async fn run_delivery(
    spool: Arc<Spool>,
    directory: Arc<DomainDirectory>,
    wake: smol::channel::Receiver<()>,
) {
    loop {
        async {
            match wake.recv().await {
                Ok(()) => (),
                // Receiver gone; fall back to pure polling
                Err(_) => smol::future::pending::<()>().await,
            }
        }
        .or(async {
            smol::Timer::after(Duration::from_secs(DELIVER_EVERY)).await;
        })
        .await;

        if let Err(e) = deliver_pending(&spool, &directory).await {
            warn!(error = %e, "Delivery scan failed");
        }
    }
}

/// One pass over `received/`.
pub async fn deliver_pending(
    spool: &Spool,
    directory: &DomainDirectory,
) -> std::io::Result<()> {
    for name in spool.scan_received().await? {
        match deliver_one(spool, directory, &name).await {
            Ok(()) => {
                if let Err(e) = spool.remove_received(&name).await {
                    warn!(name = %name, error = %e, "Couldn't unlink delivered message");
                }
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Couldn't deliver message, quarantining");
                spool.quarantine_received(&name).await;
            }
        }
    }
    Ok(())
}

async fn deliver_one(
    spool: &Spool,
    directory: &DomainDirectory,
    name: &str,
) -> anyhow::Result<()> {
    let file = spool.open_received(name).await?;
    let mut reader = BufReader::new(file);
    let (envelope, _offset) = read_pre_header(&mut reader).await?;

    let (local, remote) =
        envelope.partition(|e| directory.lookup_email(e) == MailboxLookup::Mailbox);
    debug!(
        name = %name,
        local = local.recipient_count(),
        remote = remote.recipient_count(),
        "Delivering"
    );

    let mut outputs = Vec::with_capacity(local.recipient_count() + 1);
    let mut local_paths = Vec::with_capacity(local.recipient_count());
    let mut staged_relay = false;

    let result: anyhow::Result<()> = async {
        for e in local.forward_paths() {
            let dir = directory
                .mailbox_dir(e)
                .with_context(|| format!("mailbox for {} vanished", e))?;
            let path = dir.join(name);
            let file = smol::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await
                .with_context(|| format!("opening inbox copy {}", path.display()))?;
            local_paths.push(path);
            outputs.push(file);
        }

        if remote.recipient_count() > 0 {
            let mut file = spool.create_relay(name).await.context("staging relay copy")?;
            staged_relay = true;
            let mut head = Vec::with_capacity(256);
            remote.write_pre_header(&mut head);
            file.write_all(&head).await.context("writing relay pre-header")?;
            outputs.push(file);
        }

        copy_to_all(&mut reader, &mut outputs).await.context("fanning out message")?;
        drop(outputs);

        if staged_relay {
            spool.publish_relay(name).await.context("publishing relay copy")?;
        }
        Ok(())
    }
    .await;

    if result.is_err() {
        for path in &local_paths {
            let _ = smol::fs::remove_file(path).await;
        }
        if staged_relay {
            spool.discard_relay_tmp(name).await;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::executor::block_on;
    use tempdir::TempDir;

    struct Rig {
        tmp: TempDir,
        spool: Spool,
        directory: DomainDirectory,
    }

    fn rig() -> Rig {
        let tmp = TempDir::new("delivery").unwrap();
        for dir in [
            "domains/example.org/alice",
            "domains/example.org/bob",
            "spool/incoming",
            "spool/received",
            "spool/relay",
            "spool/error",
        ] {
            std::fs::create_dir_all(tmp.path().join(dir)).unwrap();
        }
        let spool = block_on(Spool::open(
            tmp.path().join("spool/incoming"),
            tmp.path().join("spool/received"),
            tmp.path().join("spool/relay"),
            tmp.path().join("spool/error"),
        ))
        .unwrap();
        let directory = DomainDirectory::load(&tmp.path().join("domains")).unwrap();
        Rig { tmp, spool, directory }
    }

    const BODY: &str = "Received: FROM 192.0.2.1\r\n\tBY example.org;\r\n\
                        \tTue, 2 Mar 2021 09:05:07 GMT\r\nHi\r\n";

    #[test]
    fn splits_local_and_remote() {
        let rig = rig();
        let message = format!(
            "MAIL FROM: sender@ext.net\r\n\
             RCPT TO: alice@example.org\r\n\
             RCPT TO: bob@example.org\r\n\
             RCPT TO: carol@foreign.example\r\n\
             \r\n{}",
            BODY
        );
        std::fs::write(rig.tmp.path().join("spool/received/5-0.eml"), &message).unwrap();

        block_on(deliver_pending(&rig.spool, &rig.directory)).unwrap();

        // Local copies carry the body only, bytewise identical
        let alice =
            std::fs::read(rig.tmp.path().join("domains/example.org/alice/5-0.eml")).unwrap();
        let bob =
            std::fs::read(rig.tmp.path().join("domains/example.org/bob/5-0.eml")).unwrap();
        assert_eq!(alice, BODY.as_bytes());
        assert_eq!(alice, bob);

        // The relay copy carries a fresh pre-header with the remote paths
        let relay =
            std::fs::read(rig.tmp.path().join("spool/relay/5-0.eml")).unwrap();
        let expected = format!(
            "MAIL FROM: sender@ext.net\r\nRCPT TO: carol@foreign.example\r\n\r\n{}",
            BODY
        );
        assert_eq!(relay, expected.as_bytes());

        // Source is gone
        assert_eq!(std::fs::read_dir(rig.tmp.path().join("spool/received")).unwrap().count(), 0);
    }

    #[test]
    fn local_only_message_creates_no_relay_file() {
        let rig = rig();
        let message = format!(
            "MAIL FROM: <>\r\nRCPT TO: alice@example.org\r\n\r\n{}",
            BODY
        );
        std::fs::write(rig.tmp.path().join("spool/received/6-0.eml"), &message).unwrap();

        block_on(deliver_pending(&rig.spool, &rig.directory)).unwrap();

        assert!(rig.tmp.path().join("domains/example.org/alice/6-0.eml").exists());
        assert_eq!(std::fs::read_dir(rig.tmp.path().join("spool/relay")).unwrap().count(), 0);
    }

    #[test]
    fn unknown_local_mailbox_goes_to_relay_split() {
        // A recipient in a served domain whose mailbox disappeared after
        // acceptance counts as remote and ends up in the relay pre-header
        let rig = rig();
        let message = format!(
            "MAIL FROM: s@ext.net\r\nRCPT TO: mallory@example.org\r\n\r\n{}",
            BODY
        );
        std::fs::write(rig.tmp.path().join("spool/received/7-0.eml"), &message).unwrap();

        block_on(deliver_pending(&rig.spool, &rig.directory)).unwrap();

        let relay = std::fs::read(rig.tmp.path().join("spool/relay/7-0.eml")).unwrap();
        assert!(relay.starts_with(b"MAIL FROM: s@ext.net\r\nRCPT TO: mallory@example.org\r\n"));
    }

    #[test]
    fn poison_file_is_quarantined() {
        let rig = rig();
        std::fs::write(
            rig.tmp.path().join("spool/received/8-0.eml"),
            b"this is not a pre-header\r\n\r\nbody\r\n",
        )
        .unwrap();

        block_on(deliver_pending(&rig.spool, &rig.directory)).unwrap();

        assert_eq!(std::fs::read_dir(rig.tmp.path().join("spool/received")).unwrap().count(), 0);
        assert!(rig.tmp.path().join("spool/error/8-0.eml").exists());
    }

    #[test]
    fn missing_blank_line_is_poison() {
        let rig = rig();
        std::fs::write(
            rig.tmp.path().join("spool/received/9-0.eml"),
            b"MAIL FROM: a@b.c\r\nRCPT TO: alice@example.org\r\n",
        )
        .unwrap();

        block_on(deliver_pending(&rig.spool, &rig.directory)).unwrap();
        assert!(rig.tmp.path().join("spool/error/9-0.eml").exists());
    }

    #[test]
    fn fanout_is_idempotent_bytewise() {
        // Two runs over the same content produce identical copies
        let rig = rig();
        let message = format!(
            "MAIL FROM: s@ext.net\r\nRCPT TO: alice@example.org\r\n\r\n{}",
            BODY
        );
        std::fs::write(rig.tmp.path().join("spool/received/10-0.eml"), &message).unwrap();
        block_on(deliver_pending(&rig.spool, &rig.directory)).unwrap();
        let first =
            std::fs::read(rig.tmp.path().join("domains/example.org/alice/10-0.eml")).unwrap();

        std::fs::write(rig.tmp.path().join("spool/received/10-0.eml"), &message).unwrap();
        block_on(deliver_pending(&rig.spool, &rig.directory)).unwrap();
        let second =
            std::fs::read(rig.tmp.path().join("domains/example.org/alice/10-0.eml")).unwrap();
        assert_eq!(first, second);
    }
}
