//! Receiver-side policy: the inbound engine's `Config` implementation.
//!
//! Validates recipients against the domain directory, gates relaying on the
//! source allowlist plus DNS reachability, enforces the size and count
//! limits, and spools accepted messages (pre-header, `Received:` trace
//! header, body) through `incoming/` into `received/`.

use std::{borrow::Cow, net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;
use chrono::{Local, Utc};
use tracing::{debug, warn};

use mail_spool::{Envelope, Spool, SpoolWriter};
use smtp_inbound::{Config, ConnectionMetadata, Decision, MailMetadata};
use smtp_outbound::{DnsCache, Resolve};
use smtp_wire::{CommandError, Email, Params, Verb};

use crate::{
    allowlist::RelayAllowlist,
    directory::{DomainDirectory, MailboxLookup},
    maillog::MailLog,
};

pub struct ReceiverConfig<R: Resolve> {
    pub hostname: String,
    pub postmaster: Email,
    pub max_message_size: u64,
    pub max_recipients: usize,
    pub max_transactions: u32,
    pub max_idle_time: i64,
    pub directory: Arc<DomainDirectory>,
    pub allowlist: RelayAllowlist,
    pub spool: Arc<Spool>,
    pub dnscache: Arc<smol::lock::Mutex<DnsCache<R>>>,
    pub maillog: Option<Arc<MailLog>>,
    pub delivery_wake: smol::channel::Sender<()>,
}

pub struct ConnMeta {
    pub peer: Ipv4Addr,
    pub ntransactions: u32,
}

#[derive(Default)]
pub struct MailUser {
    writer: Option<SpoolWriter>,
    size: u64,
}

#[async_trait]
impl<R: Resolve> Config for ReceiverConfig<R> {
    type ConnectionUserMeta = ConnMeta;
    type MailUserMeta = MailUser;

    fn hostname(&self) -> Cow<'static, str> {
        self.hostname.clone().into()
    }

    fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_idle_time)
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<ConnMeta>) -> MailUser {
        MailUser::default()
    }

    async fn filter_from(
        &self,
        _from: &Option<Email>,
        params: &Params,
        _meta: &mut MailMetadata<MailUser>,
        conn_meta: &mut ConnectionMetadata<ConnMeta>,
    ) -> Decision {
        if conn_meta.user.ntransactions >= self.max_transactions {
            let domain = conn_meta
                .hello
                .as_ref()
                .map(|h| h.hostname.clone())
                .unwrap_or_default();
            return Decision::Reject(self.too_many_transactions(&domain));
        }
        if let Some(Some(size)) = params.get("SIZE") {
            match size.parse::<u64>() {
                Ok(n) if n > self.max_message_size => {
                    return Decision::Reject(self.message_too_big());
                }
                Ok(_) => (),
                Err(_) => {
                    return Decision::Reject(
                        self.syntax_error(CommandError::InvalidArgument(Verb::Mail)),
                    );
                }
            }
        }
        Decision::Accept
    }

    async fn filter_to(
        &self,
        to: &mut Email,
        meta: &mut MailMetadata<MailUser>,
        conn_meta: &mut ConnectionMetadata<ConnMeta>,
    ) -> Decision {
        if meta.to.len() >= self.max_recipients {
            return Decision::Reject(self.too_many_recipients());
        }

        // The bare postmaster alias maps to the configured mailbox
        if to.hostname.is_none() {
            *to = self.postmaster.clone();
        }

        match self.directory.lookup_email(to) {
            MailboxLookup::Mailbox => Decision::Accept,
            MailboxLookup::UnknownMailbox => Decision::Reject(self.addressee_unknown()),
            MailboxLookup::NotServed => {
                if !self.allowlist.contains(conn_meta.user.peer) {
                    return Decision::Reject(self.addressee_unknown());
                }
                let domain = to.hostname.as_ref().expect("rewritten above").raw().clone();
                let now = Utc::now().timestamp();
                let reachable = self
                    .dnscache
                    .lock()
                    .await
                    .resolve_destination(&domain, now)
                    .await
                    .is_some();
                if reachable {
                    Decision::Accept
                } else {
                    Decision::Reject(self.addressee_unknown())
                }
            }
        }
    }

    async fn handle_mail_start(
        &self,
        meta: &mut MailMetadata<MailUser>,
        conn_meta: &mut ConnectionMetadata<ConnMeta>,
    ) -> Decision {
        let now = Utc::now();
        let mut writer = match self.spool.create_incoming(now.timestamp() as u64).await {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "Couldn't open an incoming spool file");
                return Decision::Reject(self.insufficient_disk_space());
            }
        };

        let mut envelope = Envelope::new(meta.from.clone());
        for to in &meta.to {
            envelope.add_forward_path(to.clone());
        }
        let mut head = Vec::with_capacity(512);
        envelope.write_pre_header(&mut head);
        head.extend_from_slice(
            format!(
                "Received: FROM {}\r\n\tBY {};\r\n\t{} GMT\r\n",
                conn_meta.user.peer,
                self.hostname,
                now.format("%a, %-d %b %Y %H:%M:%S"),
            )
            .as_bytes(),
        );

        match writer.write_all(&head).await {
            Ok(()) => {
                meta.user.writer = Some(writer);
                Decision::Accept
            }
            Err(e) => {
                warn!(error = %e, "Couldn't write the spool pre-header");
                writer.abort().await;
                Decision::Reject(self.insufficient_disk_space())
            }
        }
    }

    async fn handle_mail_data(
        &self,
        data: &[u8],
        meta: &mut MailMetadata<MailUser>,
        _conn_meta: &mut ConnectionMetadata<ConnMeta>,
    ) -> Decision {
        let write_res = match meta.user.writer.as_mut() {
            Some(w) => w.write_all(data).await,
            None => return Decision::Accept,
        };
        if let Err(e) = write_res {
            warn!(error = %e, "Couldn't write message data to the spool");
            if let Some(w) = meta.user.writer.take() {
                w.abort().await;
            }
            return Decision::Reject(self.insufficient_disk_space());
        }
        meta.user.size += data.len() as u64;
        if meta.user.size > self.max_message_size {
            if let Some(w) = meta.user.writer.take() {
                w.abort().await;
            }
            return Decision::Reject(self.message_too_big());
        }
        Decision::Accept
    }

    async fn handle_mail_done(
        &self,
        meta: MailMetadata<MailUser>,
        conn_meta: &mut ConnectionMetadata<ConnMeta>,
    ) -> Decision {
        let mut user = meta.user;
        let writer = match user.writer.take() {
            Some(w) => w,
            None => return Decision::Reject(self.insufficient_disk_space()),
        };
        match writer.commit().await {
            Err(e) => {
                warn!(error = %e, "Couldn't move message into the received area");
                Decision::Reject(self.insufficient_disk_space())
            }
            Ok(name) => {
                debug!(name = %name, size = user.size, "Message accepted");
                // Liveness hint only; delivery also polls
                let _ = self.delivery_wake.try_send(());
                if let Some(log) = &self.maillog {
                    let reverse = meta
                        .from
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "<>".to_owned());
                    log.log(conn_meta.user.peer, Local::now(), &reverse, &meta.to, user.size);
                }
                conn_meta.user.ntransactions += 1;
                Decision::Accept
            }
        }
    }

    async fn handle_rset(
        &self,
        meta: &mut Option<MailMetadata<MailUser>>,
        _conn_meta: &mut ConnectionMetadata<ConnMeta>,
    ) -> Decision {
        if let Some(meta) = meta.as_mut() {
            if let Some(w) = meta.user.writer.take() {
                w.abort().await;
            }
        }
        Decision::Accept
    }
}
