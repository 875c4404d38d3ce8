//! The on-disk spool shared by the receiver, delivery and relay stages.
//!
//! Messages move through four flat areas, each owned by exactly one stage at
//! a time: the receiver writes into `incoming/` and renames into `received/`
//! once a message is complete; delivery is the sole reader of `received/`;
//! relay is the sole reader of `relay/`; poison files land in `error/`.
//! Visibility is always create-then-rename, so a reader never observes a
//! partially written file.
//!
//! Every spooled file starts with a pre-header carrying the envelope:
//!
//! ```text
//! MAIL FROM: <reverse-path>\r\n
//! RCPT TO: <forward-path>\r\n   (repeated)
//! \r\n
//! ```
//!
//! followed by the message content. The pre-header reuses the wire command
//! grammar so both sides share one parser.

use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
};

use futures::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
};
use tracing::warn;

use smtp_wire::{Command, Email, TEXT_LINE_MAXLEN};

pub const MESSAGE_EXTENSION: &str = ".eml";

const COPY_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PreHeaderError {
    #[error("Reading pre-header")]
    Io(#[from] io::Error),

    #[error("Pre-header line is not a MAIL or RCPT command: ‘{0}’")]
    UnexpectedLine(String),

    #[error("Pre-header has more than one MAIL FROM line")]
    DuplicateReversePath,

    #[error("Pre-header ended before the empty line")]
    Truncated,

    #[error("Pre-header has no MAIL FROM line")]
    NoReversePath,

    #[error("Pre-header has no RCPT TO line")]
    NoForwardPath,
}

/// The envelope carried by a pre-header: one reverse path (`None` is the
/// null path `<>`) plus at least one forward path, kept sorted by
/// `(domain, localpart)` with case-insensitive dedup.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Envelope {
    pub reverse_path: Option<Email>,
    forward_paths: Vec<Email>,
}

fn path_key(e: &Email) -> (String, String) {
    (
        e.hostname
            .as_ref()
            .map(|h| h.raw().to_lowercase())
            .unwrap_or_default(),
        e.localpart.raw().to_lowercase(),
    )
}

impl Envelope {
    pub fn new(reverse_path: Option<Email>) -> Envelope {
        Envelope { reverse_path, forward_paths: Vec::new() }
    }

    /// Insert keeping the list sorted; duplicate recipients are dropped.
    pub fn add_forward_path(&mut self, email: Email) {
        let key = path_key(&email);
        match self.forward_paths.binary_search_by_key(&key, path_key) {
            Ok(_) => (),
            Err(pos) => self.forward_paths.insert(pos, email),
        }
    }

    pub fn forward_paths(&self) -> &[Email] {
        &self.forward_paths
    }

    pub fn recipient_count(&self) -> usize {
        self.forward_paths.len()
    }

    /// Split recipients by a predicate, keeping the reverse path on both
    /// halves. The first envelope gets the recipients the predicate accepts.
    pub fn partition(&self, pred: impl Fn(&Email) -> bool) -> (Envelope, Envelope) {
        let mut yes = Envelope::new(self.reverse_path.clone());
        let mut no = Envelope::new(self.reverse_path.clone());
        for e in &self.forward_paths {
            if pred(e) {
                yes.forward_paths.push(e.clone());
            } else {
                no.forward_paths.push(e.clone());
            }
        }
        (yes, no)
    }

    /// Recipients grouped by destination domain (lowercased key). The list
    /// is sorted by domain, so groups are consecutive runs.
    pub fn by_domain(&self) -> Vec<(String, Vec<&Email>)> {
        let mut groups: Vec<(String, Vec<&Email>)> = Vec::new();
        for e in &self.forward_paths {
            let domain = e
                .hostname
                .as_ref()
                .map(|h| h.raw().to_lowercase())
                .unwrap_or_default();
            match groups.last_mut() {
                Some((d, members)) if *d == domain => members.push(e),
                _ => groups.push((domain, vec![e])),
            }
        }
        groups
    }

    /// The `MAIL FROM:` argument as spooled: `<>` for the null path.
    pub fn reverse_path_string(&self) -> String {
        match &self.reverse_path {
            Some(e) => e.to_string(),
            None => "<>".to_owned(),
        }
    }

    /// Render the pre-header, trailing empty line included.
    pub fn write_pre_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"MAIL FROM: ");
        out.extend_from_slice(self.reverse_path_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        for e in &self.forward_paths {
            out.extend_from_slice(b"RCPT TO: ");
            out.extend_from_slice(e.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Re-parse a pre-header from the head of a spooled file. On success the
/// reader is positioned at the first body byte and the returned offset is
/// the pre-header length in bytes.
pub async fn read_pre_header<R>(input: &mut R) -> Result<(Envelope, u64), PreHeaderError>
where
    R: AsyncBufRead + Unpin,
{
    let mut envelope = Envelope::default();
    let mut have_reverse = false;
    let mut offset = 0u64;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = input.read_until(b'\n', &mut line).await?;
        if n == 0 || line.last() != Some(&b'\n') || n > TEXT_LINE_MAXLEN {
            return Err(PreHeaderError::Truncated);
        }
        offset += n as u64;

        // End of pre-header?
        if line == b"\n" || line == b"\r\n" {
            if !have_reverse {
                return Err(PreHeaderError::NoReversePath);
            }
            if envelope.forward_paths.is_empty() {
                return Err(PreHeaderError::NoForwardPath);
            }
            return Ok((envelope, offset));
        }

        match Command::parse(&line) {
            Ok(Command::Mail { from, .. }) => {
                if have_reverse {
                    return Err(PreHeaderError::DuplicateReversePath);
                }
                envelope.reverse_path = from.map(|f| f.to_owned());
                have_reverse = true;
            }
            Ok(Command::Rcpt { to, .. }) => {
                envelope.add_forward_path(to.to_owned());
            }
            _ => {
                return Err(PreHeaderError::UnexpectedLine(
                    String::from_utf8_lossy(&line).trim_end().to_owned(),
                ));
            }
        }
    }
}

/// Stream the remainder of `input` to every output in lock step. A short
/// write on any output is fatal; cleanup of partial outputs is the caller's
/// business.
pub async fn copy_to_all<R, W>(input: &mut R, outputs: &mut [W]) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for out in outputs.iter_mut() {
            out.write_all(&buf[..n]).await?;
        }
        total += n as u64;
    }
    for out in outputs.iter_mut() {
        out.flush().await?;
    }
    Ok(total)
}

/// The four flat spool areas plus the per-process file name sequence.
pub struct Spool {
    incoming: PathBuf,
    received: PathBuf,
    relay: PathBuf,
    error: PathBuf,
    seq: AtomicU32,
}

impl Spool {
    /// Every area must already exist; creating them is deployment's business.
    pub async fn open(
        incoming: PathBuf,
        received: PathBuf,
        relay: PathBuf,
        error: PathBuf,
    ) -> io::Result<Spool> {
        for dir in [&incoming, &received, &relay, &error] {
            let meta = smol::fs::metadata(dir).await.map_err(|e| {
                io::Error::new(e.kind(), format!("spool area {}: {}", dir.display(), e))
            })?;
            if !meta.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("spool area {} is not a directory", dir.display()),
                ));
            }
        }
        Ok(Spool { incoming, received, relay, error, seq: AtomicU32::new(0) })
    }

    pub fn received_path(&self, name: &str) -> PathBuf {
        self.received.join(name)
    }

    pub fn relay_path(&self, name: &str) -> PathBuf {
        self.relay.join(name)
    }

    pub fn error_path(&self, name: &str) -> PathBuf {
        self.error.join(name)
    }

    /// Open a fresh `<unix-ts>-<seq>.eml` under `incoming/`. The sequence is
    /// monotonic within the process; reuse of a timestamp across restarts is
    /// resolved by probing for an unused name.
    pub async fn create_incoming(&self, unix_ts: u64) -> io::Result<SpoolWriter> {
        loop {
            let n = self.seq.fetch_add(1, Ordering::Relaxed);
            let name = format!("{}-{}{}", unix_ts, n, MESSAGE_EXTENSION);
            let path = self.incoming.join(&name);
            if smol::fs::metadata(&path).await.is_ok() {
                continue;
            }
            let file = smol::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await?;
            return Ok(SpoolWriter {
                file,
                incoming_path: path,
                received_path: self.received.join(&name),
                name,
                written: 0,
            });
        }
    }

    /// `*.eml` names in an area, dotfiles and foreign names skipped, sorted
    /// so older messages come first.
    async fn scan(&self, dir: &Path, limit: usize) -> io::Result<Vec<String>> {
        use futures::StreamExt;

        let mut names = Vec::new();
        let mut entries = smol::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') || !name.ends_with(MESSAGE_EXTENSION) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        names.truncate(limit);
        Ok(names)
    }

    pub async fn scan_received(&self) -> io::Result<Vec<String>> {
        self.scan(&self.received, usize::MAX).await
    }

    pub async fn scan_relay(&self, limit: usize) -> io::Result<Vec<String>> {
        self.scan(&self.relay, limit).await
    }

    pub async fn open_received(&self, name: &str) -> io::Result<smol::fs::File> {
        smol::fs::File::open(self.received.join(name)).await
    }

    pub async fn open_relay(&self, name: &str) -> io::Result<smol::fs::File> {
        smol::fs::File::open(self.relay.join(name)).await
    }

    /// Stage `relay/<name>` under a hidden temporary name; scans skip
    /// dotfiles, so the file only becomes visible once published.
    pub async fn create_relay(&self, name: &str) -> io::Result<smol::fs::File> {
        smol::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.relay.join(format!(".{}", name)))
            .await
    }

    /// Atomically reveal a staged relay file to the relay scan.
    pub async fn publish_relay(&self, name: &str) -> io::Result<()> {
        smol::fs::rename(self.relay.join(format!(".{}", name)), self.relay.join(name)).await
    }

    /// Drop a staged relay file that will not be published.
    pub async fn discard_relay_tmp(&self, name: &str) {
        if let Err(e) = smol::fs::remove_file(self.relay.join(format!(".{}", name))).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(name, error = %e, "Couldn't unlink staged relay message");
            }
        }
    }

    pub async fn remove_received(&self, name: &str) -> io::Result<()> {
        smol::fs::remove_file(self.received.join(name)).await
    }

    pub async fn remove_relay(&self, name: &str) -> io::Result<()> {
        smol::fs::remove_file(self.relay.join(name)).await
    }

    /// Move a poison file out of the queue so it never blocks the scan.
    pub async fn quarantine_received(&self, name: &str) {
        if let Err(e) =
            smol::fs::rename(self.received.join(name), self.error.join(name)).await
        {
            warn!(name, error = %e, "Couldn't move received message to the error area");
        }
    }

    pub async fn quarantine_relay(&self, name: &str) {
        if let Err(e) = smol::fs::rename(self.relay.join(name), self.error.join(name)).await {
            warn!(name, error = %e, "Couldn't move relay message to the error area");
        }
    }
}

/// An open `incoming/` file. `commit` renames it into `received/` in one
/// atomic step; `abort` unlinks it. Dropping without either leaves the file
/// behind in `incoming/`, which the next startup treats as garbage.
pub struct SpoolWriter {
    file: smol::fs::File,
    name: String,
    incoming_path: PathBuf,
    received_path: PathBuf,
    written: u64,
}

impl SpoolWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    pub async fn commit(mut self) -> io::Result<String> {
        self.file.flush().await?;
        drop(self.file);
        smol::fs::rename(&self.incoming_path, &self.received_path).await?;
        Ok(self.name)
    }

    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = smol::fs::remove_file(&self.incoming_path).await {
            warn!(name = %self.name, error = %e, "Couldn't unlink aborted incoming message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::{executor::block_on, io::BufReader};
    use tempdir::TempDir;

    fn email(s: &str) -> Email {
        match Command::parse(format!("RCPT TO:<{}>\r\n", s).as_bytes()) {
            Ok(Command::Rcpt { to, .. }) => to.to_owned(),
            x => panic!("Bad test address {:?}: {:?}", s, x),
        }
    }

    #[test]
    fn pre_header_roundtrip() {
        let mut envelope = Envelope::new(Some(email("bob@ext.net")));
        envelope.add_forward_path(email("alice@example.org"));
        envelope.add_forward_path(email("carol@foreign.example"));
        envelope.add_forward_path(email("alice@example.org")); // duplicate

        let mut wire = Vec::new();
        envelope.write_pre_header(&mut wire);
        assert_eq!(
            wire,
            b"MAIL FROM: bob@ext.net\r\n\
              RCPT TO: alice@example.org\r\n\
              RCPT TO: carol@foreign.example\r\n\
              \r\n"
                .to_vec()
        );

        let mut reader = BufReader::new(futures::io::Cursor::new(&wire));
        let (parsed, offset) = block_on(read_pre_header(&mut reader)).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(offset, wire.len() as u64);
    }

    #[test]
    fn pre_header_null_reverse_path() {
        let mut envelope = Envelope::new(None);
        envelope.add_forward_path(email("alice@example.org"));

        let mut wire = Vec::new();
        envelope.write_pre_header(&mut wire);
        assert!(wire.starts_with(b"MAIL FROM: <>\r\n"));

        let mut reader = BufReader::new(futures::io::Cursor::new(&wire));
        let (parsed, _) = block_on(read_pre_header(&mut reader)).unwrap();
        assert_eq!(parsed.reverse_path, None);
        assert_eq!(parsed.reverse_path_string(), "<>");
    }

    #[test]
    fn pre_header_rejects_garbage() {
        let cases: &[&[u8]] = &[
            b"",                                                        // empty
            b"MAIL FROM: a@b.c\r\n",                                    // truncated
            b"MAIL FROM: a@b.c\r\nNOOP\r\n\r\n",                        // foreign command
            b"MAIL FROM: a@b.c\r\nMAIL FROM: d@e.f\r\n\r\n",            // duplicate MAIL
            b"MAIL FROM: a@b.c\r\n\r\n",                                // no recipients
            b"RCPT TO: a@b.c\r\n\r\n",                                  // no reverse path
            b"Received: FROM somewhere\r\n\r\n",                        // body without pre-header
        ];
        for case in cases {
            let mut reader = BufReader::new(futures::io::Cursor::new(*case));
            let r = block_on(read_pre_header(&mut reader));
            println!("{:?} -> {:?}", String::from_utf8_lossy(case), r);
            assert!(r.is_err());
        }
    }

    #[test]
    fn pre_header_leaves_reader_at_body() {
        let wire = b"MAIL FROM: <>\r\nRCPT TO: a@b.c\r\n\r\nBody first line\r\n";
        let mut reader = BufReader::new(futures::io::Cursor::new(&wire[..]));
        let (_, offset) = block_on(read_pre_header(&mut reader)).unwrap();
        let mut rest = Vec::new();
        block_on(futures::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)).unwrap();
        assert_eq!(rest, b"Body first line\r\n");
        assert_eq!(offset as usize + rest.len(), wire.len());
    }

    #[test]
    fn grouping_by_domain() {
        let mut envelope = Envelope::new(None);
        envelope.add_forward_path(email("b@mx.example"));
        envelope.add_forward_path(email("a@mx.example"));
        envelope.add_forward_path(email("z@aaa.example"));

        let groups = envelope.by_domain();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "aaa.example");
        assert_eq!(groups[1].0, "mx.example");
        assert_eq!(groups[1].1.len(), 2);
    }

    #[test]
    fn copy_fans_out_identically() {
        let body = b"line one\r\nline two\r\n".to_vec();
        let mut input = futures::io::Cursor::new(body.clone());
        let mut outputs = vec![Vec::new(), Vec::new(), Vec::new()];
        let n = block_on(copy_to_all(&mut input, &mut outputs)).unwrap();
        assert_eq!(n, body.len() as u64);
        for out in &outputs {
            assert_eq!(out, &body);
        }
    }

    #[test]
    fn spool_commit_moves_into_received() {
        let tmp = TempDir::new("spool").unwrap();
        for d in ["incoming", "received", "relay", "error"] {
            std::fs::create_dir(tmp.path().join(d)).unwrap();
        }
        smol::block_on(async {
            let spool = Spool::open(
                tmp.path().join("incoming"),
                tmp.path().join("received"),
                tmp.path().join("relay"),
                tmp.path().join("error"),
            )
            .await
            .unwrap();

            let mut w = spool.create_incoming(1234567).await.unwrap();
            assert!(w.name().starts_with("1234567-"));
            w.write_all(b"MAIL FROM: <>\r\nRCPT TO: a@b.c\r\n\r\nHi\r\n")
                .await
                .unwrap();
            let name = w.commit().await.unwrap();

            assert_eq!(spool.scan_received().await.unwrap(), vec![name.clone()]);
            assert!(!tmp.path().join("incoming").join(&name).exists());

            // A second file under the same timestamp gets the next sequence
            let w2 = spool.create_incoming(1234567).await.unwrap();
            assert_ne!(w2.name(), name);
            w2.abort().await;
            assert!(spool.scan_received().await.unwrap().len() == 1);
        });
    }

    #[test]
    fn abort_unlinks_incoming() {
        let tmp = TempDir::new("spool").unwrap();
        for d in ["incoming", "received", "relay", "error"] {
            std::fs::create_dir(tmp.path().join(d)).unwrap();
        }
        smol::block_on(async {
            let spool = Spool::open(
                tmp.path().join("incoming"),
                tmp.path().join("received"),
                tmp.path().join("relay"),
                tmp.path().join("error"),
            )
            .await
            .unwrap();
            let mut w = spool.create_incoming(99).await.unwrap();
            w.write_all(b"partial").await.unwrap();
            let name = w.name().to_owned();
            w.abort().await;
            assert!(!tmp.path().join("incoming").join(&name).exists());
        });
    }

    #[test]
    fn scan_skips_foreign_names() {
        let tmp = TempDir::new("spool").unwrap();
        for d in ["incoming", "received", "relay", "error"] {
            std::fs::create_dir(tmp.path().join(d)).unwrap();
        }
        std::fs::write(tmp.path().join("received/1-0.eml"), b"x").unwrap();
        std::fs::write(tmp.path().join("received/.hidden.eml"), b"x").unwrap();
        std::fs::write(tmp.path().join("received/notes.txt"), b"x").unwrap();
        smol::block_on(async {
            let spool = Spool::open(
                tmp.path().join("incoming"),
                tmp.path().join("received"),
                tmp.path().join("relay"),
                tmp.path().join("error"),
            )
            .await
            .unwrap();
            assert_eq!(spool.scan_received().await.unwrap(), vec!["1-0.eml".to_owned()]);
        });
    }
}
