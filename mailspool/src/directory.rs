//! The served-domain model.
//!
//! A domain is served if a directory for it exists under `DomainsDirectory`,
//! and a mailbox exists if the local part has a directory inside the domain.
//! That filesystem layout IS the mailbox database; it is scanned once at
//! startup. Names that fail the wire grammar are warned about and skipped.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use tracing::warn;

use smtp_wire::{Email, Hostname, Localpart};

#[derive(Debug, Eq, PartialEq)]
pub enum MailboxLookup {
    /// Domain served, mailbox exists.
    Mailbox,
    /// Domain served but no such mailbox.
    UnknownMailbox,
    /// Not one of ours.
    NotServed,
}

struct DomainRecord {
    /// Directory name as it appears on disk.
    name: String,
    /// lowercase localpart -> on-disk directory name
    mailboxes: BTreeMap<String, String>,
}

pub struct DomainDirectory {
    root: PathBuf,
    /// lowercase domain -> record
    domains: BTreeMap<String, DomainRecord>,
}

impl DomainDirectory {
    pub fn load(root: &Path) -> anyhow::Result<DomainDirectory> {
        let mut domains = BTreeMap::new();
        let mut nmailboxes = 0usize;

        let entries = std::fs::read_dir(root)
            .with_context(|| format!("Opening domains directory {}", root.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            if Hostname::parse_complete(&name).is_none() {
                warn!(domain = %name, "Not a valid domain name, skipping");
                continue;
            }

            let mut mailboxes = BTreeMap::new();
            let local_parts = std::fs::read_dir(entry.path())
                .with_context(|| format!("Opening domain directory {}", name))?;
            for local_part in local_parts {
                let local_part = local_part?;
                let lp_name = match local_part.file_name().into_string() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                if lp_name.starts_with('.') || !local_part.path().is_dir() {
                    continue;
                }
                if !Localpart::is_valid_dot_string(&lp_name) {
                    warn!(local_part = %lp_name, domain = %name, "Not a valid local part, skipping");
                    continue;
                }
                mailboxes.insert(lp_name.to_lowercase(), lp_name);
                nmailboxes += 1;
            }

            domains.insert(name.to_lowercase(), DomainRecord { name, mailboxes });
        }

        if nmailboxes == 0 {
            bail!("no mailboxes under {}", root.display());
        }

        Ok(DomainDirectory { root: root.to_owned(), domains })
    }

    /// The lexicographically first served domain; the server's identity in
    /// the banner, EHLO response and trace headers.
    pub fn first_domain(&self) -> &str {
        self.domains
            .values()
            .next()
            .map(|d| d.name.as_str())
            .expect("load refuses an empty directory")
    }

    pub fn lookup(&self, local_part: &str, domain: &str) -> MailboxLookup {
        match self.domains.get(&domain.to_lowercase()) {
            None => MailboxLookup::NotServed,
            Some(record) => {
                if record.mailboxes.contains_key(&local_part.to_lowercase()) {
                    MailboxLookup::Mailbox
                } else {
                    MailboxLookup::UnknownMailbox
                }
            }
        }
    }

    pub fn lookup_email(&self, email: &Email) -> MailboxLookup {
        match &email.hostname {
            None => MailboxLookup::NotServed,
            Some(h) => self.lookup(&email.localpart.unquote(), h.raw()),
        }
    }

    /// The on-disk inbox directory for a recipient, with the directory's own
    /// spelling of domain and local part.
    pub fn mailbox_dir(&self, email: &Email) -> Option<PathBuf> {
        let domain = email.hostname.as_ref()?;
        let record = self.domains.get(&domain.raw().to_lowercase())?;
        let lp = record.mailboxes.get(&email.localpart.unquote().to_lowercase())?;
        Some(self.root.join(&record.name).join(lp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use smtp_wire::Command;
    use tempdir::TempDir;

    fn email(s: &str) -> Email {
        match Command::parse(format!("RCPT TO:<{}>\r\n", s).as_bytes()) {
            Ok(Command::Rcpt { to, .. }) => to.to_owned(),
            x => panic!("Bad test address {:?}: {:?}", s, x),
        }
    }

    fn scaffold() -> TempDir {
        let tmp = TempDir::new("domains").unwrap();
        for dir in [
            "example.org/alice",
            "example.org/Bob",
            "zz.example/carol",
            "bad domain/user",
        ] {
            std::fs::create_dir_all(tmp.path().join(dir)).unwrap();
        }
        // A plain file is not a mailbox
        std::fs::write(tmp.path().join("example.org/notes.txt"), b"x").unwrap();
        tmp
    }

    #[test]
    fn loads_and_looks_up_case_insensitively() {
        let tmp = scaffold();
        let dir = DomainDirectory::load(tmp.path()).unwrap();

        assert_eq!(dir.lookup("alice", "example.org"), MailboxLookup::Mailbox);
        assert_eq!(dir.lookup("ALICE", "Example.ORG"), MailboxLookup::Mailbox);
        assert_eq!(dir.lookup("bob", "example.org"), MailboxLookup::Mailbox);
        assert_eq!(dir.lookup("mallory", "example.org"), MailboxLookup::UnknownMailbox);
        assert_eq!(dir.lookup("alice", "foreign.example"), MailboxLookup::NotServed);
        // The invalid domain directory was skipped entirely
        assert_eq!(dir.lookup("user", "bad domain"), MailboxLookup::NotServed);
    }

    #[test]
    fn first_domain_is_lexicographic() {
        let tmp = scaffold();
        let dir = DomainDirectory::load(tmp.path()).unwrap();
        assert_eq!(dir.first_domain(), "example.org");
    }

    #[test]
    fn mailbox_dir_uses_on_disk_spelling() {
        let tmp = scaffold();
        let dir = DomainDirectory::load(tmp.path()).unwrap();
        let path = dir.mailbox_dir(&email("BOB@EXAMPLE.ORG")).unwrap();
        assert!(path.ends_with("example.org/Bob"));
        assert!(path.is_dir());
        assert_eq!(dir.mailbox_dir(&email("nosuch@example.org")), None);
    }

    #[test]
    fn empty_directory_is_a_startup_error() {
        let tmp = TempDir::new("domains").unwrap();
        assert!(DomainDirectory::load(tmp.path()).is_err());
    }

    #[test]
    fn files_are_not_mailboxes() {
        let tmp = scaffold();
        let dir = DomainDirectory::load(tmp.path()).unwrap();
        assert_eq!(dir.lookup("notes.txt", "example.org"), MailboxLookup::UnknownMailbox);
    }
}
