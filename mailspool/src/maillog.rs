//! The accepted-mail log: one line per message taken in by the receiver.

use std::{
    io::{self, Write},
    net::Ipv4Addr,
    path::Path,
    sync::Mutex,
};

use chrono::{DateTime, Local};
use tracing::warn;

use smtp_wire::Email;

pub struct MailLog {
    file: Mutex<std::fs::File>,
}

impl MailLog {
    pub fn open(path: &Path) -> io::Result<MailLog> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(MailLog { file: Mutex::new(file) })
    }

    /// `[<peer-ip>] [<Day, D Mon YYYY HH:MM:SS>] [<reverse-path>]
    /// [<rcpt>, ...] [<filesize>]`
    pub fn log(
        &self,
        peer: Ipv4Addr,
        when: DateTime<Local>,
        reverse_path: &str,
        recipients: &[Email],
        filesize: u64,
    ) {
        let mut line = format!(
            "[{}] [{}] [{}] [",
            peer,
            when.format("%a, %-d %b %Y %H:%M:%S"),
            reverse_path
        );
        for (i, rcpt) in recipients.iter().enumerate() {
            if i > 0 {
                line.push_str(", ");
            }
            line.push_str(&rcpt.to_string());
        }
        line.push_str(&format!("] [{}]\n", filesize));

        let mut file = self.file.lock().expect("mail log lock poisoned");
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "Couldn't append to the mail log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;
    use smtp_wire::Command;
    use tempdir::TempDir;

    fn email(s: &str) -> Email {
        match Command::parse(format!("RCPT TO:<{}>\r\n", s).as_bytes()) {
            Ok(Command::Rcpt { to, .. }) => to.to_owned(),
            x => panic!("Bad test address {:?}: {:?}", s, x),
        }
    }

    #[test]
    fn formats_one_line_per_message() {
        let tmp = TempDir::new("maillog").unwrap();
        let path = tmp.path().join("mail.log");
        let log = MailLog::open(&path).unwrap();

        let when = Local.ymd(2021, 3, 2).and_hms(9, 5, 7);
        log.log(
            "192.0.2.9".parse().unwrap(),
            when,
            "bob@ext.net",
            &[email("alice@example.org"), email("carol@example.org")],
            1234,
        );
        log.log("192.0.2.9".parse().unwrap(), when, "<>", &[email("alice@example.org")], 7);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "[192.0.2.9] [Tue, 2 Mar 2021 09:05:07] [bob@ext.net] \
             [alice@example.org, carol@example.org] [1234]"
        );
        assert_eq!(lines[1], "[192.0.2.9] [Tue, 2 Mar 2021 09:05:07] [<>] [alice@example.org] [7]");
    }
}
