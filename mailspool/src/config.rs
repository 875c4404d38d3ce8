//! The hierarchical configuration file.
//!
//! Syntax: `key = value` leaves and `key { ... }` sections, nested freely.
//! Key names and bare values are alphanumerics plus `.-_/@`; anything else
//! must be `"..."`-quoted, where `\r`, `\n`, `\t` and `\\` escapes apply and
//! any other escaped character stands for itself. `#` comments to end of
//! line. Repeated keys are kept in file order.

use std::path::Path;

use anyhow::{bail, Context};

const KEY_NAME_MAXLEN: usize = 255;
const VALUE_MAXLEN: usize = 1024;

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | '@')
}

#[derive(Debug)]
pub struct ConfKey {
    pub name: String,
    pub value: Option<String>,
    pub children: Vec<ConfKey>,
}

#[derive(Debug, Default)]
pub struct Config {
    root: Vec<ConfKey>,
}

enum State {
    TopLevel,
    Key,
    AfterKey,
    AfterEquals,
    Value,
    AfterValue,
    QuotedValue,
    Escape,
    Comment,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config file {}", path.display()))?;
        Config::parse(&text)
            .with_context(|| format!("Parsing config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Config> {
        // `stack` holds the lists being filled, innermost last; a pending
        // key is always the last entry of its list.
        let mut stack: Vec<Vec<ConfKey>> = vec![Vec::new()];
        let mut state = State::TopLevel;
        let mut nline = 1usize;
        let mut key_name = String::new();
        let mut value = String::new();
        let mut have_pending_key = false;

        macro_rules! push_key {
            () => {{
                stack
                    .last_mut()
                    .expect("stack is never empty")
                    .push(ConfKey {
                        name: std::mem::take(&mut key_name),
                        value: None,
                        children: Vec::new(),
                    });
                have_pending_key = true;
            }};
        }

        macro_rules! set_value {
            () => {{
                stack
                    .last_mut()
                    .expect("stack is never empty")
                    .last_mut()
                    .expect("a value always follows a key")
                    .value = Some(std::mem::take(&mut value));
                have_pending_key = false;
            }};
        }

        macro_rules! open_section {
            () => {{
                if !have_pending_key {
                    bail!("line {}: no parent key present", nline);
                }
                stack.push(Vec::new());
                have_pending_key = false;
            }};
        }

        macro_rules! close_section {
            () => {{
                if stack.len() < 2 {
                    bail!("line {}: no parent list present", nline);
                }
                let children = stack.pop().expect("checked above");
                stack
                    .last_mut()
                    .expect("checked above")
                    .last_mut()
                    .expect("a section always follows a key")
                    .children = children;
                have_pending_key = false;
            }};
        }

        for c in text.chars().chain(std::iter::once('\n')) {
            match state {
                State::TopLevel => {
                    if c == '{' {
                        open_section!();
                    } else if c == '}' {
                        close_section!();
                    } else if c == '#' {
                        state = State::Comment;
                    } else if c == '\n' {
                        nline += 1;
                    } else if is_safe(c) {
                        key_name.push(c);
                        state = State::Key;
                    } else if c != '\r' && c != ' ' && c != '\t' {
                        bail!("line {}: wrong character found: [{}]", nline, c);
                    }
                }
                State::Key => {
                    if is_safe(c) {
                        if key_name.len() >= KEY_NAME_MAXLEN {
                            bail!("line {}: key name too long (> {})", nline, KEY_NAME_MAXLEN);
                        }
                        key_name.push(c);
                    } else if c == '\r' || c == ' ' || c == '\t' {
                        push_key!();
                        state = State::AfterKey;
                    } else if c == '\n' {
                        push_key!();
                        nline += 1;
                        state = State::TopLevel;
                    } else if c == '=' {
                        push_key!();
                        state = State::AfterEquals;
                    } else if c == '{' {
                        push_key!();
                        open_section!();
                        state = State::TopLevel;
                    } else if c == '}' {
                        push_key!();
                        close_section!();
                        state = State::TopLevel;
                    } else {
                        bail!("line {}: wrong character found: [{}]", nline, c);
                    }
                }
                State::AfterKey => {
                    if c == '\n' {
                        nline += 1;
                        state = State::TopLevel;
                    } else if c == '#' {
                        state = State::Comment;
                    } else if c == '=' {
                        state = State::AfterEquals;
                    } else if c == '{' {
                        open_section!();
                        state = State::TopLevel;
                    } else if c == '}' {
                        close_section!();
                        state = State::TopLevel;
                    } else if c != '\r' && c != ' ' && c != '\t' {
                        bail!("line {}: wrong character found: [{}]", nline, c);
                    }
                }
                State::AfterEquals => {
                    if is_safe(c) {
                        value.push(c);
                        state = State::Value;
                    } else if c == '"' {
                        state = State::QuotedValue;
                    } else if c == '}' {
                        set_value!();
                        close_section!();
                        state = State::TopLevel;
                    } else if c == '\n' {
                        // The key keeps an empty value
                        set_value!();
                        nline += 1;
                        state = State::TopLevel;
                    } else if c != '\r' && c != ' ' && c != '\t' {
                        bail!("line {}: wrong character found: [{}]", nline, c);
                    }
                }
                State::Value => {
                    if is_safe(c) {
                        if value.len() >= VALUE_MAXLEN {
                            bail!("line {}: value too long (> {})", nline, VALUE_MAXLEN);
                        }
                        value.push(c);
                    } else if c == '\r' || c == ' ' || c == '\t' {
                        set_value!();
                        state = State::AfterValue;
                    } else if c == '}' {
                        set_value!();
                        close_section!();
                        state = State::TopLevel;
                    } else if c == '\n' {
                        set_value!();
                        nline += 1;
                        state = State::TopLevel;
                    } else {
                        bail!("line {}: wrong character found: [{}]", nline, c);
                    }
                }
                State::AfterValue => {
                    if c == '\n' {
                        nline += 1;
                        state = State::TopLevel;
                    } else if c == '}' {
                        close_section!();
                        state = State::TopLevel;
                    } else if c == '#' {
                        state = State::Comment;
                    } else if c != '\r' && c != ' ' && c != '\t' {
                        bail!("line {}: wrong character found: [{}]", nline, c);
                    }
                }
                State::QuotedValue => {
                    if c == '"' {
                        set_value!();
                        state = State::AfterValue;
                    } else if c == '\\' {
                        state = State::Escape;
                    } else {
                        if value.len() >= VALUE_MAXLEN {
                            bail!("line {}: value too long (> {})", nline, VALUE_MAXLEN);
                        }
                        if c == '\n' {
                            nline += 1;
                        }
                        value.push(c);
                    }
                }
                State::Escape => {
                    let unescaped = match c {
                        'r' => '\r',
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    };
                    if value.len() >= VALUE_MAXLEN {
                        bail!("line {}: value too long (> {})", nline, VALUE_MAXLEN);
                    }
                    value.push(unescaped);
                    state = State::QuotedValue;
                }
                State::Comment => {
                    if c == '\n' {
                        nline += 1;
                        state = State::TopLevel;
                    }
                }
            }
        }

        if !matches!(state, State::TopLevel) || stack.len() != 1 {
            bail!("unexpected end of configuration (unclosed section or value)");
        }
        Ok(Config { root: stack.pop().expect("checked above") })
    }

    fn find<'a>(&'a self, path: &[&str]) -> Option<&'a ConfKey> {
        let mut list = &self.root;
        let mut found = None;
        for component in path {
            found = list.iter().find(|k| k.name.eq_ignore_ascii_case(component));
            list = &found?.children;
        }
        found
    }

    /// The value of the first key at `path`.
    pub fn get(&self, path: &[&str]) -> Option<&str> {
        self.find(path).and_then(|k| k.value.as_deref())
    }

    /// Values of every key named by the last path component, in file order.
    pub fn get_all(&self, path: &[&str]) -> Vec<&str> {
        let (last, parents) = match path.split_last() {
            Some(x) => x,
            None => return Vec::new(),
        };
        let list = if parents.is_empty() {
            &self.root
        } else {
            match self.find(parents) {
                Some(k) => &k.children,
                None => return Vec::new(),
            }
        };
        list.iter()
            .filter(|k| k.name.eq_ignore_ascii_case(last))
            .filter_map(|k| k.value.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# mailspool configuration
General {
\tPort = 2525
\tDomainsDirectory = /var/spool/mailspool/domains
\tPostmaster = postmaster@example.org   # the boss
\tLogFile = \"/var/log/mail spool.log\"
\tIPsForRelay = 192.168.0.0/16
\tIPsForRelay = 10.0.0.1
}
";

    #[test]
    fn parses_the_general_section() {
        let conf = Config::parse(SAMPLE).unwrap();
        assert_eq!(conf.get(&["General", "Port"]), Some("2525"));
        assert_eq!(
            conf.get(&["General", "DomainsDirectory"]),
            Some("/var/spool/mailspool/domains")
        );
        assert_eq!(conf.get(&["General", "Postmaster"]), Some("postmaster@example.org"));
        assert_eq!(conf.get(&["General", "Missing"]), None);
    }

    #[test]
    fn key_lookup_is_case_insensitive() {
        let conf = Config::parse(SAMPLE).unwrap();
        assert_eq!(conf.get(&["general", "port"]), Some("2525"));
    }

    #[test]
    fn quoted_values_keep_spaces() {
        let conf = Config::parse(SAMPLE).unwrap();
        assert_eq!(conf.get(&["General", "LogFile"]), Some("/var/log/mail spool.log"));
    }

    #[test]
    fn repeated_keys_come_back_in_order() {
        let conf = Config::parse(SAMPLE).unwrap();
        assert_eq!(
            conf.get_all(&["General", "IPsForRelay"]),
            vec!["192.168.0.0/16", "10.0.0.1"]
        );
    }

    #[test]
    fn escapes_in_quoted_values() {
        let conf =
            Config::parse("Key = \"a\\tb\\r\\n\\\\c\\\"d\"\n").unwrap();
        assert_eq!(conf.get(&["Key"]), Some("a\tb\r\n\\c\"d"));
    }

    #[test]
    fn nested_sections() {
        let conf = Config::parse("a { b { c = 1 } d = 2 }\n").unwrap();
        assert_eq!(conf.get(&["a", "b", "c"]), Some("1"));
        assert_eq!(conf.get(&["a", "d"]), Some("2"));
    }

    #[test]
    fn brace_on_its_own_line() {
        let conf = Config::parse("section\n{\n  k = v\n}\n").unwrap();
        assert_eq!(conf.get(&["section", "k"]), Some("v"));
    }

    #[test]
    fn rejects_garbage() {
        let cases = [
            "{\n",          // section with no key
            "a { b = 1\n",  // unclosed section
            "a = 1 }\n",    // unbalanced close
            "a == b\n",     // bad character in value position
            "k%y = 1\n",    // bad character in key
        ];
        for case in &cases {
            println!("{:?}", case);
            assert!(Config::parse(case).is_err());
        }
    }

    #[test]
    fn empty_value_is_kept() {
        let conf = Config::parse("LogFile =\n").unwrap();
        assert_eq!(conf.get(&["LogFile"]), Some(""));
    }
}
