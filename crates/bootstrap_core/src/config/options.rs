//! Launch option parsing.
//!
//! Keys are the `--`-prefixed arguments of the host command line, lower-cased
//! with leading dashes stripped. Both `--key=value` and `--key value` forms are
//! accepted; a key followed by another key (or nothing) is a bare flag.

use std::collections::BTreeMap;

/// Parsed host command-line options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    values: BTreeMap<String, Option<String>>,
}

impl LaunchOptions {
    /// Parses the current process command line.
    pub fn from_env() -> Self {
        Self::parse(std::env::args_os().map(|arg| arg.to_string_lossy().into_owned()))
    }

    /// Parses an argument list. The first element is treated like any other
    /// argument; an executable path never starts with `--`.
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args = args
            .into_iter()
            .map(|arg| arg.as_ref().to_string())
            .collect::<Vec<_>>();
        let mut values = BTreeMap::new();
        let mut index = 0;
        while index < args.len() {
            let Some(key) = option_key(&args[index]) else {
                index += 1;
                continue;
            };

            if let Some((name, value)) = key.split_once('=') {
                values.insert(name.to_ascii_lowercase(), Some(value.to_string()));
                index += 1;
                continue;
            }

            let value = args
                .get(index + 1)
                .filter(|next| option_key(next).is_none())
                .cloned();
            index += if value.is_some() { 2 } else { 1 };
            values.insert(key.to_ascii_lowercase(), value);
        }
        Self { values }
    }

    /// Returns whether `key` appeared on the command line, with or without value.
    pub fn is_defined(&self, key: &str) -> bool {
        self.values.contains_key(&normalize_key(key))
    }

    /// Returns the value given for `key`, if any.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .get(&normalize_key(key))
            .and_then(|value| value.as_deref())
    }

    /// Parses the value given for `key`; unparsable values read as absent.
    pub fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.value(key).and_then(|value| value.trim().parse().ok())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn option_key(arg: &str) -> Option<&str> {
    let stripped = arg.strip_prefix("--")?;
    let stripped = stripped.trim_start_matches('-');
    (!stripped.is_empty()).then_some(stripped)
}

fn normalize_key(key: &str) -> String {
    key.trim_start_matches('-').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::LaunchOptions;

    #[test]
    fn parses_flags_and_both_value_forms() {
        let options = LaunchOptions::parse([
            "/games/Host.x86_64",
            "--melonloader.debug",
            "--melonloader.debugport=55000",
            "--melonloader.debugipaddress",
            "10.0.0.2",
            "-screen-fullscreen",
            "0",
        ]);

        assert!(options.is_defined("melonloader.debug"));
        assert_eq!(options.value("melonloader.debug"), None);
        assert_eq!(options.parsed::<u16>("melonloader.debugport"), Some(55000));
        assert_eq!(options.value("melonloader.debugipaddress"), Some("10.0.0.2"));
        assert!(!options.is_defined("screen-fullscreen"));
    }

    #[test]
    fn keys_are_case_insensitive_and_dash_tolerant() {
        let options = LaunchOptions::parse(["--MelonLoader.BaseDir=/opt/loader"]);
        assert_eq!(options.value("--melonloader.basedir"), Some("/opt/loader"));
    }

    #[test]
    fn flag_followed_by_flag_has_no_value() {
        let options = LaunchOptions::parse(["--no-mods", "--melonloader.debug"]);
        assert!(options.is_defined("no-mods"));
        assert_eq!(options.value("no-mods"), None);
        assert_eq!(options.len(), 2);
    }

    #[test]
    fn unparsable_numbers_read_as_absent() {
        let options = LaunchOptions::parse(["--melonloader.debugport", "not-a-port"]);
        assert_eq!(options.parsed::<u16>("melonloader.debugport"), None);
    }
}
