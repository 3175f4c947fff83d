//! # Sanitizer Options
//!
//! Options are read once, when the sanitizer is installed, from a
//! key/value string:
//!
//! ```text
//! CSAN_OPTIONS="debug:1;quarantine_size_mb:64;detect_locals:true"
//! ```
//!
//! Entries are separated by `;`, a key is separated from its values by `:`,
//! and multiple values by `,`. Only the first value of a key is used.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::types::ByteSize;

/// Environment variable holding the option string
pub const OPTIONS_ENV: &str = "CSAN_OPTIONS";

/// Runtime options of the sanitizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options {
    /// Verbose diagnostics on host and device
    pub debug: bool,
    /// Quarantine cap per device in MiB; zero disables the quarantine
    pub quarantine_size_mb: u32,
    /// Provision shadow memory for work-group local memory
    pub detect_locals: bool,
}

impl Options {
    /// Parse an option string
    pub fn parse(input: &str) -> Result<Self> {
        let mut options = Self::default();

        for (key, values) in split_entries(input)? {
            let Some(value) = values.first() else {
                log::warn!("option \"{}\" has no value, ignored", key);
                continue;
            };

            match key.as_str() {
                "debug" => options.debug = parse_bool(value),
                "quarantine_size_mb" => {
                    options.quarantine_size_mb = value.parse().map_err(|_| {
                        log::error!("\"quarantine_size_mb\" should be an integer, got \"{}\"", value);
                        Error::InvalidConfig
                    })?;
                }
                "detect_locals" => options.detect_locals = parse_bool(value),
                other => log::warn!("unknown sanitizer option \"{}\"", other),
            }
        }

        Ok(options)
    }

    /// Read options from [`OPTIONS_ENV`]; defaults when it is unset
    #[cfg(feature = "std")]
    pub fn from_env() -> Result<Self> {
        match std::env::var(OPTIONS_ENV) {
            Ok(value) => Self::parse(&value),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(std::env::VarError::NotUnicode(_)) => Err(Error::InvalidConfig),
        }
    }

    /// Quarantine cap, or `None` when the quarantine is disabled
    pub fn quarantine_cap(&self) -> Option<ByteSize> {
        match self.quarantine_size_mb {
            0 => None,
            mb => Some(ByteSize::from_mib(u64::from(mb))),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value == "true"
}

fn split_entries(input: &str) -> Result<Vec<(String, Vec<String>)>> {
    let mut entries = Vec::new();

    for entry in input.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, values) = entry.split_once(':').ok_or_else(|| {
            log::error!("malformed option entry \"{}\", expected key:value", entry);
            Error::InvalidConfig
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidConfig);
        }

        let values = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .collect();

        entries.push((String::from(key), values));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::parse("").unwrap();
        assert_eq!(options, Options::default());
        assert!(options.quarantine_cap().is_none());
    }

    #[test]
    fn test_parse_all() {
        let options = Options::parse("debug:1;quarantine_size_mb:16;detect_locals:true").unwrap();
        assert!(options.debug);
        assert!(options.detect_locals);
        assert_eq!(options.quarantine_size_mb, 16);
        assert_eq!(options.quarantine_cap(), Some(ByteSize::from_mib(16)));
    }

    #[test]
    fn test_first_value_wins() {
        let options = Options::parse("debug:0,1").unwrap();
        assert!(!options.debug);
    }

    #[test]
    fn test_bad_integer() {
        assert_eq!(Options::parse("quarantine_size_mb:lots"), Err(Error::InvalidConfig));
    }

    #[test]
    fn test_malformed_entry() {
        assert_eq!(Options::parse("debug"), Err(Error::InvalidConfig));
    }

    #[test]
    fn test_unknown_key_ignored() {
        let options = Options::parse("verbosity:3;detect_locals:1").unwrap();
        assert!(options.detect_locals);
    }
}
