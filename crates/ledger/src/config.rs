use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where and how the SQLite ledger is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// When false, opening a missing database file is an error.
    pub create_if_missing: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            create_if_missing: true,
        }
    }
}

impl LedgerConfig {
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_create_if_missing(mut self, create_if_missing: bool) -> Self {
        self.create_if_missing = create_if_missing;
        self
    }

    /// Defaults overridden by `TALLY_LEDGER_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let config = Self::default();
        match lookup("TALLY_LEDGER_PATH").filter(|p| !p.trim().is_empty()) {
            Some(path) => config.with_path(path),
            None => config,
        }
    }
}

/// `{data_dir}/tally/ledger.db`, falling back to `~/.local/share` and then the
/// working directory.
pub fn default_ledger_path() -> PathBuf {
    let base = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("tally").join("ledger.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_replaces_only_the_path() {
        let config = LedgerConfig::from_lookup(|key| {
            (key == "TALLY_LEDGER_PATH").then(|| "/var/lib/tally/pos.db".to_string())
        });

        assert_eq!(config.path, PathBuf::from("/var/lib/tally/pos.db"));
        assert_eq!(config.max_connections, 4);
        assert!(config.create_if_missing);
    }

    #[test]
    fn blank_env_value_keeps_default() {
        let config = LedgerConfig::from_lookup(|_| Some("  ".to_string()));
        assert!(config.path.ends_with("tally/ledger.db"));
    }
}
