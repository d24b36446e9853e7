use std::net::SocketAddr;

use thiserror::Error;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("TALLY_INGEST_ADDR is not a socket address: {0:?}")]
    InvalidAddr(String),
}

/// Settings for the `tally-ingest` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub addr: SocketAddr,
    pub token: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            token: None,
        }
    }
}

impl IngestConfig {
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Reads `TALLY_INGEST_ADDR` (default `0.0.0.0:8080`) and
    /// `TALLY_INGEST_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw = lookup("TALLY_INGEST_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddr(raw.clone()))?;

        Ok(Self {
            addr,
            token: lookup("TALLY_INGEST_TOKEN").filter(|t| !t.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = IngestConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, IngestConfig::default());
        assert_eq!(config.addr.to_string(), DEFAULT_ADDR);
    }

    #[test]
    fn bad_address_is_an_error() {
        let err = IngestConfig::from_lookup(|key| {
            (key == "TALLY_INGEST_ADDR").then(|| "localhost".to_string())
        })
        .unwrap_err();
        assert_eq!(err, ConfigError::InvalidAddr("localhost".into()));
    }
}
