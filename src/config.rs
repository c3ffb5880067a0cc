use std::fmt;
use std::path::PathBuf;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_WAL_FILE: &str = "bookings.wal";
const DEFAULT_COMPACT_THRESHOLD: usize = 1000;

/// Where the booking store lives and when to compact it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub wal_file: String,
    /// Compact on start once replay has read at least this many events.
    pub compact_threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String, reason: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "{var}={value:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            wal_file: DEFAULT_WAL_FILE.into(),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

impl Config {
    /// Read `EVSLOT_DATA_DIR`, `EVSLOT_WAL_FILE` and `EVSLOT_COMPACT_THRESHOLD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup("EVSLOT_DATA_DIR") {
            if dir.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    var: "EVSLOT_DATA_DIR",
                    value: dir,
                    reason: "must not be empty",
                });
            }
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(file) = lookup("EVSLOT_WAL_FILE") {
            if file.is_empty() || file.contains(['/', '\\']) {
                return Err(ConfigError::Invalid {
                    var: "EVSLOT_WAL_FILE",
                    value: file,
                    reason: "must be a plain file name",
                });
            }
            config.wal_file = file;
        }

        if let Some(raw) = lookup("EVSLOT_COMPACT_THRESHOLD") {
            config.compact_threshold = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "EVSLOT_COMPACT_THRESHOLD",
                value: raw,
                reason: "expected a non-negative integer",
            })?;
        }

        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_file)
    }
}
