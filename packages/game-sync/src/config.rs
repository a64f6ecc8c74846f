use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Invalid { name: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { name, value } => {
                write!(f, "Invalid value for {}: {}", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Table names and timing for the synchronization client.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub games_table: String,
    pub moves_table: String,
    pub users_table: String,
    pub feed_poll_interval: Duration,
    pub clock_tick: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            games_table: "games".to_string(),
            moves_table: "moves".to_string(),
            users_table: "users".to_string(),
            feed_poll_interval: Duration::from_millis(1000),
            clock_tick: Duration::from_millis(1000),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SyncConfig::default();
        let millis = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(name) {
                Some(value) => match value.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
                    _ => Err(ConfigError::Invalid {
                        name: name.to_string(),
                        value,
                    }),
                },
                None => Ok(default),
            }
        };

        Ok(SyncConfig {
            games_table: lookup("GAMES_TABLE").unwrap_or(defaults.games_table),
            moves_table: lookup("MOVES_TABLE").unwrap_or(defaults.moves_table),
            users_table: lookup("USERS_TABLE").unwrap_or(defaults.users_table),
            feed_poll_interval: millis("FEED_POLL_INTERVAL_MS", defaults.feed_poll_interval)?,
            clock_tick: millis("CLOCK_TICK_MS", defaults.clock_tick)?,
        })
    }
}
