use std::{env, fmt, time::Duration};

use crate::error::ConfigError;
use crate::scheduler::ScheduleConfig;

pub const DEFAULT_SPOTIFY_API_BASE: &str = "https://api.spotify.com/v1";
pub const DEFAULT_SPOTIFY_ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Client credentials and refresh token for the playback service.
#[derive(Clone, PartialEq, Eq)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for SpotifyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpotifyCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Everything the engine needs, read once at startup.
#[derive(Clone)]
pub struct Settings {
    pub channel_id: String,
    pub initial_message_id: Option<String>,
    pub discord_token: String,
    pub spotify: SpotifyCredentials,
    pub spotify_api_base: String,
    pub spotify_accounts_base: String,
    pub discord_api_base: String,
    pub schedule: ScheduleConfig,
    pub request_timeout: Duration,
    pub token_safety_factor: f64,
}

impl Settings {
    /// Load `.env` (if any) and read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // optionally load .env
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup. Empty values are
    /// treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        // helper to parse seconds into Duration
        let parse_secs = |key: &'static str, default_secs: u64| -> Result<Duration, ConfigError> {
            match get(key) {
                None => Ok(Duration::from_secs(default_secs)),
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| ConfigError::Invalid {
                        key,
                        reason: e.to_string(),
                    }),
            }
        };

        // helper to parse a float within an inclusive range
        let parse_factor =
            |key: &'static str, default: f64, min: f64, max: f64| -> Result<f64, ConfigError> {
                let value = match get(key) {
                    None => return Ok(default),
                    Some(raw) => raw.parse::<f64>().map_err(|e| ConfigError::Invalid {
                        key,
                        reason: e.to_string(),
                    })?,
                };
                if value.is_finite() && (min..=max).contains(&value) {
                    Ok(value)
                } else {
                    Err(ConfigError::Invalid {
                        key,
                        reason: format!("expected a value between {} and {}", min, max),
                    })
                }
            };

        let spotify = SpotifyCredentials {
            client_id: required("SPOTIFY_CLIENT_ID")?,
            client_secret: required("SPOTIFY_CLIENT_SECRET")?,
            refresh_token: required("SPOTIFY_REFRESH_TOKEN")?,
        };

        let schedule = ScheduleConfig {
            startup_delay: parse_secs("STARTUP_DELAY_SECS", 5)?,
            idle_interval: parse_secs("IDLE_INTERVAL_SECS", 15)?,
            playing_interval: parse_secs("PLAYING_INTERVAL_SECS", 5)?,
            max_playing_interval: parse_secs("MAX_PLAYING_INTERVAL_SECS", 15)?,
            playing_growth: parse_factor("PLAYING_GROWTH_FACTOR", 1.25, 1.0, 10.0)?,
            backoff_growth: parse_factor("BACKOFF_GROWTH_FACTOR", 2.0, 1.0, 10.0)?,
            max_backoff: parse_secs("MAX_BACKOFF_SECS", 120)?,
        };
        if schedule.idle_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "IDLE_INTERVAL_SECS",
                reason: "must be at least one second".to_string(),
            });
        }
        if schedule.playing_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "PLAYING_INTERVAL_SECS",
                reason: "must be at least one second".to_string(),
            });
        }
        if schedule.max_playing_interval < schedule.playing_interval {
            return Err(ConfigError::Invalid {
                key: "MAX_PLAYING_INTERVAL_SECS",
                reason: "must not be shorter than PLAYING_INTERVAL_SECS".to_string(),
            });
        }
        // Backoff must never poll faster than the healthy cadence.
        let slowest_cadence = schedule.idle_interval.max(schedule.max_playing_interval);
        if schedule.max_backoff < slowest_cadence {
            return Err(ConfigError::Invalid {
                key: "MAX_BACKOFF_SECS",
                reason: format!(
                    "must be at least {} (the slowest polling interval)",
                    slowest_cadence.as_secs()
                ),
            });
        }

        let request_timeout = parse_secs("REQUEST_TIMEOUT_SECS", 10)?;
        if request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "REQUEST_TIMEOUT_SECS",
                reason: "must be at least one second".to_string(),
            });
        }

        Ok(Settings {
            channel_id: required("SYNC_CHANNEL_ID")?,
            initial_message_id: get("SYNC_MESSAGE_ID"),
            discord_token: required("DISCORD_BOT_TOKEN")?,
            spotify,
            spotify_api_base: get("SPOTIFY_API_BASE")
                .unwrap_or_else(|| DEFAULT_SPOTIFY_API_BASE.to_string()),
            spotify_accounts_base: get("SPOTIFY_ACCOUNTS_BASE")
                .unwrap_or_else(|| DEFAULT_SPOTIFY_ACCOUNTS_BASE.to_string()),
            discord_api_base: get("DISCORD_API_BASE")
                .unwrap_or_else(|| DEFAULT_DISCORD_API_BASE.to_string()),
            schedule,
            request_timeout,
            token_safety_factor: parse_factor("TOKEN_SAFETY_FACTOR", 0.9, 0.1, 0.99)?,
        })
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("channel_id", &self.channel_id)
            .field("initial_message_id", &self.initial_message_id)
            .field("discord_token", &"<redacted>")
            .field("spotify", &self.spotify)
            .field("spotify_api_base", &self.spotify_api_base)
            .field("spotify_accounts_base", &self.spotify_accounts_base)
            .field("discord_api_base", &self.discord_api_base)
            .field("schedule", &self.schedule)
            .field("request_timeout", &self.request_timeout)
            .field("token_safety_factor", &self.token_safety_factor)
            .finish()
    }
}
