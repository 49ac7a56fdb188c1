use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, trace, warn};

use crate::credentials::{Credential, CredentialCache};
use crate::error::FetchError;
use crate::models::CurrentlyPlaying;
use crate::utils::normalize_display;

/// Canonical description of the track being played, derived from one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackState {
    pub track_id: String,
    pub title: String,
    pub artist_names: Vec<String>,
    pub album_art_url: Option<String>,
    pub track_url: Option<String>,
    pub started_at: SystemTime,
    pub ends_at: SystemTime,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
}

/// Result of a successful poll: either a track or nothing at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playback {
    Idle,
    Track(PlaybackState),
}

impl Playback {
    pub fn track(&self) -> Option<&PlaybackState> {
        match self {
            Playback::Track(state) => Some(state),
            Playback::Idle => None,
        }
    }

    pub fn track_id(&self) -> Option<&str> {
        self.track().map(|state| state.track_id.as_str())
    }

    /// True only while a track is actually playing (not paused).
    pub fn is_active(&self) -> bool {
        self.track().is_some_and(|state| state.is_playing)
    }

    /// Normalize a status payload observed at `now`.
    pub fn from_currently_playing(payload: CurrentlyPlaying, now: SystemTime) -> Playback {
        let Some(item) = payload.item else {
            return Playback::Idle;
        };

        let duration_ms = item.duration_ms;
        // Reported progress can overshoot the duration right at a track change.
        let progress_ms = payload.progress_ms.unwrap_or(0).min(duration_ms);
        let started_at = now
            .checked_sub(Duration::from_millis(progress_ms))
            .unwrap_or(now);
        let ends_at = started_at + Duration::from_millis(duration_ms);

        let track_id = item
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| item.uri.clone().filter(|uri| !uri.is_empty()))
            .unwrap_or_else(|| item.name.clone());

        Playback::Track(PlaybackState {
            track_id,
            title: normalize_display(&item.name),
            artist_names: item
                .artists
                .iter()
                .map(|artist| normalize_display(&artist.name))
                .collect(),
            album_art_url: item
                .album
                .as_ref()
                .and_then(|album| album.largest_image_url())
                .map(ToString::to_string),
            track_url: item.external_urls.and_then(|urls| urls.spotify),
            started_at,
            ends_at,
            progress_ms,
            duration_ms,
            is_playing: payload.is_playing,
        })
    }
}

/// Source of canonical playback state.
#[async_trait]
pub trait PlaybackSource: Send + Sync {
    async fn fetch(&self) -> Result<Playback, FetchError>;
}

enum StatusResponse {
    Playback(Playback),
    Unauthorized,
}

/// Web API client for the playback service: status polling here, control
/// calls in `commands`.
#[derive(Clone)]
pub struct SpotifyPlayer {
    pub(crate) client: Client,
    pub(crate) api_base: String,
    pub(crate) credentials: CredentialCache,
}

impl SpotifyPlayer {
    pub fn new(client: Client, api_base: &str, credentials: CredentialCache) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn request_status(&self, credential: &Credential) -> Result<StatusResponse, FetchError> {
        let url = self.endpoint("/me/player/currently-playing");
        trace!(%url, "Polling playback status");

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, credential.bearer())
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::NO_CONTENT => {
                debug!("Nothing is playing (204)");
                Ok(StatusResponse::Playback(Playback::Idle))
            }
            StatusCode::UNAUTHORIZED => Ok(StatusResponse::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                warn!(?retry_after, "Playback status rate limited (429)");
                Err(FetchError::Transient("Rate limited (HTTP 429)".to_string()))
            }
            s if s.is_server_error() => Err(FetchError::Transient(format!(
                "Playback service error (HTTP {})",
                s.as_u16()
            ))),
            s if s.is_success() => {
                let body = response.text().await?;
                if body.trim().is_empty() {
                    return Ok(StatusResponse::Playback(Playback::Idle));
                }
                let payload: CurrentlyPlaying = serde_json::from_str(&body)?;
                Ok(StatusResponse::Playback(Playback::from_currently_playing(
                    payload,
                    SystemTime::now(),
                )))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(FetchError::Permanent(format!(
                    "Unexpected status {} from playback service: {}",
                    s.as_u16(),
                    body
                )))
            }
        }
    }
}

#[async_trait]
impl PlaybackSource for SpotifyPlayer {
    /// Fetch the current playback state.
    ///
    /// A rejected credential triggers exactly one refresh and one retry.
    async fn fetch(&self) -> Result<Playback, FetchError> {
        let credential = self.credentials.get_token().await?;
        match self.request_status(&credential).await? {
            StatusResponse::Playback(playback) => Ok(playback),
            StatusResponse::Unauthorized => {
                warn!("Access token rejected (HTTP 401), refreshing and retrying once");
                let credential = self.credentials.force_refresh(&credential).await?;
                match self.request_status(&credential).await? {
                    StatusResponse::Playback(playback) => Ok(playback),
                    StatusResponse::Unauthorized => Err(FetchError::Unauthorized),
                }
            }
        }
    }
}

impl std::fmt::Debug for SpotifyPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotifyPlayer")
            .field("api_base", &self.api_base)
            .finish()
    }
}
