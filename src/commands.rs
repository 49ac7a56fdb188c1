use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::playback::SpotifyPlayer;

// Playback commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    Pause,
    Resume,
    Skip,
}

impl PlaybackCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PlaybackCommand::Pause => "pause",
            PlaybackCommand::Resume => "resume",
            PlaybackCommand::Skip => "skip",
        }
    }

    pub(crate) fn method(&self) -> Method {
        match self {
            PlaybackCommand::Pause | PlaybackCommand::Resume => Method::PUT,
            PlaybackCommand::Skip => Method::POST,
        }
    }

    pub(crate) fn path(&self) -> &'static str {
        match self {
            PlaybackCommand::Pause => "/me/player/pause",
            PlaybackCommand::Resume => "/me/player/play",
            PlaybackCommand::Skip => "/me/player/next",
        }
    }
}

/// Forwards user-triggered control actions to the playback service.
///
/// Failures are reported to the caller once; nothing is retried or queued.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    async fn execute(&self, command: PlaybackCommand) -> Result<(), ControlError>;
}

#[async_trait]
impl CommandGateway for SpotifyPlayer {
    async fn execute(&self, command: PlaybackCommand) -> Result<(), ControlError> {
        let credential = self.credentials.get_token().await?;
        let url = self.endpoint(command.path());
        debug!(command = command.name(), %url, "Sending playback command");

        let response = self
            .client
            .request(command.method(), &url)
            .header(header::AUTHORIZATION, credential.bearer())
            .header(header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(command = command.name(), "Command accepted");
            return Ok(());
        }

        if status == StatusCode::UNAUTHORIZED {
            // Next call will refresh; this one is not retried.
            self.credentials.invalidate(&credential);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(
            command = command.name(),
            status = status.as_u16(),
            %body,
            "Command rejected"
        );
        Err(ControlError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
