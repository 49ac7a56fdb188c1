use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::error::MessagingError;
use crate::models::{Channel, Message, MessagePayload};

/// The chat service the synced message lives on.
#[async_trait]
pub trait MessagingSurface: Send + Sync {
    async fn fetch_surface(&self, surface_id: &str) -> Result<Channel, MessagingError>;

    async fn fetch_message(
        &self,
        surface_id: &str,
        message_id: &str,
    ) -> Result<Message, MessagingError>;

    async fn create_message(
        &self,
        surface_id: &str,
        payload: &MessagePayload,
    ) -> Result<Message, MessagingError>;

    async fn edit_message(
        &self,
        surface_id: &str,
        message_id: &str,
        payload: &MessagePayload,
    ) -> Result<Message, MessagingError>;
}

/// Discord REST implementation, authenticated as a bot.
pub struct DiscordSurface {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl DiscordSurface {
    pub fn new(client: Client, api_base: &str, bot_token: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
        }
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    /// Map the response status onto `MessagingError` and decode the body.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, MessagingError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(MessagingError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MessagingError::Other(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }
        response.json::<T>().await.map_err(MessagingError::from)
    }
}

#[async_trait]
impl MessagingSurface for DiscordSurface {
    async fn fetch_surface(&self, surface_id: &str) -> Result<Channel, MessagingError> {
        let url = format!("{}/channels/{}", self.api_base, surface_id);
        trace!(%url, "Fetching channel");
        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.authorization())
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn fetch_message(
        &self,
        surface_id: &str,
        message_id: &str,
    ) -> Result<Message, MessagingError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.api_base, surface_id, message_id
        );
        trace!(%url, "Fetching message");
        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.authorization())
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn create_message(
        &self,
        surface_id: &str,
        payload: &MessagePayload,
    ) -> Result<Message, MessagingError> {
        let url = format!("{}/channels/{}/messages", self.api_base, surface_id);
        debug!(channel_id = surface_id, "Creating message");
        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, self.authorization())
            .json(payload)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn edit_message(
        &self,
        surface_id: &str,
        message_id: &str,
        payload: &MessagePayload,
    ) -> Result<Message, MessagingError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.api_base, surface_id, message_id
        );
        trace!(channel_id = surface_id, message_id, "Editing message");
        let response = self
            .client
            .patch(&url)
            .header(header::AUTHORIZATION, self.authorization())
            .json(payload)
            .send()
            .await?;
        Self::decode(response).await
    }
}

impl std::fmt::Debug for DiscordSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordSurface")
            .field("api_base", &self.api_base)
            .finish()
    }
}
