//! Chat-platform capability: channels, members, and direct messages.
//!
//! The chat platform is the source of truth for membership; it is read from
//! extensively and written to only for notification DMs.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use url::Url;

use crate::config::ChatSettings;
use crate::error::{ApiError, ConfigError};

use super::{build_http_client, with_backoff};

const SERVICE: &str = "chat";
const PAGE_SIZE: usize = 200;

/// A channel as observed on the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChannel {
    pub id: String,
    /// URL-safe slug (the platform's `name`).
    #[serde(rename = "name")]
    pub slug: String,
    pub display_name: String,
}

/// A channel member.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
}

/// Abstract chat-platform contract the engine consumes.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn list_channels(&self, team_id: &str) -> Result<Vec<ChatChannel>, ApiError>;

    /// Look up a channel by its slug. `Ok(None)` when no such channel exists.
    async fn get_channel_by_slug(
        &self,
        team_id: &str,
        slug: &str,
    ) -> Result<Option<ChatChannel>, ApiError>;

    async fn list_channel_members(&self, channel_id: &str) -> Result<Vec<ChatUser>, ApiError>;

    /// Platform roles of a user (used by callers gating who may trigger a sync).
    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>, ApiError>;

    async fn send_direct_message(&self, user_id: &str, text: &str) -> Result<(), ApiError>;

    /// The engine's own platform identity, for opening DM conversations.
    async fn bot_user_id(&self) -> Result<String, ApiError>;
}

/// REST implementor.
pub struct HttpChatClient {
    http: reqwest::Client,
    base_url: Url,
    token: SecretString,
    bot_id: OnceCell<String>,
}

impl HttpChatClient {
    pub fn new(settings: &ChatSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            http: build_http_client(SERVICE)?,
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
            bot_id: OnceCell::new(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v4/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .http
            .get(self.endpoint(path))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|source| ApiError::Transport { service: SERVICE, source })?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            service: SERVICE,
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|e| ApiError::Decode { service: SERVICE, message: e.to_string() })
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn list_channels(&self, team_id: &str) -> Result<Vec<ChatChannel>, ApiError> {
        let mut channels = Vec::new();
        let mut page = 0;
        loop {
            let path = format!("teams/{team_id}/channels?page={page}&per_page={PAGE_SIZE}");
            let batch: Vec<ChatChannel> =
                with_backoff("chat.list_channels", || self.get_json(&path)).await?;
            let done = batch.len() < PAGE_SIZE;
            channels.extend(batch);
            if done {
                return Ok(channels);
            }
            page += 1;
        }
    }

    async fn get_channel_by_slug(
        &self,
        team_id: &str,
        slug: &str,
    ) -> Result<Option<ChatChannel>, ApiError> {
        let path = format!("teams/{team_id}/channels/name/{slug}");
        match with_backoff("chat.get_channel", || self.get_json::<ChatChannel>(&path)).await {
            Ok(channel) => Ok(Some(channel)),
            Err(ApiError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_channel_members(&self, channel_id: &str) -> Result<Vec<ChatUser>, ApiError> {
        let mut members = Vec::new();
        let mut page = 0;
        loop {
            let path = format!("users?in_channel={channel_id}&page={page}&per_page={PAGE_SIZE}");
            let batch: Vec<ChatUser> =
                with_backoff("chat.list_channel_members", || self.get_json(&path)).await?;
            let done = batch.len() < PAGE_SIZE;
            members.extend(batch);
            if done {
                return Ok(members);
            }
            page += 1;
        }
    }

    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        #[derive(Deserialize)]
        struct UserRoles {
            #[serde(default)]
            roles: String,
        }
        let path = format!("users/{user_id}");
        let user: UserRoles = with_backoff("chat.user_roles", || self.get_json(&path)).await?;
        Ok(user.roles.split_whitespace().map(str::to_string).collect())
    }

    async fn send_direct_message(&self, user_id: &str, text: &str) -> Result<(), ApiError> {
        let bot_id = self.bot_user_id().await?;

        #[derive(Deserialize)]
        struct Channel {
            id: String,
        }
        let channel: Channel = {
            let response = self
                .http
                .post(self.endpoint("channels/direct"))
                .bearer_auth(self.token.expose_secret())
                .json(&json!([bot_id, user_id]))
                .send()
                .await
                .map_err(|source| ApiError::Transport { service: SERVICE, source })?;
            decode(response).await?
        };

        let response = self
            .http
            .post(self.endpoint("posts"))
            .bearer_auth(self.token.expose_secret())
            .json(&json!({ "channel_id": channel.id, "message": text }))
            .send()
            .await
            .map_err(|source| ApiError::Transport { service: SERVICE, source })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn bot_user_id(&self) -> Result<String, ApiError> {
        #[derive(Deserialize)]
        struct Me {
            id: String,
        }
        self.bot_id
            .get_or_try_init(|| async {
                let me: Me = with_backoff("chat.me", || self.get_json("users/me")).await?;
                Ok(me.id)
            })
            .await
            .cloned()
    }
}
