//! Capability interfaces for the external services, their HTTP-backed
//! implementors, and the registry handed to the orchestrator.
//!
//! Reconcilers only ever see the traits defined in these modules; transport
//! concerns (auth headers, pagination, retry) live in the implementors.
//! Tests substitute in-memory fakes.

pub mod brevo;
pub mod chat;
pub mod nocodb;
pub mod outline;
pub mod provider;
pub mod vaultwarden;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{ApiError, ConfigError};

pub use brevo::{BrevoClient, ContactList, HttpBrevoClient};
pub use chat::{ChatChannel, ChatClient, ChatUser, HttpChatClient};
pub use nocodb::{Base, BaseUser, HttpNocodbClient, NocodbClient};
pub use outline::{Collection, CollectionMember, HttpOutlineClient, OutlineClient, OutlineUser};
pub use provider::{HttpProviderClient, ProviderClient, ProviderGroup, ProviderUser};
pub use vaultwarden::{
    HttpVaultwardenClient, VaultCollection, VaultCollectionDetails, VaultCollectionUser,
    VaultInviteOutcome, VaultMember, VaultToken, VaultwardenClient,
};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Retry a capability call on transient faults with bounded exponential
/// backoff. Business-logic failures (4xx) pass through untouched.
pub(crate) async fn with_backoff<T, F, Fut>(op_name: &str, op: F) -> Result<T, ApiError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                tracing::warn!(
                    operation = op_name,
                    attempt,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The set of configured service clients for one run. Absent entries mean
/// the service is not configured and its reconciler is skipped.
#[derive(Clone, Default)]
pub struct Clients {
    pub chat: Option<Arc<dyn ChatClient>>,
    pub provider: Option<Arc<dyn ProviderClient>>,
    pub outline: Option<Arc<dyn OutlineClient>>,
    pub brevo: Option<Arc<dyn BrevoClient>>,
    pub nocodb: Option<Arc<dyn NocodbClient>>,
    pub vaultwarden: Option<Arc<dyn VaultwardenClient>>,
}

impl Clients {
    /// Build HTTP-backed clients for every configured service.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let mut clients = Self::default();
        if let Some(chat) = &settings.chat {
            clients.chat = Some(Arc::new(HttpChatClient::new(chat)?));
        } else {
            tracing::error!("chat platform not configured; no sync can run without it");
        }
        if let Some(provider) = &settings.provider {
            clients.provider = Some(Arc::new(HttpProviderClient::new(provider)?));
        } else {
            tracing::warn!("identity provider not configured; group sync will be skipped");
        }
        if let Some(outline) = &settings.outline {
            clients.outline = Some(Arc::new(HttpOutlineClient::new(outline)?));
        } else {
            tracing::info!("documentation service not configured; collection sync will be skipped");
        }
        if let Some(brevo) = &settings.brevo {
            clients.brevo = Some(Arc::new(HttpBrevoClient::new(brevo)?));
        } else {
            tracing::info!("email platform not configured; contact-list sync will be skipped");
        }
        if let Some(nocodb) = &settings.nocodb {
            clients.nocodb = Some(Arc::new(HttpNocodbClient::new(nocodb)?));
        } else {
            tracing::info!("database service not configured; base sync will be skipped");
        }
        if let Some(vw) = &settings.vaultwarden {
            clients.vaultwarden = Some(Arc::new(HttpVaultwardenClient::new(vw)));
        } else {
            tracing::info!("password store not configured; collection sync will be skipped");
        }
        Ok(clients)
    }
}

pub(crate) fn build_http_client(service: &'static str) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ConfigError::InvalidValue {
            key: format!("{service} http client"),
            message: e.to_string(),
        })
}
