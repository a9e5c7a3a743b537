//! Email-platform capability: contact lists, folders, and contact upserts.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::config::BrevoSettings;
use crate::error::{ApiError, ConfigError};

use super::{build_http_client, with_backoff};

const SERVICE: &str = "brevo";
const PAGE_SIZE: usize = 50;

/// The platform files every list under a folder; this is its default one.
pub const DEFAULT_FOLDER_ID: i64 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct ContactList {
    pub id: i64,
    pub name: String,
}

/// Abstract email-platform contract. Contact upserts are create-or-add in a
/// single idempotent call, which is why this reconciler never removes.
#[async_trait]
pub trait BrevoClient: Send + Sync {
    async fn find_list(&self, name: &str) -> Result<Option<ContactList>, ApiError>;

    async fn create_list(&self, name: &str, folder_id: i64) -> Result<ContactList, ApiError>;

    async fn folder_id_by_name(&self, name: &str) -> Result<Option<i64>, ApiError>;

    /// Create the contact if needed and attach it to the list. Idempotent.
    async fn upsert_contact(&self, email: &str, list_id: i64) -> Result<(), ApiError>;
}

/// REST implementor.
pub struct HttpBrevoClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: SecretString,
}

impl HttpBrevoClient {
    pub fn new(settings: &BrevoSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            http: build_http_client(SERVICE)?,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .http
            .get(self.endpoint(path))
            .header("api-key", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|source| ApiError::Transport { service: SERVICE, source })?;
        decode(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ApiError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .header("api-key", self.api_key.expose_secret())
            .json(body)
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
impl BrevoClient for HttpBrevoClient {
    async fn find_list(&self, name: &str) -> Result<Option<ContactList>, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            lists: Vec<ContactList>,
            #[serde(default)]
            count: usize,
        }
        let mut offset = 0;
        loop {
            let path = format!("contacts/lists?limit={PAGE_SIZE}&offset={offset}");
            let page: Response = with_backoff("brevo.lists", || self.get_json(&path)).await?;
            if let Some(found) = page.lists.iter().find(|l| l.name == name) {
                return Ok(Some(found.clone()));
            }
            offset += page.lists.len();
            if page.lists.is_empty() || offset >= page.count {
                return Ok(None);
            }
        }
    }

    async fn create_list(&self, name: &str, folder_id: i64) -> Result<ContactList, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            id: i64,
        }
        let body = json!({ "name": name, "folderId": folder_id });
        let response: Response = self.post_json("contacts/lists", &body).await?;
        Ok(ContactList {
            id: response.id,
            name: name.to_string(),
        })
    }

    async fn folder_id_by_name(&self, name: &str) -> Result<Option<i64>, ApiError> {
        #[derive(Deserialize)]
        struct Folder {
            id: i64,
            #[serde(default)]
            name: String,
        }
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            folders: Vec<Folder>,
            #[serde(default)]
            count: usize,
        }
        let mut offset = 0;
        loop {
            let path = format!("contacts/folders?limit={PAGE_SIZE}&offset={offset}");
            let page: Response = with_backoff("brevo.folders", || self.get_json(&path)).await?;
            if let Some(folder) = page.folders.iter().find(|f| f.name == name) {
                return Ok(Some(folder.id));
            }
            offset += page.folders.len();
            if page.folders.is_empty() || offset >= page.count {
                return Ok(None);
            }
        }
    }

    async fn upsert_contact(&self, email: &str, list_id: i64) -> Result<(), ApiError> {
        let body = json!({
            "email": email,
            "listIds": [list_id],
            "updateEnabled": true,
        });
        let response = self
            .http
            .post(self.endpoint("contacts"))
            .header("api-key", self.api_key.expose_secret())
            .json(&body)
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
}
