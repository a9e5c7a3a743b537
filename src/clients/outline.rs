//! Documentation-service capability: collections and their memberships.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::config::matrix::DocAccess;
use crate::config::OutlineSettings;
use crate::error::{ApiError, ConfigError};

use super::{build_http_client, with_backoff};

const SERVICE: &str = "outline";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct Collection {
    pub id: String,
    pub name: String,
    /// URL fragment used to build a shareable link; absent on some versions.
    pub url_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CollectionMember {
    pub user_id: String,
    /// Lowercased; empty when the service exposes no email.
    pub email: String,
    /// Native permission label (`read`, `read_write`).
    pub permission: String,
}

#[derive(Debug, Clone)]
pub struct OutlineUser {
    pub id: String,
    pub email: String,
}

/// Abstract documentation-service contract.
#[async_trait]
pub trait OutlineClient: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<Collection>, ApiError>;

    async fn create_collection(&self, name: &str) -> Result<Collection, ApiError>;

    async fn collection_members(
        &self,
        collection_id: &str,
    ) -> Result<Vec<CollectionMember>, ApiError>;

    /// Add a user, or update their permission if already a member. The call
    /// is idempotent on the permission.
    async fn add_user_to_collection(
        &self,
        collection_id: &str,
        user_id: &str,
        permission: DocAccess,
    ) -> Result<(), ApiError>;

    async fn remove_user_from_collection(
        &self,
        collection_id: &str,
        user_id: &str,
    ) -> Result<(), ApiError>;

    async fn user_by_email(&self, email: &str) -> Result<Option<OutlineUser>, ApiError>;

    /// Shareable URL for a collection, when the service base URL is known.
    fn collection_url(&self, collection: &Collection) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct ApiCollection {
    id: String,
    name: String,
    #[serde(rename = "urlId")]
    url_id: Option<String>,
}

impl From<ApiCollection> for Collection {
    fn from(c: ApiCollection) -> Self {
        Self {
            id: c.id,
            name: c.name,
            url_id: c.url_id,
        }
    }
}

/// REST implementor. The service exposes RPC-style POST endpoints.
pub struct HttpOutlineClient {
    http: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

impl HttpOutlineClient {
    pub fn new(settings: &OutlineSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            http: build_http_client(SERVICE)?,
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/api/{}", self.base_url.as_str().trim_end_matches('/'), method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, ApiError> {
        let response = self
            .http
            .post(self.endpoint(method))
            .bearer_auth(self.token.expose_secret())
            .json(body)
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
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode { service: SERVICE, message: e.to_string() })
    }
}

#[async_trait]
impl OutlineClient for HttpOutlineClient {
    async fn list_collections(&self) -> Result<Vec<Collection>, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            data: Vec<ApiCollection>,
        }
        let mut collections = Vec::new();
        let mut offset = 0;
        loop {
            let body = json!({ "offset": offset, "limit": PAGE_SIZE });
            let page: Response =
                with_backoff("outline.collections.list", || self.call("collections.list", &body))
                    .await?;
            let count = page.data.len();
            collections.extend(page.data.into_iter().map(Collection::from));
            if count < PAGE_SIZE {
                return Ok(collections);
            }
            offset += count;
        }
    }

    async fn create_collection(&self, name: &str) -> Result<Collection, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            data: ApiCollection,
        }
        let body = json!({ "name": name, "private": false });
        let response: Response = self.call("collections.create", &body).await?;
        Ok(response.data.into())
    }

    async fn collection_members(
        &self,
        collection_id: &str,
    ) -> Result<Vec<CollectionMember>, ApiError> {
        #[derive(Deserialize)]
        struct Membership {
            #[serde(rename = "userId")]
            user_id: String,
            #[serde(default)]
            permission: String,
        }
        #[derive(Deserialize)]
        struct User {
            id: String,
            #[serde(default)]
            email: String,
        }
        #[derive(Default, Deserialize)]
        struct Data {
            #[serde(default)]
            memberships: Vec<Membership>,
            #[serde(default)]
            users: Vec<User>,
        }
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            data: Data,
        }

        let mut members = Vec::new();
        let mut offset = 0;
        loop {
            let body = json!({ "id": collection_id, "offset": offset, "limit": PAGE_SIZE });
            let page: Response = with_backoff("outline.collections.memberships", || {
                self.call("collections.memberships", &body)
            })
            .await?;
            let count = page.data.memberships.len();
            let emails: std::collections::HashMap<String, String> = page
                .data
                .users
                .into_iter()
                .map(|u| (u.id, u.email.to_lowercase()))
                .collect();
            members.extend(page.data.memberships.into_iter().map(|m| CollectionMember {
                email: emails.get(&m.user_id).cloned().unwrap_or_default(),
                user_id: m.user_id,
                permission: m.permission,
            }));
            if count < PAGE_SIZE {
                return Ok(members);
            }
            offset += count;
        }
    }

    async fn add_user_to_collection(
        &self,
        collection_id: &str,
        user_id: &str,
        permission: DocAccess,
    ) -> Result<(), ApiError> {
        let body = json!({
            "id": collection_id,
            "userId": user_id,
            "permission": permission.as_str(),
        });
        let _: serde_json::Value = self.call("collections.add_user", &body).await?;
        Ok(())
    }

    async fn remove_user_from_collection(
        &self,
        collection_id: &str,
        user_id: &str,
    ) -> Result<(), ApiError> {
        let body = json!({ "id": collection_id, "userId": user_id });
        let _: serde_json::Value = self.call("collections.remove_user", &body).await?;
        Ok(())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<OutlineUser>, ApiError> {
        #[derive(Deserialize)]
        struct User {
            id: String,
            #[serde(default)]
            email: String,
        }
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            data: Vec<User>,
        }
        let body = json!({ "emails": [email], "limit": 10 });
        let response: Response =
            with_backoff("outline.users.list", || self.call("users.list", &body)).await?;
        Ok(response
            .data
            .into_iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| OutlineUser {
                id: u.id,
                email: u.email.to_lowercase(),
            }))
    }

    fn collection_url(&self, collection: &Collection) -> Option<String> {
        let url_id = collection.url_id.as_deref()?;
        Some(format!(
            "{}/collection/{}",
            self.base_url.as_str().trim_end_matches('/'),
            url_id
        ))
    }
}
