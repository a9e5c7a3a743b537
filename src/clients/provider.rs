//! Identity-provider capability: groups and their members.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::config::ProviderSettings;
use crate::error::{ApiError, ConfigError};

use super::{build_http_client, with_backoff};

const SERVICE: &str = "provider";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ProviderUser {
    pub id: String,
    pub username: String,
    /// Lowercased; empty when the provider has no email on file.
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct ProviderGroup {
    pub id: String,
    pub name: String,
    pub users: Vec<ProviderUser>,
}

/// Abstract identity-provider contract.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// All groups with their member lists (pagination is internal).
    async fn groups_with_users(&self) -> Result<Vec<ProviderGroup>, ApiError>;

    /// Directory of every user, keyed by lowercased email.
    async fn users_by_email(&self) -> Result<HashMap<String, String>, ApiError>;

    /// Create a group; returns the new (empty) group.
    async fn create_group(&self, name: &str) -> Result<ProviderGroup, ApiError>;

    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<(), ApiError>;

    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    pk: serde_json::Value,
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: String,
}

impl ApiUser {
    fn into_user(self) -> ProviderUser {
        ProviderUser {
            id: scalar_to_string(&self.pk),
            username: self.username,
            email: self.email.to_lowercase(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiGroup {
    pk: serde_json::Value,
    name: String,
    #[serde(default)]
    users_obj: Vec<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    results: Vec<T>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    next: u64,
    #[serde(default)]
    current: u64,
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// REST implementor.
pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

impl HttpProviderClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            http: build_http_client(SERVICE)?,
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v3/{}", self.base_url.as_str().trim_end_matches('/'), path)
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

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ApiError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|source| ApiError::Transport { service: SERVICE, source })?;
        decode(response).await
    }

    /// POST whose success response carries no body (204).
    async fn post_no_content(&self, path: &str, body: &serde_json::Value) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.endpoint(path))
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
        Ok(())
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
impl ProviderClient for HttpProviderClient {
    async fn groups_with_users(&self) -> Result<Vec<ProviderGroup>, ApiError> {
        let mut groups = Vec::new();
        let mut page = 1;
        loop {
            let path =
                format!("core/groups/?include_users=true&page={page}&page_size={PAGE_SIZE}");
            let batch: Page<ApiGroup> =
                with_backoff("provider.groups", || self.get_json(&path)).await?;
            let next = batch.pagination.next;
            let current = batch.pagination.current;
            groups.extend(batch.results.into_iter().map(|g| ProviderGroup {
                id: scalar_to_string(&g.pk),
                name: g.name,
                users: g.users_obj.into_iter().map(ApiUser::into_user).collect(),
            }));
            if next == 0 || next <= current {
                return Ok(groups);
            }
            page = next;
        }
    }

    async fn users_by_email(&self) -> Result<HashMap<String, String>, ApiError> {
        let mut map = HashMap::new();
        let mut page = 1;
        loop {
            let path = format!("core/users/?page={page}&page_size={PAGE_SIZE}");
            let batch: Page<ApiUser> =
                with_backoff("provider.users", || self.get_json(&path)).await?;
            let next = batch.pagination.next;
            let current = batch.pagination.current;
            for user in batch.results {
                let user = user.into_user();
                if !user.email.is_empty() {
                    map.insert(user.email, user.id);
                }
            }
            if next == 0 || next <= current {
                return Ok(map);
            }
            page = next;
        }
    }

    async fn create_group(&self, name: &str) -> Result<ProviderGroup, ApiError> {
        let body = json!({ "name": name });
        let group: ApiGroup = self.post_json("core/groups/", &body).await?;
        Ok(ProviderGroup {
            id: scalar_to_string(&group.pk),
            name: group.name,
            users: Vec::new(),
        })
    }

    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<(), ApiError> {
        let path = format!("core/groups/{group_id}/add_user/");
        self.post_no_content(&path, &json!({ "pk": user_id })).await
    }

    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<(), ApiError> {
        let path = format!("core/groups/{group_id}/remove_user/");
        self.post_no_content(&path, &json!({ "pk": user_id })).await
    }
}
