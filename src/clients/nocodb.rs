//! Low-code database capability: bases and base users.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::config::matrix::BaseRole;
use crate::config::NocodbSettings;
use crate::error::{ApiError, ConfigError};

use super::{build_http_client, with_backoff};

const SERVICE: &str = "nocodb";

#[derive(Debug, Clone, Deserialize)]
pub struct Base {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct BaseUser {
    pub id: String,
    /// Lowercased.
    pub email: String,
    /// Native role label; see [`BaseRole`].
    pub role: String,
}

/// Abstract database-service contract. The platform has no first-class
/// base-user delete; removal is an update to `no-access`.
#[async_trait]
pub trait NocodbClient: Send + Sync {
    async fn list_bases(&self) -> Result<Vec<Base>, ApiError>;

    async fn base_by_title(&self, title: &str) -> Result<Option<Base>, ApiError>;

    async fn base_users(&self, base_id: &str) -> Result<Vec<BaseUser>, ApiError>;

    async fn invite_user(&self, base_id: &str, email: &str, role: BaseRole)
        -> Result<(), ApiError>;

    async fn update_user_role(
        &self,
        base_id: &str,
        user_id: &str,
        role: BaseRole,
    ) -> Result<(), ApiError>;

    /// Dashboard link for a base, for notification DMs.
    fn base_url(&self, base_id: &str) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct ApiBaseUser {
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    roles: String,
}

/// REST implementor.
pub struct HttpNocodbClient {
    http: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

impl HttpNocodbClient {
    pub fn new(settings: &NocodbSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            http: build_http_client(SERVICE)?,
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v2/meta/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, ApiError> {
        let mut request = self
            .http
            .request(method, self.endpoint(path))
            .header("xc-token", self.token.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
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
impl NocodbClient for HttpNocodbClient {
    async fn list_bases(&self) -> Result<Vec<Base>, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            list: Vec<Base>,
        }
        let response: Response = with_backoff("nocodb.bases", || {
            self.request(reqwest::Method::GET, "bases", None)
        })
        .await?;
        Ok(response.list)
    }

    async fn base_by_title(&self, title: &str) -> Result<Option<Base>, ApiError> {
        Ok(self
            .list_bases()
            .await?
            .into_iter()
            .find(|base| base.title == title))
    }

    async fn base_users(&self, base_id: &str) -> Result<Vec<BaseUser>, ApiError> {
        #[derive(Deserialize)]
        struct Users {
            #[serde(default)]
            list: Vec<ApiBaseUser>,
        }
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            users: Option<Users>,
        }
        let path = format!("bases/{base_id}/users");
        let response: Response = with_backoff("nocodb.base_users", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;
        Ok(response
            .users
            .map(|u| u.list)
            .unwrap_or_default()
            .into_iter()
            .map(|u| BaseUser {
                id: u.id,
                email: u.email.to_lowercase(),
                role: u.roles,
            })
            .collect())
    }

    async fn invite_user(
        &self,
        base_id: &str,
        email: &str,
        role: BaseRole,
    ) -> Result<(), ApiError> {
        let path = format!("bases/{base_id}/users");
        let body = json!({ "email": email, "roles": role.as_str() });
        let _: serde_json::Value = self
            .request(reqwest::Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    async fn update_user_role(
        &self,
        base_id: &str,
        user_id: &str,
        role: BaseRole,
    ) -> Result<(), ApiError> {
        let path = format!("bases/{base_id}/users/{user_id}");
        let body = json!({ "roles": role.as_str() });
        let _: serde_json::Value = self
            .request(reqwest::Method::PATCH, &path, Some(&body))
            .await?;
        Ok(())
    }

    fn base_url(&self, base_id: &str) -> Option<String> {
        Some(format!(
            "{}/#/nc/{}/dashboard",
            self.base_url.as_str().trim_end_matches('/'),
            base_id
        ))
    }
}
