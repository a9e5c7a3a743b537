//! Password-store capability: collections, invitations, and membership.
//!
//! The store authenticates with an OAuth-style bearer token obtained by
//! password grant; the reconciler caches it and retries once on 401.
//! Collection discovery goes through the store's command-line tool — the
//! admin API has no stable listing endpoint — behind a narrow capability so
//! an all-HTTP implementor can replace it later.

use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::config::VaultwardenSettings;
use crate::error::ApiError;

use super::with_backoff;

const SERVICE: &str = "vaultwarden";

/// Phrases in a 400 body that mean the invitation already happened.
const ALREADY_MEMBER_PHRASES: &[&str] = &[
    "already a member",
    "user already invited",
    "is already a member",
    "already in this collection",
    "user is already confirmed",
];

/// Bearer token with its advertised lifetime.
pub struct VaultToken {
    pub access_token: SecretString,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone)]
pub struct VaultCollection {
    pub id: String,
    pub name: String,
    pub org_id: String,
}

/// A user entry inside a collection's ownership record. Round-trips through
/// the PUT that rewrites the membership list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultCollectionUser {
    pub id: String,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
    #[serde(rename = "hidePasswords", default)]
    pub hide_passwords: bool,
    #[serde(default)]
    pub manage: bool,
}

/// Full ownership record of a collection, as fetched and PUT back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultCollectionDetails {
    pub id: String,
    pub name: String,
    #[serde(rename = "externalId", default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub users: Vec<VaultCollectionUser>,
    #[serde(default)]
    pub groups: Vec<serde_json::Value>,
}

/// An organization member, for resolving collection-user ids to emails.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultMember {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

/// What an invitation attempt meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultInviteOutcome {
    Invited,
    /// The store reported the user as already invited/confirmed; idempotent.
    AlreadyMember,
}

/// Abstract password-store contract.
#[async_trait]
pub trait VaultwardenClient: Send + Sync {
    /// Acquire a fresh bearer token by password grant.
    async fn request_token(&self) -> Result<VaultToken, ApiError>;

    /// All organization collections, discovered via the CLI helper.
    async fn list_collections(&self) -> Result<Vec<VaultCollection>, ApiError>;

    async fn invite_user(
        &self,
        collection_id: &str,
        org_id: &str,
        email: &str,
        token: &SecretString,
    ) -> Result<VaultInviteOutcome, ApiError>;

    async fn collection_details(
        &self,
        collection_id: &str,
        token: &SecretString,
    ) -> Result<VaultCollectionDetails, ApiError>;

    /// Rewrite the collection's user list wholesale. Must not be cancelled
    /// mid-request; callers let it run to completion.
    async fn put_collection_users(
        &self,
        details: &VaultCollectionDetails,
        token: &SecretString,
    ) -> Result<(), ApiError>;

    /// Organization membership, for mapping collection-user ids to emails.
    async fn organization_members(
        &self,
        token: &SecretString,
    ) -> Result<Vec<VaultMember>, ApiError>;

    fn organization_id(&self) -> &str;

    /// Store URL for notification DMs, when known.
    fn server_url(&self) -> Option<String>;
}

/// HTTP + CLI implementor.
pub struct HttpVaultwardenClient {
    http: reqwest::Client,
    server_url: Url,
    organization_id: String,
    api_username: String,
    api_password: SecretString,
    cli_path: PathBuf,
}

impl HttpVaultwardenClient {
    pub fn new(settings: &VaultwardenSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: settings.server_url.clone(),
            organization_id: settings.organization_id.clone(),
            api_username: settings.api_username.clone(),
            api_password: settings.api_password.clone(),
            cli_path: settings.cli_path.clone(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.server_url.as_str().trim_end_matches('/'), path)
    }

    fn org_endpoint(&self, rest: &str) -> String {
        self.endpoint(&format!("api/organizations/{}/{rest}", self.organization_id))
    }
}

/// Whether a 400 body carries one of the known "already invited" signals.
fn body_signals_already_member(body: &str) -> bool {
    let parsed: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return false,
    };

    if let Some(message) = parsed
        .pointer("/errorModel/message")
        .and_then(|v| v.as_str())
    {
        let lower = message.to_lowercase();
        if ALREADY_MEMBER_PHRASES.iter().any(|p| lower.contains(p)) {
            return true;
        }
    }

    if let Some(validation) = parsed
        .get("ValidationErrors")
        .and_then(|v| v.as_object())
    {
        for errors in validation.values() {
            let Some(list) = errors.as_array() else { continue };
            for err in list {
                if let Some(text) = err.as_str() {
                    let lower = text.to_lowercase();
                    if ALREADY_MEMBER_PHRASES.iter().any(|p| lower.contains(p)) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

#[async_trait]
impl VaultwardenClient for HttpVaultwardenClient {
    async fn request_token(&self) -> Result<VaultToken, ApiError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            expires_in: u64,
        }

        let form = [
            ("grant_type", "password"),
            ("username", self.api_username.as_str()),
            ("password", self.api_password.expose_secret()),
            ("scope", "api offline_access"),
            ("client_id", "web"),
            ("deviceType", "10"),
            ("deviceIdentifier", "access-reconciler"),
            ("deviceName", "cohort"),
        ];

        let response = with_backoff("vaultwarden.token", || async {
            self.http
                .post(self.endpoint("identity/connect/token"))
                .form(&form)
                .send()
                .await
                .map_err(|source| ApiError::Transport { service: SERVICE, source })
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Auth {
                service: SERVICE,
                message: format!("token endpoint returned {}: {body}", status.as_u16()),
            });
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode { service: SERVICE, message: e.to_string() })?;
        Ok(VaultToken {
            access_token: token.access_token.into(),
            expires_in_secs: token.expires_in,
        })
    }

    async fn list_collections(&self) -> Result<Vec<VaultCollection>, ApiError> {
        #[derive(Deserialize)]
        struct CliCollection {
            id: String,
            name: String,
            #[serde(rename = "organizationId", default)]
            organization_id: String,
        }

        let output = tokio::process::Command::new(&self.cli_path)
            .args([
                "list",
                "org-collections",
                "--organizationid",
                &self.organization_id,
            ])
            .output()
            .await
            .map_err(|e| ApiError::Subprocess {
                service: SERVICE,
                message: format!("failed to spawn {}: {e}", self.cli_path.display()),
            })?;

        if !output.status.success() {
            return Err(ApiError::Subprocess {
                service: SERVICE,
                message: format!(
                    "{} exited with {}: {}",
                    self.cli_path.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let collections: Vec<CliCollection> = serde_json::from_slice(&output.stdout)
            .map_err(|e| ApiError::Decode { service: SERVICE, message: e.to_string() })?;
        Ok(collections
            .into_iter()
            .map(|c| VaultCollection {
                id: c.id,
                name: c.name,
                org_id: if c.organization_id.is_empty() {
                    self.organization_id.clone()
                } else {
                    c.organization_id
                },
            })
            .collect())
    }

    async fn invite_user(
        &self,
        collection_id: &str,
        org_id: &str,
        email: &str,
        token: &SecretString,
    ) -> Result<VaultInviteOutcome, ApiError> {
        let payload = json!({
            "emails": [email],
            "collections": [{
                "id": collection_id,
                "readOnly": true,
                "hidePasswords": false,
                "manage": false,
            }],
            "permissions": { "response": null },
            "type": 2,
            "groups": [],
            "accessSecretsManager": false,
        });

        let url = self.endpoint(&format!("api/organizations/{org_id}/users/invite"));
        let response = self
            .http
            .post(url)
            .bearer_auth(token.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(|source| ApiError::Transport { service: SERVICE, source })?;

        let status = response.status();
        if status.is_success() {
            return Ok(VaultInviteOutcome::Invited);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 400 && body_signals_already_member(&body) {
            return Ok(VaultInviteOutcome::AlreadyMember);
        }
        Err(ApiError::Status {
            service: SERVICE,
            status: status.as_u16(),
            body,
        })
    }

    async fn collection_details(
        &self,
        collection_id: &str,
        token: &SecretString,
    ) -> Result<VaultCollectionDetails, ApiError> {
        let url = self.org_endpoint(&format!("collections/{collection_id}/details"));
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
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

    async fn put_collection_users(
        &self,
        details: &VaultCollectionDetails,
        token: &SecretString,
    ) -> Result<(), ApiError> {
        let url = self.org_endpoint(&format!("collections/{}", details.id));
        let payload = json!({
            "name": details.name,
            "externalId": details.external_id,
            "users": details.users,
            "groups": details.groups,
        });
        let response = self
            .http
            .put(url)
            .bearer_auth(token.expose_secret())
            .json(&payload)
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

    async fn organization_members(
        &self,
        token: &SecretString,
    ) -> Result<Vec<VaultMember>, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default, alias = "Data")]
            data: Vec<VaultMember>,
        }
        let url = self.org_endpoint("users");
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
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
        let members: Response = response
            .json()
            .await
            .map_err(|e| ApiError::Decode { service: SERVICE, message: e.to_string() })?;
        Ok(members.data)
    }

    fn organization_id(&self) -> &str {
        &self.organization_id
    }

    fn server_url(&self) -> Option<String> {
        Some(self.server_url.as_str().trim_end_matches('/').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_model_message_signals_idempotency() {
        let body =
            r#"{"errorModel":{"message":"alice@x is already a member of this collection."}}"#;
        assert!(body_signals_already_member(body));
    }

    #[test]
    fn validation_errors_signal_idempotency() {
        let body = r#"{"ValidationErrors":{"":["User already invited."]}}"#;
        assert!(body_signals_already_member(body));
    }

    #[test]
    fn unrelated_errors_are_not_idempotent() {
        assert!(!body_signals_already_member(
            r#"{"errorModel":{"message":"Seats are full."}}"#
        ));
        assert!(!body_signals_already_member("not json"));
    }
}
