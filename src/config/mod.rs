//! Runtime settings resolved from the environment, plus the two startup
//! files: the permissions matrix and the exclusion list.
//!
//! A downstream service is "configured" when its URL (and credentials, where
//! applicable) are present; unconfigured services are skipped by the engine
//! without comment. Misconfigured values are fatal at startup.

pub mod exclusions;
pub mod helpers;
pub mod matrix;

use std::path::PathBuf;

use secrecy::SecretString;
use url::Url;

use crate::config::helpers::{optional_env, parse_usize_env, required_env};
use crate::error::ConfigError;

pub use exclusions::ExclusionList;
pub use matrix::{
    BaseRole, BrevoBlock, ChannelBlock, ChannelType, DocAccess, Entity, KindPolicy, NocodbBlock,
    OutlineBlock, PermissionsMatrix, VaultwardenBlock,
};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Chat-platform connection settings. The chat platform is the source of
/// truth; without it no sync can run.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub base_url: Url,
    pub token: SecretString,
    pub team_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: Url,
    pub token: SecretString,
}

#[derive(Debug, Clone)]
pub struct OutlineSettings {
    pub base_url: Url,
    pub token: SecretString,
}

#[derive(Debug, Clone)]
pub struct BrevoSettings {
    pub base_url: Url,
    pub api_key: SecretString,
}

#[derive(Debug, Clone)]
pub struct NocodbSettings {
    pub base_url: Url,
    pub token: SecretString,
}

#[derive(Debug, Clone)]
pub struct VaultwardenSettings {
    pub server_url: Url,
    pub organization_id: String,
    pub api_username: String,
    pub api_password: SecretString,
    /// Path to the vault CLI used for collection discovery.
    pub cli_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub chat: Option<ChatSettings>,
    pub provider: Option<ProviderSettings>,
    pub outline: Option<OutlineSettings>,
    pub brevo: Option<BrevoSettings>,
    pub nocodb: Option<NocodbSettings>,
    pub vaultwarden: Option<VaultwardenSettings>,
    pub matrix_path: PathBuf,
    pub exclusions_path: Option<PathBuf>,
    pub concurrency: usize,
}

const DEFAULT_BREVO_API_URL: &str = "https://api.brevo.com/v3";

fn parse_url(key: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

impl Settings {
    /// Resolve all settings from the environment. `.env` loading, if any,
    /// happens before this is called.
    pub fn resolve() -> Result<Self, ConfigError> {
        let chat = match optional_env("CHAT_URL") {
            Some(url) => Some(ChatSettings {
                base_url: parse_url("CHAT_URL", &url)?,
                token: required_env("CHAT_TOKEN")?.into(),
                team_id: optional_env("CHAT_TEAM_ID"),
            }),
            None => None,
        };

        let provider = match optional_env("PROVIDER_URL") {
            Some(url) => Some(ProviderSettings {
                base_url: parse_url("PROVIDER_URL", &url)?,
                token: required_env("PROVIDER_TOKEN")?.into(),
            }),
            None => None,
        };

        let outline = match optional_env("OUTLINE_URL") {
            Some(url) => Some(OutlineSettings {
                base_url: parse_url("OUTLINE_URL", &url)?,
                token: required_env("OUTLINE_TOKEN")?.into(),
            }),
            None => None,
        };

        let brevo = match optional_env("BREVO_API_KEY") {
            Some(key) => Some(BrevoSettings {
                base_url: parse_url(
                    "BREVO_API_URL",
                    &optional_env("BREVO_API_URL").unwrap_or_else(|| DEFAULT_BREVO_API_URL.into()),
                )?,
                api_key: key.into(),
            }),
            None => None,
        };

        let nocodb = match optional_env("NOCODB_URL") {
            Some(url) => Some(NocodbSettings {
                base_url: parse_url("NOCODB_URL", &url)?,
                token: required_env("NOCODB_TOKEN")?.into(),
            }),
            None => None,
        };

        let vaultwarden = match optional_env("VAULTWARDEN_SERVER_URL") {
            Some(url) => Some(VaultwardenSettings {
                server_url: parse_url("VAULTWARDEN_SERVER_URL", &url)?,
                organization_id: required_env("VAULTWARDEN_ORGANIZATION_ID")?,
                api_username: required_env("VAULTWARDEN_API_USERNAME")?,
                api_password: required_env("VAULTWARDEN_API_PASSWORD")?.into(),
                cli_path: optional_env("VAULTWARDEN_CLI_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("bw")),
            }),
            None => None,
        };

        Ok(Self {
            chat,
            provider,
            outline,
            brevo,
            nocodb,
            vaultwarden,
            matrix_path: optional_env("PERMISSIONS_MATRIX_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/permissions_matrix.yml")),
            exclusions_path: optional_env("EXCLUDED_USERS_PATH").map(PathBuf::from),
            concurrency: parse_usize_env("SYNC_CONCURRENCY", DEFAULT_CONCURRENCY)?,
        })
    }

    /// Load the permissions matrix named by these settings.
    pub fn load_matrix(&self) -> Result<PermissionsMatrix, ConfigError> {
        PermissionsMatrix::load(&self.matrix_path)
    }

    /// Load the exclusion list, or an empty one when no path is configured.
    pub fn load_exclusions(&self) -> Result<ExclusionList, ConfigError> {
        match &self.exclusions_path {
            Some(path) => ExclusionList::load(path),
            None => Ok(ExclusionList::default()),
        }
    }
}
