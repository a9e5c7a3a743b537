//! The permissions matrix: which downstream resources exist for each entity
//! kind, and the name patterns that tie them together.
//!
//! Loaded once at startup from YAML and immutable afterwards. Kind order in
//! the file is significant: reverse lookups iterate kinds in matrix order,
//! trying admin patterns before standard ones so that the more specific
//! admin names win when both could match.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::pattern;

/// A logical organizational unit: a kind from the matrix plus a free-form
/// base name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entity {
    pub kind: String,
    pub base_name: String,
}

impl Entity {
    pub fn new(kind: impl Into<String>, base_name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            base_name: base_name.into(),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.base_name)
    }
}

/// Chat channel visibility, as the platform encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChannelType {
    #[serde(rename = "O")]
    Open,
    #[serde(rename = "P")]
    Private,
}

impl Default for ChannelType {
    fn default() -> Self {
        Self::Open
    }
}

/// Documentation-collection permission levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocAccess {
    Read,
    ReadWrite,
}

impl DocAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::ReadWrite => "read_write",
        }
    }

    /// Fragment used inside action tags.
    pub fn tag_fragment(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::ReadWrite => "READ_WRITE",
        }
    }
}

/// Database-base roles, in the platform's vocabulary. Removal is modelled
/// as `no-access`; the platform has no first-class base-user delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaseRole {
    Owner,
    Creator,
    Editor,
    Commenter,
    Viewer,
    Guest,
    NoAccess,
}

impl BaseRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Creator => "creator",
            Self::Editor => "editor",
            Self::Commenter => "commenter",
            Self::Viewer => "viewer",
            Self::Guest => "guest",
            Self::NoAccess => "no-access",
        }
    }

    /// Fragment used inside action tags.
    pub fn tag_fragment(self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Creator => "CREATOR",
            Self::Editor => "EDITOR",
            Self::Commenter => "COMMENTER",
            Self::Viewer => "VIEWER",
            Self::Guest => "GUEST",
            Self::NoAccess => "NO_ACCESS",
        }
    }

    pub fn from_api_str(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Self::Owner),
            "creator" => Some(Self::Creator),
            "editor" => Some(Self::Editor),
            "commenter" => Some(Self::Commenter),
            "viewer" => Some(Self::Viewer),
            "guest" => Some(Self::Guest),
            "no-access" => Some(Self::NoAccess),
            _ => None,
        }
    }
}

/// Patterns for a channel and its matching identity-provider group.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelBlock {
    pub channel_name_pattern: String,
    #[serde(default)]
    pub channel_type: ChannelType,
    pub provider_group_pattern: String,
}

/// Documentation-collection block.
#[derive(Debug, Clone, Deserialize)]
pub struct OutlineBlock {
    pub collection_name_pattern: String,
    pub default_access: DocAccess,
    pub admin_access: DocAccess,
}

/// Email contact-list block.
#[derive(Debug, Clone, Deserialize)]
pub struct BrevoBlock {
    pub list_name_pattern: String,
    #[serde(default)]
    pub folder_name: Option<String>,
}

/// Database-base block.
#[derive(Debug, Clone, Deserialize)]
pub struct NocodbBlock {
    pub base_title_pattern: String,
    pub default_access: BaseRole,
    pub admin_access: BaseRole,
}

/// Password-collection block.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultwardenBlock {
    pub collection_name_pattern: String,
}

/// Everything the matrix says about one entity kind.
#[derive(Debug, Clone, Deserialize)]
pub struct KindPolicy {
    pub standard: ChannelBlock,
    #[serde(default)]
    pub admin: Option<ChannelBlock>,
    #[serde(default)]
    pub outline: Option<OutlineBlock>,
    #[serde(default)]
    pub brevo: Option<BrevoBlock>,
    #[serde(default)]
    pub nocodb: Option<NocodbBlock>,
    #[serde(default)]
    pub vaultwarden: Option<VaultwardenBlock>,
}

/// The full matrix, kinds in file order.
#[derive(Debug, Clone, Default)]
pub struct PermissionsMatrix {
    kinds: Vec<(String, KindPolicy)>,
}

#[derive(Debug, Deserialize)]
struct MatrixFile {
    permissions: serde_yml::Value,
}

impl PermissionsMatrix {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let file: MatrixFile =
            serde_yml::from_str(raw).map_err(|e| ConfigError::Matrix(e.to_string()))?;
        let mapping = file
            .permissions
            .as_mapping()
            .ok_or_else(|| ConfigError::Matrix("'permissions' must be a mapping".to_string()))?;

        let mut kinds = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let kind = key
                .as_str()
                .ok_or_else(|| ConfigError::Matrix("entity kind keys must be strings".to_string()))?
                .to_string();
            let policy: KindPolicy = serde_yml::from_value(value.clone())
                .map_err(|e| ConfigError::Matrix(format!("kind '{kind}': {e}")))?;
            validate_policy(&kind, &policy)?;
            kinds.push((kind, policy));
        }
        Ok(Self { kinds })
    }

    pub fn from_kinds(kinds: Vec<(String, KindPolicy)>) -> Result<Self, ConfigError> {
        for (kind, policy) in &kinds {
            validate_policy(kind, policy)?;
        }
        Ok(Self { kinds })
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Kinds in matrix (file) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KindPolicy)> {
        self.kinds.iter().map(|(k, p)| (k.as_str(), p))
    }

    pub fn policy(&self, kind: &str) -> Option<&KindPolicy> {
        self.kinds
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, p)| p)
    }

    /// Map an identity-provider group name back to an entity.
    ///
    /// Admin patterns are tried for every kind before any standard pattern,
    /// so a name matching both resolves to the admin group. Returns the
    /// entity and whether the name matched an admin pattern.
    pub fn entity_for_provider_group(&self, group_name: &str) -> Option<(Entity, bool)> {
        for (kind, policy) in &self.kinds {
            if let Some(admin) = &policy.admin
                && let Some(base) = pattern::extract(group_name, &admin.provider_group_pattern)
            {
                return Some((Entity::new(kind.clone(), base), true));
            }
        }
        for (kind, policy) in &self.kinds {
            if let Some(base) = pattern::extract(group_name, &policy.standard.provider_group_pattern)
            {
                return Some((Entity::new(kind.clone(), base), false));
            }
        }
        None
    }

    /// Map a chat channel back to an entity by display name, falling back to
    /// the slug only for patterns that are themselves slug-shaped.
    pub fn entity_for_channel(&self, display_name: &str, slug: &str) -> Option<Entity> {
        for (kind, policy) in &self.kinds {
            if let Some(admin) = &policy.admin
                && let Some(base) = pattern::extract(display_name, &admin.channel_name_pattern)
            {
                return Some(Entity::new(kind.clone(), base));
            }
        }
        for (kind, policy) in &self.kinds {
            if let Some(base) = pattern::extract(display_name, &policy.standard.channel_name_pattern)
            {
                return Some(Entity::new(kind.clone(), base));
            }
        }

        for (kind, policy) in &self.kinds {
            if let Some(admin) = &policy.admin
                && pattern::pattern_is_slug_safe(&admin.channel_name_pattern)
                && let Some(base) =
                    pattern::extract(slug, &admin.channel_name_pattern.to_lowercase())
            {
                return Some(Entity::new(kind.clone(), base));
            }
        }
        for (kind, policy) in &self.kinds {
            if pattern::pattern_is_slug_safe(&policy.standard.channel_name_pattern)
                && let Some(base) =
                    pattern::extract(slug, &policy.standard.channel_name_pattern.to_lowercase())
            {
                return Some(Entity::new(kind.clone(), base));
            }
        }
        None
    }

    /// Map a documentation-collection name back to an entity.
    pub fn entity_for_outline_collection(&self, name: &str) -> Option<Entity> {
        self.entity_for_section(name, |p| {
            p.outline.as_ref().map(|b| b.collection_name_pattern.as_str())
        })
    }

    /// Map an email contact-list name back to an entity.
    pub fn entity_for_brevo_list(&self, name: &str) -> Option<Entity> {
        self.entity_for_section(name, |p| p.brevo.as_ref().map(|b| b.list_name_pattern.as_str()))
    }

    /// Map a database-base title back to an entity.
    pub fn entity_for_nocodb_base(&self, title: &str) -> Option<Entity> {
        self.entity_for_section(title, |p| {
            p.nocodb.as_ref().map(|b| b.base_title_pattern.as_str())
        })
    }

    /// Map a password-collection name back to an entity.
    pub fn entity_for_vaultwarden_collection(&self, name: &str) -> Option<Entity> {
        self.entity_for_section(name, |p| {
            p.vaultwarden
                .as_ref()
                .map(|b| b.collection_name_pattern.as_str())
        })
    }

    fn entity_for_section<'a>(
        &'a self,
        name: &str,
        section_pattern: impl Fn(&'a KindPolicy) -> Option<&'a str>,
    ) -> Option<Entity> {
        for (kind, policy) in &self.kinds {
            if let Some(pat) = section_pattern(policy)
                && let Some(base) = pattern::extract(name, pat)
            {
                return Some(Entity::new(kind.clone(), base));
            }
        }
        None
    }
}

fn validate_policy(kind: &str, policy: &KindPolicy) -> Result<(), ConfigError> {
    let mut patterns: Vec<(&str, &str)> = vec![
        (
            "standard.channel_name_pattern",
            policy.standard.channel_name_pattern.as_str(),
        ),
        (
            "standard.provider_group_pattern",
            policy.standard.provider_group_pattern.as_str(),
        ),
    ];
    if let Some(admin) = &policy.admin {
        patterns.push(("admin.channel_name_pattern", admin.channel_name_pattern.as_str()));
        patterns.push((
            "admin.provider_group_pattern",
            admin.provider_group_pattern.as_str(),
        ));
    }
    if let Some(outline) = &policy.outline {
        patterns.push((
            "outline.collection_name_pattern",
            outline.collection_name_pattern.as_str(),
        ));
    }
    if let Some(brevo) = &policy.brevo {
        patterns.push(("brevo.list_name_pattern", brevo.list_name_pattern.as_str()));
    }
    if let Some(nocodb) = &policy.nocodb {
        patterns.push(("nocodb.base_title_pattern", nocodb.base_title_pattern.as_str()));
    }
    if let Some(vw) = &policy.vaultwarden {
        patterns.push((
            "vaultwarden.collection_name_pattern",
            vw.collection_name_pattern.as_str(),
        ));
    }

    for (field, value) in patterns {
        let occurrences = value.matches(pattern::PLACEHOLDER).count();
        if occurrences > 1 {
            return Err(ConfigError::Matrix(format!(
                "kind '{kind}': {field} contains the {} placeholder more than once",
                pattern::PLACEHOLDER
            )));
        }
        if value.trim().is_empty() {
            return Err(ConfigError::Matrix(format!(
                "kind '{kind}': {field} must not be empty"
            )));
        }
    }
    Ok(())
}
