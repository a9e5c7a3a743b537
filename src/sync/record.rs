//! Structured outcomes of reconciliation steps.
//!
//! Every action a reconciler considers produces exactly one [`SyncRecord`].
//! The action-tag strings are a closed, stable namespace: the summary report
//! and downstream consumers match on them, so changes here are breaking.

use serde::{Serialize, Serializer};

use crate::config::matrix::{BaseRole, DocAccess};

/// Which component produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Orchestrator,
    Provider,
    Outline,
    Brevo,
    Nocodb,
    Vaultwarden,
}

impl Service {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orchestrator => "ORCHESTRATOR",
            Self::Provider => "PROVIDER",
            Self::Outline => "OUTLINE",
            Self::Brevo => "BREVO",
            Self::Nocodb => "NOCODB",
            Self::Vaultwarden => "VAULTWARDEN",
        }
    }

    /// Lowercase name used for `--skip` matching.
    pub fn skip_key(self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Provider => "provider",
            Self::Outline => "outline",
            Self::Brevo => "brevo",
            Self::Nocodb => "nocodb",
            Self::Vaultwarden => "vaultwarden",
        }
    }
}

impl Serialize for Service {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    Failure,
    Skipped,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl Serialize for SyncStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Outcome of the notification DM that decorates first-time additions.
/// DM failure never changes a record's status, only its tag suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmOutcome {
    /// No DM applies (the subject was already a member).
    #[default]
    NotAttempted,
    Sent,
    Failed,
    SkippedNoUrl,
}

impl DmOutcome {
    fn suffix(self) -> &'static str {
        match self {
            Self::NotAttempted => "",
            Self::Sent => "_AND_DM_SENT",
            Self::Failed => "_DM_FAILED",
            Self::SkippedNoUrl => "_DM_SKIPPED_NO_URL",
        }
    }
}

/// The closed set of actions the engine can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    // Orchestrator-level.
    UnexpectedError,
    FailedToFetchChannelMembers,
    SkippedNoEmail,

    // Identity-provider groups.
    UserAddedToGroup,
    UserAlreadyInGroup,
    UserRemovedFromGroup,
    FailedToAddToGroup,
    FailedToRemoveFromGroup,
    FailedToEnsureGroup,
    FailedToListGroups,
    SkippedUserNotInProvider,

    // Documentation collections.
    UserAddedToCollection { access: DocAccess, dm: DmOutcome },
    UserAlreadyInCollectionPermissionEnsured,
    UserRemovedFromCollection,
    FailedToAddToCollection,
    FailedToUpdatePermission,
    FailedToRemoveFromCollection,
    FailedToEnsureCollection,
    FailedToListCollections,
    SkippedUserNotInOutline,

    // Email contact lists.
    UserEnsuredInList,
    FailedToEnsureContact,
    FailedToEnsureList,

    // Database bases.
    UserInvitedToBase { role: BaseRole, dm: DmOutcome },
    UserRoleUpdated { role: BaseRole },
    UserAlreadyInBaseWithCorrectRole,
    FailedToInviteToBase,
    FailedToUpdateRole,
    FailedToListBases,
    FailedToListBaseUsers,
    SkippedBaseNotFound,

    // Password collections.
    UserInvitedToVaultCollection { dm: DmOutcome },
    UserAlreadyInvited,
    UserRemovedFromVaultCollection,
    FailedToInviteToVaultCollection,
    FailedToUpdateVaultCollection,
    FailedToGetVaultToken,
    SkippedCollectionNotFound,
}

impl Action {
    /// Render the stable tag string for this action.
    pub fn tag(&self) -> String {
        match self {
            Self::UnexpectedError => "UNEXPECTED_ERROR".into(),
            Self::FailedToFetchChannelMembers => "FAILED_TO_FETCH_CHANNEL_MEMBERS".into(),
            Self::SkippedNoEmail => "SKIPPED_NO_EMAIL".into(),

            Self::UserAddedToGroup => "USER_ADDED_TO_GROUP".into(),
            Self::UserAlreadyInGroup => "USER_ALREADY_IN_GROUP".into(),
            Self::UserRemovedFromGroup => "USER_REMOVED_FROM_GROUP".into(),
            Self::FailedToAddToGroup => "FAILED_TO_ADD_TO_GROUP".into(),
            Self::FailedToRemoveFromGroup => "FAILED_TO_REMOVE_FROM_GROUP".into(),
            Self::FailedToEnsureGroup => "FAILED_TO_ENSURE_GROUP".into(),
            Self::FailedToListGroups => "FAILED_TO_LIST_GROUPS".into(),
            Self::SkippedUserNotInProvider => "SKIPPED_USER_NOT_IN_PROVIDER".into(),

            Self::UserAddedToCollection { access, dm } => format!(
                "USER_ADDED_TO_COLLECTION_WITH_{}_ACCESS{}",
                access.tag_fragment(),
                dm.suffix()
            ),
            Self::UserAlreadyInCollectionPermissionEnsured => {
                "USER_ALREADY_IN_COLLECTION_PERMISSION_ENSURED".into()
            }
            Self::UserRemovedFromCollection => "USER_REMOVED_FROM_COLLECTION".into(),
            Self::FailedToAddToCollection => "FAILED_TO_ADD_TO_COLLECTION".into(),
            Self::FailedToUpdatePermission => "FAILED_TO_UPDATE_PERMISSION".into(),
            Self::FailedToRemoveFromCollection => "FAILED_TO_REMOVE_FROM_COLLECTION".into(),
            Self::FailedToEnsureCollection => "FAILED_TO_ENSURE_COLLECTION".into(),
            Self::FailedToListCollections => "FAILED_TO_LIST_COLLECTIONS".into(),
            Self::SkippedUserNotInOutline => "SKIPPED_USER_NOT_IN_OUTLINE".into(),

            Self::UserEnsuredInList => "USER_ENSURED_IN_LIST".into(),
            Self::FailedToEnsureContact => "FAILED_TO_ENSURE_CONTACT".into(),
            Self::FailedToEnsureList => "FAILED_TO_ENSURE_LIST".into(),

            Self::UserInvitedToBase { role, dm } => {
                format!("USER_INVITED_AS_{}{}", role.tag_fragment(), dm.suffix())
            }
            Self::UserRoleUpdated { role } => {
                format!("USER_ROLE_UPDATED_TO_{}", role.tag_fragment())
            }
            Self::UserAlreadyInBaseWithCorrectRole => {
                "USER_ALREADY_IN_BASE_WITH_CORRECT_ROLE".into()
            }
            Self::FailedToInviteToBase => "FAILED_TO_INVITE_TO_BASE".into(),
            Self::FailedToUpdateRole => "FAILED_TO_UPDATE_ROLE".into(),
            Self::FailedToListBases => "FAILED_TO_LIST_BASES".into(),
            Self::FailedToListBaseUsers => "FAILED_TO_LIST_BASE_USERS".into(),
            Self::SkippedBaseNotFound => "SKIPPED_BASE_NOT_FOUND".into(),

            Self::UserInvitedToVaultCollection { dm } => {
                format!("USER_INVITED_TO_VAULT_COLLECTION{}", dm.suffix())
            }
            Self::UserAlreadyInvited => "USER_ALREADY_INVITED".into(),
            Self::UserRemovedFromVaultCollection => "USER_REMOVED_FROM_VAULT_COLLECTION".into(),
            Self::FailedToInviteToVaultCollection => "FAILED_TO_INVITE_TO_VAULT_COLLECTION".into(),
            Self::FailedToUpdateVaultCollection => "FAILED_TO_UPDATE_VAULT_COLLECTION".into(),
            Self::FailedToGetVaultToken => "FAILED_TO_GET_VAULT_TOKEN".into(),
            Self::SkippedCollectionNotFound => "SKIPPED_COLLECTION_NOT_FOUND".into(),
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tag())
    }
}

/// One reconciliation outcome for a (subject, resource) pair.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub service: Service,
    /// Concrete downstream resource name (group, collection, list, base).
    pub target: String,
    /// Email or username identifying the affected user.
    pub subject: String,
    /// Chat channel the membership came from, for reporting context.
    pub channel: String,
    pub status: SyncStatus,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncRecord {
    pub fn success(
        service: Service,
        target: impl Into<String>,
        subject: impl Into<String>,
        channel: impl Into<String>,
        action: Action,
    ) -> Self {
        Self {
            service,
            target: target.into(),
            subject: subject.into(),
            channel: channel.into(),
            status: SyncStatus::Success,
            action,
            error: None,
        }
    }

    pub fn failure(
        service: Service,
        target: impl Into<String>,
        subject: impl Into<String>,
        channel: impl Into<String>,
        action: Action,
        error: impl Into<String>,
    ) -> Self {
        Self {
            service,
            target: target.into(),
            subject: subject.into(),
            channel: channel.into(),
            status: SyncStatus::Failure,
            action,
            error: Some(error.into()),
        }
    }

    pub fn skipped(
        service: Service,
        target: impl Into<String>,
        subject: impl Into<String>,
        channel: impl Into<String>,
        action: Action,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            service,
            target: target.into(),
            subject: subject.into(),
            channel: channel.into(),
            status: SyncStatus::Skipped,
            action,
            error: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_suffixes_decorate_add_tags() {
        let base = Action::UserAddedToCollection {
            access: DocAccess::ReadWrite,
            dm: DmOutcome::NotAttempted,
        };
        assert_eq!(base.tag(), "USER_ADDED_TO_COLLECTION_WITH_READ_WRITE_ACCESS");

        let sent = Action::UserAddedToCollection {
            access: DocAccess::Read,
            dm: DmOutcome::Sent,
        };
        assert_eq!(
            sent.tag(),
            "USER_ADDED_TO_COLLECTION_WITH_READ_ACCESS_AND_DM_SENT"
        );
    }

    #[test]
    fn role_tags_use_underscored_fragments() {
        let tag = Action::UserRoleUpdated {
            role: BaseRole::NoAccess,
        }
        .tag();
        assert_eq!(tag, "USER_ROLE_UPDATED_TO_NO_ACCESS");

        let tag = Action::UserInvitedToBase {
            role: BaseRole::Viewer,
            dm: DmOutcome::Failed,
        }
        .tag();
        assert_eq!(tag, "USER_INVITED_AS_VIEWER_DM_FAILED");
    }

    #[test]
    fn vault_invite_tag_variants() {
        let tag = Action::UserInvitedToVaultCollection {
            dm: DmOutcome::SkippedNoUrl,
        }
        .tag();
        assert_eq!(tag, "USER_INVITED_TO_VAULT_COLLECTION_DM_SKIPPED_NO_URL");
        assert_eq!(Action::UserAlreadyInvited.tag(), "USER_ALREADY_INVITED");
    }

    #[test]
    fn records_serialize_with_flat_tag_strings() {
        let record = SyncRecord::success(
            Service::Provider,
            "proj_Orion",
            "a@x",
            "Project Orion",
            Action::UserAddedToGroup,
        );
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["service"], "PROVIDER");
        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(json["action"], "USER_ADDED_TO_GROUP");
        assert!(json.get("error").is_none());
    }
}
