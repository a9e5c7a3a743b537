//! Documentation-collection reconciliation.
//!
//! One collection per entity. The add endpoint is idempotent on the
//! permission, so a divergent permission is fixed by re-adding; a member
//! whose permission already matches is left alone. First-time additions get
//! a notification DM with a link to the collection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::clients::{Collection, CollectionMember, OutlineClient};
use crate::config::matrix::{DocAccess, OutlineBlock};
use crate::config::Entity;
use crate::pattern;

use super::membership::{assemble_from_snapshot, ChannelSnapshot, EntityMembership, Member};
use super::record::{Action, DmOutcome, Service, SyncRecord};
use super::{send_notification_dm, Reconciler, SyncContext};

pub struct OutlineReconciler {
    client: Arc<dyn OutlineClient>,
    ctx: Arc<SyncContext>,
}

impl OutlineReconciler {
    pub fn new(client: Arc<dyn OutlineClient>, ctx: Arc<SyncContext>) -> Self {
        Self { client, ctx }
    }

    async fn find_or_create_collection(&self, name: &str) -> Result<Collection, String> {
        let existing = self
            .client
            .list_collections()
            .await
            .map_err(|e| e.to_string())?
            .into_iter()
            .find(|c| c.name == name);
        match existing {
            Some(collection) => Ok(collection),
            None => {
                tracing::info!(collection = name, "documentation collection missing, creating");
                self.client.create_collection(name).await.map_err(|e| e.to_string())
            }
        }
    }

    /// Add or realign every authoritative member of one collection.
    async fn ensure_members(
        &self,
        collection: &Collection,
        block: &OutlineBlock,
        membership: &EntityMembership,
        current: &[CollectionMember],
    ) -> Vec<SyncRecord> {
        let mut records = Vec::new();
        let current_permissions: HashMap<&str, &str> = current
            .iter()
            .map(|m| (m.user_id.as_str(), m.permission.as_str()))
            .collect();

        for member in membership.members.values() {
            let native = match self.client.user_by_email(&member.email).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    records.push(SyncRecord::skipped(
                        Service::Outline,
                        &collection.name,
                        &member.email,
                        &membership.channel_label,
                        Action::SkippedUserNotInOutline,
                        format!("email '{}' not found in the documentation service", member.email),
                    ));
                    continue;
                }
                Err(e) => {
                    records.push(SyncRecord::failure(
                        Service::Outline,
                        &collection.name,
                        &member.email,
                        &membership.channel_label,
                        Action::FailedToAddToCollection,
                        format!("user lookup failed: {e}"),
                    ));
                    continue;
                }
            };

            let target = if member.is_admin_channel_member {
                block.admin_access
            } else {
                block.default_access
            };
            let existing = current_permissions.get(native.id.as_str()).copied();

            if existing == Some(target.as_str()) {
                records.push(SyncRecord::success(
                    Service::Outline,
                    &collection.name,
                    &member.email,
                    &membership.channel_label,
                    Action::UserAlreadyInCollectionPermissionEnsured,
                ));
                continue;
            }

            let was_member = existing.is_some();
            match self
                .client
                .add_user_to_collection(&collection.id, &native.id, target)
                .await
            {
                Ok(()) => {
                    let dm = if was_member {
                        DmOutcome::NotAttempted
                    } else {
                        self.notify_added(collection, member, target).await
                    };
                    records.push(SyncRecord::success(
                        Service::Outline,
                        &collection.name,
                        &member.email,
                        &membership.channel_label,
                        Action::UserAddedToCollection { access: target, dm },
                    ));
                }
                Err(e) => {
                    let action = if was_member {
                        Action::FailedToUpdatePermission
                    } else {
                        Action::FailedToAddToCollection
                    };
                    records.push(SyncRecord::failure(
                        Service::Outline,
                        &collection.name,
                        &member.email,
                        &membership.channel_label,
                        action,
                        e.to_string(),
                    ));
                }
            }
        }
        records
    }

    async fn notify_added(
        &self,
        collection: &Collection,
        member: &Member,
        _access: DocAccess,
    ) -> DmOutcome {
        let Some(url) = self.client.collection_url(collection) else {
            tracing::warn!(
                collection = %collection.name,
                "no collection URL available, skipping notification DM"
            );
            return DmOutcome::SkippedNoUrl;
        };
        let text = format!(
            "Hi @{}, you have been added to the documentation collection **{}**.\nYou can access it here: {}",
            member.username, collection.name, url
        );
        send_notification_dm(self.ctx.chat.as_ref(), &member.chat_user_id, &text).await
    }
}

#[async_trait]
impl Reconciler for OutlineReconciler {
    fn service(&self) -> Service {
        Service::Outline
    }

    async fn upsert_sync(
        &self,
        entity: &Entity,
        membership: &EntityMembership,
    ) -> Vec<SyncRecord> {
        let Some(block) = self
            .ctx
            .matrix
            .policy(&entity.kind)
            .and_then(|p| p.outline.as_ref())
        else {
            return Vec::new();
        };
        let name = pattern::render(&block.collection_name_pattern, &entity.base_name);

        let collection = match self.find_or_create_collection(&name).await {
            Ok(collection) => collection,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Outline,
                    &name,
                    "",
                    &membership.channel_label,
                    Action::FailedToEnsureCollection,
                    e,
                )];
            }
        };

        let current = match self.client.collection_members(&collection.id).await {
            Ok(members) => members,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Outline,
                    &name,
                    "",
                    &membership.channel_label,
                    Action::FailedToEnsureCollection,
                    format!("could not fetch collection members: {e}"),
                )];
            }
        };

        self.ensure_members(&collection, block, membership, &current).await
    }

    async fn differential_sync(&self, snapshot: &ChannelSnapshot) -> Vec<SyncRecord> {
        let mut records = Vec::new();

        let collections = match self.client.list_collections().await {
            Ok(collections) => collections,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Outline,
                    "",
                    "",
                    "",
                    Action::FailedToListCollections,
                    e.to_string(),
                )];
            }
        };

        for collection in collections {
            let Some(entity) = self.ctx.matrix.entity_for_outline_collection(&collection.name)
            else {
                continue;
            };
            let Some(policy) = self.ctx.matrix.policy(&entity.kind) else {
                continue;
            };
            let Some(block) = policy.outline.as_ref() else {
                continue;
            };

            let membership = assemble_from_snapshot(
                snapshot,
                policy,
                &self.ctx.exclusions,
                &entity.base_name,
            );

            let current = match self.client.collection_members(&collection.id).await {
                Ok(members) => members,
                Err(e) => {
                    records.push(SyncRecord::failure(
                        Service::Outline,
                        &collection.name,
                        "",
                        &membership.channel_label,
                        Action::FailedToEnsureCollection,
                        format!("could not fetch collection members: {e}"),
                    ));
                    continue;
                }
            };

            for existing in &current {
                if existing.email.is_empty() || membership.is_preserved(&existing.email) {
                    continue;
                }
                match self
                    .client
                    .remove_user_from_collection(&collection.id, &existing.user_id)
                    .await
                {
                    Ok(()) => records.push(SyncRecord::success(
                        Service::Outline,
                        &collection.name,
                        &existing.email,
                        &membership.channel_label,
                        Action::UserRemovedFromCollection,
                    )),
                    Err(e) => records.push(SyncRecord::failure(
                        Service::Outline,
                        &collection.name,
                        &existing.email,
                        &membership.channel_label,
                        Action::FailedToRemoveFromCollection,
                        e.to_string(),
                    )),
                }
            }

            records.extend(
                self.ensure_members(&collection, block, &membership, &current)
                    .await,
            );
        }
        records
    }
}
