//! Email contact-list reconciliation.
//!
//! Strictly additive: the platform's contact upsert is a single idempotent
//! create-or-add call, and nothing is ever removed from a list. Differential
//! mode therefore performs the same upsert logic, over entities discovered
//! from the prefetched channel snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::clients::brevo::DEFAULT_FOLDER_ID;
use crate::clients::{BrevoClient, ContactList};
use crate::config::matrix::BrevoBlock;
use crate::config::Entity;
use crate::pattern;

use super::membership::{assemble_from_snapshot, ChannelSnapshot, EntityMembership};
use super::record::{Action, Service, SyncRecord};
use super::{Reconciler, SyncContext};

pub struct BrevoReconciler {
    client: Arc<dyn BrevoClient>,
    ctx: Arc<SyncContext>,
}

impl BrevoReconciler {
    pub fn new(client: Arc<dyn BrevoClient>, ctx: Arc<SyncContext>) -> Self {
        Self { client, ctx }
    }

    async fn find_or_create_list(
        &self,
        name: &str,
        block: &BrevoBlock,
    ) -> Result<ContactList, String> {
        if let Some(list) = self.client.find_list(name).await.map_err(|e| e.to_string())? {
            return Ok(list);
        }

        let folder_id = match &block.folder_name {
            Some(folder) => match self
                .client
                .folder_id_by_name(folder)
                .await
                .map_err(|e| e.to_string())?
            {
                Some(id) => id,
                None => {
                    tracing::warn!(
                        folder,
                        "configured folder not found, creating list in the default folder"
                    );
                    DEFAULT_FOLDER_ID
                }
            },
            None => DEFAULT_FOLDER_ID,
        };

        tracing::info!(list = name, folder_id, "contact list missing, creating");
        self.client
            .create_list(name, folder_id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn sync_list(
        &self,
        block: &BrevoBlock,
        entity: &Entity,
        membership: &EntityMembership,
    ) -> Vec<SyncRecord> {
        let name = pattern::render(&block.list_name_pattern, &entity.base_name);
        let list = match self.find_or_create_list(&name, block).await {
            Ok(list) => list,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Brevo,
                    &name,
                    "",
                    &membership.channel_label,
                    Action::FailedToEnsureList,
                    e,
                )];
            }
        };

        let mut records = Vec::new();
        for member in membership.members.values() {
            match self.client.upsert_contact(&member.email, list.id).await {
                Ok(()) => records.push(SyncRecord::success(
                    Service::Brevo,
                    &list.name,
                    &member.email,
                    &membership.channel_label,
                    Action::UserEnsuredInList,
                )),
                Err(e) => records.push(SyncRecord::failure(
                    Service::Brevo,
                    &list.name,
                    &member.email,
                    &membership.channel_label,
                    Action::FailedToEnsureContact,
                    e.to_string(),
                )),
            }
        }
        records
    }
}

#[async_trait]
impl Reconciler for BrevoReconciler {
    fn service(&self) -> Service {
        Service::Brevo
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
            .and_then(|p| p.brevo.as_ref())
        else {
            return Vec::new();
        };
        self.sync_list(block, entity, membership).await
    }

    async fn differential_sync(&self, snapshot: &ChannelSnapshot) -> Vec<SyncRecord> {
        let mut records = Vec::new();
        let mut seen: BTreeSet<Entity> = BTreeSet::new();

        for channel in snapshot.channels() {
            let Some(entity) = self
                .ctx
                .matrix
                .entity_for_channel(&channel.display_name, &channel.slug)
            else {
                continue;
            };
            if !seen.insert(entity.clone()) {
                continue;
            }
            let Some(policy) = self.ctx.matrix.policy(&entity.kind) else {
                continue;
            };
            let Some(block) = policy.brevo.as_ref() else {
                continue;
            };

            let membership = assemble_from_snapshot(
                snapshot,
                policy,
                &self.ctx.exclusions,
                &entity.base_name,
            );
            records.extend(self.sync_list(block, &entity, &membership).await);
        }
        records
    }
}
