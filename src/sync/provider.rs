//! Identity-provider group reconciliation.
//!
//! Each entity maps to a standard group and, when configured, an admin
//! group. The standard group receives every authoritative member (admins
//! included — the standard set is always a superset); the admin group
//! receives admin-channel members only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::clients::{ProviderClient, ProviderGroup};
use crate::config::Entity;
use crate::error::ApiError;
use crate::pattern;

use super::membership::{assemble_from_snapshot, ChannelSnapshot, EntityMembership, Member};
use super::record::{Action, Service, SyncRecord};
use super::{Reconciler, SyncContext};

pub struct ProviderReconciler {
    client: Arc<dyn ProviderClient>,
    ctx: Arc<SyncContext>,
    /// email → native id directory, fetched once per run.
    email_to_id: OnceCell<HashMap<String, String>>,
}

impl ProviderReconciler {
    pub fn new(client: Arc<dyn ProviderClient>, ctx: Arc<SyncContext>) -> Self {
        Self {
            client,
            ctx,
            email_to_id: OnceCell::new(),
        }
    }

    async fn email_directory(&self) -> Result<&HashMap<String, String>, ApiError> {
        self.email_to_id
            .get_or_try_init(|| async {
                let map = self.client.users_by_email().await?;
                if map.is_empty() {
                    tracing::warn!("identity provider returned an empty user directory");
                }
                Ok(map)
            })
            .await
    }

    /// Add missing members to one group; report the ones already there.
    async fn ensure_members_in_group<'a>(
        &self,
        group: &ProviderGroup,
        desired: impl Iterator<Item = &'a Member>,
        directory: &HashMap<String, String>,
        channel_label: &str,
    ) -> Vec<SyncRecord> {
        let mut records = Vec::new();
        let current_ids: HashSet<&str> = group.users.iter().map(|u| u.id.as_str()).collect();

        for member in desired {
            let Some(native_id) = directory.get(&member.email) else {
                records.push(SyncRecord::skipped(
                    Service::Provider,
                    &group.name,
                    &member.email,
                    channel_label,
                    Action::SkippedUserNotInProvider,
                    format!("email '{}' not found in the identity provider", member.email),
                ));
                continue;
            };

            if current_ids.contains(native_id.as_str()) {
                records.push(SyncRecord::success(
                    Service::Provider,
                    &group.name,
                    &member.email,
                    channel_label,
                    Action::UserAlreadyInGroup,
                ));
                continue;
            }

            match self.client.add_user_to_group(&group.id, native_id).await {
                Ok(()) => records.push(SyncRecord::success(
                    Service::Provider,
                    &group.name,
                    &member.email,
                    channel_label,
                    Action::UserAddedToGroup,
                )),
                Err(e) => records.push(SyncRecord::failure(
                    Service::Provider,
                    &group.name,
                    &member.email,
                    channel_label,
                    Action::FailedToAddToGroup,
                    e.to_string(),
                )),
            }
        }
        records
    }

    /// Resolve a group by name from the pre-fetched map, creating it when
    /// absent.
    async fn get_or_create_group(
        &self,
        groups_by_name: &HashMap<String, ProviderGroup>,
        name: &str,
    ) -> Result<ProviderGroup, ApiError> {
        if let Some(group) = groups_by_name.get(name) {
            return Ok(group.clone());
        }
        tracing::info!(group = name, "identity-provider group missing, creating");
        self.client.create_group(name).await
    }

    async fn sync_one_group<'a>(
        &self,
        groups_by_name: &HashMap<String, ProviderGroup>,
        group_name: &str,
        desired: impl Iterator<Item = &'a Member>,
        directory: &HashMap<String, String>,
        channel_label: &str,
    ) -> Vec<SyncRecord> {
        match self.get_or_create_group(groups_by_name, group_name).await {
            Ok(group) => {
                self.ensure_members_in_group(&group, desired, directory, channel_label)
                    .await
            }
            Err(e) => vec![SyncRecord::failure(
                Service::Provider,
                group_name,
                "",
                channel_label,
                Action::FailedToEnsureGroup,
                e.to_string(),
            )],
        }
    }
}

#[async_trait]
impl Reconciler for ProviderReconciler {
    fn service(&self) -> Service {
        Service::Provider
    }

    async fn upsert_sync(
        &self,
        entity: &Entity,
        membership: &EntityMembership,
    ) -> Vec<SyncRecord> {
        let Some(policy) = self.ctx.matrix.policy(&entity.kind) else {
            return Vec::new();
        };
        let std_group_name =
            pattern::render(&policy.standard.provider_group_pattern, &entity.base_name);

        let directory = match self.email_directory().await {
            Ok(map) => map,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Provider,
                    &std_group_name,
                    "",
                    &membership.channel_label,
                    Action::FailedToEnsureGroup,
                    format!("could not fetch user directory: {e}"),
                )];
            }
        };

        let groups_by_name = match self.client.groups_with_users().await {
            Ok(groups) => groups
                .into_iter()
                .map(|g| (g.name.clone(), g))
                .collect::<HashMap<_, _>>(),
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Provider,
                    &std_group_name,
                    "",
                    &membership.channel_label,
                    Action::FailedToListGroups,
                    e.to_string(),
                )];
            }
        };

        let mut records = self
            .sync_one_group(
                &groups_by_name,
                &std_group_name,
                membership.members.values(),
                directory,
                &membership.channel_label,
            )
            .await;

        if let Some(admin) = &policy.admin {
            let admin_group_name =
                pattern::render(&admin.provider_group_pattern, &entity.base_name);
            records.extend(
                self.sync_one_group(
                    &groups_by_name,
                    &admin_group_name,
                    membership.admin_members(),
                    directory,
                    &membership.channel_label,
                )
                .await,
            );
        }
        records
    }

    async fn differential_sync(&self, snapshot: &ChannelSnapshot) -> Vec<SyncRecord> {
        let mut records = Vec::new();

        let groups = match self.client.groups_with_users().await {
            Ok(groups) => groups,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Provider,
                    "",
                    "",
                    "",
                    Action::FailedToListGroups,
                    e.to_string(),
                )];
            }
        };
        let directory = match self.email_directory().await {
            Ok(map) => map,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Provider,
                    "",
                    "",
                    "",
                    Action::FailedToListGroups,
                    format!("could not fetch user directory: {e}"),
                )];
            }
        };

        for group in &groups {
            let Some((entity, is_admin_group)) =
                self.ctx.matrix.entity_for_provider_group(&group.name)
            else {
                tracing::debug!(group = %group.name, "group does not map to an entity, skipping");
                continue;
            };
            let Some(policy) = self.ctx.matrix.policy(&entity.kind) else {
                continue;
            };

            let membership = assemble_from_snapshot(
                snapshot,
                policy,
                &self.ctx.exclusions,
                &entity.base_name,
            );
            let desired: Vec<&Member> = if is_admin_group {
                membership.admin_members().collect()
            } else {
                membership.members.values().collect()
            };
            let desired_emails: HashSet<&str> =
                desired.iter().map(|m| m.email.as_str()).collect();

            // Removals first check the exclusion guard, by provider username
            // and by chat email.
            for user in &group.users {
                if user.email.is_empty() || desired_emails.contains(user.email.as_str()) {
                    continue;
                }
                if self.ctx.exclusions.contains(&user.username)
                    || membership.excluded_emails.contains(&user.email)
                {
                    tracing::debug!(
                        user = %user.username,
                        group = %group.name,
                        "excluded user preserved in group"
                    );
                    continue;
                }
                match self.client.remove_user_from_group(&group.id, &user.id).await {
                    Ok(()) => records.push(SyncRecord::success(
                        Service::Provider,
                        &group.name,
                        &user.email,
                        &membership.channel_label,
                        Action::UserRemovedFromGroup,
                    )),
                    Err(e) => records.push(SyncRecord::failure(
                        Service::Provider,
                        &group.name,
                        &user.email,
                        &membership.channel_label,
                        Action::FailedToRemoveFromGroup,
                        e.to_string(),
                    )),
                }
            }

            records.extend(
                self.ensure_members_in_group(
                    group,
                    desired.into_iter(),
                    directory,
                    &membership.channel_label,
                )
                .await,
            );
        }
        records
    }
}
