//! Database-base reconciliation.
//!
//! One base per entity, for the kinds whose matrix block enables it. The
//! platform exposes no base-user delete, so removal is an update to the
//! `no-access` role. Base creation is out of scope here; a missing base is
//! reported and skipped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::clients::{Base, BaseUser, NocodbClient};
use crate::config::matrix::{BaseRole, NocodbBlock};
use crate::config::Entity;
use crate::pattern;

use super::membership::{assemble_from_snapshot, ChannelSnapshot, EntityMembership, Member};
use super::record::{Action, DmOutcome, Service, SyncRecord};
use super::{send_notification_dm, Reconciler, SyncContext};

pub struct NocodbReconciler {
    client: Arc<dyn NocodbClient>,
    ctx: Arc<SyncContext>,
}

impl NocodbReconciler {
    pub fn new(client: Arc<dyn NocodbClient>, ctx: Arc<SyncContext>) -> Self {
        Self { client, ctx }
    }

    /// Invite missing members and realign roles for present ones.
    async fn ensure_members(
        &self,
        base: &Base,
        block: &NocodbBlock,
        membership: &EntityMembership,
        current: &[BaseUser],
    ) -> Vec<SyncRecord> {
        let mut records = Vec::new();
        let current_by_email: HashMap<&str, &BaseUser> = current
            .iter()
            .filter(|u| !u.email.is_empty())
            .map(|u| (u.email.as_str(), u))
            .collect();

        for member in membership.members.values() {
            let target = if member.is_admin_channel_member {
                block.admin_access
            } else {
                block.default_access
            };

            match current_by_email.get(member.email.as_str()) {
                Some(existing) if existing.role == target.as_str() => {
                    records.push(SyncRecord::success(
                        Service::Nocodb,
                        &base.title,
                        &member.email,
                        &membership.channel_label,
                        Action::UserAlreadyInBaseWithCorrectRole,
                    ));
                }
                Some(existing) => {
                    match self
                        .client
                        .update_user_role(&base.id, &existing.id, target)
                        .await
                    {
                        Ok(()) => records.push(SyncRecord::success(
                            Service::Nocodb,
                            &base.title,
                            &member.email,
                            &membership.channel_label,
                            Action::UserRoleUpdated { role: target },
                        )),
                        Err(e) => records.push(SyncRecord::failure(
                            Service::Nocodb,
                            &base.title,
                            &member.email,
                            &membership.channel_label,
                            Action::FailedToUpdateRole,
                            e.to_string(),
                        )),
                    }
                }
                None => match self.client.invite_user(&base.id, &member.email, target).await {
                    Ok(()) => {
                        let dm = self.notify_invited(base, member, target).await;
                        records.push(SyncRecord::success(
                            Service::Nocodb,
                            &base.title,
                            &member.email,
                            &membership.channel_label,
                            Action::UserInvitedToBase { role: target, dm },
                        ));
                    }
                    Err(e) => records.push(SyncRecord::failure(
                        Service::Nocodb,
                        &base.title,
                        &member.email,
                        &membership.channel_label,
                        Action::FailedToInviteToBase,
                        e.to_string(),
                    )),
                },
            }
        }
        records
    }

    async fn notify_invited(&self, base: &Base, member: &Member, role: BaseRole) -> DmOutcome {
        let Some(url) = self.client.base_url(&base.id) else {
            tracing::warn!(base = %base.title, "no base URL available, skipping notification DM");
            return DmOutcome::SkippedNoUrl;
        };
        let text = format!(
            "Hi @{}, you have been invited to the database **{}** (role: {}).\nYou can access it here: {}",
            member.username,
            base.title,
            role.as_str(),
            url
        );
        send_notification_dm(self.ctx.chat.as_ref(), &member.chat_user_id, &text).await
    }
}

#[async_trait]
impl Reconciler for NocodbReconciler {
    fn service(&self) -> Service {
        Service::Nocodb
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
            .and_then(|p| p.nocodb.as_ref())
        else {
            return Vec::new();
        };
        let title = pattern::render(&block.base_title_pattern, &entity.base_name);

        let base = match self.client.base_by_title(&title).await {
            Ok(Some(base)) => base,
            Ok(None) => {
                return vec![SyncRecord::skipped(
                    Service::Nocodb,
                    &title,
                    "",
                    &membership.channel_label,
                    Action::SkippedBaseNotFound,
                    format!("base '{title}' not found; bases are provisioned separately"),
                )];
            }
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Nocodb,
                    &title,
                    "",
                    &membership.channel_label,
                    Action::FailedToListBases,
                    e.to_string(),
                )];
            }
        };

        let current = match self.client.base_users(&base.id).await {
            Ok(users) => users,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Nocodb,
                    &title,
                    "",
                    &membership.channel_label,
                    Action::FailedToListBaseUsers,
                    e.to_string(),
                )];
            }
        };

        self.ensure_members(&base, block, membership, &current).await
    }

    async fn differential_sync(&self, snapshot: &ChannelSnapshot) -> Vec<SyncRecord> {
        let mut records = Vec::new();

        let bases = match self.client.list_bases().await {
            Ok(bases) => bases,
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Nocodb,
                    "",
                    "",
                    "",
                    Action::FailedToListBases,
                    e.to_string(),
                )];
            }
        };

        for base in bases {
            let Some(entity) = self.ctx.matrix.entity_for_nocodb_base(&base.title) else {
                continue;
            };
            let Some(policy) = self.ctx.matrix.policy(&entity.kind) else {
                continue;
            };
            let Some(block) = policy.nocodb.as_ref() else {
                continue;
            };

            let membership = assemble_from_snapshot(
                snapshot,
                policy,
                &self.ctx.exclusions,
                &entity.base_name,
            );

            let current = match self.client.base_users(&base.id).await {
                Ok(users) => users,
                Err(e) => {
                    records.push(SyncRecord::failure(
                        Service::Nocodb,
                        &base.title,
                        "",
                        &membership.channel_label,
                        Action::FailedToListBaseUsers,
                        e.to_string(),
                    ));
                    continue;
                }
            };

            // Removal is a role downgrade; users already at no-access are
            // effectively gone and left alone.
            for user in &current {
                if user.email.is_empty()
                    || user.role == BaseRole::NoAccess.as_str()
                    || membership.is_preserved(&user.email)
                {
                    continue;
                }
                match self
                    .client
                    .update_user_role(&base.id, &user.id, BaseRole::NoAccess)
                    .await
                {
                    Ok(()) => records.push(SyncRecord::success(
                        Service::Nocodb,
                        &base.title,
                        &user.email,
                        &membership.channel_label,
                        Action::UserRoleUpdated {
                            role: BaseRole::NoAccess,
                        },
                    )),
                    Err(e) => records.push(SyncRecord::failure(
                        Service::Nocodb,
                        &base.title,
                        &user.email,
                        &membership.channel_label,
                        Action::FailedToUpdateRole,
                        e.to_string(),
                    )),
                }
            }

            records.extend(
                self.ensure_members(&base, block, &membership, &current)
                    .await,
            );
        }
        records
    }
}
