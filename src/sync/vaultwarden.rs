//! Password-collection reconciliation.
//!
//! Invitations are additive and idempotent: the store answers repeated
//! invites for a member with a 400 the client translates into
//! [`VaultInviteOutcome::AlreadyMember`]. Removal only happens in
//! differential mode, by rewriting the collection's user list wholesale.
//!
//! The bearer token is the one piece of shared mutable state in a run; a
//! single cell guards `{token, expiry}` and a 401 triggers one refresh and
//! one retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{Mutex, OnceCell};

use crate::clients::{VaultCollection, VaultInviteOutcome, VaultwardenClient};
use crate::config::Entity;
use crate::error::ApiError;
use crate::pattern;

use super::membership::{assemble_from_snapshot, ChannelSnapshot, EntityMembership, Member};
use super::record::{Action, DmOutcome, Service, SyncRecord};
use super::{send_notification_dm, Reconciler, SyncContext};

/// Refresh slightly before the advertised expiry to absorb clock skew.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

struct CachedToken {
    secret: SecretString,
    expires_at: Instant,
}

/// Single-owner cell for the bearer token shared across invitations.
#[derive(Default)]
struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    async fn get(&self, client: &dyn VaultwardenClient) -> Result<SecretString, ApiError> {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref()
            && cached.expires_at > Instant::now()
        {
            return Ok(cached.secret.clone());
        }
        let fresh = client.request_token().await?;
        let lifetime = Duration::from_secs(fresh.expires_in_secs)
            .saturating_sub(TOKEN_EXPIRY_MARGIN);
        let secret = fresh.access_token;
        *slot = Some(CachedToken {
            secret: secret.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(secret)
    }

    async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

pub struct VaultwardenReconciler {
    client: Arc<dyn VaultwardenClient>,
    ctx: Arc<SyncContext>,
    tokens: TokenCache,
    /// CLI-mediated collection listing, fetched once per run.
    collections: OnceCell<Vec<VaultCollection>>,
}

impl VaultwardenReconciler {
    pub fn new(client: Arc<dyn VaultwardenClient>, ctx: Arc<SyncContext>) -> Self {
        Self {
            client,
            ctx,
            tokens: TokenCache::default(),
            collections: OnceCell::new(),
        }
    }

    async fn collections(&self) -> Result<&[VaultCollection], ApiError> {
        self.collections
            .get_or_try_init(|| self.client.list_collections())
            .await
            .map(Vec::as_slice)
    }

    /// Run a token-bearing call, refreshing once on 401.
    async fn with_token<T, F, Fut>(&self, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut(SecretString) -> Fut,
        Fut: std::future::Future<Output = Result<T, ApiError>>,
    {
        let token = self.tokens.get(self.client.as_ref()).await?;
        match call(token).await {
            Err(e) if e.is_unauthorized() => {
                tracing::info!("password-store token rejected, refreshing once");
                self.tokens.invalidate().await;
                let token = self.tokens.get(self.client.as_ref()).await?;
                call(token).await
            }
            other => other,
        }
    }

    async fn invite_members(
        &self,
        collection: &VaultCollection,
        membership: &EntityMembership,
    ) -> Vec<SyncRecord> {
        let mut records = Vec::new();
        for member in membership.members.values() {
            let outcome = self
                .with_token(|token| async move {
                    self.client
                        .invite_user(&collection.id, &collection.org_id, &member.email, &token)
                        .await
                })
                .await;

            match outcome {
                Ok(VaultInviteOutcome::Invited) => {
                    let dm = self.notify_invited(collection, member).await;
                    records.push(SyncRecord::success(
                        Service::Vaultwarden,
                        &collection.name,
                        &member.email,
                        &membership.channel_label,
                        Action::UserInvitedToVaultCollection { dm },
                    ));
                }
                Ok(VaultInviteOutcome::AlreadyMember) => {
                    records.push(SyncRecord::success(
                        Service::Vaultwarden,
                        &collection.name,
                        &member.email,
                        &membership.channel_label,
                        Action::UserAlreadyInvited,
                    ));
                }
                Err(e) => records.push(SyncRecord::failure(
                    Service::Vaultwarden,
                    &collection.name,
                    &member.email,
                    &membership.channel_label,
                    Action::FailedToInviteToVaultCollection,
                    e.to_string(),
                )),
            }
        }
        records
    }

    async fn notify_invited(&self, collection: &VaultCollection, member: &Member) -> DmOutcome {
        let Some(url) = self.client.server_url() else {
            tracing::warn!(
                collection = %collection.name,
                "no store URL available, skipping notification DM"
            );
            return DmOutcome::SkippedNoUrl;
        };
        let text = format!(
            "Hi @{}, you have been invited to the password collection **{}**.\nYou can access the store here: {}",
            member.username, collection.name, url
        );
        send_notification_dm(self.ctx.chat.as_ref(), &member.chat_user_id, &text).await
    }
}

#[async_trait]
impl Reconciler for VaultwardenReconciler {
    fn service(&self) -> Service {
        Service::Vaultwarden
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
            .and_then(|p| p.vaultwarden.as_ref())
        else {
            return Vec::new();
        };
        let name = pattern::render(&block.collection_name_pattern, &entity.base_name);

        let collection = match self.collections().await {
            Ok(collections) => collections.iter().find(|c| c.name == name).cloned(),
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Vaultwarden,
                    &name,
                    "",
                    &membership.channel_label,
                    Action::FailedToListCollections,
                    e.to_string(),
                )];
            }
        };
        let Some(collection) = collection else {
            return vec![SyncRecord::skipped(
                Service::Vaultwarden,
                &name,
                "",
                &membership.channel_label,
                Action::SkippedCollectionNotFound,
                format!("collection '{name}' not found; collections are provisioned separately"),
            )];
        };

        self.invite_members(&collection, membership).await
    }

    async fn differential_sync(&self, snapshot: &ChannelSnapshot) -> Vec<SyncRecord> {
        let mut records = Vec::new();

        let collections = match self.collections().await {
            Ok(collections) => collections.to_vec(),
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Vaultwarden,
                    "",
                    "",
                    "",
                    Action::FailedToListCollections,
                    e.to_string(),
                )];
            }
        };

        let member_emails = match self
            .with_token(|token| async move { self.client.organization_members(&token).await })
            .await
        {
            Ok(members) => members
                .into_iter()
                .map(|m| (m.id, m.email.to_lowercase()))
                .collect::<std::collections::HashMap<_, _>>(),
            Err(e) => {
                return vec![SyncRecord::failure(
                    Service::Vaultwarden,
                    "",
                    "",
                    "",
                    Action::FailedToUpdateVaultCollection,
                    format!("could not resolve organization members: {e}"),
                )];
            }
        };

        for collection in collections {
            let Some(entity) = self
                .ctx
                .matrix
                .entity_for_vaultwarden_collection(&collection.name)
            else {
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

            let collection_id = &collection.id;
            let details = match self
                .with_token(|token| async move {
                    self.client.collection_details(collection_id, &token).await
                })
                .await
            {
                Ok(details) => details,
                Err(e) => {
                    records.push(SyncRecord::failure(
                        Service::Vaultwarden,
                        &collection.name,
                        "",
                        &membership.channel_label,
                        Action::FailedToUpdateVaultCollection,
                        format!("could not fetch collection details: {e}"),
                    ));
                    continue;
                }
            };

            // Retain authorized and excluded-but-present users; everyone
            // else comes out in one list rewrite.
            let mut retained = Vec::new();
            let mut removed: Vec<String> = Vec::new();
            for user in &details.users {
                let email = member_emails.get(&user.id).cloned().unwrap_or_default();
                if !email.is_empty() && membership.is_preserved(&email) {
                    retained.push(user.clone());
                } else if email.is_empty() {
                    removed.push(user.id.clone());
                } else {
                    removed.push(email);
                }
            }

            if !removed.is_empty() {
                let mut updated = details.clone();
                updated.users = retained;
                let updated_ref = &updated;
                match self
                    .with_token(|token| async move {
                        self.client.put_collection_users(updated_ref, &token).await
                    })
                    .await
                {
                    Ok(()) => {
                        for subject in &removed {
                            records.push(SyncRecord::success(
                                Service::Vaultwarden,
                                &collection.name,
                                subject,
                                &membership.channel_label,
                                Action::UserRemovedFromVaultCollection,
                            ));
                        }
                    }
                    Err(e) => {
                        for subject in &removed {
                            records.push(SyncRecord::failure(
                                Service::Vaultwarden,
                                &collection.name,
                                subject,
                                &membership.channel_label,
                                Action::FailedToUpdateVaultCollection,
                                e.to_string(),
                            ));
                        }
                    }
                }
            }

            records.extend(self.invite_members(&collection, &membership).await);
        }
        records
    }
}
