//! The synchronization core: per-service reconcilers and the orchestrator
//! that drives them.
//!
//! Each reconciler converges one downstream service onto the authoritative
//! membership derived from chat channels, through the same two-operation
//! contract. Reconcilers never raise: every outcome, including capability
//! failures, becomes a [`SyncRecord`].

pub mod brevo;
pub mod membership;
pub mod nocodb;
pub mod orchestrator;
pub mod outline;
pub mod provider;
pub mod record;
pub mod vaultwarden;

use std::sync::Arc;

use async_trait::async_trait;

use crate::clients::{ChatClient, Clients};
use crate::config::{Entity, ExclusionList, PermissionsMatrix};

pub use membership::{ChannelSnapshot, EntityMembership, Member};
pub use orchestrator::{differential_sync, orchestrate, CancelFlag, RunOptions, SyncMode};
pub use record::{Action, DmOutcome, Service, SyncRecord, SyncStatus};

/// Read-only state shared by every reconciler for the duration of a run.
pub struct SyncContext {
    pub matrix: Arc<PermissionsMatrix>,
    pub exclusions: Arc<ExclusionList>,
    pub chat: Arc<dyn ChatClient>,
}

/// The two-operation contract every per-service reconciler implements.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn service(&self) -> Service;

    /// Additive convergence for one entity: add missing members, align
    /// permissions, never remove. Idempotent.
    async fn upsert_sync(
        &self,
        entity: &Entity,
        membership: &EntityMembership,
    ) -> Vec<SyncRecord>;

    /// Full convergence across every resource this service owns that maps to
    /// a configured entity kind, including removal of members no longer
    /// authorized (excluded users are preserved).
    async fn differential_sync(&self, snapshot: &ChannelSnapshot) -> Vec<SyncRecord>;
}

/// Build the registry of reconcilers for the configured services.
pub fn build_reconcilers(clients: &Clients, ctx: &Arc<SyncContext>) -> Vec<Arc<dyn Reconciler>> {
    let mut reconcilers: Vec<Arc<dyn Reconciler>> = Vec::new();
    if let Some(client) = &clients.provider {
        reconcilers.push(Arc::new(provider::ProviderReconciler::new(
            client.clone(),
            ctx.clone(),
        )));
    }
    if let Some(client) = &clients.outline {
        reconcilers.push(Arc::new(outline::OutlineReconciler::new(
            client.clone(),
            ctx.clone(),
        )));
    }
    if let Some(client) = &clients.brevo {
        reconcilers.push(Arc::new(brevo::BrevoReconciler::new(
            client.clone(),
            ctx.clone(),
        )));
    }
    if let Some(client) = &clients.nocodb {
        reconcilers.push(Arc::new(nocodb::NocodbReconciler::new(
            client.clone(),
            ctx.clone(),
        )));
    }
    if let Some(client) = &clients.vaultwarden {
        reconcilers.push(Arc::new(vaultwarden::VaultwardenReconciler::new(
            client.clone(),
            ctx.clone(),
        )));
    }
    reconcilers
}

/// Send a notification DM, folding the result into a tag decoration.
/// DM failures never invalidate the action they decorate.
pub(crate) async fn send_notification_dm(
    chat: &dyn ChatClient,
    chat_user_id: &str,
    text: &str,
) -> DmOutcome {
    match chat.send_direct_message(chat_user_id, text).await {
        Ok(()) => DmOutcome::Sent,
        Err(e) => {
            tracing::warn!(user = chat_user_id, error = %e, "notification DM failed");
            DmOutcome::Failed
        }
    }
}
