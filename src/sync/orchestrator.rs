//! Entity discovery and per-entity fan-out across the configured
//! reconcilers.
//!
//! Entities are reconciled concurrently under a configurable bound; within
//! one entity the reconcilers run serially, so per-resource ordering
//! (adds and updates before removals) holds. A reconciler panic is caught
//! at the task boundary and becomes one synthetic FAILURE record. A
//! cancellation signal stops entities that have not started; in-flight
//! calls run to completion so partial writes (the password store's list
//! rewrite in particular) are never cut short.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;

use crate::clients::{ChatClient, Clients};
use crate::config::{Entity, ExclusionList, PermissionsMatrix, DEFAULT_CONCURRENCY};

use super::membership::{assemble_live, ChannelSnapshot, EntityMembership};
use super::record::{Action, Service, SyncRecord};
use super::{build_reconcilers, Reconciler, SyncContext};

/// How entities are discovered for an additive run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Enumerate identity-provider groups and reverse-match their names.
    WithProvider,
    /// Enumerate chat channels and reverse-match display names, then slugs.
    /// Discovery source only: every reconciler still runs per entity.
    ChatToTools,
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().replace('-', "_").as_str() {
            "WITH_PROVIDER" => Ok(Self::WithProvider),
            "CHAT_TO_TOOLS" => Ok(Self::ChatToTools),
            other => Err(format!(
                "invalid sync mode '{other}', expected WITH_PROVIDER or CHAT_TO_TOOLS"
            )),
        }
    }
}

/// Cooperative cancellation: aborts entities that have not started while
/// letting in-flight work finish.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Upper bound on concurrently reconciled entities.
    pub concurrency: usize,
    pub cancel: CancelFlag,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancelFlag::new(),
        }
    }
}

fn normalized_skips(skip_services: &[String]) -> Vec<String> {
    skip_services
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_skipped(skips: &[String], reconciler: &dyn Reconciler) -> bool {
    skips.iter().any(|s| s == reconciler.service().skip_key())
}

/// Run one reconciler invocation on its own task so a panic becomes a
/// record instead of tearing the run down.
async fn run_shielded<F>(
    service: Service,
    target: String,
    channel: String,
    fut: F,
) -> Vec<SyncRecord>
where
    F: std::future::Future<Output = Vec<SyncRecord>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(service = service.as_str(), error = %e, "reconciler task failed");
            vec![SyncRecord::failure(
                service,
                target,
                "",
                channel,
                Action::UnexpectedError,
                e.to_string(),
            )]
        }
    }
}

async fn sync_entity(
    entity: Entity,
    chat: Arc<dyn ChatClient>,
    team_id: String,
    ctx: Arc<SyncContext>,
    reconcilers: Arc<Vec<Arc<dyn Reconciler>>>,
    skips: Arc<Vec<String>>,
) -> Vec<SyncRecord> {
    let Some(policy) = ctx.matrix.policy(&entity.kind) else {
        return Vec::new();
    };

    tracing::info!(entity = %entity, "reconciling entity");
    let membership = match assemble_live(
        chat.as_ref(),
        &team_id,
        policy,
        &ctx.exclusions,
        &entity.base_name,
    )
    .await
    {
        Ok(membership) => membership,
        Err(e) => {
            return vec![SyncRecord::failure(
                Service::Orchestrator,
                entity.to_string(),
                "",
                "",
                Action::FailedToFetchChannelMembers,
                e.to_string(),
            )];
        }
    };

    let mut records: Vec<SyncRecord> = membership
        .no_email_usernames
        .iter()
        .map(|username| {
            SyncRecord::skipped(
                Service::Orchestrator,
                &membership.channel_label,
                username,
                &membership.channel_label,
                Action::SkippedNoEmail,
                "user has no email on the chat platform",
            )
        })
        .collect();

    for reconciler in reconcilers.iter() {
        if is_skipped(&skips, reconciler.as_ref()) {
            continue;
        }
        let reconciler = reconciler.clone();
        let entity = entity.clone();
        let membership: EntityMembership = membership.clone();
        let service = reconciler.service();
        let channel = membership.channel_label.clone();
        records.extend(
            run_shielded(service, entity.to_string(), channel, async move {
                reconciler.upsert_sync(&entity, &membership).await
            })
            .await,
        );
    }
    records
}

/// Additive synchronization across every configured service.
///
/// Returns `(false, [])` only on fatal preconditions: no chat client, no
/// team id, or the discovery source being unreachable. Per-record failures
/// never fail the run.
pub async fn orchestrate(
    clients: &Clients,
    matrix: Arc<PermissionsMatrix>,
    exclusions: Arc<ExclusionList>,
    team_id: &str,
    mode: SyncMode,
    skip_services: &[String],
    options: &RunOptions,
) -> (bool, Vec<SyncRecord>) {
    let skips = Arc::new(normalized_skips(skip_services));
    tracing::info!(?mode, skips = ?*skips, "starting group synchronization");

    let Some(chat) = clients.chat.clone() else {
        tracing::error!("chat client not provided to orchestrator, cannot proceed");
        return (false, Vec::new());
    };
    if team_id.is_empty() {
        tracing::error!("chat team id not provided to orchestrator, cannot proceed");
        return (false, Vec::new());
    }

    let ctx = Arc::new(SyncContext {
        matrix: matrix.clone(),
        exclusions,
        chat: chat.clone(),
    });
    let reconcilers = Arc::new(build_reconcilers(clients, &ctx));

    let mut entities: Vec<Entity> = Vec::new();
    let mut seen: BTreeSet<Entity> = BTreeSet::new();

    match mode {
        SyncMode::WithProvider => {
            let Some(provider) = clients.provider.clone() else {
                tracing::warn!("identity provider not configured, nothing to discover");
                return (true, Vec::new());
            };
            let groups = match provider.groups_with_users().await {
                Ok(groups) => groups,
                Err(e) => {
                    tracing::error!(error = %e, "could not enumerate identity-provider groups");
                    return (
                        true,
                        vec![SyncRecord::failure(
                            Service::Provider,
                            "",
                            "",
                            "",
                            Action::FailedToListGroups,
                            e.to_string(),
                        )],
                    );
                }
            };
            for group in groups {
                if let Some((entity, _)) = matrix.entity_for_provider_group(&group.name)
                    && seen.insert(entity.clone())
                {
                    tracing::debug!(entity = %entity, group = %group.name, "discovered entity");
                    entities.push(entity);
                }
            }
        }
        SyncMode::ChatToTools => {
            let channels = match chat.list_channels(team_id).await {
                Ok(channels) => channels,
                Err(e) => {
                    tracing::error!(error = %e, "could not enumerate chat channels");
                    return (false, Vec::new());
                }
            };
            for channel in channels {
                if let Some(entity) =
                    matrix.entity_for_channel(&channel.display_name, &channel.slug)
                    && seen.insert(entity.clone())
                {
                    tracing::debug!(
                        entity = %entity,
                        channel = %channel.display_name,
                        "discovered entity"
                    );
                    entities.push(entity);
                }
            }
        }
    }

    if entities.is_empty() {
        tracing::info!("no entities discovered, synchronization finished");
        return (true, Vec::new());
    }
    tracing::info!(count = entities.len(), "entities discovered");

    let cancel = options.cancel.clone();
    let team_id = team_id.to_string();
    let results: Vec<Vec<SyncRecord>> = futures::stream::iter(entities.into_iter().map(|entity| {
        let chat = chat.clone();
        let team_id = team_id.clone();
        let ctx = ctx.clone();
        let reconcilers = reconcilers.clone();
        let skips = skips.clone();
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                tracing::info!(entity = %entity, "cancelled before start, skipping");
                return Vec::new();
            }
            sync_entity(entity, chat, team_id, ctx, reconcilers, skips).await
        }
    }))
    .buffer_unordered(options.concurrency.max(1))
    .collect()
    .await;

    let records: Vec<SyncRecord> = results.into_iter().flatten().collect();
    tracing::info!(records = records.len(), "synchronization finished");
    (true, records)
}

/// Full convergence including removals.
///
/// Chat channel members are prefetched once for every channel that maps to
/// a configured entity kind; reconcilers work from that snapshot instead of
/// re-querying the chat platform per entity.
pub async fn differential_sync(
    clients: &Clients,
    matrix: Arc<PermissionsMatrix>,
    exclusions: Arc<ExclusionList>,
    team_id: &str,
    skip_services: &[String],
    options: &RunOptions,
) -> (bool, Vec<SyncRecord>) {
    let skips = Arc::new(normalized_skips(skip_services));
    tracing::info!(skips = ?*skips, "starting differential synchronization");

    let Some(chat) = clients.chat.clone() else {
        tracing::error!("chat client not provided to orchestrator, cannot proceed");
        return (false, Vec::new());
    };
    if team_id.is_empty() {
        tracing::error!("chat team id not provided to orchestrator, cannot proceed");
        return (false, Vec::new());
    }

    let ctx = Arc::new(SyncContext {
        matrix: matrix.clone(),
        exclusions,
        chat: chat.clone(),
    });
    let reconcilers = build_reconcilers(clients, &ctx);

    let mut records: Vec<SyncRecord> = Vec::new();

    tracing::info!("prefetching chat channel members");
    let channels = match chat.list_channels(team_id).await {
        Ok(channels) => channels,
        Err(e) => {
            tracing::error!(error = %e, "could not enumerate chat channels");
            return (false, Vec::new());
        }
    };
    let mut members = std::collections::HashMap::new();
    for channel in &channels {
        if matrix
            .entity_for_channel(&channel.display_name, &channel.slug)
            .is_none()
        {
            tracing::debug!(
                channel = %channel.display_name,
                "channel maps to no entity, member fetch skipped"
            );
            continue;
        }
        match chat.list_channel_members(&channel.id).await {
            Ok(users) => {
                members.insert(channel.id.clone(), users);
            }
            Err(e) => {
                records.push(SyncRecord::failure(
                    Service::Orchestrator,
                    &channel.display_name,
                    "",
                    &channel.display_name,
                    Action::FailedToFetchChannelMembers,
                    e.to_string(),
                ));
            }
        }
    }
    let snapshot = Arc::new(ChannelSnapshot::new(channels, members));

    for reconciler in &reconcilers {
        if is_skipped(&skips, reconciler.as_ref()) {
            tracing::info!(
                service = reconciler.service().as_str(),
                "service skipped by request"
            );
            continue;
        }
        if options.cancel.is_cancelled() {
            tracing::info!(
                service = reconciler.service().as_str(),
                "cancelled before start, skipping remaining services"
            );
            break;
        }
        let service = reconciler.service();
        let reconciler = reconciler.clone();
        let snapshot = snapshot.clone();
        records.extend(
            run_shielded(service, String::new(), String::new(), async move {
                reconciler.differential_sync(&snapshot).await
            })
            .await,
        );
    }

    tracing::info!(records = records.len(), "differential synchronization finished");
    (true, records)
}
