//! Assembly of the authoritative membership set for an entity.
//!
//! The set is derived from the entity's standard and admin chat channels:
//! keys are lowercased emails, admin-channel members dominate, excluded
//! usernames never enter the set (their emails are tracked separately so
//! differential passes can preserve access they already hold), and users
//! without an email are dropped with a skip record upstream.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::clients::{ChatChannel, ChatClient, ChatUser};
use crate::config::{ExclusionList, KindPolicy};
use crate::error::ApiError;
use crate::pattern;

/// One authorized user, as the chat platform describes them.
#[derive(Debug, Clone)]
pub struct Member {
    /// Lowercased; never empty.
    pub email: String,
    pub username: String,
    pub chat_user_id: String,
    pub is_admin_channel_member: bool,
}

/// The authoritative membership for one entity, plus the bookkeeping the
/// reconcilers need around it.
#[derive(Debug, Clone, Default)]
pub struct EntityMembership {
    /// Standard ∪ admin channel members, keyed by lowercased email.
    pub members: BTreeMap<String, Member>,
    /// Emails of excluded channel members. Not part of the authoritative
    /// set, but removal passes must leave these users untouched.
    pub excluded_emails: BTreeSet<String>,
    /// Usernames of channel members with no email on file.
    pub no_email_usernames: Vec<String>,
    /// Display name of the standard channel, for record context.
    pub channel_label: String,
}

impl EntityMembership {
    /// Members of the admin channel only.
    pub fn admin_members(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| m.is_admin_channel_member)
    }

    pub fn contains_email(&self, email: &str) -> bool {
        self.members.contains_key(email)
    }

    /// Whether a downstream member with this email must survive a removal
    /// pass: either authorized, or excluded and therefore untouchable.
    pub fn is_preserved(&self, email: &str) -> bool {
        self.members.contains_key(email) || self.excluded_emails.contains(email)
    }
}

fn fold_channel_users(
    membership: &mut EntityMembership,
    users: &[ChatUser],
    exclusions: &ExclusionList,
    is_admin_channel: bool,
) {
    for user in users {
        let email = user.email.to_lowercase();
        if exclusions.contains(&user.username) {
            if !email.is_empty() {
                membership.excluded_emails.insert(email);
            }
            continue;
        }
        if email.is_empty() {
            if !membership
                .no_email_usernames
                .iter()
                .any(|u| u == &user.username)
            {
                membership.no_email_usernames.push(user.username.clone());
            }
            continue;
        }
        membership
            .members
            .entry(email.clone())
            .and_modify(|m| {
                if is_admin_channel {
                    m.is_admin_channel_member = true;
                }
            })
            .or_insert(Member {
                email,
                username: user.username.clone(),
                chat_user_id: user.id.clone(),
                is_admin_channel_member: is_admin_channel,
            });
    }
}

/// Build the membership set from already-fetched channel member lists.
pub fn build_membership(
    std_users: &[ChatUser],
    admin_users: &[ChatUser],
    exclusions: &ExclusionList,
    channel_label: String,
) -> EntityMembership {
    let mut membership = EntityMembership {
        channel_label,
        ..EntityMembership::default()
    };
    fold_channel_users(&mut membership, std_users, exclusions, false);
    fold_channel_users(&mut membership, admin_users, exclusions, true);
    membership
}

/// Assemble an entity's membership by querying the chat platform directly
/// (upsert path).
pub async fn assemble_live(
    chat: &dyn ChatClient,
    team_id: &str,
    policy: &KindPolicy,
    exclusions: &ExclusionList,
    base_name: &str,
) -> Result<EntityMembership, ApiError> {
    let std_name = pattern::render(&policy.standard.channel_name_pattern, base_name);
    let std_channel = chat
        .get_channel_by_slug(team_id, &pattern::slugify(&std_name))
        .await?;
    let (std_users, channel_label) = match &std_channel {
        Some(channel) => (
            chat.list_channel_members(&channel.id).await?,
            channel.display_name.clone(),
        ),
        None => (Vec::new(), std_name.clone()),
    };

    let mut admin_users = Vec::new();
    if let Some(admin) = &policy.admin {
        let admin_name = pattern::render(&admin.channel_name_pattern, base_name);
        if let Some(channel) = chat
            .get_channel_by_slug(team_id, &pattern::slugify(&admin_name))
            .await?
        {
            admin_users = chat.list_channel_members(&channel.id).await?;
        }
    }

    Ok(build_membership(
        &std_users,
        &admin_users,
        exclusions,
        channel_label,
    ))
}

/// Channels and their members, prefetched once per differential run so
/// reconcilers do not re-query the chat platform per entity.
#[derive(Debug, Clone, Default)]
pub struct ChannelSnapshot {
    channels: Vec<ChatChannel>,
    members: HashMap<String, Vec<ChatUser>>,
}

impl ChannelSnapshot {
    pub fn new(channels: Vec<ChatChannel>, members: HashMap<String, Vec<ChatUser>>) -> Self {
        Self { channels, members }
    }

    pub fn channels(&self) -> &[ChatChannel] {
        &self.channels
    }

    pub fn channel_by_slug(&self, slug: &str) -> Option<&ChatChannel> {
        self.channels.iter().find(|c| c.slug == slug)
    }

    pub fn members_of(&self, channel_id: &str) -> &[ChatUser] {
        self.members
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Assemble an entity's membership from a prefetched snapshot
/// (differential path).
pub fn assemble_from_snapshot(
    snapshot: &ChannelSnapshot,
    policy: &KindPolicy,
    exclusions: &ExclusionList,
    base_name: &str,
) -> EntityMembership {
    let std_name = pattern::render(&policy.standard.channel_name_pattern, base_name);
    let std_channel = snapshot.channel_by_slug(&pattern::slugify(&std_name));
    let std_users = std_channel
        .map(|c| snapshot.members_of(&c.id).to_vec())
        .unwrap_or_default();
    let channel_label = std_channel
        .map(|c| c.display_name.clone())
        .unwrap_or(std_name);

    let mut admin_users = Vec::new();
    if let Some(admin) = &policy.admin {
        let admin_name = pattern::render(&admin.channel_name_pattern, base_name);
        if let Some(channel) = snapshot.channel_by_slug(&pattern::slugify(&admin_name)) {
            admin_users = snapshot.members_of(&channel.id).to_vec();
        }
    }

    let mut membership = build_membership(&std_users, &admin_users, exclusions, channel_label);
    // An excluded user may have left this entity's channels while still
    // holding access downstream; removal passes must preserve them wherever
    // the snapshot can still name their email.
    for users in snapshot.members.values() {
        for user in users {
            if exclusions.contains(&user.username) && !user.email.is_empty() {
                membership.excluded_emails.insert(user.email.to_lowercase());
            }
        }
    }
    membership
}
