//! In-memory fakes for every capability interface, plus a small world
//! builder that wires them into a `Clients` registry for orchestrator runs.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::SecretString;

use cohort::clients::{
    Base, BaseUser, BrevoClient, ChatChannel, ChatClient, ChatUser, Clients, Collection,
    CollectionMember, ContactList, NocodbClient, OutlineClient, OutlineUser, ProviderClient,
    ProviderGroup, ProviderUser, VaultCollection, VaultCollectionDetails, VaultCollectionUser,
    VaultInviteOutcome, VaultMember, VaultToken, VaultwardenClient,
};
use cohort::config::matrix::{BaseRole, DocAccess};
use cohort::config::PermissionsMatrix;
use cohort::error::ApiError;

pub const TEAM: &str = "team-1";

pub const MATRIX_YAML: &str = r#"
permissions:
  PROJECT:
    standard:
      channel_name_pattern: "Project {base_name}"
      channel_type: "O"
      provider_group_pattern: "proj_{base_name}"
    admin:
      channel_name_pattern: "Project {base_name} Admin"
      channel_type: "P"
      provider_group_pattern: "proj_{base_name}_admin"
    outline:
      collection_name_pattern: "{base_name}"
      default_access: read
      admin_access: read_write
    brevo:
      list_name_pattern: "mm_{base_name}"
    nocodb:
      base_title_pattern: "nocodb_{base_name}"
      default_access: viewer
      admin_access: owner
    vaultwarden:
      collection_name_pattern: "Shared - {base_name}"
"#;

pub fn test_matrix() -> PermissionsMatrix {
    PermissionsMatrix::from_yaml(MATRIX_YAML).expect("test matrix parses")
}

pub fn chat_user(id: &str, username: &str, email: &str) -> ChatUser {
    ChatUser {
        id: id.to_string(),
        username: username.to_string(),
        email: email.to_string(),
    }
}

fn api_fail(message: &str) -> ApiError {
    ApiError::Decode {
        service: "fake",
        message: message.to_string(),
    }
}

// ---------------------------------------------------------------- chat

#[derive(Default)]
pub struct FakeChat {
    pub channels: Vec<ChatChannel>,
    pub members: HashMap<String, Vec<ChatUser>>,
    pub dms: Mutex<Vec<(String, String)>>,
}

impl FakeChat {
    pub fn with_channel(mut self, id: &str, slug: &str, display: &str, users: Vec<ChatUser>) -> Self {
        self.channels.push(ChatChannel {
            id: id.to_string(),
            slug: slug.to_string(),
            display_name: display.to_string(),
        });
        self.members.insert(id.to_string(), users);
        self
    }

    pub fn dm_count(&self) -> usize {
        self.dms.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn list_channels(&self, _team_id: &str) -> Result<Vec<ChatChannel>, ApiError> {
        Ok(self.channels.clone())
    }

    async fn get_channel_by_slug(
        &self,
        _team_id: &str,
        slug: &str,
    ) -> Result<Option<ChatChannel>, ApiError> {
        Ok(self.channels.iter().find(|c| c.slug == slug).cloned())
    }

    async fn list_channel_members(&self, channel_id: &str) -> Result<Vec<ChatUser>, ApiError> {
        Ok(self.members.get(channel_id).cloned().unwrap_or_default())
    }

    async fn user_roles(&self, _user_id: &str) -> Result<Vec<String>, ApiError> {
        Ok(vec!["system_user".to_string()])
    }

    async fn send_direct_message(&self, user_id: &str, text: &str) -> Result<(), ApiError> {
        self.dms
            .lock()
            .unwrap()
            .push((user_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn bot_user_id(&self) -> Result<String, ApiError> {
        Ok("bot-0".to_string())
    }
}

// ------------------------------------------------------------ provider

#[derive(Default)]
pub struct FakeProvider {
    pub groups: Mutex<Vec<ProviderGroup>>,
    /// email → native id directory.
    pub directory: HashMap<String, String>,
    /// native id → full user record, for materializing group adds.
    pub catalog: HashMap<String, ProviderUser>,
    pub panic_on_list: bool,
    pub next_group: AtomicUsize,
}

impl FakeProvider {
    pub fn with_user(mut self, id: &str, username: &str, email: &str) -> Self {
        self.directory.insert(email.to_string(), id.to_string());
        self.catalog.insert(
            id.to_string(),
            ProviderUser {
                id: id.to_string(),
                username: username.to_string(),
                email: email.to_string(),
            },
        );
        self
    }

    pub fn with_group(self, id: &str, name: &str, member_ids: &[&str]) -> Self {
        let users = member_ids
            .iter()
            .map(|uid| {
                self.catalog
                    .get(*uid)
                    .cloned()
                    .unwrap_or_else(|| ProviderUser {
                        id: uid.to_string(),
                        username: format!("user-{uid}"),
                        email: String::new(),
                    })
            })
            .collect();
        self.groups.lock().unwrap().push(ProviderGroup {
            id: id.to_string(),
            name: name.to_string(),
            users,
        });
        self
    }

    pub fn group_member_ids(&self, name: &str) -> BTreeSet<String> {
        self.groups
            .lock()
            .unwrap()
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.users.iter().map(|u| u.id.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn groups_with_users(&self) -> Result<Vec<ProviderGroup>, ApiError> {
        if self.panic_on_list {
            panic!("provider exploded");
        }
        Ok(self.groups.lock().unwrap().clone())
    }

    async fn users_by_email(&self) -> Result<HashMap<String, String>, ApiError> {
        Ok(self.directory.clone())
    }

    async fn create_group(&self, name: &str) -> Result<ProviderGroup, ApiError> {
        let id = format!("g-new-{}", self.next_group.fetch_add(1, Ordering::SeqCst));
        let group = ProviderGroup {
            id: id.clone(),
            name: name.to_string(),
            users: Vec::new(),
        };
        self.groups.lock().unwrap().push(group.clone());
        Ok(group)
    }

    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<(), ApiError> {
        let mut groups = self.groups.lock().unwrap();
        let group = groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| api_fail("no such group"))?;
        if !group.users.iter().any(|u| u.id == user_id) {
            let user = self
                .catalog
                .get(user_id)
                .cloned()
                .unwrap_or_else(|| ProviderUser {
                    id: user_id.to_string(),
                    username: format!("user-{user_id}"),
                    email: String::new(),
                });
            group.users.push(user);
        }
        Ok(())
    }

    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<(), ApiError> {
        let mut groups = self.groups.lock().unwrap();
        let group = groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| api_fail("no such group"))?;
        group.users.retain(|u| u.id != user_id);
        Ok(())
    }
}

// ------------------------------------------------------------- outline

#[derive(Default)]
pub struct FakeOutline {
    pub collections: Mutex<Vec<Collection>>,
    /// collection id → user id → permission.
    pub memberships: Mutex<HashMap<String, HashMap<String, String>>>,
    /// email → native user id.
    pub users: HashMap<String, String>,
    pub has_urls: bool,
    pub next_collection: AtomicUsize,
}

impl FakeOutline {
    pub fn with_user(mut self, email: &str, id: &str) -> Self {
        self.users.insert(email.to_string(), id.to_string());
        self
    }

    pub fn with_collection(self, id: &str, name: &str, members: &[(&str, &str)]) -> Self {
        self.collections.lock().unwrap().push(Collection {
            id: id.to_string(),
            name: name.to_string(),
            url_id: Some(format!("url-{id}")),
        });
        self.memberships.lock().unwrap().insert(
            id.to_string(),
            members
                .iter()
                .map(|(uid, perm)| (uid.to_string(), perm.to_string()))
                .collect(),
        );
        self
    }

    pub fn permission_of(&self, collection_id: &str, user_id: &str) -> Option<String> {
        self.memberships
            .lock()
            .unwrap()
            .get(collection_id)
            .and_then(|m| m.get(user_id).cloned())
    }

    pub fn member_ids(&self, collection_id: &str) -> BTreeSet<String> {
        self.memberships
            .lock()
            .unwrap()
            .get(collection_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OutlineClient for FakeOutline {
    async fn list_collections(&self) -> Result<Vec<Collection>, ApiError> {
        Ok(self.collections.lock().unwrap().clone())
    }

    async fn create_collection(&self, name: &str) -> Result<Collection, ApiError> {
        let id = format!("coll-new-{}", self.next_collection.fetch_add(1, Ordering::SeqCst));
        let collection = Collection {
            id: id.clone(),
            name: name.to_string(),
            url_id: Some(format!("url-{id}")),
        };
        self.collections.lock().unwrap().push(collection.clone());
        self.memberships.lock().unwrap().insert(id, HashMap::new());
        Ok(collection)
    }

    async fn collection_members(
        &self,
        collection_id: &str,
    ) -> Result<Vec<CollectionMember>, ApiError> {
        let memberships = self.memberships.lock().unwrap();
        let id_to_email: HashMap<&String, &String> =
            self.users.iter().map(|(email, id)| (id, email)).collect();
        Ok(memberships
            .get(collection_id)
            .map(|members| {
                members
                    .iter()
                    .map(|(uid, perm)| CollectionMember {
                        user_id: uid.clone(),
                        email: id_to_email
                            .get(uid)
                            .map(|e| e.to_string())
                            .unwrap_or_default(),
                        permission: perm.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_user_to_collection(
        &self,
        collection_id: &str,
        user_id: &str,
        permission: DocAccess,
    ) -> Result<(), ApiError> {
        self.memberships
            .lock()
            .unwrap()
            .entry(collection_id.to_string())
            .or_default()
            .insert(user_id.to_string(), permission.as_str().to_string());
        Ok(())
    }

    async fn remove_user_from_collection(
        &self,
        collection_id: &str,
        user_id: &str,
    ) -> Result<(), ApiError> {
        if let Some(members) = self.memberships.lock().unwrap().get_mut(collection_id) {
            members.remove(user_id);
        }
        Ok(())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<OutlineUser>, ApiError> {
        Ok(self.users.get(email).map(|id| OutlineUser {
            id: id.clone(),
            email: email.to_string(),
        }))
    }

    fn collection_url(&self, collection: &Collection) -> Option<String> {
        if !self.has_urls {
            return None;
        }
        collection
            .url_id
            .as_ref()
            .map(|url_id| format!("https://docs.example/collection/{url_id}"))
    }
}

// --------------------------------------------------------------- brevo

#[derive(Default)]
pub struct FakeBrevo {
    pub lists: Mutex<Vec<ContactList>>,
    pub folders: HashMap<String, i64>,
    /// list id → emails.
    pub contacts: Mutex<HashMap<i64, BTreeSet<String>>>,
    pub created_folder_ids: Mutex<Vec<i64>>,
    pub next_list: AtomicI64,
}

impl FakeBrevo {
    pub fn with_folder(mut self, name: &str, id: i64) -> Self {
        self.folders.insert(name.to_string(), id);
        self
    }

    pub fn with_list(self, id: i64, name: &str) -> Self {
        self.lists.lock().unwrap().push(ContactList {
            id,
            name: name.to_string(),
        });
        self
    }

    pub fn contacts_of(&self, list_id: i64) -> BTreeSet<String> {
        self.contacts
            .lock()
            .unwrap()
            .get(&list_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrevoClient for FakeBrevo {
    async fn find_list(&self, name: &str) -> Result<Option<ContactList>, ApiError> {
        Ok(self
            .lists
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.name == name)
            .cloned())
    }

    async fn create_list(&self, name: &str, folder_id: i64) -> Result<ContactList, ApiError> {
        let id = 100 + self.next_list.fetch_add(1, Ordering::SeqCst);
        let list = ContactList {
            id,
            name: name.to_string(),
        };
        self.lists.lock().unwrap().push(list.clone());
        self.created_folder_ids.lock().unwrap().push(folder_id);
        Ok(list)
    }

    async fn folder_id_by_name(&self, name: &str) -> Result<Option<i64>, ApiError> {
        Ok(self.folders.get(name).copied())
    }

    async fn upsert_contact(&self, email: &str, list_id: i64) -> Result<(), ApiError> {
        self.contacts
            .lock()
            .unwrap()
            .entry(list_id)
            .or_default()
            .insert(email.to_string());
        Ok(())
    }
}

// -------------------------------------------------------------- nocodb

#[derive(Default)]
pub struct FakeNocodb {
    pub bases: Vec<Base>,
    /// base id → users.
    pub users: Mutex<HashMap<String, Vec<BaseUser>>>,
    pub has_urls: bool,
    pub next_user: AtomicUsize,
}

impl FakeNocodb {
    pub fn with_base(mut self, id: &str, title: &str, users: &[(&str, &str, &str)]) -> Self {
        self.bases.push(Base {
            id: id.to_string(),
            title: title.to_string(),
        });
        self.users.lock().unwrap().insert(
            id.to_string(),
            users
                .iter()
                .map(|(uid, email, role)| BaseUser {
                    id: uid.to_string(),
                    email: email.to_string(),
                    role: role.to_string(),
                })
                .collect(),
        );
        self
    }

    pub fn role_of(&self, base_id: &str, email: &str) -> Option<String> {
        self.users
            .lock()
            .unwrap()
            .get(base_id)
            .and_then(|users| users.iter().find(|u| u.email == email))
            .map(|u| u.role.clone())
    }
}

#[async_trait]
impl NocodbClient for FakeNocodb {
    async fn list_bases(&self) -> Result<Vec<Base>, ApiError> {
        Ok(self.bases.clone())
    }

    async fn base_by_title(&self, title: &str) -> Result<Option<Base>, ApiError> {
        Ok(self.bases.iter().find(|b| b.title == title).cloned())
    }

    async fn base_users(&self, base_id: &str) -> Result<Vec<BaseUser>, ApiError> {
        Ok(self.users.lock().unwrap().get(base_id).cloned().unwrap_or_default())
    }

    async fn invite_user(
        &self,
        base_id: &str,
        email: &str,
        role: BaseRole,
    ) -> Result<(), ApiError> {
        let id = format!("nu-{}", self.next_user.fetch_add(1, Ordering::SeqCst));
        self.users
            .lock()
            .unwrap()
            .entry(base_id.to_string())
            .or_default()
            .push(BaseUser {
                id,
                email: email.to_string(),
                role: role.as_str().to_string(),
            });
        Ok(())
    }

    async fn update_user_role(
        &self,
        base_id: &str,
        user_id: &str,
        role: BaseRole,
    ) -> Result<(), ApiError> {
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(base_id)
            .and_then(|list| list.iter_mut().find(|u| u.id == user_id))
            .ok_or_else(|| api_fail("no such base user"))?;
        user.role = role.as_str().to_string();
        Ok(())
    }

    fn base_url(&self, base_id: &str) -> Option<String> {
        self.has_urls
            .then(|| format!("https://grid.example/#/nc/{base_id}/dashboard"))
    }
}

// ---------------------------------------------------------- vaultwarden

pub const ORG: &str = "org-1";

#[derive(Default)]
pub struct FakeVaultwarden {
    pub collections: Vec<VaultCollection>,
    /// Emails whose invite the store reports as already handled.
    pub already_invited: BTreeSet<String>,
    /// collection id → invited emails (new invitations land here).
    pub invited: Mutex<HashMap<String, BTreeSet<String>>>,
    pub details: Mutex<HashMap<String, VaultCollectionDetails>>,
    pub members: Vec<VaultMember>,
    pub token_requests: AtomicUsize,
    /// When set, the next token-bearing call fails with a 401 once.
    pub fail_once_with_401: AtomicBool,
    pub has_url: bool,
}

impl FakeVaultwarden {
    pub fn with_collection(mut self, id: &str, name: &str) -> Self {
        self.collections.push(VaultCollection {
            id: id.to_string(),
            name: name.to_string(),
            org_id: ORG.to_string(),
        });
        self.details.lock().unwrap().insert(
            id.to_string(),
            VaultCollectionDetails {
                id: id.to_string(),
                name: name.to_string(),
                external_id: None,
                users: Vec::new(),
                groups: Vec::new(),
            },
        );
        self
    }

    pub fn with_collection_user(self, collection_id: &str, member_id: &str) -> Self {
        self.details
            .lock()
            .unwrap()
            .get_mut(collection_id)
            .expect("collection exists")
            .users
            .push(VaultCollectionUser {
                id: member_id.to_string(),
                read_only: true,
                hide_passwords: false,
                manage: false,
            });
        self
    }

    pub fn with_member(mut self, id: &str, email: &str) -> Self {
        self.members.push(VaultMember {
            id: id.to_string(),
            email: email.to_string(),
        });
        self
    }

    pub fn already(mut self, email: &str) -> Self {
        self.already_invited.insert(email.to_string());
        self
    }

    pub fn invited_to(&self, collection_id: &str) -> BTreeSet<String> {
        self.invited
            .lock()
            .unwrap()
            .get(collection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn collection_user_ids(&self, collection_id: &str) -> BTreeSet<String> {
        self.details
            .lock()
            .unwrap()
            .get(collection_id)
            .map(|d| d.users.iter().map(|u| u.id.clone()).collect())
            .unwrap_or_default()
    }

    fn maybe_401(&self) -> Result<(), ApiError> {
        if self.fail_once_with_401.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Status {
                service: "vaultwarden",
                status: 401,
                body: "token expired".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VaultwardenClient for FakeVaultwarden {
    async fn request_token(&self) -> Result<VaultToken, ApiError> {
        let n = self.token_requests.fetch_add(1, Ordering::SeqCst);
        Ok(VaultToken {
            access_token: SecretString::from(format!("token-{n}")),
            expires_in_secs: 3600,
        })
    }

    async fn list_collections(&self) -> Result<Vec<VaultCollection>, ApiError> {
        Ok(self.collections.clone())
    }

    async fn invite_user(
        &self,
        collection_id: &str,
        _org_id: &str,
        email: &str,
        _token: &SecretString,
    ) -> Result<VaultInviteOutcome, ApiError> {
        self.maybe_401()?;
        if self.already_invited.contains(email)
            || self.invited_to(collection_id).contains(email)
        {
            return Ok(VaultInviteOutcome::AlreadyMember);
        }
        self.invited
            .lock()
            .unwrap()
            .entry(collection_id.to_string())
            .or_default()
            .insert(email.to_string());
        Ok(VaultInviteOutcome::Invited)
    }

    async fn collection_details(
        &self,
        collection_id: &str,
        _token: &SecretString,
    ) -> Result<VaultCollectionDetails, ApiError> {
        self.maybe_401()?;
        self.details
            .lock()
            .unwrap()
            .get(collection_id)
            .cloned()
            .ok_or_else(|| api_fail("no such collection"))
    }

    async fn put_collection_users(
        &self,
        details: &VaultCollectionDetails,
        _token: &SecretString,
    ) -> Result<(), ApiError> {
        self.maybe_401()?;
        self.details
            .lock()
            .unwrap()
            .insert(details.id.clone(), details.clone());
        Ok(())
    }

    async fn organization_members(
        &self,
        _token: &SecretString,
    ) -> Result<Vec<VaultMember>, ApiError> {
        self.maybe_401()?;
        Ok(self.members.clone())
    }

    fn organization_id(&self) -> &str {
        ORG
    }

    fn server_url(&self) -> Option<String> {
        self.has_url.then(|| "https://vault.example".to_string())
    }
}

// ---------------------------------------------------------------- world

/// Assembles a `Clients` registry from whichever fakes a test needs.
#[derive(Default)]
pub struct World {
    pub chat: Option<Arc<FakeChat>>,
    pub provider: Option<Arc<FakeProvider>>,
    pub outline: Option<Arc<FakeOutline>>,
    pub brevo: Option<Arc<FakeBrevo>>,
    pub nocodb: Option<Arc<FakeNocodb>>,
    pub vaultwarden: Option<Arc<FakeVaultwarden>>,
}

impl World {
    pub fn clients(&self) -> Clients {
        Clients {
            chat: self.chat.clone().map(|c| c as Arc<dyn ChatClient>),
            provider: self.provider.clone().map(|c| c as Arc<dyn ProviderClient>),
            outline: self.outline.clone().map(|c| c as Arc<dyn OutlineClient>),
            brevo: self.brevo.clone().map(|c| c as Arc<dyn BrevoClient>),
            nocodb: self.nocodb.clone().map(|c| c as Arc<dyn NocodbClient>),
            vaultwarden: self
                .vaultwarden
                .clone()
                .map(|c| c as Arc<dyn VaultwardenClient>),
        }
    }
}
