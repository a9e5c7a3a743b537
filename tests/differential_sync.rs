//! End-to-end differential scenarios: convergence with removals, exclusion
//! preservation, and failure containment.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use cohort::config::ExclusionList;
use cohort::sync::record::{SyncRecord, SyncStatus};
use cohort::sync::{differential_sync, CancelFlag, RunOptions, Service};

use common::*;

async fn run(
    world: &World,
    exclusions: ExclusionList,
    skip: &[String],
) -> (bool, Vec<SyncRecord>) {
    differential_sync(
        &world.clients(),
        Arc::new(test_matrix()),
        Arc::new(exclusions),
        TEAM,
        skip,
        &RunOptions::default(),
    )
    .await
}

fn orion_chat() -> FakeChat {
    FakeChat::default().with_channel(
        "ch-1",
        "project-orion",
        "Project Orion",
        vec![chat_user("u-alice", "alice", "a@x")],
    )
}

#[tokio::test]
async fn unauthorized_group_member_is_removed() {
    let world = World {
        chat: Some(Arc::new(orion_chat())),
        provider: Some(Arc::new(
            FakeProvider::default()
                .with_user("11", "alice", "a@x")
                .with_user("33", "carol", "c@x")
                .with_group("g1", "proj_Orion", &["11", "33"]),
        )),
        ..World::default()
    };

    let (ok, records) = run(&world, ExclusionList::default(), &[]).await;
    assert!(ok);

    let removed = records
        .iter()
        .find(|r| r.action.tag() == "USER_REMOVED_FROM_GROUP")
        .expect("removal record");
    assert_eq!(removed.subject, "c@x");
    assert_eq!(removed.target, "proj_Orion");
    assert_eq!(removed.status, SyncStatus::Success);

    let already = records
        .iter()
        .find(|r| r.action.tag() == "USER_ALREADY_IN_GROUP")
        .expect("already record");
    assert_eq!(already.subject, "a@x");

    let provider = world.provider.as_ref().unwrap();
    assert_eq!(
        provider.group_member_ids("proj_Orion"),
        ["11"].iter().map(|s| s.to_string()).collect()
    );
}

#[tokio::test]
async fn excluded_members_survive_every_removal_pass() {
    // xena is excluded. She still sits in the group, the collection, and the
    // base, but in no channel that authorizes her; she must be untouched.
    let chat = FakeChat::default()
        .with_channel(
            "ch-1",
            "project-orion",
            "Project Orion",
            vec![chat_user("u-alice", "alice", "a@x")],
        )
        .with_channel(
            "ch-2",
            "project-vega",
            "Project Vega",
            vec![chat_user("u-xena", "xena", "x@x")],
        );
    let world = World {
        chat: Some(Arc::new(chat)),
        provider: Some(Arc::new(
            FakeProvider::default()
                .with_user("11", "alice", "a@x")
                .with_user("44", "xena", "x@x")
                .with_group("g1", "proj_Orion", &["11", "44"]),
        )),
        outline: Some(Arc::new(
            FakeOutline::default()
                .with_user("a@x", "ou-a")
                .with_user("x@x", "ou-x")
                .with_collection("coll-1", "Orion", &[("ou-a", "read"), ("ou-x", "read")]),
        )),
        nocodb: Some(Arc::new(FakeNocodb::default().with_base(
            "base-1",
            "nocodb_Orion",
            &[("nu-a", "a@x", "viewer"), ("nu-x", "x@x", "viewer")],
        ))),
        ..World::default()
    };

    let exclusions = ExclusionList::from_usernames(["xena"]);
    let (ok, records) = run(&world, exclusions, &[]).await;
    assert!(ok);

    // P1: no record of any kind mentions the excluded user.
    assert!(records.iter().all(|r| r.subject != "x@x"));

    let provider = world.provider.as_ref().unwrap();
    assert!(provider.group_member_ids("proj_Orion").contains("44"));
    let outline = world.outline.as_ref().unwrap();
    assert_eq!(outline.permission_of("coll-1", "ou-x").as_deref(), Some("read"));
    let nocodb = world.nocodb.as_ref().unwrap();
    assert_eq!(nocodb.role_of("base-1", "x@x").as_deref(), Some("viewer"));
}

#[tokio::test]
async fn collection_membership_converges_to_the_channel() {
    let world = World {
        chat: Some(Arc::new(orion_chat())),
        outline: Some(Arc::new(
            FakeOutline::default()
                .with_user("a@x", "ou-a")
                .with_user("gone@x", "ou-gone")
                .with_collection("coll-1", "Orion", &[("ou-gone", "read_write")]),
        )),
        ..World::default()
    };

    let (ok, records) = run(&world, ExclusionList::default(), &[]).await;
    assert!(ok);

    assert!(records.iter().any(|r| {
        r.action.tag() == "USER_REMOVED_FROM_COLLECTION" && r.subject == "gone@x"
    }));
    assert!(records.iter().any(|r| {
        r.action.tag().starts_with("USER_ADDED_TO_COLLECTION_WITH_READ_ACCESS")
            && r.subject == "a@x"
    }));

    // P4: the collection now holds exactly the authoritative member.
    let outline = world.outline.as_ref().unwrap();
    assert_eq!(
        outline.member_ids("coll-1"),
        ["ou-a"].iter().map(|s| s.to_string()).collect()
    );
}

#[tokio::test]
async fn database_removal_is_a_role_downgrade() {
    let world = World {
        chat: Some(Arc::new(orion_chat())),
        nocodb: Some(Arc::new(FakeNocodb::default().with_base(
            "base-1",
            "nocodb_Orion",
            &[("nu-a", "a@x", "viewer"), ("nu-old", "old@x", "editor")],
        ))),
        ..World::default()
    };

    let (ok, records) = run(&world, ExclusionList::default(), &[]).await;
    assert!(ok);

    let downgrade = records
        .iter()
        .find(|r| r.subject == "old@x")
        .expect("downgrade record");
    assert_eq!(downgrade.action.tag(), "USER_ROLE_UPDATED_TO_NO_ACCESS");
    assert_eq!(downgrade.status, SyncStatus::Success);

    let nocodb = world.nocodb.as_ref().unwrap();
    assert_eq!(nocodb.role_of("base-1", "old@x").as_deref(), Some("no-access"));
    assert_eq!(nocodb.role_of("base-1", "a@x").as_deref(), Some("viewer"));

    // A second pass leaves the downgraded user alone.
    let (_, second) = run(&world, ExclusionList::default(), &[]).await;
    assert!(second.iter().all(|r| r.subject != "old@x"));
}

#[tokio::test]
async fn vault_membership_is_rewritten_wholesale() {
    let vault = FakeVaultwarden::default()
        .with_collection("vc-1", "Shared - Orion")
        .with_collection_user("vc-1", "m-alice")
        .with_collection_user("vc-1", "m-old")
        .with_member("m-alice", "alice@x")
        .with_member("m-old", "old@x")
        .already("alice@x");
    let world = World {
        chat: Some(Arc::new(FakeChat::default().with_channel(
            "ch-1",
            "project-orion",
            "Project Orion",
            vec![chat_user("u-alice", "alice", "alice@x")],
        ))),
        vaultwarden: Some(Arc::new(vault)),
        ..World::default()
    };

    let (ok, records) = run(&world, ExclusionList::default(), &[]).await;
    assert!(ok);

    let removed = records
        .iter()
        .find(|r| r.action.tag() == "USER_REMOVED_FROM_VAULT_COLLECTION")
        .expect("vault removal record");
    assert_eq!(removed.subject, "old@x");
    assert!(records
        .iter()
        .any(|r| r.action.tag() == "USER_ALREADY_INVITED" && r.subject == "alice@x"));

    // P4: only the authorized member remains in the ownership record.
    let vault = world.vaultwarden.as_ref().unwrap();
    assert_eq!(
        vault.collection_user_ids("vc-1"),
        ["m-alice"].iter().map(|s| s.to_string()).collect()
    );
}

#[tokio::test]
async fn contact_lists_remain_additive_in_differential_mode() {
    let brevo = FakeBrevo::default().with_list(5, "mm_Orion");
    brevo
        .contacts
        .lock()
        .unwrap()
        .entry(5)
        .or_default()
        .insert("stale@x".to_string());
    let world = World {
        chat: Some(Arc::new(orion_chat())),
        brevo: Some(Arc::new(brevo)),
        ..World::default()
    };

    let (ok, records) = run(&world, ExclusionList::default(), &[]).await;
    assert!(ok);

    assert!(records
        .iter()
        .any(|r| r.action.tag() == "USER_ENSURED_IN_LIST" && r.subject == "a@x"));
    // Nothing is ever removed from a contact list.
    let brevo = world.brevo.as_ref().unwrap();
    assert!(brevo.contacts_of(5).contains("stale@x"));
    assert!(brevo.contacts_of(5).contains("a@x"));
}

#[tokio::test]
async fn reconciler_panic_becomes_one_failure_record() {
    let provider = FakeProvider {
        panic_on_list: true,
        ..FakeProvider::default()
    };
    let world = World {
        chat: Some(Arc::new(orion_chat())),
        provider: Some(Arc::new(provider)),
        brevo: Some(Arc::new(FakeBrevo::default())),
        ..World::default()
    };

    let (ok, records) = run(&world, ExclusionList::default(), &[]).await;
    assert!(ok, "a reconciler panic must not fail the run");

    let failure = records
        .iter()
        .find(|r| r.action.tag() == "UNEXPECTED_ERROR")
        .expect("synthetic failure record");
    assert_eq!(failure.service, Service::Provider);
    assert_eq!(failure.status, SyncStatus::Failure);

    // Later services still ran.
    assert!(records
        .iter()
        .any(|r| r.service == Service::Brevo && r.action.tag() == "USER_ENSURED_IN_LIST"));
}

#[tokio::test]
async fn cancellation_skips_services_that_have_not_started() {
    let world = World {
        chat: Some(Arc::new(orion_chat())),
        provider: Some(Arc::new(
            FakeProvider::default()
                .with_user("11", "alice", "a@x")
                .with_group("g1", "proj_Orion", &["11"]),
        )),
        ..World::default()
    };

    let options = RunOptions {
        concurrency: 4,
        cancel: CancelFlag::new(),
    };
    options.cancel.cancel();
    let (ok, records) = differential_sync(
        &world.clients(),
        Arc::new(test_matrix()),
        Arc::new(ExclusionList::default()),
        TEAM,
        &[],
        &options,
    )
    .await;
    assert!(ok);
    assert!(records.iter().all(|r| r.service != Service::Provider));
}

#[tokio::test]
async fn groups_mapping_to_no_entity_are_ignored() {
    let world = World {
        chat: Some(Arc::new(orion_chat())),
        provider: Some(Arc::new(
            FakeProvider::default()
                .with_user("55", "zed", "z@x")
                .with_group("g9", "unrelated-group", &["55"]),
        )),
        ..World::default()
    };

    let (ok, records) = run(&world, ExclusionList::default(), &[]).await;
    assert!(ok);

    // The group name matches no configured pattern, so its membership is
    // not the engine's business.
    assert!(records.iter().all(|r| r.subject != "z@x"));
    let provider = world.provider.as_ref().unwrap();
    assert!(provider.group_member_ids("unrelated-group").contains("55"));
}
