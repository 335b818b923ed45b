//! End-to-end profile flows over the in-memory tables.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use medprofile::adapters::memory::{MemoryTables, TableOp};
use medprofile::application::tables;
use medprofile::domain::{LinkStatus, MergeDepth, NewProfile, ProfileUpdate};
use medprofile::ports::{Clock, FixedClock, Row, TableError};
use medprofile::{MedProfileError, ProfileStore, StoreEvent};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn at(timestamp: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(timestamp)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

type Fixture = (
    Arc<MemoryTables>,
    Arc<FixedClock>,
    ProfileStore<MemoryTables, FixedClock>,
);

fn setup(rows: Vec<Value>) -> Fixture {
    let tables = Arc::new(MemoryTables::new());
    tables.seed(tables::PROFILES, rows.into_iter().map(object).collect::<Vec<Row>>());
    let clock = Arc::new(FixedClock::new(at("2026-03-01T10:15:30Z")));
    let store = ProfileStore::with_clock(Arc::clone(&tables), Arc::clone(&clock));
    (tables, clock, store)
}

#[tokio::test]
async fn test_created_profile_is_repaired_exactly_once() {
    let (tables, _, store) = setup(vec![]);

    let created = store
        .create_profile(NewProfile::for_patient("pt-1"))
        .await
        .expect("Should create");
    assert!(created.profile_data.medications.is_empty());

    let fetched = store
        .fetch_profile_by_id(&created.id)
        .await
        .expect("Should fetch");

    assert_eq!(fetched.profile_data.medications, Vec::<Value>::new());
    assert_eq!(tables.calls_of(TableOp::Update, tables::PROFILES).len(), 1);
    assert_eq!(
        tables.rows(tables::PROFILES)[0]["profile_data"],
        json!({"medications": []})
    );
}

#[tokio::test]
async fn test_link_expiry_is_exact() {
    let (tables, clock, store) = setup(vec![json!({
        "id": "p1",
        "patient_id": "pt-1",
        "profile_data": {"medications": []}
    })]);
    let issued_at = clock.now();

    let link = store.create_profile_link("p1", None).await.expect("Should issue");

    assert_eq!(link.expiry_time, issued_at + Duration::hours(24));
    assert_eq!(link.expiry_time, at("2026-03-02T10:15:30Z"));
    assert_eq!(
        tables.rows(tables::ACCESS_LINKS)[0]["expiry_time"],
        "2026-03-02T10:15:30.000Z"
    );
    assert_eq!(link.status_at(clock.now()), LinkStatus::Active);
    assert_eq!(
        link.status_at(issued_at + Duration::hours(24)),
        LinkStatus::Expired
    );
}

#[tokio::test]
async fn test_failed_write_keeps_current_profile() {
    let (tables, _, store) = setup(vec![json!({
        "id": "p1",
        "patient_id": "pt-1",
        "profile_data": {"medications": [{"drug": "A"}], "notes": "x"}
    })]);
    store.fetch_patient_profiles("pt-1").await.expect("Should list");
    let before = store.fetch_profile_by_id("p1").await.expect("Should fetch");
    let events = store.subscribe();

    tables.fail_next(
        TableOp::Update,
        tables::PROFILES,
        TableError::new("57014", "canceling statement due to statement timeout"),
    );
    let result = store
        .update_profile(
            "p1",
            ProfileUpdate::new().with_profile_data(object(json!({"notes": "y"}))),
        )
        .await;

    assert!(matches!(result, Err(MedProfileError::Remote(_))));
    let after = store.current().expect("Should still be current");
    assert!(Arc::ptr_eq(&before, &after));
    assert!(Arc::ptr_eq(&store.profiles()[0], &before));
    assert_eq!(
        store.error().as_deref(),
        Some("canceling statement due to statement timeout")
    );
    assert!(!store.loading());

    let seen: Vec<StoreEvent> = events.try_iter().collect();
    assert!(!seen.contains(&StoreEvent::CurrentChanged));
    assert_eq!(seen.last(), Some(&StoreEvent::Loading(false)));
}

#[tokio::test]
async fn test_merge_keeps_siblings_and_medications() {
    let (tables, _, store) = setup(vec![json!({
        "id": "p1",
        "patient_id": "pt-1",
        "profile_data": {"medications": ["A"], "notes": "x"}
    })]);
    store.fetch_profile_by_id("p1").await.expect("Should fetch");

    store
        .update_profile(
            "p1",
            ProfileUpdate::new().with_profile_data(object(json!({"medications": ["A", "B"]}))),
        )
        .await
        .expect("Should update");
    let updated = store
        .update_profile(
            "p1",
            ProfileUpdate::new().with_profile_data(object(json!({"notes": "y"}))),
        )
        .await
        .expect("Should update")
        .expect("Row should match");

    assert_eq!(
        updated.profile_data.to_value(),
        json!({"medications": ["A", "B"], "notes": "y"})
    );
    assert_eq!(
        tables.rows(tables::PROFILES)[0]["profile_data"],
        json!({"medications": ["A", "B"], "notes": "y"})
    );
}

#[tokio::test]
async fn test_recursive_merge_depth() {
    let tables = Arc::new(MemoryTables::new());
    tables.seed(
        tables::PROFILES,
        vec![object(json!({
            "id": "p1",
            "profile_data": {
                "medications": [],
                "allergies": {"penicillin": "rash", "latex": "none"}
            }
        }))],
    );
    let store = ProfileStore::new(Arc::clone(&tables)).with_merge_depth(MergeDepth::Recursive);
    store.fetch_profile_by_id("p1").await.expect("Should fetch");

    let updated = store
        .update_profile(
            "p1",
            ProfileUpdate::new()
                .with_profile_data(object(json!({"allergies": {"latex": "hives"}}))),
        )
        .await
        .expect("Should update")
        .expect("Row should match");

    assert_eq!(
        updated.profile_data.extra["allergies"],
        json!({"penicillin": "rash", "latex": "hives"})
    );
}

#[tokio::test]
async fn test_shared_link_lifecycle() {
    let (_, clock, store) = setup(vec![json!({
        "id": "p1",
        "patient_id": "pt-1",
        "profile_data": {"medications": "corrupted"}
    })]);

    let link = store.create_profile_link("p1", Some(2)).await.expect("Should issue");
    assert!(store.current().is_none());

    let shared = store
        .open_shared_profile(&link.unique_hash)
        .await
        .expect("Should open");
    assert!(shared.profile_data.medications.is_empty());
    assert_eq!(shared.viewable_link_id.as_deref(), Some(link.id.as_str()));
    assert!(store.current().is_none());

    clock.advance(Duration::hours(2));
    let err = store
        .open_shared_profile(&link.unique_hash)
        .await
        .expect_err("Should be expired");
    assert!(matches!(err, MedProfileError::LinkUnavailable(LinkStatus::Expired)));
    assert_eq!(store.error().as_deref(), Some("Share link is expired"));
}

#[tokio::test]
async fn test_profiles_listed_newest_first() {
    let (_, _, store) = setup(vec![
        json!({
            "id": "old",
            "patient_id": "pt-1",
            "created_at": "2026-01-01T00:00:00Z",
            "profile_data": null
        }),
        json!({
            "id": "new",
            "patient_id": "pt-1",
            "created_at": "2026-02-01T00:00:00Z",
            "profile_data": {"medications": []}
        }),
        json!({"id": "other", "patient_id": "pt-2", "created_at": "2026-03-01T00:00:00Z"}),
    ]);

    let profiles = store.fetch_patient_profiles("pt-1").await.expect("Should list");

    let ids: Vec<&str> = profiles.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["new", "old"]);
    assert!(profiles.iter().all(|p| p.profile_data.medications.is_empty()));
}
