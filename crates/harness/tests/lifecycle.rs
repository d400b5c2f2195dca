use recordcache_core::{config::CacheConfig, field_value::FieldValue, LifecycleState, ResourceKey};
use recordcache_engine::{ChangeKind, EngineError, FetchFailure};
use recordcache_harness::{document, identifier, resource, text_attributes, TestCache};
use recordcache_storage::ValidationError;
use serde_json::json;

fn loaded_user(t: &mut TestCache, id: &str, name: &str) -> Result<ResourceKey, Box<dyn std::error::Error>> {
    let keys = t.push_json(json!({
        "data": { "type": "user", "id": id, "attributes": { "name": name } }
    }))?;
    Ok(keys[0])
}

// ============================================================================
// Local edits
// ============================================================================

#[test]
fn setting_an_attribute_back_to_canonical_cleans_the_record() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;

    t.cache.set_local_attribute(key, "name", "Grace")?;
    assert_eq!(t.cache.state(key), LifecycleState::UpdatedUncommitted);
    let changed = t.cache.changed_attributes(key);
    assert_eq!(changed["name"].canonical, Some(FieldValue::from("Ada")));
    assert_eq!(changed["name"].current, FieldValue::from("Grace"));

    t.cache.set_local_attribute(key, "name", "Ada")?;
    assert_eq!(t.cache.state(key), LifecycleState::LoadedSaved);
    assert!(t.cache.changed_attributes(key).is_empty());
    Ok(())
}

#[test]
fn rollback_restores_canonical_values() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    t.cache.set_local_attribute(key, "name", "Grace")?;
    t.cache.set_local_attribute(key, "email", "grace@example.com")?;

    t.cache.rollback(key)?;

    assert_eq!(t.cache.state(key), LifecycleState::LoadedSaved);
    assert_eq!(t.text(key, "name").as_deref(), Some("Ada"));
    assert_eq!(t.cache.attribute(key, "email"), None);
    Ok(())
}

#[test]
fn pushed_data_keeps_local_edits_on_top() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    t.cache.set_local_attribute(key, "name", "Grace")?;

    t.push_json(json!({
        "data": { "type": "user", "id": "1", "attributes": { "name": "Ada", "email": "ada@example.com" } }
    }))?;
    assert_eq!(t.cache.state(key), LifecycleState::UpdatedUncommitted);
    assert_eq!(t.text(key, "name").as_deref(), Some("Grace"));
    assert_eq!(t.text(key, "email").as_deref(), Some("ada@example.com"));

    // server catches up with the local edit
    t.push_json(json!({
        "data": { "type": "user", "id": "1", "attributes": { "name": "Grace" } }
    }))?;
    assert_eq!(t.cache.state(key), LifecycleState::LoadedSaved);
    Ok(())
}

#[test]
fn rolling_back_a_new_record_deletes_it() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = t
        .cache
        .create_record("user", text_attributes(&[("name", "Ada")]), None)?;
    assert_eq!(t.cache.state(key), LifecycleState::CreatedUncommitted);

    t.cache.rollback(key)?;
    assert_eq!(t.cache.state(key), LifecycleState::DeletedSaved);
    Ok(())
}

// ============================================================================
// Saving
// ============================================================================

#[test]
fn fields_being_saved_are_locked_until_the_save_settles() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    t.cache.set_local_attribute(key, "name", "Grace")?;
    t.cache.will_commit(key)?;
    assert_eq!(t.cache.state(key), LifecycleState::UpdatedInflight);

    assert!(matches!(
        t.cache.set_local_attribute(key, "name", "Hopper"),
        Err(EngineError::FieldInFlight { .. })
    ));
    // other fields stay editable
    t.cache.set_local_attribute(key, "email", "grace@example.com")?;

    t.cache.did_commit(key, None)?;
    assert_eq!(t.cache.state(key), LifecycleState::UpdatedUncommitted);
    assert_eq!(t.cache.record(key).ok_or("record missing")?.canonical["name"], FieldValue::from("Grace"));
    Ok(())
}

#[test]
fn invalid_save_keeps_edits_and_clears_field_errors_on_edit() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    t.watch(key)?;
    t.cache.set_local_attribute(key, "name", "")?;
    t.cache.will_commit(key)?;

    t.cache
        .commit_rejected(key, Some(vec![ValidationError::field("name", "can't be blank")]))?;

    assert_eq!(t.cache.state(key), LifecycleState::UpdatedInvalid);
    assert_eq!(t.text(key, "name").as_deref(), Some(""));
    assert_eq!(t.cache.errors_for(key, "name").len(), 1);
    assert!(!t.changes_of(ChangeKind::Errors).is_empty());

    t.cache.set_local_attribute(key, "name", "Grace")?;
    assert_eq!(t.cache.state(key), LifecycleState::UpdatedUncommitted);
    assert!(t.cache.errors(key).is_empty());
    Ok(())
}

#[test]
fn invalid_record_stays_invalid_while_other_fields_have_errors() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    t.cache.set_local_attribute(key, "name", "")?;
    t.cache.will_commit(key)?;
    t.cache.commit_rejected(
        key,
        Some(vec![
            ValidationError::field("name", "can't be blank"),
            ValidationError::field("email", "is required"),
        ]),
    )?;

    t.cache.set_local_attribute(key, "name", "Grace")?;
    assert_eq!(t.cache.state(key), LifecycleState::UpdatedInvalid);
    assert_eq!(t.cache.errors_for(key, "email").len(), 1);
    assert!(t.cache.errors_for(key, "name").is_empty());
    Ok(())
}

#[test]
fn failed_save_can_be_retried() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = t
        .cache
        .create_record("user", text_attributes(&[("name", "Ada")]), None)?;
    t.cache.will_commit(key)?;
    t.cache.commit_rejected(key, None)?;

    assert_eq!(t.cache.state(key), LifecycleState::CreatedError);
    assert_eq!(t.text(key, "name").as_deref(), Some("Ada"));

    t.cache.will_commit(key)?;
    assert_eq!(t.cache.state(key), LifecycleState::CreatedInflight);
    let server = resource(json!({ "type": "user", "id": "5" }))?;
    t.cache.did_commit(key, Some(&server))?;
    assert_eq!(t.cache.state(key), LifecycleState::LoadedSaved);
    assert_eq!(t.text(key, "name").as_deref(), Some("Ada"));
    Ok(())
}

#[test]
fn deleted_records_save_into_deleted_saved() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    t.cache.delete_record(key)?;
    assert_eq!(t.cache.state(key), LifecycleState::DeletedUncommitted);

    t.cache.will_commit(key)?;
    assert_eq!(t.cache.state(key), LifecycleState::DeletedInflight);
    t.cache.did_commit(key, None)?;
    assert_eq!(t.cache.state(key), LifecycleState::DeletedSaved);

    // later payloads for a deleted resource are ignored
    t.push_json(json!({
        "data": { "type": "user", "id": "1", "attributes": { "name": "Zombie" } }
    }))?;
    assert_eq!(t.cache.state(key), LifecycleState::DeletedSaved);
    Ok(())
}

#[test]
fn rolled_back_delete_returns_to_saved() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    t.cache.delete_record(key)?;
    t.cache.rollback(key)?;
    assert_eq!(t.cache.state(key), LifecycleState::LoadedSaved);
    Ok(())
}

// ============================================================================
// Protocol violations
// ============================================================================

#[test]
fn events_without_a_handler_are_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let empty = t.cache.identifier_for(&identifier("user", "3"))?;
    let err = t.cache.will_commit(empty).expect_err("empty records cannot be saved");
    assert!(matches!(err, EngineError::Protocol { .. }));
    assert!(err.is_fatal());

    let key = loaded_user(&mut t, "1", "Ada")?;
    t.cache.delete_record(key)?;
    let err = t
        .cache
        .set_local_attribute(key, "name", "Grace")
        .expect_err("deleted records are read-only");
    assert!(err.is_fatal());
    assert_eq!(t.text(key, "name").as_deref(), Some("Ada"));

    let loaded = loaded_user(&mut t, "2", "Grace")?;
    assert!(t.cache.did_commit(loaded, None).is_err());
    assert!(t.cache.commit_rejected(loaded, None).is_err());
    Ok(())
}

#[test]
fn deleted_records_reject_relationship_edits() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let user = loaded_user(&mut t, "1", "Ada")?;
    let post = t.push_json(json!({ "data": { "type": "post", "id": "1" } }))?[0];
    t.cache.delete_record(user)?;
    assert!(matches!(
        t.cache
            .mutate_relationship(user, "posts", recordcache_engine::RelationshipOp::Add(vec![post])),
        Err(EngineError::InvalidOperation(_))
    ));
    Ok(())
}

// ============================================================================
// Fetching
// ============================================================================

#[test]
fn fetch_loads_and_dedups() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = t.cache.identifier_for(&identifier("user", "1"))?;

    let first = t.cache.fetch(key)?;
    assert_eq!(t.cache.state(key), LifecycleState::Loading);
    let second = t.cache.fetch(key)?;
    assert!(second.deduplicated);
    assert_eq!(second.request, first.request);
    assert!(t.cache.is_fetch_pending(key));

    let doc = document(json!({ "data": { "type": "user", "id": "1", "attributes": { "name": "Ada" } } }))?;
    t.cache.resolve_fetch(first, &doc)?;
    assert_eq!(t.cache.state(key), LifecycleState::LoadedSaved);
    assert!(!t.cache.is_fetch_pending(key));

    assert!(matches!(
        t.cache.resolve_fetch(second, &doc),
        Err(EngineError::UnknownRequest(_))
    ));
    Ok(())
}

#[test]
fn failed_fetches_settle_loading_records() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let missing = t.cache.identifier_for(&identifier("user", "1"))?;
    let ticket = t.cache.fetch(missing)?;
    t.cache.reject_fetch(ticket, FetchFailure::NotFound)?;
    assert_eq!(t.cache.state(missing), LifecycleState::Empty);

    let broken = t.cache.identifier_for(&identifier("user", "2"))?;
    let ticket = t.cache.fetch(broken)?;
    t.cache.reject_fetch(ticket, FetchFailure::Error("503".into()))?;
    assert_eq!(t.cache.state(broken), LifecycleState::Error);
    assert_eq!(t.cache.errors(broken), vec![ValidationError::base("503")]);

    // an errored record can be fetched again
    let ticket = t.cache.fetch(broken)?;
    let doc = document(json!({ "data": { "type": "user", "id": "2" } }))?;
    t.cache.resolve_fetch(ticket, &doc)?;
    assert_eq!(t.cache.state(broken), LifecycleState::LoadedSaved);
    assert!(t.cache.errors(broken).is_empty());
    Ok(())
}

#[test]
fn malformed_fetch_response_keeps_the_request_open() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = t.cache.identifier_for(&identifier("user", "1"))?;
    let ticket = t.cache.fetch(key)?;

    let bad = document(json!({
        "data": { "type": "user", "id": "1", "relationships": { "pets": { "data": [] } } }
    }))?;
    assert!(matches!(
        t.cache.resolve_fetch(ticket, &bad),
        Err(EngineError::UnknownRelationship { .. })
    ));
    assert_eq!(t.cache.state(key), LifecycleState::Loading);
    assert!(t.cache.is_fetch_pending(key));
    assert!(t.cache.fetch(key)?.deduplicated);

    t.cache.reject_fetch(ticket, FetchFailure::NotFound)?;
    assert_eq!(t.cache.state(key), LifecycleState::Empty);
    assert!(!t.cache.is_fetch_pending(key));
    Ok(())
}

#[test]
fn fetch_of_a_loaded_record_is_a_reload() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;

    let ticket = t.cache.fetch(key)?;
    assert_eq!(t.cache.state(key), LifecycleState::LoadedSaved);
    assert!(t.cache.is_reloading(key));
    t.cache.reject_fetch(ticket, FetchFailure::Error("timeout".into()))?;
    assert!(!t.cache.is_reloading(key));
    assert_eq!(t.cache.state(key), LifecycleState::LoadedSaved);
    assert!(t.cache.errors(key).is_empty());

    let ticket = t.cache.fetch(key)?;
    let doc = document(json!({ "data": { "type": "user", "id": "1", "attributes": { "name": "Ada L." } } }))?;
    t.cache.resolve_fetch(ticket, &doc)?;
    assert!(!t.cache.is_reloading(key));
    assert_eq!(t.text(key, "name").as_deref(), Some("Ada L."));
    Ok(())
}

#[test]
fn new_records_cannot_be_fetched() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = t.cache.create_record("user", Default::default(), None)?;
    assert!(t.cache.fetch(key).is_err());
    assert!(!t.cache.is_fetch_pending(key));
    Ok(())
}

// ============================================================================
// Notifications
// ============================================================================

#[test]
fn notifications_arrive_once_per_operation() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    t.watch(key)?;

    t.cache.set_local_attribute(key, "name", "Grace")?;
    let changes = t.changes();
    assert_eq!(
        changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Attributes && c.field.as_deref() == Some("name"))
            .count(),
        1
    );
    assert_eq!(t.changes_of(ChangeKind::State).len(), 1);

    t.clear_changes();
    t.cache.set_local_attribute(key, "name", "Grace")?;
    assert!(t.changes().is_empty());
    Ok(())
}

#[test]
fn unsubscribed_observers_hear_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let mut t = TestCache::new()?;
    let key = loaded_user(&mut t, "1", "Ada")?;
    let token = t.watch(key)?;
    assert!(t.cache.unsubscribe(token));
    assert!(!t.cache.unsubscribe(token));

    t.cache.set_local_attribute(key, "name", "Grace")?;
    assert!(t.changes().is_empty());
    Ok(())
}

// ============================================================================
// Transition memoization
// ============================================================================

#[test]
fn memoized_and_direct_transitions_agree() -> Result<(), Box<dyn std::error::Error>> {
    fn run(config: CacheConfig) -> Result<(Vec<LifecycleState>, TestCache), Box<dyn std::error::Error>> {
        let mut t = TestCache::with_config(config)?;
        let mut states = Vec::new();
        for id in ["1", "2"] {
            let key = loaded_user(&mut t, id, "Ada")?;
            t.cache.set_local_attribute(key, "name", "Grace")?;
            states.push(t.cache.state(key));
            t.cache.will_commit(key)?;
            states.push(t.cache.state(key));
            t.cache.did_commit(key, None)?;
            states.push(t.cache.state(key));
        }
        Ok((states, t))
    }

    let (memoized, with_cache) = run(CacheConfig::default())?;
    let (direct, without_cache) = run(CacheConfig {
        memoize_transitions: false,
        ..CacheConfig::default()
    })?;

    assert_eq!(memoized, direct);
    assert!(with_cache.cache.transition_stats().hits > 0);
    assert_eq!(without_cache.cache.transition_stats().hits, 0);
    Ok(())
}
