//! Property-based tests for in-place merging.
//!
//! # Properties Tested
//!
//! 1. **Order Property**: after a collection merge, members follow the raw order
//! 2. **Handle Property**: members whose identity recurs keep their handle
//! 3. **Field Property**: an entity merge overwrites present fields only
//! 4. **Identity Property**: repeated fetch-alls keep one instance per identity

use entity_sync::backend::{Method, MockBackend};
use entity_sync::merge::{merge_collection, merge_entity};
use entity_sync::{Collection, Defaults, Entity, Identity, Record, Registry, ResourceOptions};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;

// ============================================================================
// Strategies
// ============================================================================

/// Distinct identities in arbitrary order
fn arb_ids() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::btree_set(0u32..64, 0..16)
        .prop_map(|ids| ids.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
}

fn arb_fields() -> impl Strategy<Value = Record> {
    prop::collection::btree_map("[a-e]", any::<i32>(), 0..5).prop_map(|fields| {
        fields
            .into_iter()
            .map(|(name, value)| (name, json!(value)))
            .collect()
    })
}

fn member(id: u32, generation: &str) -> Record {
    match json!({"id": id, "generation": generation}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn by_id(fields: &Record) -> Option<Identity> {
    Identity::from_record(fields, "id")
}

fn ids_of(list: &Collection) -> Vec<Value> {
    list.to_vec()
        .iter()
        .map(|e| e.get("id").unwrap_or(Value::Null))
        .collect()
}

// ============================================================================
// Property 1 + 2: Collection merge
// ============================================================================

proptest! {
    /// Property: members end up in raw order with exactly raw's identities
    #[test]
    fn prop_collection_follows_raw_order(before in arb_ids(), after in arb_ids()) {
        let list = Collection::from_entities(
            before.iter().map(|id| Entity::from_record(member(*id, "old"))).collect(),
        );

        merge_collection(
            &list,
            after.iter().map(|id| member(*id, "new")).collect(),
            by_id,
            |_| Entity::new(),
        );

        let expected: Vec<Value> = after.iter().map(|id| json!(id)).collect();
        prop_assert_eq!(ids_of(&list), expected);
        prop_assert!(list.to_vec().iter().all(|e| e.get("generation") == Some(json!("new"))));
    }

    /// Property: recurring identities keep their handle, new ones are adopted
    #[test]
    fn prop_recurring_members_keep_handles(before in arb_ids(), after in arb_ids()) {
        let originals: HashMap<u32, Entity> = before
            .iter()
            .map(|id| (*id, Entity::from_record(member(*id, "old"))))
            .collect();
        let list = Collection::from_entities(
            before.iter().map(|id| originals[id].clone()).collect(),
        );
        let handle = list.clone();

        let mut adopted = 0;
        merge_collection(
            &list,
            after.iter().map(|id| member(*id, "new")).collect(),
            by_id,
            |_| {
                adopted += 1;
                Entity::new()
            },
        );

        prop_assert!(handle.ptr_eq(&list));
        let recurring = after.iter().filter(|id| originals.contains_key(*id)).count();
        prop_assert_eq!(adopted, after.len() - recurring);
        for (position, id) in after.iter().enumerate() {
            if let Some(original) = originals.get(id) {
                prop_assert!(list.get(position).unwrap().ptr_eq(original));
            }
        }
    }
}

// ============================================================================
// Property 3: Entity merge
// ============================================================================

proptest! {
    /// Property: merged fields are the union, raw winning on conflicts
    #[test]
    fn prop_entity_merge_overwrites_present_fields(base in arb_fields(), raw in arb_fields()) {
        let entity = Entity::from_record(base.clone());

        merge_entity(&entity, raw.clone());

        let merged = entity.snapshot();
        for (name, value) in &raw {
            prop_assert_eq!(merged.get(name), Some(value));
        }
        for (name, value) in &base {
            if !raw.contains_key(name) {
                prop_assert_eq!(merged.get(name), Some(value));
            }
        }
        prop_assert!(merged.keys().all(|k| base.contains_key(k) || raw.contains_key(k)));
    }
}

// ============================================================================
// Property 4: One instance per identity across fetches
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any sequence of fetch-all responses keeps the collection
    /// handle and shares every member with its single-item entry
    #[test]
    fn prop_fetch_all_sequence_keeps_identity(responses in prop::collection::vec(arb_ids(), 1..5)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("Failed to create Tokio runtime");
        let backend = MockBackend::new();
        let registry = Registry::init(Defaults::new().with_backend(backend.clone()));
        let people = registry
            .declare::<Value>(ResourceOptions::new("/api/people"))
            .expect("Failed to declare");

        let mut first: Option<Collection> = None;
        for (generation, ids) in responses.iter().enumerate() {
            let body: Vec<Value> = ids
                .iter()
                .map(|id| json!({"id": id, "generation": generation}))
                .collect();
            backend.when(Method::Get, "/api/people").respond(Value::Array(body));

            let list = rt
                .block_on(async { people.get_all().await })
                .expect("Fetch all failed");
            let first = first.get_or_insert_with(|| list.clone());
            prop_assert!(first.ptr_eq(&list));

            for entity in list.to_vec() {
                let id = entity.identity("id").expect("Member without identity");
                let owned = people.cached(id).expect("Member not cached");
                prop_assert!(owned.ptr_eq(&entity));
                prop_assert_eq!(entity.get("generation"), Some(json!(generation)));
            }
        }
    }
}
