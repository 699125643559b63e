//! In-place merging of raw payloads into owned entities and collections.
//!
//! Merges never replace a handle. Fields are copied into the existing record
//! and collection membership is rewritten inside the existing sequence, so
//! anyone holding the handle sees the new contents.

use crate::entity::{Collection, Entity, Identity, Record};
use std::collections::HashMap;

/// Copy every field of `raw` into `target`.
///
/// Fields present in `raw` overwrite the target's; fields absent from `raw`
/// are left untouched. Returns `target` for chaining.
pub fn merge_entity(target: &Entity, raw: Record) -> &Entity {
    let mut fields = target.write();
    for (name, value) in raw {
        fields.insert(name, value);
    }
    drop(fields);
    target
}

/// Reconcile `target` against `raw` by identity.
///
/// - Members whose identity recurs in `raw` are merged in place and moved to
///   `raw`'s order.
/// - Members absent from `raw` are dropped.
/// - New identities (and records without one) get an entity from `adopt`,
///   which is then merged.
/// - An identity repeated within `raw` is placed once, at its first
///   position; later records for it are merged into the same member.
///
/// Runs in `O(target + raw)` through an identity-keyed lookup.
pub fn merge_collection<'a, I, A>(
    target: &'a Collection,
    raw: Vec<Record>,
    identify: I,
    mut adopt: A,
) -> &'a Collection
where
    I: Fn(&Record) -> Option<Identity>,
    A: FnMut(Option<&Identity>) -> Entity,
{
    let existing: HashMap<Identity, Entity> = target
        .read()
        .iter()
        .filter_map(|member| identify(&*member.read()).map(|id| (id, member.clone())))
        .collect();

    let mut placed: HashMap<Identity, Entity> = HashMap::with_capacity(raw.len());
    let mut members = Vec::with_capacity(raw.len());
    for fields in raw {
        let id = identify(&fields);
        if let Some(member) = id.as_ref().and_then(|id| placed.get(id)) {
            merge_entity(member, fields);
            continue;
        }

        let entity = match id.as_ref().and_then(|id| existing.get(id)) {
            Some(member) => member.clone(),
            None => adopt(id.as_ref()),
        };
        merge_entity(&entity, fields);
        if let Some(id) = id {
            placed.insert(id, entity.clone());
        }
        members.push(entity);
    }

    *target.write() = members;
    target
}

/// Keep only the allow-listed fields of `record`.
///
/// `None` keeps everything.
pub fn select_fields(record: &Record, fields: Option<&[&str]>) -> Record {
    match fields {
        None => record.clone(),
        Some(allowed) => record
            .iter()
            .filter(|(name, _)| allowed.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    }
}
