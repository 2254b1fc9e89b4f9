//! Conflict detection and resolution.
//!
//! A pulled record conflicts with local state iff a live queue entry exists
//! for the same entity **and** the remote version is strictly newer than the
//! version this device last observed. Versions are assigned by the remote, so
//! device clock drift never affects the decision.

use crate::{
    error::Result, protocol::RemoteRecord, EntityId, EntityType, Error,
    LocalStore, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// What the pull phase should do with one remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    /// No local change pending; take the remote copy
    ApplyRemote,
    /// Remote is not newer than what this device already knows; the pending
    /// local change goes out on the next push
    KeepLocal,
    /// Both sides changed; needs a resolution
    Conflict,
}

/// Classify a pulled record against local state.
pub fn detect(store: &LocalStore, remote: &RemoteRecord) -> PullDecision {
    if store.tracker().find(remote.entity_type, &remote.id).is_none() {
        return PullDecision::ApplyRemote;
    }

    let observed = store
        .observed_version(remote.entity_type, &remote.id)
        .unwrap_or(0);
    if remote.version > observed {
        PullDecision::Conflict
    } else {
        PullDecision::KeepLocal
    }
}

/// A divergence awaiting resolution. Held in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Pending local payload (`None` if the local change is a delete)
    pub local_payload: Option<serde_json::Value>,
    /// The remote's copy at detection time
    pub server: RemoteRecord,
    pub detected_at: Timestamp,
}

impl ConflictRecord {
    /// Server payload, or `None` when the remote deleted the record.
    pub fn server_payload(&self) -> Option<&serde_json::Value> {
        (!self.server.deleted).then_some(&self.server.payload)
    }
}

/// Which side wins a bulk resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Server,
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Side::Local),
            "server" => Ok(Side::Server),
            other => Err(Error::InvalidPayload(format!("unknown side: {other}"))),
        }
    }
}

/// Resolution action for a single conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Force-push the local payload over the remote
    KeepLocal,
    /// Drop the pending change and take the remote copy
    KeepServer,
    /// Queue a caller-supplied payload based on the remote version
    Merge(serde_json::Value),
}

impl From<Side> for Resolution {
    fn from(side: Side) -> Self {
        match side {
            Side::Local => Resolution::KeepLocal,
            Side::Server => Resolution::KeepServer,
        }
    }
}

/// Automatic handling of conflicts at the end of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave conflicts for the user
    #[default]
    Manual,
    PreferLocal,
    PreferServer,
}

impl ConflictPolicy {
    /// The side applied automatically, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            ConflictPolicy::Manual => None,
            ConflictPolicy::PreferLocal => Some(Side::Local),
            ConflictPolicy::PreferServer => Some(Side::Server),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(ConflictPolicy::Manual),
            "prefer_local" => Ok(ConflictPolicy::PreferLocal),
            "prefer_server" => Ok(ConflictPolicy::PreferServer),
            other => Err(Error::InvalidPayload(format!("unknown conflict policy: {other}"))),
        }
    }
}

/// Outstanding conflicts, at most one per entity.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    conflicts: BTreeMap<(EntityType, EntityId), ConflictRecord>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a conflict for `server` and hold the local entry until resolved.
    ///
    /// A second detection for the same entity refreshes the server copy and
    /// keeps the original conflict id.
    pub fn raise(
        &mut self,
        store: &mut LocalStore,
        server: RemoteRecord,
        now: Timestamp,
    ) -> Result<&ConflictRecord> {
        let entry = store
            .tracker()
            .find(server.entity_type, &server.id)
            .ok_or_else(|| Error::EntityNotFound {
                entity_type: server.entity_type,
                id: server.id.clone(),
            })?;
        let entry_id = entry.id;
        let local_payload = entry.payload.clone();
        store.tracker_mut().hold(entry_id)?;

        let key = (server.entity_type, server.id.clone());
        let conflict = self
            .conflicts
            .entry(key)
            .and_modify(|c| {
                c.local_payload = local_payload.clone();
                c.detected_at = now;
            })
            .or_insert_with(|| ConflictRecord {
                id: uuid::Uuid::new_v4().to_string(),
                entity_type: server.entity_type,
                entity_id: server.id.clone(),
                local_payload,
                server: server.clone(),
                detected_at: now,
            });
        conflict.server = server;

        Ok(conflict)
    }

    /// Get a conflict by id.
    pub fn get(&self, conflict_id: &str) -> Option<&ConflictRecord> {
        self.conflicts.values().find(|c| c.id == conflict_id)
    }

    /// The conflict for an entity, if any.
    pub fn find(&self, entity_type: EntityType, entity_id: &str) -> Option<&ConflictRecord> {
        self.conflicts.get(&(entity_type, entity_id.to_string()))
    }

    /// All outstanding conflicts, ordered by entity type then id.
    pub fn list(&self) -> Vec<&ConflictRecord> {
        self.conflicts.values().collect()
    }

    /// Outstanding conflicts grouped by entity type.
    pub fn by_entity_type(&self) -> BTreeMap<EntityType, Vec<&ConflictRecord>> {
        let mut grouped: BTreeMap<EntityType, Vec<&ConflictRecord>> = BTreeMap::new();
        for conflict in self.conflicts.values() {
            grouped.entry(conflict.entity_type).or_default().push(conflict);
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Forget every conflict (used by full reset).
    pub fn clear(&mut self) {
        self.conflicts.clear();
    }

    /// Apply `resolution` to one conflict and remove it.
    pub fn resolve(
        &mut self,
        store: &mut LocalStore,
        conflict_id: &str,
        resolution: Resolution,
        now: Timestamp,
    ) -> Result<ConflictRecord> {
        let key = self
            .conflicts
            .iter()
            .find(|(_, c)| c.id == conflict_id)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;

        let conflict = &self.conflicts[&key];
        check(store, conflict, &resolution)?;
        apply(store, conflict, resolution, now)?;

        self.conflicts
            .remove(&key)
            .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))
    }

    /// Apply the same side to every outstanding conflict.
    ///
    /// Every conflict is checked before any is applied, so a failing check
    /// leaves all of them in place.
    pub fn resolve_all(&mut self, store: &mut LocalStore, side: Side, now: Timestamp) -> Result<usize> {
        let resolution = Resolution::from(side);
        for conflict in self.conflicts.values() {
            check(store, conflict, &resolution)?;
        }

        let conflicts = std::mem::take(&mut self.conflicts);
        let count = conflicts.len();
        for conflict in conflicts.values() {
            apply(store, conflict, resolution.clone(), now)?;
        }
        Ok(count)
    }
}

fn check(store: &LocalStore, conflict: &ConflictRecord, resolution: &Resolution) -> Result<()> {
    match resolution {
        Resolution::KeepLocal => store
            .tracker()
            .find(conflict.entity_type, &conflict.entity_id)
            .map(|_| ())
            .ok_or_else(|| Error::EntityNotFound {
                entity_type: conflict.entity_type,
                id: conflict.entity_id.clone(),
            }),
        Resolution::KeepServer => Ok(()),
        Resolution::Merge(payload) => store
            .schema()
            .validate_payload(conflict.entity_type, payload),
    }
}

fn apply(
    store: &mut LocalStore,
    conflict: &ConflictRecord,
    resolution: Resolution,
    now: Timestamp,
) -> Result<()> {
    let (entity_type, entity_id) = (conflict.entity_type, conflict.entity_id.as_str());

    match resolution {
        Resolution::KeepLocal => {
            let entry_id = store
                .tracker()
                .find(entity_type, entity_id)
                .map(|e| e.id)
                .ok_or_else(|| Error::EntityNotFound {
                    entity_type,
                    id: entity_id.to_string(),
                })?;
            store.acknowledge_remote(&conflict.server);
            store.tracker_mut().release(entry_id, true)?;
        }
        Resolution::KeepServer => {
            store.tracker_mut().discard(entity_type, entity_id);
            // A stale result means a newer remote copy already landed.
            store.apply_remote(&conflict.server, now);
        }
        Resolution::Merge(payload) => {
            store.tracker_mut().discard(entity_type, entity_id);
            store.apply_remote(&conflict.server, now);
            store.write_merged(entity_type, entity_id, payload, now)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeOp, Schema, Version};
    use proptest::prelude::*;
    use serde_json::json;

    fn store() -> LocalStore {
        LocalStore::new(Schema::business_default(), "till-1")
    }

    fn remote(id: &str, version: Version, name: &str) -> RemoteRecord {
        RemoteRecord {
            entity_type: EntityType::Customer,
            id: id.into(),
            payload: json!({"name": name}),
            deleted: false,
            version,
            server_clock: version * 10,
        }
    }

    /// Store with `id` synced at `version` and then edited locally.
    fn edited(id: &str, version: Version) -> LocalStore {
        let mut store = store();
        store.apply_remote(&remote(id, version, "Server"), 1000);
        store
            .update(EntityType::Customer, id, json!({"name": "Local"}), 2000)
            .unwrap();
        store
    }

    #[test]
    fn no_pending_change_applies_remote() {
        let mut s = store();
        s.apply_remote(&remote("c-1", 1, "Ada"), 1000);
        assert_eq!(detect(&s, &remote("c-1", 2, "Ada B.")), PullDecision::ApplyRemote);
    }

    #[test]
    fn pending_change_with_stale_remote_keeps_local() {
        let s = edited("c-1", 3);
        assert_eq!(detect(&s, &remote("c-1", 3, "Server")), PullDecision::KeepLocal);
        assert_eq!(detect(&s, &remote("c-1", 2, "Older")), PullDecision::KeepLocal);
    }

    #[test]
    fn both_sides_changed_is_a_conflict() {
        let s = edited("c-1", 3);
        assert_eq!(detect(&s, &remote("c-1", 4, "Other")), PullDecision::Conflict);
    }

    #[test]
    fn raise_holds_the_entry() {
        let mut s = edited("c-1", 1);
        let mut resolver = ConflictResolver::new();
        let conflict = resolver.raise(&mut s, remote("c-1", 2, "Other"), 3000).unwrap();

        assert_eq!(conflict.local_payload, Some(json!({"name": "Local"})));
        assert_eq!(conflict.server_payload(), Some(&json!({"name": "Other"})));
        assert!(s.tracker().drain(10, u64::MAX).is_empty());
    }

    #[test]
    fn raise_twice_keeps_one_conflict() {
        let mut s = edited("c-1", 1);
        let mut resolver = ConflictResolver::new();
        let first = resolver.raise(&mut s, remote("c-1", 2, "Other"), 3000).unwrap().id.clone();
        let second = resolver.raise(&mut s, remote("c-1", 3, "Newest"), 4000).unwrap();

        assert_eq!(second.id, first);
        assert_eq!(second.server.version, 3);
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn raise_without_pending_change_fails() {
        let mut s = store();
        let mut resolver = ConflictResolver::new();
        assert!(resolver.raise(&mut s, remote("c-1", 1, "Other"), 1000).is_err());
    }

    #[test]
    fn keep_local_forces_push_on_server_version() {
        let mut s = edited("c-1", 1);
        let mut resolver = ConflictResolver::new();
        let id = resolver.raise(&mut s, remote("c-1", 2, "Other"), 3000).unwrap().id.clone();

        resolver.resolve(&mut s, &id, Resolution::KeepLocal, 4000).unwrap();

        assert!(resolver.is_empty());
        let drained = s.tracker().drain(10, u64::MAX);
        assert_eq!(drained.len(), 1);
        assert!(drained[0].force);
        assert_eq!(s.observed_version(EntityType::Customer, "c-1"), Some(2));
        assert!(!s.read(EntityType::Customer, "c-1").unwrap().is_synced);
    }

    #[test]
    fn keep_server_discards_pending_change() {
        let mut s = edited("c-1", 1);
        let mut resolver = ConflictResolver::new();
        let id = resolver.raise(&mut s, remote("c-1", 2, "Other"), 3000).unwrap().id.clone();

        resolver.resolve(&mut s, &id, Resolution::KeepServer, 4000).unwrap();

        assert_eq!(s.pending_count(), 0);
        let record = s.read(EntityType::Customer, "c-1").unwrap();
        assert_eq!(record.payload, json!({"name": "Other"}));
        assert!(record.is_synced);
    }

    #[test]
    fn merge_queues_new_update_based_on_server() {
        let mut s = edited("c-1", 1);
        let mut resolver = ConflictResolver::new();
        let id = resolver.raise(&mut s, remote("c-1", 2, "Other"), 3000).unwrap().id.clone();

        let merged = json!({"name": "Other", "phone": "555"});
        resolver
            .resolve(&mut s, &id, Resolution::Merge(merged.clone()), 4000)
            .unwrap();

        let entry = s.tracker().find(EntityType::Customer, "c-1").unwrap();
        assert_eq!(entry.operation, ChangeOp::Update);
        assert_eq!(entry.payload, Some(merged.clone()));
        assert!(!entry.held);
        assert_eq!(s.observed_version(EntityType::Customer, "c-1"), Some(2));
        assert_eq!(s.read(EntityType::Customer, "c-1").unwrap().payload, merged);
    }

    #[test]
    fn invalid_merge_leaves_conflict_in_place() {
        let mut s = edited("c-1", 1);
        let mut resolver = ConflictResolver::new();
        let id = resolver.raise(&mut s, remote("c-1", 2, "Other"), 3000).unwrap().id.clone();

        let result = resolver.resolve(&mut s, &id, Resolution::Merge(json!({"phone": "555"})), 4000);

        assert!(result.is_err());
        assert_eq!(resolver.len(), 1);
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn resolve_unknown_conflict() {
        let mut s = store();
        let mut resolver = ConflictResolver::new();
        assert!(matches!(
            resolver.resolve(&mut s, "nope", Resolution::KeepServer, 0),
            Err(Error::ConflictNotFound(_))
        ));
    }

    #[test]
    fn resolve_all_local_and_server() {
        let mut s = store();
        let mut resolver = ConflictResolver::new();
        for id in ["c-1", "c-2", "c-3"] {
            s.apply_remote(&remote(id, 1, "Server"), 1000);
            s.update(EntityType::Customer, id, json!({"name": "Local"}), 2000).unwrap();
            resolver.raise(&mut s, remote(id, 2, "Other"), 3000).unwrap();
        }
        let mut server_side = s.clone();
        let mut server_resolver = resolver.clone();

        assert_eq!(resolver.resolve_all(&mut s, Side::Local, 4000).unwrap(), 3);
        assert!(resolver.is_empty());
        assert_eq!(s.tracker().drain(10, u64::MAX).len(), 3);

        assert_eq!(server_resolver.resolve_all(&mut server_side, Side::Server, 4000).unwrap(), 3);
        assert!(server_resolver.is_empty());
        assert_eq!(server_side.pending_count(), 0);
    }

    #[test]
    fn grouped_by_entity_type() {
        let mut s = edited("c-1", 1);
        s.apply_remote(
            &RemoteRecord {
                entity_type: EntityType::Staff,
                id: "s-1".into(),
                payload: json!({"name": "Sam"}),
                deleted: false,
                version: 1,
                server_clock: 5,
            },
            1000,
        );
        s.update(EntityType::Staff, "s-1", json!({"name": "Sam L."}), 2000).unwrap();

        let mut resolver = ConflictResolver::new();
        resolver.raise(&mut s, remote("c-1", 2, "Other"), 3000).unwrap();
        resolver
            .raise(
                &mut s,
                RemoteRecord {
                    entity_type: EntityType::Staff,
                    id: "s-1".into(),
                    payload: json!({"name": "Samuel"}),
                    deleted: false,
                    version: 2,
                    server_clock: 9,
                },
                3000,
            )
            .unwrap();

        let grouped = resolver.by_entity_type();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&EntityType::Staff].len(), 1);
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("prefer_server".parse::<ConflictPolicy>().unwrap().side(), Some(Side::Server));
        assert_eq!(ConflictPolicy::default().side(), None);
        assert!("sometimes".parse::<ConflictPolicy>().is_err());
    }

    proptest! {
        /// Conflict iff a pending change exists and the remote moved past
        /// the observed version.
        #[test]
        fn conflict_iff_both_sides_changed(
            observed in 1u64..50,
            remote_version in 1u64..60,
            pending in any::<bool>(),
        ) {
            let mut s = store();
            s.apply_remote(&remote("c-1", observed, "Server"), 1000);
            if pending {
                s.update(EntityType::Customer, "c-1", json!({"name": "Local"}), 2000).unwrap();
            }

            let decision = detect(&s, &remote("c-1", remote_version, "Other"));
            let expected = pending && remote_version > observed;
            prop_assert_eq!(decision == PullDecision::Conflict, expected);
        }
    }
}
