use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::types::{GameResult, PoolRecord, SeedRecord, SetRecord, SetState};

// ── Field patches ──────────────────────────────────────────────────────

/// A sparse field-level delta. `Keep` leaves the base value untouched;
/// `Set` overwrites it, including `Set(None)` which clears an optional
/// field. The two are distinct on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldPatch<T> {
    Keep,
    Set(T),
}

// Not derived: the derive would put a `T: Default` bound on it.
impl<T> Default for FieldPatch<T> {
    fn default() -> Self {
        FieldPatch::Keep
    }
}

impl<T: Clone> FieldPatch<T> {
    pub fn apply_to(&self, target: &mut T) {
        if let FieldPatch::Set(value) = self {
            *target = value.clone();
        }
    }

    /// Carries another patch's value over this one when the other is present.
    pub fn overlay(&mut self, other: &FieldPatch<T>) {
        if let FieldPatch::Set(value) = other {
            *self = FieldPatch::Set(value.clone());
        }
    }
}

// ── Mutations ──────────────────────────────────────────────────────────

/// Ordered overlay delta for one set, owned by transaction `number`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMutation {
    pub set_id: u64,
    pub number: u64,
    pub state: FieldPatch<SetState>,
    pub slot_one_entrant: FieldPatch<Option<u32>>,
    pub slot_two_entrant: FieldPatch<Option<u32>>,
    pub slot_one_score: FieldPatch<Option<i32>>,
    pub slot_two_score: FieldPatch<Option<i32>>,
    pub winner_id: FieldPatch<Option<u32>>,
    pub loser_id: FieldPatch<Option<u32>>,
    pub started_at_ms: FieldPatch<Option<u64>>,
    pub completed_at_ms: FieldPatch<Option<u64>>,
    pub station_id: FieldPatch<Option<u32>>,
    pub stream_id: FieldPatch<Option<u32>>,
    pub games: FieldPatch<Vec<GameResult>>,
}

impl SetMutation {
    pub fn new(set_id: u64, number: u64) -> Self {
        SetMutation {
            set_id,
            number,
            ..SetMutation::default()
        }
    }

    pub fn slot_entrant_patch(&mut self, slot: usize) -> &mut FieldPatch<Option<u32>> {
        if slot == 0 {
            &mut self.slot_one_entrant
        } else {
            &mut self.slot_two_entrant
        }
    }

    /// Copies every present field of `other` over this mutation.
    pub fn merge_from(&mut self, other: &SetMutation) {
        self.state.overlay(&other.state);
        self.slot_one_entrant.overlay(&other.slot_one_entrant);
        self.slot_two_entrant.overlay(&other.slot_two_entrant);
        self.slot_one_score.overlay(&other.slot_one_score);
        self.slot_two_score.overlay(&other.slot_two_score);
        self.winner_id.overlay(&other.winner_id);
        self.loser_id.overlay(&other.loser_id);
        self.started_at_ms.overlay(&other.started_at_ms);
        self.completed_at_ms.overlay(&other.completed_at_ms);
        self.station_id.overlay(&other.station_id);
        self.stream_id.overlay(&other.stream_id);
        self.games.overlay(&other.games);
    }
}

/// Overlay delta for one seed. Graduation placements computed locally from
/// a finished round robin pool must also be patched on the remote side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedMutation {
    pub seed_id: u64,
    pub number: u64,
    pub entrant_id: FieldPatch<Option<u32>>,
    pub requires_remote_patch: bool,
}

// ── Materialization ────────────────────────────────────────────────────

/// Pure left-fold of ordered mutations onto a base record. Absent fields
/// are no-ops; replaying the same ordered log twice yields the same value.
pub fn materialize_set<'a>(
    base: &SetRecord,
    mutations: impl IntoIterator<Item = &'a SetMutation>,
) -> SetRecord {
    let mut current = base.clone();
    for m in mutations {
        m.state.apply_to(&mut current.state);
        m.slot_one_entrant.apply_to(&mut current.slot_one_entrant);
        m.slot_two_entrant.apply_to(&mut current.slot_two_entrant);
        m.slot_one_score.apply_to(&mut current.slot_one_score);
        m.slot_two_score.apply_to(&mut current.slot_two_score);
        m.winner_id.apply_to(&mut current.winner_id);
        m.loser_id.apply_to(&mut current.loser_id);
        m.started_at_ms.apply_to(&mut current.started_at_ms);
        m.completed_at_ms.apply_to(&mut current.completed_at_ms);
        m.station_id.apply_to(&mut current.station_id);
        m.stream_id.apply_to(&mut current.stream_id);
        m.games.apply_to(&mut current.games);
    }
    current
}

pub fn materialize_seed<'a>(
    base: &SeedRecord,
    mutations: impl IntoIterator<Item = &'a SeedMutation>,
) -> SeedRecord {
    let mut current = base.clone();
    for m in mutations {
        m.entrant_id.apply_to(&mut current.entrant_id);
    }
    current
}

// ── Overlay store ──────────────────────────────────────────────────────

/// Immutable base records plus per-record mutation logs keyed by
/// transaction number. BTreeMap keys give the strict replay order.
#[derive(Debug, Default)]
pub struct OverlayStore {
    pub(crate) sets: HashMap<u64, SetRecord>,
    pub(crate) seeds: HashMap<u64, SeedRecord>,
    pub(crate) pools: HashMap<u64, PoolRecord>,
    set_mutations: HashMap<u64, BTreeMap<u64, SetMutation>>,
    seed_mutations: HashMap<u64, BTreeMap<u64, SeedMutation>>,
}

impl OverlayStore {
    pub fn new() -> Self {
        OverlayStore::default()
    }

    // ── Base records ───────────────────────────────────────────────

    pub fn upsert_set(&mut self, record: SetRecord) {
        self.sets.insert(record.id, record);
    }

    pub fn remove_set(&mut self, set_id: u64) -> Option<SetRecord> {
        self.set_mutations.remove(&set_id);
        self.sets.remove(&set_id)
    }

    pub fn base_set(&self, set_id: u64) -> Option<&SetRecord> {
        self.sets.get(&set_id)
    }

    pub fn upsert_seed(&mut self, record: SeedRecord) {
        self.seeds.insert(record.id, record);
    }

    pub fn remove_seed(&mut self, seed_id: u64) -> Option<SeedRecord> {
        self.seed_mutations.remove(&seed_id);
        self.seeds.remove(&seed_id)
    }

    pub fn base_seed(&self, seed_id: u64) -> Option<&SeedRecord> {
        self.seeds.get(&seed_id)
    }

    pub fn upsert_pool(&mut self, record: PoolRecord) {
        self.pools.insert(record.id, record);
    }

    pub fn remove_pool(&mut self, pool_id: u64) -> Option<PoolRecord> {
        self.pools.remove(&pool_id)
    }

    pub fn pool(&self, pool_id: u64) -> Option<&PoolRecord> {
        self.pools.get(&pool_id)
    }

    // ── Mutations ──────────────────────────────────────────────────

    pub fn push_set_mutation(&mut self, mutation: SetMutation) {
        self.set_mutations
            .entry(mutation.set_id)
            .or_default()
            .insert(mutation.number, mutation);
    }

    /// Like `push_set_mutation`, but folds into an existing mutation with
    /// the same owning transaction instead of replacing it. Used when one
    /// transaction touches the same set through several paths.
    pub fn merge_set_mutation(&mut self, mutation: SetMutation) {
        let log = self.set_mutations.entry(mutation.set_id).or_default();
        match log.get_mut(&mutation.number) {
            Some(existing) => existing.merge_from(&mutation),
            None => {
                log.insert(mutation.number, mutation);
            }
        }
    }

    pub fn push_seed_mutation(&mut self, mutation: SeedMutation) {
        self.seed_mutations
            .entry(mutation.seed_id)
            .or_default()
            .insert(mutation.number, mutation);
    }

    pub fn set_mutation(&self, set_id: u64, number: u64) -> Option<&SetMutation> {
        self.set_mutations.get(&set_id)?.get(&number)
    }

    pub fn set_mutation_mut(&mut self, set_id: u64, number: u64) -> Option<&mut SetMutation> {
        self.set_mutations.get_mut(&set_id)?.get_mut(&number)
    }

    /// Deletes every mutation owned by one transaction, across all records.
    pub fn delete_mutations_for_txn(&mut self, number: u64) {
        for log in self.set_mutations.values_mut() {
            log.remove(&number);
        }
        for log in self.seed_mutations.values_mut() {
            log.remove(&number);
        }
    }

    pub fn has_pending_edits(&self, set_id: u64) -> bool {
        self.set_mutations
            .get(&set_id)
            .map(|log| !log.is_empty())
            .unwrap_or(false)
    }

    pub fn sets_with_pending_edits(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .set_mutations
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ── Materialized views ─────────────────────────────────────────

    pub fn set_view(&self, set_id: u64) -> Option<SetRecord> {
        let base = self.sets.get(&set_id)?;
        let current = match self.set_mutations.get(&set_id) {
            Some(log) => materialize_set(base, log.values()),
            None => base.clone(),
        };
        Some(current)
    }

    /// Materializes only mutations strictly earlier than `before_number`,
    /// the view a transaction saw when it was recorded.
    pub fn set_view_before(&self, set_id: u64, before_number: u64) -> Option<SetRecord> {
        let base = self.sets.get(&set_id)?;
        let current = match self.set_mutations.get(&set_id) {
            Some(log) => materialize_set(base, log.range(..before_number).map(|(_, m)| m)),
            None => base.clone(),
        };
        Some(current)
    }

    pub fn seed_view(&self, seed_id: u64) -> Option<SeedRecord> {
        let base = self.seeds.get(&seed_id)?;
        let current = match self.seed_mutations.get(&seed_id) {
            Some(log) => materialize_seed(base, log.values()),
            None => base.clone(),
        };
        Some(current)
    }

    /// Every intermediate state of one set's replay, oldest first, for
    /// conflict resolution display.
    pub fn set_replay_states(&self, set_id: u64) -> Option<Vec<(u64, SetRecord)>> {
        let base = self.sets.get(&set_id)?;
        let mut out = Vec::new();
        let mut current = base.clone();
        if let Some(log) = self.set_mutations.get(&set_id) {
            for (number, mutation) in log {
                current = materialize_set(&current, std::iter::once(mutation));
                out.push((*number, current.clone()));
            }
        }
        Some(out)
    }

    pub fn all_set_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sets.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn all_seed_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.seeds.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn all_pool_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pools.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SetState;

    fn make_base_set(id: u64) -> SetRecord {
        SetRecord {
            id,
            pool_id: 1,
            round: 1,
            full_round_text: "Winners Round 1".to_string(),
            preview: false,
            slot_one_prereq: None,
            slot_two_prereq: None,
            winner_target: None,
            loser_target: None,
            state: SetState::Pending,
            slot_one_entrant: Some(10),
            slot_two_entrant: Some(20),
            slot_one_score: None,
            slot_two_score: None,
            winner_id: None,
            loser_id: None,
            started_at_ms: None,
            completed_at_ms: None,
            station_id: Some(3),
            stream_id: None,
            games: Vec::new(),
            updated_at_ms: 100,
        }
    }

    #[test]
    fn test_materialize_applies_in_txn_order() {
        let base = make_base_set(1);
        let mut store = OverlayStore::new();
        store.upsert_set(base.clone());

        let mut first = SetMutation::new(1, 1);
        first.state = FieldPatch::Set(SetState::Called);
        first.station_id = FieldPatch::Set(Some(7));
        let mut second = SetMutation::new(1, 2);
        second.state = FieldPatch::Set(SetState::Started);

        // Insert out of order; replay must still follow transaction numbers.
        store.push_set_mutation(second);
        store.push_set_mutation(first);

        let view = store.set_view(1).unwrap();
        assert_eq!(view.state, SetState::Started);
        assert_eq!(view.station_id, Some(7));

        // Replaying the same log twice is idempotent.
        let again = store.set_view(1).unwrap();
        assert_eq!(view, again);
    }

    #[test]
    fn test_set_none_distinct_from_keep() {
        let base = make_base_set(1);

        let mut clear = SetMutation::new(1, 1);
        clear.station_id = FieldPatch::Set(None);
        let cleared = materialize_set(&base, std::iter::once(&clear));
        assert_eq!(cleared.station_id, None);

        let keep = SetMutation::new(1, 2);
        let kept = materialize_set(&base, std::iter::once(&keep));
        assert_eq!(kept.station_id, Some(3));
    }

    #[test]
    fn test_view_before_excludes_later_mutations() {
        let mut store = OverlayStore::new();
        store.upsert_set(make_base_set(1));

        let mut first = SetMutation::new(1, 5);
        first.state = FieldPatch::Set(SetState::Called);
        let mut second = SetMutation::new(1, 9);
        second.state = FieldPatch::Set(SetState::Completed);
        second.winner_id = FieldPatch::Set(Some(10));
        store.push_set_mutation(first);
        store.push_set_mutation(second);

        let before = store.set_view_before(1, 9).unwrap();
        assert_eq!(before.state, SetState::Called);
        assert_eq!(before.winner_id, None);

        let full = store.set_view(1).unwrap();
        assert_eq!(full.state, SetState::Completed);
    }

    #[test]
    fn test_delete_mutations_for_txn() {
        let mut store = OverlayStore::new();
        store.upsert_set(make_base_set(1));
        let mut m = SetMutation::new(1, 4);
        m.state = FieldPatch::Set(SetState::Called);
        store.push_set_mutation(m);
        assert!(store.has_pending_edits(1));

        store.delete_mutations_for_txn(4);
        assert!(!store.has_pending_edits(1));
        assert_eq!(store.set_view(1).unwrap().state, SetState::Pending);
    }
}
