use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::engine::BracketEngine;
use crate::error::ActionError;
use crate::overlay::{FieldPatch, SeedMutation, SetMutation};
use crate::standings::round_robin_standings;
use crate::types::{
    BracketKind, PrereqCondition, PrereqKind, SetRecord, SetState, CASCADE_SAFETY_LIMIT,
};

// ── Downstream discovery ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotTarget {
    pub set_id: u64,
    pub slot: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DownstreamTargets {
    pub winner: Option<SlotTarget>,
    pub loser: Option<SlotTarget>,
}

fn prereq_claims_side(
    set: &SetRecord,
    prereq: &crate::types::PrereqDescriptor,
    condition: PrereqCondition,
) -> bool {
    match prereq.kind {
        PrereqKind::Set => prereq.referenced_id == set.id && prereq.condition == condition,
        PrereqKind::Seed => {
            let target = match condition {
                PrereqCondition::Winner => set.winner_target.as_ref(),
                PrereqCondition::Loser => set.loser_target.as_ref(),
                PrereqCondition::None => None,
            };
            target.map(|t| t.seed_id) == Some(prereq.referenced_id)
        }
    }
}

impl BracketEngine {
    /// Finds the at-most-one downstream set fed by this set's winner and
    /// the at-most-one fed by its loser. Two sets claiming the same side
    /// is a modeling bug in the bracket graph.
    pub(crate) fn find_downstream(&self, set: &SetRecord) -> Result<DownstreamTargets, ActionError> {
        let mut targets = DownstreamTargets::default();
        for candidate in self.store.sets.values() {
            if candidate.id == set.id {
                continue;
            }
            for (slot, prereq) in [
                (0usize, candidate.slot_one_prereq.as_ref()),
                (1usize, candidate.slot_two_prereq.as_ref()),
            ] {
                let Some(prereq) = prereq else { continue };
                if prereq_claims_side(set, prereq, PrereqCondition::Winner) {
                    if targets.winner.is_some() {
                        return Err(ActionError::Invariant {
                            set_id: set.id,
                            message: format!(
                                "two sets claim the winner progression (second: {})",
                                candidate.id
                            ),
                        });
                    }
                    targets.winner = Some(SlotTarget {
                        set_id: candidate.id,
                        slot,
                    });
                } else if prereq_claims_side(set, prereq, PrereqCondition::Loser) {
                    if targets.loser.is_some() {
                        return Err(ActionError::Invariant {
                            set_id: set.id,
                            message: format!(
                                "two sets claim the loser progression (second: {})",
                                candidate.id
                            ),
                        });
                    }
                    targets.loser = Some(SlotTarget {
                        set_id: candidate.id,
                        slot,
                    });
                }
            }
        }
        Ok(targets)
    }

    /// Sets fed by one seed's resolution.
    fn seed_fed_targets(&self, seed_id: u64) -> Vec<SlotTarget> {
        let mut out = Vec::new();
        for candidate in self.store.sets.values() {
            for (slot, prereq) in [
                (0usize, candidate.slot_one_prereq.as_ref()),
                (1usize, candidate.slot_two_prereq.as_ref()),
            ] {
                if let Some(prereq) = prereq {
                    if prereq.kind == PrereqKind::Seed && prereq.referenced_id == seed_id {
                        out.push(SlotTarget {
                            set_id: candidate.id,
                            slot,
                        });
                    }
                }
            }
        }
        out.sort_by_key(|t| (t.set_id, t.slot));
        out
    }

    /// Every slot target invalidated when `set_id` is reset: its own
    /// winner/loser progression plus, for a round robin pool, the slots
    /// fed by the pool's graduation seeds.
    fn reset_targets_of(&self, set_id: u64) -> Result<Vec<SlotTarget>, ActionError> {
        let Some(base) = self.store.base_set(set_id) else {
            return Ok(Vec::new());
        };
        let base = base.clone();
        let targets = self.find_downstream(&base)?;
        let mut out = Vec::new();
        if let Some(t) = targets.winner {
            out.push(t);
        }
        if let Some(t) = targets.loser {
            out.push(t);
        }
        if self.pool_is_round_robin(base.pool_id) {
            for seed in self.origin_seeds_of_pool(base.pool_id) {
                out.extend(self.seed_fed_targets(seed));
            }
        }
        Ok(out)
    }

    fn pool_is_round_robin(&self, pool_id: u64) -> bool {
        self.store
            .pool(pool_id)
            .map(|p| p.bracket == BracketKind::RoundRobin)
            .unwrap_or(false)
    }

    /// Seed ids that graduate out of the given pool (their origin pool
    /// back-reference points here).
    fn origin_seeds_of_pool(&self, pool_id: u64) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .store
            .seeds
            .values()
            .filter(|s| s.origin_pool_id == Some(pool_id))
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ── Reset dependents ───────────────────────────────────────────

    /// Walks the progression graph from `set_id` and collects every
    /// downstream set that already progressed past PENDING. Iterative
    /// worklist with a visited set; the graph is expected acyclic but
    /// a cycle must not hang us.
    pub(crate) fn check_reset_dependents(&self, set_id: u64) -> Result<Vec<u64>, ActionError> {
        let mut dependents = Vec::new();
        let mut visited: HashSet<u64> = HashSet::from([set_id]);
        let mut worklist = vec![set_id];
        let mut safety = 0usize;

        while let Some(current) = worklist.pop() {
            safety += 1;
            if safety > CASCADE_SAFETY_LIMIT {
                return Err(ActionError::Invariant {
                    set_id,
                    message: "reset dependent discovery exceeded safety limit".to_string(),
                });
            }
            for target in self.reset_targets_of(current)? {
                if !visited.insert(target.set_id) {
                    continue;
                }
                let Some(view) = self.store.set_view(target.set_id) else {
                    continue;
                };
                if view.state != SetState::Pending {
                    dependents.push(target.set_id);
                    worklist.push(target.set_id);
                }
            }
        }
        dependents.sort_unstable();
        Ok(dependents)
    }

    /// Same walk against authoritative base records only, ignoring the
    /// local overlay. Used when judging a queued reset against fresh
    /// remote data, where the local cascade already shows PENDING.
    pub(crate) fn check_reset_dependents_base(&self, set_id: u64) -> Result<Vec<u64>, ActionError> {
        let mut dependents = Vec::new();
        let mut visited: HashSet<u64> = HashSet::from([set_id]);
        let mut worklist = vec![set_id];
        let mut safety = 0usize;

        while let Some(current) = worklist.pop() {
            safety += 1;
            if safety > CASCADE_SAFETY_LIMIT {
                return Err(ActionError::Invariant {
                    set_id,
                    message: "reset dependent discovery exceeded safety limit".to_string(),
                });
            }
            for target in self.reset_targets_of(current)? {
                if !visited.insert(target.set_id) {
                    continue;
                }
                let Some(base) = self.store.base_set(target.set_id) else {
                    continue;
                };
                if base.state != SetState::Pending {
                    dependents.push(target.set_id);
                    worklist.push(target.set_id);
                }
            }
        }
        dependents.sort_unstable();
        Ok(dependents)
    }

    // ── Report propagation ─────────────────────────────────────────

    /// Pushes a completed set's winner and loser into their downstream
    /// slots and progression seeds, then re-evaluates round robin
    /// graduation for the pool. First-time reports only.
    pub(crate) fn propagate_report(
        &mut self,
        set_id: u64,
        winner_id: u32,
        loser_id: u32,
        number: u64,
    ) -> Result<(), ActionError> {
        let Some(base) = self.store.base_set(set_id).cloned() else {
            return Err(ActionError::UnknownSet(set_id));
        };
        let view = self.set_view(set_id)?;

        // A grand final taken by the winners-side entrant (slot one) ends
        // the bracket: the loser does not progress into a reset.
        let skip_loser = base.is_grand_final() && view.slot_one_entrant == Some(winner_id);

        let targets = self.find_downstream(&base)?;
        if let Some(target) = base.winner_target.as_ref() {
            self.write_seed_entrant(target.seed_id, Some(winner_id), number, false);
        }
        if let Some(slot_target) = targets.winner {
            self.write_slot_entrant(slot_target, Some(winner_id), number);
        }
        if !skip_loser {
            if let Some(target) = base.loser_target.as_ref() {
                self.write_seed_entrant(target.seed_id, Some(loser_id), number, false);
            }
            if let Some(slot_target) = targets.loser {
                self.write_slot_entrant(slot_target, Some(loser_id), number);
            }
        }

        if self.pool_is_round_robin(base.pool_id) {
            self.resolve_round_robin_pool(base.pool_id, number)?;
        }
        Ok(())
    }

    fn write_slot_entrant(&mut self, target: SlotTarget, entrant: Option<u32>, number: u64) {
        let Some(view) = self.store.set_view(target.set_id) else {
            return;
        };
        if view.state != SetState::Pending {
            warn!(
                "skipping progression into set {} slot {}: already {:?}",
                target.set_id, target.slot, view.state
            );
            return;
        }
        let mut mutation = SetMutation::new(target.set_id, number);
        *mutation.slot_entrant_patch(target.slot) = FieldPatch::Set(entrant);
        self.store.merge_set_mutation(mutation);
    }

    fn write_seed_entrant(
        &mut self,
        seed_id: u64,
        entrant: Option<u32>,
        number: u64,
        requires_remote_patch: bool,
    ) {
        if self.store.base_seed(seed_id).is_none() {
            warn!("progression references unknown seed {seed_id}");
            return;
        }
        self.store.push_seed_mutation(SeedMutation {
            seed_id,
            number,
            entrant_id: FieldPatch::Set(entrant),
            requires_remote_patch,
        });
    }

    // ── Round robin graduation ─────────────────────────────────────

    /// When every set in a round robin pool is complete, ranks the pool
    /// and resolves every seed graduating out of it; placements computed
    /// locally must also be patched on the remote side.
    pub(crate) fn resolve_round_robin_pool(
        &mut self,
        pool_id: u64,
        number: u64,
    ) -> Result<(), ActionError> {
        let Some(pool) = self.store.pool(pool_id).cloned() else {
            return Ok(());
        };
        if pool.bracket != BracketKind::RoundRobin {
            return Ok(());
        }

        let pool_sets: Vec<SetRecord> = self
            .store
            .all_set_ids()
            .into_iter()
            .filter_map(|id| self.store.set_view(id))
            .filter(|s| s.pool_id == pool_id && !s.preview)
            .collect();
        if pool_sets.is_empty() || pool_sets.iter().any(|s| s.state != SetState::Completed) {
            return Ok(());
        }

        let mut seed_numbers: HashMap<u32, u32> = HashMap::new();
        for seed_id in self.store.all_seed_ids() {
            let Some(seed) = self.store.seed_view(seed_id) else {
                continue;
            };
            if seed.pool_id == pool_id {
                if let Some(entrant) = seed.entrant_id {
                    seed_numbers.entry(entrant).or_insert(seed.seed_num);
                }
            }
        }

        let standings = round_robin_standings(&pool_sets, &seed_numbers, &pool.tiebreaks);
        info!("round robin pool {pool_id} complete; standings {standings:?}");

        for seed_id in self.origin_seeds_of_pool(pool_id) {
            let Some(seed) = self.store.base_seed(seed_id).cloned() else {
                continue;
            };
            let Some(placement) = seed.origin_placement else {
                continue;
            };
            let entrant = placement
                .checked_sub(1)
                .and_then(|rank| standings.get(rank as usize))
                .copied();
            self.write_seed_entrant(seed_id, entrant, number, true);
            for slot_target in self.seed_fed_targets(seed_id) {
                self.write_slot_entrant(slot_target, entrant, number);
            }
        }
        Ok(())
    }

    // ── Reset cascade ──────────────────────────────────────────────

    /// Clears everything downstream of a reset set. Pending dependents
    /// get their fed slot nulled; progressed dependents (only reachable
    /// with preempt, the caller already vetoed otherwise) are themselves
    /// reset and walked further. Returns the ids of cascaded resets.
    pub(crate) fn apply_reset_cascade(
        &mut self,
        root_set_id: u64,
        number: u64,
    ) -> Result<Vec<u64>, ActionError> {
        let mut cascaded = Vec::new();
        let mut visited: HashSet<u64> = HashSet::from([root_set_id]);
        let mut worklist = vec![root_set_id];
        let mut safety = 0usize;

        while let Some(current) = worklist.pop() {
            safety += 1;
            if safety > CASCADE_SAFETY_LIMIT {
                return Err(ActionError::Invariant {
                    set_id: root_set_id,
                    message: "reset cascade exceeded safety limit".to_string(),
                });
            }

            let Some(base) = self.store.base_set(current).cloned() else {
                continue;
            };
            let targets = self.find_downstream(&base)?;
            if let Some(target) = base.winner_target.as_ref() {
                self.write_seed_entrant(target.seed_id, None, number, false);
            }
            if let Some(target) = base.loser_target.as_ref() {
                self.write_seed_entrant(target.seed_id, None, number, false);
            }

            let mut slot_targets = Vec::new();
            if let Some(t) = targets.winner {
                slot_targets.push(t);
            }
            if let Some(t) = targets.loser {
                slot_targets.push(t);
            }
            if self.pool_is_round_robin(base.pool_id) {
                // The pool is no longer complete: unresolve its graduation
                // seeds and pull entrants back out of the fed slots.
                for seed_id in self.origin_seeds_of_pool(base.pool_id) {
                    let resolved = self
                        .store
                        .seed_view(seed_id)
                        .map(|s| s.entrant_id.is_some())
                        .unwrap_or(false);
                    if !resolved {
                        continue;
                    }
                    self.write_seed_entrant(seed_id, None, number, true);
                    slot_targets.extend(self.seed_fed_targets(seed_id));
                }
            }

            for target in slot_targets {
                if !visited.insert(target.set_id) {
                    continue;
                }
                let Some(view) = self.store.set_view(target.set_id) else {
                    continue;
                };
                if view.state == SetState::Pending {
                    let mut mutation = SetMutation::new(target.set_id, number);
                    *mutation.slot_entrant_patch(target.slot) = FieldPatch::Set(None);
                    self.store.merge_set_mutation(mutation);
                } else {
                    // Re-validated through its own materialized view, then
                    // reset in full and walked like any other reset set.
                    let mut mutation = reset_mutation(target.set_id, number);
                    *mutation.slot_entrant_patch(target.slot) = FieldPatch::Set(None);
                    self.store.merge_set_mutation(mutation);
                    cascaded.push(target.set_id);
                    worklist.push(target.set_id);
                }
            }
        }
        cascaded.sort_unstable();
        Ok(cascaded)
    }
}

/// The overlay delta that returns a set to PENDING. The started-at stamp
/// survives, matching how the remote resets a set.
pub(crate) fn reset_mutation(set_id: u64, number: u64) -> SetMutation {
    let mut mutation = SetMutation::new(set_id, number);
    mutation.state = FieldPatch::Set(SetState::Pending);
    mutation.slot_one_score = FieldPatch::Set(None);
    mutation.slot_two_score = FieldPatch::Set(None);
    mutation.winner_id = FieldPatch::Set(None);
    mutation.loser_id = FieldPatch::Set(None);
    mutation.completed_at_ms = FieldPatch::Set(None);
    mutation.games = FieldPatch::Set(Vec::new());
    mutation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::types::{PoolRecord, SeedRecord, TiebreakKind};

    /// Round robin pool 2 with entrants 1..=3 graduating its winner into
    /// the double elimination pool through seed 13, which feeds set 31.
    fn make_rr_engine() -> BracketEngine {
        let mut engine = BracketEngine::new();
        engine.store.upsert_pool(PoolRecord {
            id: 2,
            name: "Pool A".to_string(),
            bracket: BracketKind::RoundRobin,
            tiebreaks: vec![
                TiebreakKind::SetWins,
                TiebreakKind::GameWinRatio,
                TiebreakKind::HeadToHead,
            ],
            updated_at_ms: 0,
        });
        engine.store.upsert_pool(PoolRecord {
            id: 1,
            name: "Top Bracket".to_string(),
            bracket: BracketKind::DoubleElimination,
            tiebreaks: Vec::new(),
            updated_at_ms: 0,
        });

        for (id, seed_num, entrant) in [(1u64, 1u32, 1u32), (2, 2, 2), (3, 3, 3)] {
            engine.store.upsert_seed(SeedRecord {
                id,
                pool_id: 2,
                seed_num,
                entrant_id: Some(entrant),
                origin_placement: None,
                origin_pool_id: None,
                updated_at_ms: 0,
            });
        }
        // Graduation seed: first place of pool 2.
        engine.store.upsert_seed(SeedRecord {
            id: 13,
            pool_id: 1,
            seed_num: 1,
            entrant_id: None,
            origin_placement: Some(1),
            origin_pool_id: Some(2),
            updated_at_ms: 0,
        });

        let pairings = [(21u64, 1u32, 2u32), (22, 1, 3), (23, 2, 3)];
        for (id, one, two) in pairings {
            let mut set = make_set(id, 1, "Round Robin");
            set.pool_id = 2;
            set.slot_one_entrant = Some(one);
            set.slot_two_entrant = Some(two);
            engine.store.upsert_set(set);
        }

        let mut fed = make_set(31, 1, "Winners Round 1");
        fed.slot_one_prereq = Some(crate::types::PrereqDescriptor {
            kind: PrereqKind::Seed,
            referenced_id: 13,
            condition: PrereqCondition::None,
            display_text: Some("Pool A winner".to_string()),
        });
        fed.slot_two_entrant = Some(9);
        engine.store.upsert_set(fed);
        engine
    }

    #[test]
    fn test_round_robin_completion_resolves_graduation_seed() {
        let mut engine = make_rr_engine();
        engine.report_set(21, 1, false, make_games(&[1, 1]), 10).unwrap();
        engine.report_set(22, 1, false, make_games(&[1, 1]), 11).unwrap();
        assert_eq!(engine.seed_view(13).unwrap().entrant_id, None);

        engine.report_set(23, 2, false, make_games(&[2, 2]), 12).unwrap();

        // Entrant 1 swept the pool and graduates.
        assert_eq!(engine.seed_view(13).unwrap().entrant_id, Some(1));
        assert_eq!(engine.set_view(31).unwrap().slot_one_entrant, Some(1));
    }

    #[test]
    fn test_resetting_pool_set_pulls_graduation_back() {
        let mut engine = make_rr_engine();
        engine.report_set(21, 1, false, make_games(&[1, 1]), 10).unwrap();
        engine.report_set(22, 1, false, make_games(&[1, 1]), 11).unwrap();
        engine.report_set(23, 2, false, make_games(&[2, 2]), 12).unwrap();
        assert_eq!(engine.set_view(31).unwrap().slot_one_entrant, Some(1));

        // The fed set never progressed, so no preempt is needed.
        engine.reset_set(23, false, 20).unwrap();

        assert_eq!(engine.seed_view(13).unwrap().entrant_id, None);
        assert_eq!(engine.set_view(31).unwrap().slot_one_entrant, None);
    }

    #[test]
    fn test_grand_final_won_from_winners_side_skips_loser() {
        let mut engine = make_bracket_engine();
        let mut gf = make_set(5, 3, "Grand Final");
        gf.slot_one_entrant = Some(10);
        gf.slot_two_entrant = Some(30);
        let mut reset = make_set(6, 4, "Grand Final Reset");
        reset.slot_one_prereq = set_prereq(5, PrereqCondition::Winner);
        reset.slot_two_prereq = set_prereq(5, PrereqCondition::Loser);
        engine.store.upsert_set(gf);
        engine.store.upsert_set(reset);

        engine.report_set(5, 10, false, make_games(&[10, 10, 10]), 50).unwrap();

        let bracket_reset = engine.set_view(6).unwrap();
        assert_eq!(bracket_reset.slot_one_entrant, Some(10));
        // Winners-side victory ends the bracket: the loser never lands in
        // the reset set.
        assert_eq!(bracket_reset.slot_two_entrant, None);
    }

    #[test]
    fn test_grand_final_won_from_losers_side_progresses_both() {
        let mut engine = make_bracket_engine();
        let mut gf = make_set(5, 3, "Grand Final");
        gf.slot_one_entrant = Some(10);
        gf.slot_two_entrant = Some(30);
        let mut reset = make_set(6, 4, "Grand Final Reset");
        reset.slot_one_prereq = set_prereq(5, PrereqCondition::Winner);
        reset.slot_two_prereq = set_prereq(5, PrereqCondition::Loser);
        engine.store.upsert_set(gf);
        engine.store.upsert_set(reset);

        engine.report_set(5, 30, false, make_games(&[30, 30, 30]), 50).unwrap();

        let bracket_reset = engine.set_view(6).unwrap();
        assert_eq!(bracket_reset.slot_one_entrant, Some(30));
        assert_eq!(bracket_reset.slot_two_entrant, Some(10));
    }

    #[test]
    fn test_duplicate_progression_claim_is_invariant_violation() {
        let mut engine = make_bracket_engine();
        let mut extra = make_set(7, 2, "Winners Final");
        extra.slot_one_prereq = set_prereq(1, PrereqCondition::Winner);
        engine.store.upsert_set(extra);

        let err = engine.report_set(1, 10, false, make_games(&[10, 10]), 50).unwrap_err();
        assert!(matches!(err, ActionError::Invariant { set_id: 1, .. }));
    }
}
