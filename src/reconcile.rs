use tracing::{error, info, warn};

use crate::actions::games_detail_removed;
use crate::engine::BracketEngine;
use crate::error::ReconcileError;
use crate::txn::{ActionKind, ConflictReason, ReportPayload, Transaction};
use crate::types::{SetRecord, SetState, STREAM_CLEAR_ID};

// ── Classification ─────────────────────────────────────────────────────

/// How one queued transaction relates to fresh authoritative data.
/// AHEAD: local intent the remote has not seen, keep it queued.
/// BEHIND: the remote already reflects it, delete it silently.
/// CONFLICT: the remote contradicts it, hold for operator decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Ahead,
    Behind,
    Conflict(ConflictReason),
}

impl BracketEngine {
    /// Reconciles every set with queued transactions against the current
    /// base records. A set whose reconciliation violates an invariant is
    /// suspended from further automatic passes rather than corrupted.
    pub fn reconcile_event(&mut self) {
        let mut set_ids: Vec<u64> = self.log.iter().map(|t| t.set_id).collect();
        set_ids.sort_unstable();
        set_ids.dedup();

        for set_id in set_ids {
            if self.suspended.contains(&set_id) {
                warn!("set {set_id} is suspended, skipping reconciliation");
                continue;
            }
            if let Err(err) = self.reconcile_set(set_id) {
                error!("reconciling set {set_id} failed: {err}; suspending the set");
                self.suspended.insert(set_id);
            }
        }
    }

    pub(crate) fn reconcile_set(&mut self, set_id: u64) -> Result<(), ReconcileError> {
        let Some(auth) = self.store.base_set(set_id).cloned() else {
            // The record is gone from the remote; every queued intent for
            // it is undeliverable.
            for number in self.log.numbers_for_set(set_id) {
                warn!("set {set_id} no longer exists, dropping transaction {number}");
                self.drop_transaction(number);
            }
            return Ok(());
        };

        self.coalesce_set(set_id, &auth);
        self.classify_set(set_id, &auth)
    }

    // ── Phase 1: coalescing ────────────────────────────────────────

    /// Collapses redundant queued transactions for one set before
    /// classification: only the latest assignment of each kind survives,
    /// lifecycle actions subsumed by a later report are dropped, resets
    /// made unnecessary by later actions are dropped, and report flags
    /// are renormalized against the authoritative state.
    fn coalesce_set(&mut self, set_id: u64, auth: &SetRecord) {
        self.keep_latest_assignments(set_id);
        self.drop_subsumed_lifecycle(set_id);
        self.drop_redundant_resets(set_id, auth);
        self.normalize_report_flags(set_id, auth);
        self.merge_report_updates(set_id);
    }

    fn keep_latest_assignments(&mut self, set_id: u64) {
        let mut last_station = None;
        let mut last_stream = None;
        for number in self.log.numbers_for_set(set_id) {
            match self.log.get(number).map(|t| &t.kind) {
                Some(ActionKind::AssignStation { .. }) => last_station = Some(number),
                Some(ActionKind::AssignStream { .. }) => last_stream = Some(number),
                _ => {}
            }
        }
        for number in self.log.numbers_for_set(set_id) {
            let superseded = match self.log.get(number).map(|t| &t.kind) {
                Some(ActionKind::AssignStation { .. }) => last_station != Some(number),
                Some(ActionKind::AssignStream { .. }) => last_stream != Some(number),
                _ => false,
            };
            if superseded {
                info!("dropping superseded assignment transaction {number} on set {set_id}");
                self.drop_transaction(number);
            }
        }
    }

    /// A report completes the set whatever its lifecycle state, so queued
    /// calls and starts older than a queued report add nothing. Among the
    /// survivors only the newest call/start matters.
    fn drop_subsumed_lifecycle(&mut self, set_id: u64) {
        let numbers = self.log.numbers_for_set(set_id);
        let last_report = numbers
            .iter()
            .rev()
            .find(|n| matches!(self.log.get(**n).map(|t| &t.kind), Some(ActionKind::Report(_))))
            .copied();
        let last_lifecycle = numbers
            .iter()
            .rev()
            .find(|n| {
                matches!(
                    self.log.get(**n).map(|t| &t.kind),
                    Some(ActionKind::Call) | Some(ActionKind::Start)
                )
            })
            .copied();

        for number in numbers {
            let is_lifecycle = matches!(
                self.log.get(number).map(|t| &t.kind),
                Some(ActionKind::Call) | Some(ActionKind::Start)
            );
            if !is_lifecycle {
                continue;
            }
            let older_than_report = last_report.map(|r| number < r).unwrap_or(false);
            if older_than_report || last_lifecycle != Some(number) {
                info!("dropping subsumed lifecycle transaction {number} on set {set_id}");
                self.drop_transaction(number);
            }
        }
    }

    /// A queued reset exists to let a later action re-apply. When that
    /// later action could be pushed from the authoritative state as it
    /// stands, the reset itself is dead weight.
    fn drop_redundant_resets(&mut self, set_id: u64, auth: &SetRecord) {
        let numbers = self.log.numbers_for_set(set_id);
        for (idx, number) in numbers.iter().enumerate() {
            if !matches!(
                self.log.get(*number).map(|t| &t.kind),
                Some(ActionKind::Reset { .. })
            ) {
                continue;
            }
            let mut droppable = false;
            for later in &numbers[idx + 1..] {
                droppable = match self.log.get(*later).map(|t| &t.kind) {
                    Some(ActionKind::Report(_)) => true,
                    Some(ActionKind::Call) => {
                        matches!(auth.state, SetState::Pending | SetState::Started)
                    }
                    Some(ActionKind::Start) => {
                        matches!(auth.state, SetState::Pending | SetState::Called)
                    }
                    _ => continue,
                };
                break;
            }
            if droppable {
                info!("dropping redundant reset transaction {number} on set {set_id}");
                self.drop_transaction(*number);
            }
        }
    }

    /// A first-time report against a remotely-completed set with the same
    /// winner is really an update; an update whose completed premise is
    /// gone reverts to a first-time report.
    fn normalize_report_flags(&mut self, set_id: u64, auth: &SetRecord) {
        let has_reset = self.log.numbers_for_set(set_id).iter().any(|n| {
            matches!(
                self.log.get(*n).map(|t| &t.kind),
                Some(ActionKind::Reset { .. })
            )
        });
        let mut seen_report = false;
        for number in self.log.numbers_for_set(set_id) {
            let Some(txn) = self.log.get_mut(number) else {
                continue;
            };
            let ActionKind::Report(payload) = &mut txn.kind else {
                continue;
            };
            let first = !seen_report;
            seen_report = true;
            if !first {
                continue;
            }
            if !payload.is_update
                && !has_reset
                && auth.state == SetState::Completed
                && auth.winner_id == Some(payload.winner_id)
            {
                info!("report transaction {number} on set {set_id} becomes an update");
                payload.is_update = true;
            } else if payload.is_update && !has_reset && auth.state != SetState::Completed {
                info!("update transaction {number} on set {set_id} reverts to a report");
                payload.is_update = false;
            }
        }
    }

    /// Folds every queued update into the oldest surviving report (or the
    /// oldest update, when no first-time report remains): the carrier
    /// keeps the latest per-game results and absorbs the later mutations.
    fn merge_report_updates(&mut self, set_id: u64) {
        let mut carrier: Option<u64> = None;
        let mut absorbed: Vec<u64> = Vec::new();
        for number in self.log.numbers_for_set(set_id) {
            let Some(ActionKind::Report(payload)) = self.log.get(number).map(|t| &t.kind) else {
                continue;
            };
            match carrier {
                None => carrier = Some(number),
                Some(_) if payload.is_update => absorbed.push(number),
                Some(_) => {}
            }
        }
        let Some(carrier) = carrier else { return };

        for number in absorbed {
            let Some(ActionKind::Report(payload)) = self.log.get(number).map(|t| t.kind.clone())
            else {
                continue;
            };
            if let Some(mutation) = self.store.set_mutation(set_id, number).cloned() {
                if let Some(target) = self.store.set_mutation_mut(set_id, carrier) {
                    target.merge_from(&mutation);
                }
            }
            if let Some(ActionKind::Report(target)) =
                self.log.get_mut(carrier).map(|t| &mut t.kind)
            {
                if !payload.games.is_empty() {
                    target.games = payload.games;
                }
            }
            info!("merging update transaction {number} into {carrier} on set {set_id}");
            self.drop_transaction(number);
        }
    }

    // ── Phase 2: classification ────────────────────────────────────

    fn classify_set(&mut self, set_id: u64, auth: &SetRecord) -> Result<(), ReconcileError> {
        let mut contains_valid_reset = false;
        for number in self.log.numbers_for_set(set_id) {
            let Some(txn) = self.log.get(number).cloned() else {
                continue;
            };
            let verdict = self.classify(&txn, auth, contains_valid_reset)?;
            match verdict {
                Verdict::Ahead => {
                    if matches!(txn.kind, ActionKind::Reset { .. }) {
                        contains_valid_reset = true;
                    }
                    if let Some(txn) = self.log.get_mut(number) {
                        txn.clear_conflict();
                    }
                }
                Verdict::Behind => {
                    info!("transaction {number} on set {set_id} is behind the remote, dropping");
                    self.drop_transaction(number);
                }
                Verdict::Conflict(reason) => {
                    warn!("transaction {number} on set {set_id} conflicts: {reason:?}");
                    if let Some(txn) = self.log.get_mut(number) {
                        txn.mark_conflict(reason);
                    }
                }
            }
        }
        Ok(())
    }

    fn classify(
        &self,
        txn: &Transaction,
        auth: &SetRecord,
        contains_valid_reset: bool,
    ) -> Result<Verdict, ReconcileError> {
        Ok(match &txn.kind {
            ActionKind::AssignStation { station_id } => {
                if auth.station_id == Some(*station_id) {
                    Verdict::Behind
                } else {
                    Verdict::Ahead
                }
            }
            ActionKind::AssignStream { stream_id } => {
                let target = (*stream_id != STREAM_CLEAR_ID).then_some(*stream_id);
                if auth.stream_id == target {
                    Verdict::Behind
                } else {
                    Verdict::Ahead
                }
            }
            ActionKind::Reset { .. } => {
                let dependents = self.check_reset_dependents_base(txn.set_id)?;
                if !dependents.is_empty() {
                    Verdict::Conflict(ConflictReason::ResetDependentSets)
                } else if auth.state == SetState::Pending {
                    Verdict::Behind
                } else {
                    Verdict::Ahead
                }
            }
            ActionKind::Call => self.classify_lifecycle(txn, auth, SetState::Called, contains_valid_reset),
            ActionKind::Start => {
                self.classify_lifecycle(txn, auth, SetState::Started, contains_valid_reset)
            }
            ActionKind::Report(payload) if payload.is_update => {
                self.classify_update(payload, auth)
            }
            ActionKind::Report(payload) => {
                self.classify_report(txn, payload, auth, contains_valid_reset)
            }
        })
    }

    /// True when the locally replayed state just before this transaction
    /// no longer resolves both opponents.
    fn slots_unresolved_before(&self, txn: &Transaction) -> bool {
        self.store
            .set_view_before(txn.set_id, txn.number)
            .map(|view| !view.has_both_entrants())
            .unwrap_or(true)
    }

    fn classify_lifecycle(
        &self,
        txn: &Transaction,
        auth: &SetRecord,
        reached: SetState,
        contains_valid_reset: bool,
    ) -> Verdict {
        if self.slots_unresolved_before(txn) {
            return Verdict::Conflict(ConflictReason::MissingEntrants);
        }
        if auth.state == reached && !contains_valid_reset {
            Verdict::Behind
        } else {
            Verdict::Ahead
        }
    }

    fn classify_report(
        &self,
        txn: &Transaction,
        payload: &ReportPayload,
        auth: &SetRecord,
        contains_valid_reset: bool,
    ) -> Verdict {
        if self.slots_unresolved_before(txn) {
            return Verdict::Conflict(ConflictReason::MissingEntrants);
        }
        if contains_valid_reset {
            // An earlier queued reset will clear the remote result first;
            // this report intentionally rewrites it.
            return Verdict::Ahead;
        }
        if auth.state == SetState::Completed {
            if auth.winner_id != Some(payload.winner_id) {
                return Verdict::Conflict(ConflictReason::ReportCompleted);
            }
            return Verdict::Behind;
        }
        Verdict::Ahead
    }

    fn classify_update(&self, payload: &ReportPayload, auth: &SetRecord) -> Verdict {
        if auth.state != SetState::Completed {
            // normalize_report_flags reverts the flag first; an update
            // reaching here sits behind a queued reset of its own set.
            return Verdict::Ahead;
        }
        if auth.winner_id != Some(payload.winner_id) {
            return Verdict::Conflict(ConflictReason::UpdateChangeWinner);
        }
        if games_detail_removed(&auth.games, &payload.games) {
            return Verdict::Conflict(ConflictReason::UpdateRemoveStagesStocks);
        }
        if payload.is_dq && !auth.has_dq_score() && auth.completed_at_ms.is_some() {
            // The remote recorded a real result; a stale DQ adds nothing.
            return Verdict::Behind;
        }
        if payload.games.is_empty() || payload.games == auth.games {
            Verdict::Behind
        } else {
            Verdict::Ahead
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::types::{PrereqCondition, SetState, StationRecord};

    fn complete_base(engine: &mut BracketEngine, set_id: u64, winner: u32) {
        let mut base = engine.store.base_set(set_id).cloned().unwrap();
        let loser = if base.slot_one_entrant == Some(winner) {
            base.slot_two_entrant
        } else {
            base.slot_one_entrant
        };
        base.state = SetState::Completed;
        base.winner_id = Some(winner);
        base.loser_id = loser;
        base.slot_one_score = Some(if base.slot_one_entrant == Some(winner) { 2 } else { 1 });
        base.slot_two_score = Some(if base.slot_two_entrant == Some(winner) { 2 } else { 1 });
        base.completed_at_ms = Some(99);
        engine.store.upsert_set(base);
    }

    #[test]
    fn test_reset_call_report_coalesces_to_single_update() {
        let mut engine = make_bracket_engine();
        complete_base(&mut engine, 1, 10);

        engine.reset_set(1, false, 10).unwrap();
        engine.call_set(1, 11).unwrap();
        engine.report_set(1, 10, false, make_games(&[10, 10]), 12).unwrap();
        assert_eq!(engine.pending_transaction_count(), 3);

        engine.reconcile_event();

        assert_eq!(engine.pending_transaction_count(), 1);
        let survivor = engine.log.iter().next().unwrap();
        assert_eq!(survivor.kind.label(), "reportUpdate");
        assert!(!survivor.is_conflict);
        assert!(engine.next_push().is_some());
    }

    #[test]
    fn test_behind_station_assignment_dropped_silently() {
        let mut engine = make_bracket_engine();
        engine.register_station(StationRecord {
            id: 2,
            name: "Station 2".to_string(),
            stream_id: None,
        });
        engine.assign_station(1, 2, 10).unwrap();

        // The remote caught up before reconciliation ran.
        let mut base = engine.store.base_set(1).cloned().unwrap();
        base.station_id = Some(2);
        engine.store.upsert_set(base);

        engine.reconcile_event();
        assert_eq!(engine.pending_transaction_count(), 0);
        assert!(!engine.has_pending_edits(1));
        assert_eq!(engine.set_view(1).unwrap().station_id, Some(2));
    }

    #[test]
    fn test_remote_completion_with_other_winner_conflicts() {
        let mut engine = make_bracket_engine();
        engine.report_set(1, 10, false, make_games(&[10, 10]), 10).unwrap();
        complete_base(&mut engine, 1, 20);

        engine.reconcile_event();

        let conflict = engine.current_conflict().unwrap();
        assert_eq!(conflict.reason, ConflictReason::ReportCompleted);
        assert_eq!(conflict.transaction.set_id, 1);
        // The conflicted transaction is retained, not pushed.
        assert_eq!(engine.pending_transaction_count(), 1);
        assert!(engine.next_push().is_none());

        engine.discard_transaction(conflict.transaction.number).unwrap();
        assert_eq!(engine.pending_transaction_count(), 0);
        assert_eq!(engine.set_view(1).unwrap().winner_id, Some(20));
    }

    #[test]
    fn test_call_with_unresolved_slots_conflicts() {
        let mut engine = make_bracket_engine();
        engine.report_set(1, 10, false, make_games(&[10, 10]), 10).unwrap();
        engine.report_set(2, 30, false, make_games(&[30, 30]), 11).unwrap();
        engine.call_set(3, 12).unwrap();

        // Discarding the first report pulls its progression back out, so
        // the queued call no longer resolves both opponents.
        engine.discard_transaction(1).unwrap();
        engine.reconcile_event();

        let conflict = engine.current_conflict().unwrap();
        assert_eq!(conflict.reason, ConflictReason::MissingEntrants);
        assert_eq!(conflict.transaction.set_id, 3);
    }

    #[test]
    fn test_matching_report_is_behind_and_dropped() {
        let mut engine = make_bracket_engine();
        engine.report_set(1, 10, false, make_games(&[10, 10]), 10).unwrap();
        complete_base(&mut engine, 1, 10);
        // Remote already carries richer per-game detail.
        let mut base = engine.store.base_set(1).cloned().unwrap();
        base.games = make_games(&[10, 10]);
        engine.store.upsert_set(base);

        engine.reconcile_event();
        assert_eq!(engine.pending_transaction_count(), 0);
        assert!(!engine.has_pending_edits(1));
    }

    #[test]
    fn test_overturning_report_coalesces_reset_then_conflicts() {
        let mut engine = make_bracket_engine();
        complete_base(&mut engine, 1, 10);

        // Operator overturns the remote result in favor of the other
        // entrant. Re-reporting a completed set is valid upstream, so the
        // reset is redundant, but the winner change still needs an
        // explicit operator decision.
        engine.reset_set(1, false, 10).unwrap();
        engine.report_set(1, 20, false, make_games(&[20, 20]), 11).unwrap();

        engine.reconcile_event();

        assert_eq!(engine.pending_transaction_count(), 1);
        let conflict = engine.current_conflict().unwrap();
        assert_eq!(conflict.reason, ConflictReason::ReportCompleted);
        assert!(engine.next_push().is_none());
    }

    #[test]
    fn test_deleted_record_drops_its_transactions() {
        let mut engine = make_bracket_engine();
        engine.call_set(1, 10).unwrap();
        engine.store.remove_set(1);

        engine.reconcile_event();
        assert_eq!(engine.pending_transaction_count(), 0);
    }

    #[test]
    fn test_invariant_violation_suspends_the_set() {
        let mut engine = make_bracket_engine();
        complete_base(&mut engine, 1, 10);
        engine.reset_set(1, false, 10).unwrap();

        // A later snapshot installs a second claim on set 1's winner, so
        // classifying the queued reset hits the duplicate-claim invariant.
        let mut rogue = make_set(7, 2, "Winners Final");
        rogue.slot_one_prereq = set_prereq(1, PrereqCondition::Winner);
        engine.store.upsert_set(rogue);

        engine.reconcile_event();
        assert_eq!(engine.suspended_sets(), vec![1]);
        // The queued transaction is held as-is, not classified.
        assert_eq!(engine.pending_transaction_count(), 1);
        assert!(!engine.log.iter().next().unwrap().is_conflict);

        // Suspended sets are skipped on later passes.
        engine.reconcile_event();
        assert_eq!(engine.suspended_sets(), vec![1]);
        assert_eq!(engine.pending_transaction_count(), 1);
    }

    #[test]
    fn test_reset_with_remote_progression_conflicts() {
        let mut engine = make_bracket_engine();
        complete_base(&mut engine, 1, 10);
        engine.reset_set(1, false, 10).unwrap();

        // The remote meanwhile progressed the winners final.
        let mut downstream = engine.store.base_set(3).cloned().unwrap();
        downstream.slot_one_entrant = Some(10);
        downstream.slot_two_entrant = Some(30);
        downstream.state = SetState::Started;
        engine.store.upsert_set(downstream);

        engine.reconcile_event();
        let conflict = engine.current_conflict().unwrap();
        assert_eq!(conflict.reason, ConflictReason::ResetDependentSets);
    }
}
