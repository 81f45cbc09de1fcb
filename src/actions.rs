use tracing::info;

use crate::engine::BracketEngine;
use crate::error::ActionError;
use crate::overlay::{FieldPatch, SetMutation};
use crate::progression::reset_mutation;
use crate::txn::{ActionKind, ReportPayload};
use crate::types::{GameResult, SetRecord, SetState, STREAM_CLEAR_ID};

// ── Game-detail comparison ─────────────────────────────────────────────

/// True when `incoming` would erase stage or stock detail already present
/// in `existing` (matched by game number).
pub(crate) fn games_detail_removed(existing: &[GameResult], incoming: &[GameResult]) -> bool {
    for prior in existing {
        let has_detail = prior.stage.is_some()
            || prior.slot_one_stocks.is_some()
            || prior.slot_two_stocks.is_some();
        if !has_detail {
            continue;
        }
        let Some(newer) = incoming.iter().find(|g| g.game_number == prior.game_number) else {
            return true;
        };
        if prior.stage.is_some() && newer.stage.is_none() {
            return true;
        }
        if prior.slot_one_stocks.is_some() && newer.slot_one_stocks.is_none() {
            return true;
        }
        if prior.slot_two_stocks.is_some() && newer.slot_two_stocks.is_none() {
            return true;
        }
    }
    false
}

fn games_won_by(games: &[GameResult], entrant: u32) -> i32 {
    games
        .iter()
        .filter(|g| g.winner_id == Some(entrant))
        .count() as i32
}

// ── Action handlers ────────────────────────────────────────────────────

impl BracketEngine {
    /// Marks a set as called to its station. Also stamps started-at, the
    /// way the remote records a call.
    pub fn call_set(&mut self, set_id: u64, now_ms: u64) -> Result<SetRecord, ActionError> {
        let view = self.set_view(set_id)?;
        match view.state {
            SetState::Completed => {
                return Err(ActionError::precondition(set_id, "Set is already completed."))
            }
            SetState::Called => {
                return Err(ActionError::precondition(set_id, "Set is already called."))
            }
            _ => {}
        }
        if !view.has_both_entrants() {
            return Err(ActionError::precondition(set_id, "Set is missing entrants."));
        }

        let number = self.append_transaction(&view, ActionKind::Call, now_ms);
        let mut mutation = SetMutation::new(set_id, number);
        mutation.state = FieldPatch::Set(SetState::Called);
        mutation.started_at_ms = FieldPatch::Set(Some(now_ms));
        self.store.push_set_mutation(mutation);
        info!("called set {set_id} (txn {number})");
        self.set_view(set_id)
    }

    pub fn start_set(&mut self, set_id: u64, now_ms: u64) -> Result<SetRecord, ActionError> {
        let view = self.set_view(set_id)?;
        match view.state {
            SetState::Completed => {
                return Err(ActionError::precondition(set_id, "Set is already completed."))
            }
            SetState::Started => {
                return Err(ActionError::precondition(set_id, "Set has already started."))
            }
            _ => {}
        }
        if !view.has_both_entrants() {
            return Err(ActionError::precondition(set_id, "Set is missing entrants."));
        }

        let number = self.append_transaction(&view, ActionKind::Start, now_ms);
        let mut mutation = SetMutation::new(set_id, number);
        mutation.state = FieldPatch::Set(SetState::Started);
        mutation.started_at_ms = FieldPatch::Set(Some(now_ms));
        self.store.push_set_mutation(mutation);
        info!("started set {set_id} (txn {number})");
        self.set_view(set_id)
    }

    /// Reports a set's outcome. Reporting an already-completed set is an
    /// update: the winner must stand and per-game detail may only grow.
    /// First-time reports propagate the winner and loser downstream.
    pub fn report_set(
        &mut self,
        set_id: u64,
        winner_id: u32,
        is_dq: bool,
        games: Vec<GameResult>,
        now_ms: u64,
    ) -> Result<SetRecord, ActionError> {
        let view = self.set_view(set_id)?;
        let (Some(one), Some(two)) = (view.slot_one_entrant, view.slot_two_entrant) else {
            return Err(ActionError::precondition(set_id, "Set is missing entrants."));
        };
        if winner_id != one && winner_id != two {
            return Err(ActionError::precondition(
                set_id,
                "Winner must be one of the set's entrants.",
            ));
        }
        let loser_id = if winner_id == one { two } else { one };

        let is_update = view.state == SetState::Completed;
        if is_update {
            if view.winner_id != Some(winner_id) {
                return Err(ActionError::precondition(
                    set_id,
                    "Cannot change the winner of a completed set.",
                ));
            }
            if games.is_empty() {
                return Err(ActionError::precondition(
                    set_id,
                    "Updating a completed set requires per-game results.",
                ));
            }
            if games_detail_removed(&view.games, &games) {
                return Err(ActionError::precondition(
                    set_id,
                    "Update would remove reported stage or stock detail.",
                ));
            }
        }

        if !is_update {
            // Downstream discovery must pass before anything is committed;
            // a malformed progression graph leaves the log and overlay
            // untouched.
            let base = self
                .store
                .base_set(set_id)
                .ok_or(ActionError::UnknownSet(set_id))?;
            self.find_downstream(base)?;
        }

        let number = self.append_transaction(
            &view,
            ActionKind::Report(ReportPayload {
                winner_id,
                is_dq,
                games: games.clone(),
                is_update,
            }),
            now_ms,
        );

        let mut mutation = SetMutation::new(set_id, number);
        mutation.state = FieldPatch::Set(SetState::Completed);
        mutation.winner_id = FieldPatch::Set(Some(winner_id));
        mutation.loser_id = FieldPatch::Set(Some(loser_id));
        mutation.completed_at_ms = FieldPatch::Set(Some(now_ms));
        if is_dq {
            let (winner_score, loser_score) = (Some(0), Some(-1));
            if winner_id == one {
                mutation.slot_one_score = FieldPatch::Set(winner_score);
                mutation.slot_two_score = FieldPatch::Set(loser_score);
            } else {
                mutation.slot_one_score = FieldPatch::Set(loser_score);
                mutation.slot_two_score = FieldPatch::Set(winner_score);
            }
        } else if !games.is_empty() {
            mutation.slot_one_score = FieldPatch::Set(Some(games_won_by(&games, one)));
            mutation.slot_two_score = FieldPatch::Set(Some(games_won_by(&games, two)));
        }
        if !games.is_empty() {
            mutation.games = FieldPatch::Set(games);
        }
        self.store.push_set_mutation(mutation);
        info!("reported set {set_id}: winner {winner_id} (txn {number}, update: {is_update})");

        if !is_update {
            self.propagate_report(set_id, winner_id, loser_id, number)?;
        }
        self.set_view(set_id)
    }

    /// Assigns a station; the set inherits the station's configured
    /// stream. Preview sets have no remote identity and take no station.
    pub fn assign_station(
        &mut self,
        set_id: u64,
        station_id: u32,
        now_ms: u64,
    ) -> Result<SetRecord, ActionError> {
        let view = self.set_view(set_id)?;
        if view.preview {
            return Err(ActionError::precondition(
                set_id,
                "Cannot assign a station to a preview set.",
            ));
        }
        let station = self
            .stations
            .get(&station_id)
            .cloned()
            .ok_or(ActionError::UnknownStation(station_id))?;

        let number =
            self.append_transaction(&view, ActionKind::AssignStation { station_id }, now_ms);
        let mut mutation = SetMutation::new(set_id, number);
        mutation.station_id = FieldPatch::Set(Some(station_id));
        if let Some(stream_id) = station.stream_id {
            mutation.stream_id = FieldPatch::Set(Some(stream_id));
        }
        self.store.push_set_mutation(mutation);
        info!("assigned set {set_id} to station {station_id} (txn {number})");
        self.set_view(set_id)
    }

    /// Assigns a stream directly; stream id 0 clears the assignment.
    pub fn assign_stream(
        &mut self,
        set_id: u64,
        stream_id: u32,
        now_ms: u64,
    ) -> Result<SetRecord, ActionError> {
        let view = self.set_view(set_id)?;
        if view.preview {
            return Err(ActionError::precondition(
                set_id,
                "Cannot assign a stream to a preview set.",
            ));
        }
        let target = if stream_id == STREAM_CLEAR_ID {
            None
        } else {
            if !self.streams.contains_key(&stream_id) {
                return Err(ActionError::UnknownStream(stream_id));
            }
            Some(stream_id)
        };

        let number =
            self.append_transaction(&view, ActionKind::AssignStream { stream_id }, now_ms);
        let mut mutation = SetMutation::new(set_id, number);
        mutation.stream_id = FieldPatch::Set(target);
        self.store.push_set_mutation(mutation);
        info!("assigned set {set_id} to stream {stream_id} (txn {number})");
        self.set_view(set_id)
    }

    /// Returns a set to PENDING and clears its outcome. Blocked when a
    /// downstream set already progressed, unless preempt is requested, in
    /// which case the cascade resets those dependents too.
    pub fn reset_set(
        &mut self,
        set_id: u64,
        preempt: bool,
        now_ms: u64,
    ) -> Result<SetRecord, ActionError> {
        let view = self.set_view(set_id)?;
        if view.state == SetState::Pending {
            return Err(ActionError::precondition(set_id, "Set is already pending."));
        }

        let dependents = self.check_reset_dependents(set_id)?;
        if !dependents.is_empty() && !preempt {
            return Err(ActionError::DependentSetsProgressed { set_id, dependents });
        }

        let number = self.append_transaction(&view, ActionKind::Reset { preempt }, now_ms);
        self.store.merge_set_mutation(reset_mutation(set_id, number));
        let cascaded = self.apply_reset_cascade(set_id, number)?;
        if cascaded.is_empty() {
            info!("reset set {set_id} (txn {number})");
        } else {
            info!("reset set {set_id} (txn {number}), preempting {cascaded:?}");
        }
        self.set_view(set_id)
    }
}
