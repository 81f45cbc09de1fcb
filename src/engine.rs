use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::error::ActionError;
use crate::overlay::OverlayStore;
use crate::txn::{ActionKind, ConflictReason, Transaction, TransactionLog, TxnSequence};
use crate::types::{SeedRecord, SetRecord, StationRecord, StreamRecord};

// ── Conflict queries ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictView {
    pub transaction: Transaction,
    pub set: SetRecord,
    pub reason: ConflictReason,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionStep {
    pub transaction_number: u64,
    pub action: String,
    pub state: SetRecord,
}

/// Everything the operator needs to compare local intent against the
/// remote: the authoritative record plus every intermediate locally
/// replayed state of the affected set.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionDetail {
    pub transaction_number: u64,
    pub authoritative: SetRecord,
    pub steps: Vec<ResolutionStep>,
}

impl ResolutionDetail {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ── Engine ─────────────────────────────────────────────────────────────

/// The local bracket cache: base records, overlay mutations, the
/// transaction log and the station/stream registries. One instance per
/// event; callers share it behind `SharedEngine`.
#[derive(Debug, Default)]
pub struct BracketEngine {
    pub(crate) store: OverlayStore,
    pub(crate) log: TransactionLog,
    pub(crate) seq: TxnSequence,
    pub(crate) stations: HashMap<u32, StationRecord>,
    pub(crate) streams: HashMap<u32, StreamRecord>,
    /// Sets whose automatic reconciliation hit an invariant violation.
    pub(crate) suspended: HashSet<u64>,
}

impl BracketEngine {
    pub fn new() -> Self {
        BracketEngine {
            store: OverlayStore::new(),
            log: TransactionLog::new(),
            seq: TxnSequence::new(),
            stations: HashMap::new(),
            streams: HashMap::new(),
            suspended: HashSet::new(),
        }
    }

    /// Rebuilds an engine from persisted state; the sequence counter is
    /// recovered from the log's max number.
    pub fn recover(store: OverlayStore, log: TransactionLog) -> Self {
        let seq = TxnSequence::recover(log.max_number());
        BracketEngine {
            store,
            log,
            seq,
            stations: HashMap::new(),
            streams: HashMap::new(),
            suspended: HashSet::new(),
        }
    }

    // ── Registries ─────────────────────────────────────────────────

    pub fn register_station(&mut self, station: StationRecord) {
        self.stations.insert(station.id, station);
    }

    pub fn register_stream(&mut self, stream: StreamRecord) {
        self.streams.insert(stream.id, stream);
    }

    pub fn station(&self, id: u32) -> Option<&StationRecord> {
        self.stations.get(&id)
    }

    pub fn stream(&self, id: u32) -> Option<&StreamRecord> {
        self.streams.get(&id)
    }

    // ── Views ──────────────────────────────────────────────────────

    pub fn set_view(&self, set_id: u64) -> Result<SetRecord, ActionError> {
        self.store
            .set_view(set_id)
            .ok_or(ActionError::UnknownSet(set_id))
    }

    pub fn seed_view(&self, seed_id: u64) -> Option<SeedRecord> {
        self.store.seed_view(seed_id)
    }

    pub fn has_pending_edits(&self, set_id: u64) -> bool {
        self.store.has_pending_edits(set_id)
    }

    pub fn pending_transaction_count(&self) -> usize {
        self.log.len()
    }

    pub fn suspended_sets(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.suspended.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ── Transaction plumbing ───────────────────────────────────────

    /// Appends one transaction capturing the pre-action slot identities.
    pub(crate) fn append_transaction(
        &mut self,
        pre: &SetRecord,
        kind: ActionKind,
        now_ms: u64,
    ) -> u64 {
        let number = self.seq.allocate();
        self.log.append(Transaction {
            number,
            set_id: pre.id,
            kind,
            expected_slot_one: pre.slot_one_entrant,
            expected_slot_two: pre.slot_two_entrant,
            is_conflict: false,
            reason: None,
            created_at_ms: now_ms,
        });
        number
    }

    pub(crate) fn drop_transaction(&mut self, number: u64) {
        self.log.remove(number);
        self.store.delete_mutations_for_txn(number);
    }

    // ── Conflict surface ───────────────────────────────────────────

    /// The oldest conflicted transaction, with the affected set's
    /// materialized view, if any conflict is pending operator decision.
    pub fn current_conflict(&self) -> Option<ConflictView> {
        let txn = self.log.oldest_conflict()?;
        let set = self.store.set_view(txn.set_id)?;
        Some(ConflictView {
            transaction: txn.clone(),
            set,
            reason: txn.reason?,
        })
    }

    pub fn resolution_detail(&self, number: u64) -> Result<ResolutionDetail, ActionError> {
        let txn = self
            .log
            .get(number)
            .ok_or(ActionError::UnknownTransaction(number))?;
        let authoritative = self
            .store
            .base_set(txn.set_id)
            .cloned()
            .ok_or(ActionError::UnknownSet(txn.set_id))?;
        let steps = self
            .store
            .set_replay_states(txn.set_id)
            .unwrap_or_default()
            .into_iter()
            .map(|(step_number, state)| ResolutionStep {
                transaction_number: step_number,
                action: self
                    .log
                    .get(step_number)
                    .map(|t| t.kind.label().to_string())
                    .unwrap_or_else(|| "mutation".to_string()),
                state,
            })
            .collect();
        Ok(ResolutionDetail {
            transaction_number: number,
            authoritative,
            steps,
        })
    }

    /// Operator decision: abandon a local intent. The transaction and the
    /// mutations it owns are deleted.
    pub fn discard_transaction(&mut self, number: u64) -> Result<(), ActionError> {
        if self.log.get(number).is_none() {
            return Err(ActionError::UnknownTransaction(number));
        }
        info!("discarding transaction {number} by operator decision");
        self.drop_transaction(number);
        Ok(())
    }

    // ── Remote push surface ────────────────────────────────────────

    /// The next transaction ready to push upstream: the oldest
    /// non-conflicted one. When conflicts were skipped to reach it, its
    /// expected pre-state must still match the current view.
    pub fn next_push(&self) -> Option<Transaction> {
        let mut skipped_conflict = false;
        for txn in self.log.iter() {
            if txn.is_conflict {
                skipped_conflict = true;
                continue;
            }
            if !skipped_conflict {
                return Some(txn.clone());
            }
            if let Some(view) = self.store.set_view_before(txn.set_id, txn.number) {
                if view.slot_one_entrant == txn.expected_slot_one
                    && view.slot_two_entrant == txn.expected_slot_two
                {
                    return Some(txn.clone());
                }
            }
        }
        None
    }
}
