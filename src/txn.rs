use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::GameResult;

// ── Action payloads ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPayload {
    pub winner_id: u32,
    pub is_dq: bool,
    pub games: Vec<GameResult>,
    /// Set when this report amends an already-completed set instead of
    /// completing a fresh one. Flipped during reconciliation when the
    /// authoritative record disagrees.
    pub is_update: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ActionKind {
    Reset { preempt: bool },
    Call,
    Start,
    Report(ReportPayload),
    AssignStation { station_id: u32 },
    AssignStream { stream_id: u32 },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Reset { .. } => "reset",
            ActionKind::Call => "call",
            ActionKind::Start => "start",
            ActionKind::Report(payload) if payload.is_update => "reportUpdate",
            ActionKind::Report(_) => "report",
            ActionKind::AssignStation { .. } => "assignStation",
            ActionKind::AssignStream { .. } => "assignStream",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictReason {
    ResetDependentSets,
    MissingEntrants,
    ReportCompleted,
    UpdateChangeWinner,
    UpdateRemoveStagesStocks,
}

// ── Transactions ───────────────────────────────────────────────────────

/// One logged operator intent. The expected slot ids are the pre-action
/// opponents, the anchor used later to test whether the intent still
/// applies against fresh authoritative data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub number: u64,
    pub set_id: u64,
    pub kind: ActionKind,
    pub expected_slot_one: Option<u32>,
    pub expected_slot_two: Option<u32>,
    pub is_conflict: bool,
    pub reason: Option<ConflictReason>,
    pub created_at_ms: u64,
}

impl Transaction {
    pub fn mark_conflict(&mut self, reason: ConflictReason) {
        self.is_conflict = true;
        self.reason = Some(reason);
    }

    pub fn clear_conflict(&mut self) {
        self.is_conflict = false;
        self.reason = None;
    }
}

/// Gap-free monotonically increasing transaction numbers. Recovered from
/// the persisted log's max on startup instead of a module-level counter.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TxnSequence {
    next: u64,
}

impl Default for TxnSequence {
    fn default() -> Self {
        TxnSequence::new()
    }
}

impl TxnSequence {
    pub fn new() -> Self {
        TxnSequence { next: 1 }
    }

    pub fn recover(max_persisted: u64) -> Self {
        TxnSequence {
            next: max_persisted + 1,
        }
    }

    pub fn allocate(&mut self) -> u64 {
        let number = self.next;
        self.next += 1;
        number
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}

// ── Transaction log ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TransactionLog {
    entries: BTreeMap<u64, Transaction>,
}

impl TransactionLog {
    pub fn new() -> Self {
        TransactionLog::default()
    }

    pub fn append(&mut self, txn: Transaction) {
        self.entries.insert(txn.number, txn);
    }

    pub fn remove(&mut self, number: u64) -> Option<Transaction> {
        self.entries.remove(&number)
    }

    pub fn get(&self, number: u64) -> Option<&Transaction> {
        self.entries.get(&number)
    }

    pub fn get_mut(&mut self, number: u64) -> Option<&mut Transaction> {
        self.entries.get_mut(&number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn max_number(&self) -> u64 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    /// Transaction numbers targeting one set, oldest first.
    pub fn numbers_for_set(&self, set_id: u64) -> Vec<u64> {
        self.entries
            .values()
            .filter(|txn| txn.set_id == set_id)
            .map(|txn| txn.number)
            .collect()
    }

    pub fn oldest_conflict(&self) -> Option<&Transaction> {
        self.entries.values().find(|txn| txn.is_conflict)
    }

    pub fn remove_for_set(&mut self, set_id: u64) -> Vec<u64> {
        let numbers: Vec<u64> = self.numbers_for_set(set_id);
        for number in &numbers {
            self.entries.remove(number);
        }
        numbers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_txn(number: u64, set_id: u64) -> Transaction {
        Transaction {
            number,
            set_id,
            kind: ActionKind::Call,
            expected_slot_one: Some(1),
            expected_slot_two: Some(2),
            is_conflict: false,
            reason: None,
            created_at_ms: 0,
        }
    }

    #[test]
    fn test_sequence_is_gap_free_and_recoverable() {
        let mut seq = TxnSequence::new();
        assert_eq!(seq.allocate(), 1);
        assert_eq!(seq.allocate(), 2);

        let recovered = TxnSequence::recover(41);
        assert_eq!(recovered.peek(), 42);
    }

    #[test]
    fn test_log_orders_by_number_per_set() {
        let mut log = TransactionLog::new();
        log.append(make_txn(3, 7));
        log.append(make_txn(1, 7));
        log.append(make_txn(2, 9));

        assert_eq!(log.numbers_for_set(7), vec![1, 3]);
        assert_eq!(log.max_number(), 3);
    }

    #[test]
    fn test_oldest_conflict() {
        let mut log = TransactionLog::new();
        log.append(make_txn(1, 7));
        let mut conflicted = make_txn(2, 7);
        conflicted.mark_conflict(ConflictReason::MissingEntrants);
        log.append(conflicted);

        let found = log.oldest_conflict().unwrap();
        assert_eq!(found.number, 2);
        assert_eq!(found.reason, Some(ConflictReason::MissingEntrants));
    }
}
