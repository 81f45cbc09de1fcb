use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::engine::BracketEngine;

// ── Constants ──────────────────────────────────────────────────────────

pub const STREAM_CLEAR_ID: u32 = 0;
pub const MAX_TIEBREAK_CRITERIA: usize = 3;
pub const CASCADE_SAFETY_LIMIT: usize = 10_000;

// ── Shared state type aliases ──────────────────────────────────────────

pub type SharedEngine = Arc<Mutex<BracketEngine>>;

// ── Time ───────────────────────────────────────────────────────────────

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ── Set records ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SetState {
    Pending,
    Called,
    Started,
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrereqKind {
    Set,
    Seed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrereqCondition {
    Winner,
    Loser,
    None,
}

/// Where a slot's entrant comes from: a prior set's winner/loser, or a seed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrereqDescriptor {
    pub kind: PrereqKind,
    pub referenced_id: u64,
    pub condition: PrereqCondition,
    pub display_text: Option<String>,
}

/// Seed a completed set's winner or loser graduates into, optionally
/// annotated with the downstream pool's name for display.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressionTarget {
    pub seed_id: u64,
    pub pool_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameResult {
    pub game_number: u32,
    pub winner_id: Option<u32>,
    pub stage: Option<String>,
    pub slot_one_stocks: Option<u32>,
    pub slot_two_stocks: Option<u32>,
}

/// A bracket match slot as last seen from the remote, plus the mutable
/// fields local actions may overlay. Slot scores use the remote's DQ
/// convention: -1 means disqualified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRecord {
    pub id: u64,
    pub pool_id: u64,
    pub round: i32,
    pub full_round_text: String,
    pub preview: bool,
    pub slot_one_prereq: Option<PrereqDescriptor>,
    pub slot_two_prereq: Option<PrereqDescriptor>,
    pub winner_target: Option<ProgressionTarget>,
    pub loser_target: Option<ProgressionTarget>,
    pub state: SetState,
    pub slot_one_entrant: Option<u32>,
    pub slot_two_entrant: Option<u32>,
    pub slot_one_score: Option<i32>,
    pub slot_two_score: Option<i32>,
    pub winner_id: Option<u32>,
    pub loser_id: Option<u32>,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub station_id: Option<u32>,
    pub stream_id: Option<u32>,
    pub games: Vec<GameResult>,
    pub updated_at_ms: u64,
}

impl SetRecord {
    pub fn slot_entrant(&self, slot: usize) -> Option<u32> {
        if slot == 0 {
            self.slot_one_entrant
        } else {
            self.slot_two_entrant
        }
    }

    pub fn has_both_entrants(&self) -> bool {
        self.slot_one_entrant.is_some() && self.slot_two_entrant.is_some()
    }

    pub fn is_grand_final(&self) -> bool {
        let lower = self.full_round_text.to_lowercase();
        lower.contains("grand final") && !lower.contains("reset")
    }

    /// True when either reported slot score is the DQ sentinel.
    pub fn has_dq_score(&self) -> bool {
        self.slot_one_score == Some(-1) || self.slot_two_score == Some(-1)
    }
}

// ── Seed records ───────────────────────────────────────────────────────

/// A bracket position within a pool. Only `entrant_id` is mutable; the
/// origin fields tie a graduation seed back to the round robin pool it
/// ranks out of.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRecord {
    pub id: u64,
    pub pool_id: u64,
    pub seed_num: u32,
    pub entrant_id: Option<u32>,
    pub origin_placement: Option<u32>,
    pub origin_pool_id: Option<u64>,
    pub updated_at_ms: u64,
}

// ── Pool records ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BracketKind {
    DoubleElimination,
    RoundRobin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TiebreakKind {
    SetWins,
    GameWinRatio,
    GamesWon,
    HeadToHead,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRecord {
    pub id: u64,
    pub name: String,
    pub bracket: BracketKind,
    pub tiebreaks: Vec<TiebreakKind>,
    pub updated_at_ms: u64,
}

// ── Station / stream registries ────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationRecord {
    pub id: u32,
    pub name: String,
    pub stream_id: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub id: u32,
    pub name: String,
}
