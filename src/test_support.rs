//! Shared fixtures for unit tests.

use crate::engine::BracketEngine;
use crate::types::{
    BracketKind, GameResult, PoolRecord, PrereqCondition, PrereqDescriptor, PrereqKind, SetRecord,
    SetState, TiebreakKind,
};

pub(crate) fn make_set(id: u64, round: i32, label: &str) -> SetRecord {
    SetRecord {
        id,
        pool_id: 1,
        round,
        full_round_text: label.to_string(),
        preview: false,
        slot_one_prereq: None,
        slot_two_prereq: None,
        winner_target: None,
        loser_target: None,
        state: SetState::Pending,
        slot_one_entrant: None,
        slot_two_entrant: None,
        slot_one_score: None,
        slot_two_score: None,
        winner_id: None,
        loser_id: None,
        started_at_ms: None,
        completed_at_ms: None,
        station_id: None,
        stream_id: None,
        games: Vec::new(),
        updated_at_ms: 0,
    }
}

pub(crate) fn set_prereq(set_id: u64, condition: PrereqCondition) -> Option<PrereqDescriptor> {
    Some(PrereqDescriptor {
        kind: PrereqKind::Set,
        referenced_id: set_id,
        condition,
        display_text: None,
    })
}

pub(crate) fn make_games(winners: &[u32]) -> Vec<GameResult> {
    winners
        .iter()
        .enumerate()
        .map(|(i, w)| GameResult {
            game_number: i as u32 + 1,
            winner_id: Some(*w),
            stage: None,
            slot_one_stocks: None,
            slot_two_stocks: None,
        })
        .collect()
}

/// A four-entrant double elimination fragment in pool 1:
///   set 1  Winners Round 1   10 vs 20
///   set 2  Winners Round 1   30 vs 40
///   set 3  Winners Final     winner(1) vs winner(2)
///   set 4  Losers Round 1    loser(1) vs loser(2)
pub(crate) fn make_bracket_engine() -> BracketEngine {
    let mut engine = BracketEngine::new();
    engine.store.upsert_pool(PoolRecord {
        id: 1,
        name: "Top Bracket".to_string(),
        bracket: BracketKind::DoubleElimination,
        tiebreaks: vec![
            TiebreakKind::SetWins,
            TiebreakKind::GameWinRatio,
            TiebreakKind::HeadToHead,
        ],
        updated_at_ms: 0,
    });

    let mut w1a = make_set(1, 1, "Winners Round 1");
    w1a.slot_one_entrant = Some(10);
    w1a.slot_two_entrant = Some(20);
    let mut w1b = make_set(2, 1, "Winners Round 1");
    w1b.slot_one_entrant = Some(30);
    w1b.slot_two_entrant = Some(40);

    let mut wf = make_set(3, 2, "Winners Final");
    wf.slot_one_prereq = set_prereq(1, PrereqCondition::Winner);
    wf.slot_two_prereq = set_prereq(2, PrereqCondition::Winner);
    let mut l1 = make_set(4, -1, "Losers Round 1");
    l1.slot_one_prereq = set_prereq(1, PrereqCondition::Loser);
    l1.slot_two_prereq = set_prereq(2, PrereqCondition::Loser);

    for set in [w1a, w1b, wf, l1] {
        engine.store.upsert_set(set);
    }
    engine
}
