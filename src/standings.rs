use std::collections::{HashMap, HashSet};

use crate::types::{SetRecord, SetState, TiebreakKind, MAX_TIEBREAK_CRITERIA};

// ── Per-entrant aggregates ─────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
struct Aggregate {
    seed_num: u32,
    set_wins: u32,
    games_played: u32,
    games_won: u32,
    defeated: HashSet<u32>,
}

impl Aggregate {
    fn game_win_ratio(&self) -> f64 {
        if self.games_played == 0 {
            0.0
        } else {
            self.games_won as f64 / self.games_played as f64
        }
    }
}

fn positive_score(score: Option<i32>) -> u32 {
    // DQ sentinel (-1) counts as zero games.
    score.filter(|s| *s > 0).unwrap_or(0) as u32
}

fn build_aggregates(
    sets: &[SetRecord],
    seed_numbers: &HashMap<u32, u32>,
) -> HashMap<u32, Aggregate> {
    let mut aggregates: HashMap<u32, Aggregate> = HashMap::new();
    for (entrant, seed_num) in seed_numbers {
        aggregates.entry(*entrant).or_default().seed_num = *seed_num;
    }

    for set in sets {
        if set.state != SetState::Completed {
            continue;
        }
        let (Some(one), Some(two)) = (set.slot_one_entrant, set.slot_two_entrant) else {
            continue;
        };
        let score_one = positive_score(set.slot_one_score);
        let score_two = positive_score(set.slot_two_score);
        let games = score_one + score_two;

        {
            let entry = aggregates.entry(one).or_default();
            entry.games_played += games;
            entry.games_won += score_one;
        }
        {
            let entry = aggregates.entry(two).or_default();
            entry.games_played += games;
            entry.games_won += score_two;
        }
        if let Some(winner) = set.winner_id {
            let loser = if winner == one { two } else { one };
            let entry = aggregates.entry(winner).or_default();
            entry.set_wins += 1;
            entry.defeated.insert(loser);
        }
    }
    aggregates
}

// ── Tiered tiebreak sort ───────────────────────────────────────────────

fn criterion_key(
    entrant: u32,
    criterion: TiebreakKind,
    aggregates: &HashMap<u32, Aggregate>,
    group: &HashSet<u32>,
) -> f64 {
    let Some(agg) = aggregates.get(&entrant) else {
        return 0.0;
    };
    match criterion {
        TiebreakKind::SetWins => agg.set_wins as f64,
        TiebreakKind::GameWinRatio => agg.game_win_ratio(),
        TiebreakKind::GamesWon => agg.games_won as f64,
        // Only victories inside the currently-tied group count, recomputed
        // fresh at every recursion level.
        TiebreakKind::HeadToHead => agg
            .defeated
            .iter()
            .filter(|beaten| group.contains(beaten))
            .count() as f64,
    }
}

fn sort_group(group: &mut [u32], criteria: &[TiebreakKind], aggregates: &HashMap<u32, Aggregate>) {
    if group.len() < 2 {
        return;
    }
    let Some((criterion, rest)) = criteria.split_first() else {
        // Out of criteria: original seed number is the total-order fallback.
        group.sort_by_key(|e| aggregates.get(e).map(|a| a.seed_num).unwrap_or(u32::MAX));
        return;
    };

    let members: HashSet<u32> = group.iter().copied().collect();
    let keys: HashMap<u32, f64> = group
        .iter()
        .map(|e| (*e, criterion_key(*e, *criterion, aggregates, &members)))
        .collect();
    group.sort_by(|a, b| keys[b].total_cmp(&keys[a]));

    let mut start = 0;
    while start < group.len() {
        let mut end = start + 1;
        while end < group.len() && keys[&group[end]] == keys[&group[start]] {
            end += 1;
        }
        if end - start > 1 {
            sort_group(&mut group[start..end], rest, aggregates);
        }
        start = end;
    }
}

/// Computes a round robin pool's placement order from its completed sets.
/// Returns entrant ids, index 0 = first place. `seed_numbers` maps entrant
/// id to the pool's original seed number for the final tiebreak.
pub fn round_robin_standings(
    sets: &[SetRecord],
    seed_numbers: &HashMap<u32, u32>,
    criteria: &[TiebreakKind],
) -> Vec<u32> {
    let aggregates = build_aggregates(sets, seed_numbers);
    let mut field: Vec<u32> = aggregates.keys().copied().collect();
    field.sort_by_key(|e| aggregates.get(e).map(|a| a.seed_num).unwrap_or(u32::MAX));

    let criteria: Vec<TiebreakKind> = criteria
        .iter()
        .copied()
        .take(MAX_TIEBREAK_CRITERIA)
        .collect();
    sort_group(&mut field, &criteria, &aggregates);
    field
}
