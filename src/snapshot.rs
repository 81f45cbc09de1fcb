use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::engine::BracketEngine;
use crate::error::SnapshotError;
use crate::types::{
  BracketKind, PoolRecord, PrereqCondition, PrereqDescriptor, PrereqKind, SeedRecord, SetRecord,
  SetState, TiebreakKind,
};

// ── Snapshot payloads ──────────────────────────────────────────────────

/// One authoritative refresh of an event. Snapshots are complete: a
/// record missing here no longer exists upstream.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSnapshot {
  pub sets: Vec<SetRecord>,
  pub seeds: Vec<SeedRecord>,
  pub pools: Vec<PoolRecord>,
}

impl BracketEngine {
  /// Installs fresh authoritative records and reconciles the queued
  /// transactions against them. Per-record timestamps guard against
  /// out-of-order snapshot delivery.
  pub fn apply_snapshot(&mut self, snapshot: EventSnapshot) {
    let set_ids: HashSet<u64> = snapshot.sets.iter().map(|s| s.id).collect();
    let seed_ids: HashSet<u64> = snapshot.seeds.iter().map(|s| s.id).collect();
    let pool_ids: HashSet<u64> = snapshot.pools.iter().map(|p| p.id).collect();

    for incoming in snapshot.sets {
      let stale = self
        .store
        .base_set(incoming.id)
        .map(|stored| stored.updated_at_ms > incoming.updated_at_ms)
        .unwrap_or(false);
      if stale {
        warn!("ignoring stale snapshot data for set {}", incoming.id);
        continue;
      }
      self.store.upsert_set(incoming);
    }
    for incoming in snapshot.seeds {
      let stale = self
        .store
        .base_seed(incoming.id)
        .map(|stored| stored.updated_at_ms > incoming.updated_at_ms)
        .unwrap_or(false);
      if !stale {
        self.store.upsert_seed(incoming);
      }
    }
    for incoming in snapshot.pools {
      let stale = self
        .store
        .pool(incoming.id)
        .map(|stored| stored.updated_at_ms > incoming.updated_at_ms)
        .unwrap_or(false);
      if !stale {
        self.store.upsert_pool(incoming);
      }
    }

    for set_id in self.store.all_set_ids() {
      if set_ids.contains(&set_id) {
        continue;
      }
      info!("set {set_id} removed upstream, deleting the local record");
      self.store.remove_set(set_id);
      for number in self.log.remove_for_set(set_id) {
        warn!("dropping transaction {number}: its set no longer exists");
        self.store.delete_mutations_for_txn(number);
      }
    }
    for seed_id in self.store.all_seed_ids() {
      if !seed_ids.contains(&seed_id) {
        self.store.remove_seed(seed_id);
      }
    }
    for pool_id in self.store.all_pool_ids() {
      if !pool_ids.contains(&pool_id) {
        self.store.remove_pool(pool_id);
      }
    }

    self.reconcile_event();
  }
}

// ── Raw payload parsing ────────────────────────────────────────────────

fn parse_set_state(code: i64) -> SetState {
  match code {
    6 => SetState::Called,
    3 => SetState::Started,
    4 => SetState::Completed,
    _ => SetState::Pending,
  }
}

fn parse_bracket_kind(raw: Option<&str>) -> BracketKind {
  match raw {
    Some("ROUND_ROBIN") => BracketKind::RoundRobin,
    _ => BracketKind::DoubleElimination,
  }
}

fn parse_tiebreaks(raw: Option<&Vec<Value>>) -> Vec<TiebreakKind> {
  let Some(entries) = raw else {
    return vec![
      TiebreakKind::SetWins,
      TiebreakKind::GameWinRatio,
      TiebreakKind::HeadToHead,
    ];
  };
  entries
    .iter()
    .filter_map(|v| v.as_str())
    .filter_map(|name| match name {
      "setWins" => Some(TiebreakKind::SetWins),
      "gameWinRatio" => Some(TiebreakKind::GameWinRatio),
      "gamesWon" => Some(TiebreakKind::GamesWon),
      "headToHead" => Some(TiebreakKind::HeadToHead),
      _ => None,
    })
    .collect()
}

/// Preview sets come through with a "preview_<n>" string id until the
/// bracket is finalized upstream.
fn parse_set_id(raw: &Value) -> Option<(u64, bool)> {
  if let Some(id) = raw.as_u64() {
    return Some((id, false));
  }
  let text = raw.as_str()?;
  let digits = text.strip_prefix("preview_")?;
  digits.parse::<u64>().ok().map(|id| (id, true))
}

fn parse_prereq(slot: &Value) -> Option<PrereqDescriptor> {
  let referenced_id = slot.get("prereqId").and_then(|v| v.as_u64())?;
  let kind = match slot.get("prereqType").and_then(|v| v.as_str()) {
    Some("set") => PrereqKind::Set,
    Some("seed") => PrereqKind::Seed,
    _ => return None,
  };
  let condition = match slot.get("prereqPlacement").and_then(|v| v.as_i64()) {
    Some(1) => PrereqCondition::Winner,
    Some(2) => PrereqCondition::Loser,
    _ => PrereqCondition::None,
  };
  Some(PrereqDescriptor {
    kind,
    referenced_id,
    condition,
    display_text: slot
      .get("slotLabel")
      .and_then(|v| v.as_str())
      .map(|s| s.to_string()),
  })
}

fn parse_progression(node: &Value, key: &str) -> Option<crate::types::ProgressionTarget> {
  let target = node.get(key)?;
  let seed_id = target.get("seedId").and_then(|v| v.as_u64())?;
  Some(crate::types::ProgressionTarget {
    seed_id,
    pool_name: target
      .get("poolName")
      .and_then(|v| v.as_str())
      .map(|s| s.to_string()),
  })
}

fn seconds_to_ms(raw: Option<&Value>) -> Option<u64> {
  raw.and_then(|v| v.as_u64()).map(|secs| secs * 1000)
}

fn parse_set_node(node: &Value) -> Result<SetRecord, SnapshotError> {
  let raw_id = node
    .get("id")
    .ok_or_else(|| SnapshotError::Malformed("set node without id".to_string()))?;
  let (id, preview) = parse_set_id(raw_id)
    .ok_or_else(|| SnapshotError::Malformed(format!("unparseable set id: {raw_id}")))?;

  let slots = node
    .get("slots")
    .and_then(|v| v.as_array())
    .ok_or_else(|| SnapshotError::Malformed(format!("set {id} has no slots")))?;
  if slots.len() != 2 {
    return Err(SnapshotError::Malformed(format!(
      "set {id} has {} slots",
      slots.len()
    )));
  }

  let entrant = |slot: &Value| -> Option<u32> {
    slot
      .get("entrant")
      .and_then(|e| e.get("id"))
      .and_then(|v| v.as_u64())
      .map(|v| v as u32)
  };
  let score = |slot: &Value| -> Option<i32> {
    slot
      .get("standing")
      .and_then(|s| s.get("stats"))
      .and_then(|s| s.get("score"))
      .and_then(|s| s.get("value"))
      .and_then(|v| v.as_i64())
      .map(|v| v as i32)
  };

  let winner_id = node
    .get("winnerId")
    .and_then(|v| v.as_u64())
    .map(|v| v as u32);
  let loser_id = winner_id.and_then(|w| {
    [entrant(&slots[0]), entrant(&slots[1])]
      .into_iter()
      .flatten()
      .find(|e| *e != w)
  });

  Ok(SetRecord {
    id,
    pool_id: node.get("phaseGroupId").and_then(|v| v.as_u64()).unwrap_or(0),
    round: node.get("round").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
    full_round_text: node
      .get("fullRoundText")
      .and_then(|v| v.as_str())
      .unwrap_or("")
      .to_string(),
    preview,
    slot_one_prereq: parse_prereq(&slots[0]),
    slot_two_prereq: parse_prereq(&slots[1]),
    winner_target: parse_progression(node, "winnerProgression"),
    loser_target: parse_progression(node, "loserProgression"),
    state: parse_set_state(node.get("state").and_then(|v| v.as_i64()).unwrap_or(1)),
    slot_one_entrant: entrant(&slots[0]),
    slot_two_entrant: entrant(&slots[1]),
    slot_one_score: score(&slots[0]),
    slot_two_score: score(&slots[1]),
    winner_id,
    loser_id,
    started_at_ms: seconds_to_ms(node.get("startedAt")),
    completed_at_ms: seconds_to_ms(node.get("completedAt")),
    station_id: node
      .get("station")
      .and_then(|s| s.get("id"))
      .and_then(|v| v.as_u64())
      .map(|v| v as u32),
    stream_id: node
      .get("stream")
      .and_then(|s| s.get("id"))
      .and_then(|v| v.as_u64())
      .map(|v| v as u32),
    games: Vec::new(),
    updated_at_ms: seconds_to_ms(node.get("updatedAt")).unwrap_or(0),
  })
}

fn parse_seed_node(node: &Value) -> Result<SeedRecord, SnapshotError> {
  let id = node
    .get("id")
    .and_then(|v| v.as_u64())
    .ok_or_else(|| SnapshotError::Malformed("seed node without id".to_string()))?;
  Ok(SeedRecord {
    id,
    pool_id: node.get("phaseGroupId").and_then(|v| v.as_u64()).unwrap_or(0),
    seed_num: node.get("seedNum").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
    entrant_id: node
      .get("entrant")
      .and_then(|e| e.get("id"))
      .and_then(|v| v.as_u64())
      .map(|v| v as u32),
    origin_placement: node
      .get("originPlacement")
      .and_then(|v| v.as_u64())
      .map(|v| v as u32),
    origin_pool_id: node.get("originPhaseGroupId").and_then(|v| v.as_u64()),
    updated_at_ms: seconds_to_ms(node.get("updatedAt")).unwrap_or(0),
  })
}

fn parse_pool_node(node: &Value) -> Result<PoolRecord, SnapshotError> {
  let id = node
    .get("id")
    .and_then(|v| v.as_u64())
    .ok_or_else(|| SnapshotError::Malformed("phase group node without id".to_string()))?;
  Ok(PoolRecord {
    id,
    name: node
      .get("displayIdentifier")
      .and_then(|v| v.as_str())
      .unwrap_or("")
      .to_string(),
    bracket: parse_bracket_kind(node.get("bracketType").and_then(|v| v.as_str())),
    tiebreaks: parse_tiebreaks(node.get("tiebreakOrder").and_then(|v| v.as_array())),
    updated_at_ms: seconds_to_ms(node.get("updatedAt")).unwrap_or(0),
  })
}

/// Parses the remote's event payload into typed records. The shape is
/// `data.event` with `sets.nodes`, `seeds.nodes` and `phaseGroups.nodes`.
pub fn parse_event_snapshot(raw: &Value) -> Result<EventSnapshot, SnapshotError> {
  let event = raw
    .get("data")
    .and_then(|d| d.get("event"))
    .ok_or_else(|| SnapshotError::Malformed("payload has no data.event".to_string()))?;

  let nodes = |key: &str| -> Vec<Value> {
    event
      .get(key)
      .and_then(|v| v.get("nodes"))
      .and_then(|v| v.as_array())
      .cloned()
      .unwrap_or_default()
  };

  let mut snapshot = EventSnapshot::default();
  for node in nodes("sets") {
    snapshot.sets.push(parse_set_node(&node)?);
  }
  for node in nodes("seeds") {
    snapshot.seeds.push(parse_seed_node(&node)?);
  }
  for node in nodes("phaseGroups") {
    snapshot.pools.push(parse_pool_node(&node)?);
  }
  Ok(snapshot)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::*;
  use crate::types::SetState;
  use serde_json::json;

  #[test]
  fn test_parse_event_snapshot() {
    let raw = json!({
      "data": {
        "event": {
          "sets": {
            "nodes": [
              {
                "id": 11,
                "phaseGroupId": 1,
                "round": 1,
                "fullRoundText": "Winners Round 1",
                "state": 4,
                "winnerId": 10,
                "completedAt": 5,
                "updatedAt": 6,
                "slots": [
                  { "entrant": { "id": 10 },
                    "standing": { "stats": { "score": { "value": 2 } } } },
                  { "entrant": { "id": 20 },
                    "standing": { "stats": { "score": { "value": -1 } } } }
                ]
              },
              {
                "id": "preview_12",
                "phaseGroupId": 1,
                "round": 2,
                "fullRoundText": "Winners Final",
                "state": 1,
                "slots": [
                  { "prereqId": 11, "prereqType": "set", "prereqPlacement": 1 },
                  { "prereqId": 13, "prereqType": "seed" }
                ]
              }
            ]
          },
          "seeds": {
            "nodes": [
              { "id": 13, "phaseGroupId": 1, "seedNum": 1,
                "originPlacement": 1, "originPhaseGroupId": 2, "updatedAt": 6 }
            ]
          },
          "phaseGroups": {
            "nodes": [
              { "id": 2, "displayIdentifier": "A1", "bracketType": "ROUND_ROBIN",
                "tiebreakOrder": ["setWins", "gameWinRatio", "headToHead"], "updatedAt": 6 }
            ]
          }
        }
      }
    });

    let snapshot = parse_event_snapshot(&raw).unwrap();
    assert_eq!(snapshot.sets.len(), 2);
    let done = &snapshot.sets[0];
    assert_eq!(done.state, SetState::Completed);
    assert_eq!(done.loser_id, Some(20));
    assert_eq!(done.slot_two_score, Some(-1));
    assert!(done.has_dq_score());

    let preview = &snapshot.sets[1];
    assert_eq!(preview.id, 12);
    assert!(preview.preview);
    assert_eq!(
      preview.slot_one_prereq.as_ref().map(|p| p.condition),
      Some(crate::types::PrereqCondition::Winner)
    );
    assert_eq!(
      preview.slot_two_prereq.as_ref().map(|p| p.kind),
      Some(crate::types::PrereqKind::Seed)
    );

    assert_eq!(snapshot.seeds[0].origin_pool_id, Some(2));
    assert_eq!(snapshot.pools[0].bracket, BracketKind::RoundRobin);
  }

  #[test]
  fn test_malformed_payload_is_rejected() {
    let raw = json!({ "data": {} });
    assert!(matches!(
      parse_event_snapshot(&raw),
      Err(SnapshotError::Malformed(_))
    ));
  }

  #[test]
  fn test_stale_snapshot_data_is_ignored() {
    let mut engine = make_bracket_engine();
    let mut fresh = engine.store.base_set(1).cloned().unwrap();
    fresh.updated_at_ms = 100;
    engine.store.upsert_set(fresh);
    let mut fresh_pool = engine.store.pool(1).cloned().unwrap();
    fresh_pool.updated_at_ms = 100;
    engine.store.upsert_pool(fresh_pool.clone());

    let mut stale = engine.store.base_set(1).cloned().unwrap();
    stale.updated_at_ms = 50;
    stale.state = SetState::Completed;
    let mut stale_pool = fresh_pool.clone();
    stale_pool.updated_at_ms = 50;
    stale_pool.tiebreaks = vec![crate::types::TiebreakKind::GamesWon];
    let snapshot = EventSnapshot {
      sets: engine
        .store
        .all_set_ids()
        .into_iter()
        .map(|id| {
          if id == 1 {
            stale.clone()
          } else {
            engine.store.base_set(id).cloned().unwrap()
          }
        })
        .collect(),
      seeds: Vec::new(),
      pools: vec![stale_pool],
    };

    engine.apply_snapshot(snapshot);
    let view = engine.set_view(1).unwrap();
    assert_eq!(view.state, SetState::Pending);
    assert_eq!(view.updated_at_ms, 100);

    let pool = engine.store.pool(1).unwrap();
    assert_eq!(pool.updated_at_ms, 100);
    assert_eq!(pool.tiebreaks, fresh_pool.tiebreaks);
  }

  #[test]
  fn test_absent_records_are_deleted_and_transactions_dropped() {
    let mut engine = make_bracket_engine();
    engine.call_set(1, 10).unwrap();

    let snapshot = EventSnapshot {
      sets: engine
        .store
        .all_set_ids()
        .into_iter()
        .filter(|id| *id != 1)
        .map(|id| engine.store.base_set(id).cloned().unwrap())
        .collect(),
      seeds: Vec::new(),
      pools: vec![engine.store.pool(1).cloned().unwrap()],
    };

    engine.apply_snapshot(snapshot);
    assert!(engine.set_view(1).is_err());
    assert_eq!(engine.pending_transaction_count(), 0);
  }
}
