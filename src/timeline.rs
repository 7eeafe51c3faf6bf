//! Combat timeline data model — rounds, events, scheduled actions.
//!
//! DESIGN
//! ======
//! The timeline is a tree: `Timeline` owns `Round`s, each round owns ordered
//! `Event`s, each event owns ordered `Action`s. Numbers are 1-based and
//! monotonic. At most one trailing round is unexecuted (the "open" round).
//!
//! Persistent spell effects live in the map object store, not here; the
//! timeline only keeps weak bookkeeping (`TrackedEffect`) so the expiry
//! evaluator knows which store objects it created and under what rule.
//!
//! The whole structure serializes as nested JSON and is flushed to the
//! `maps.timeline` column by the persistence task.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// POSITIONS
// =============================================================================

/// A point on the battle map, in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

// =============================================================================
// ACTIONS
// =============================================================================

/// How long a persistent spell effect lives: counted in rounds or in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationType {
    Rounds,
    Events,
}

/// Spell payload. `round_created`/`event_created` are stamped by the action
/// service at scheduling time and are the anchor for expiry arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpellCast {
    pub spell_name: String,
    pub from: Position,
    pub to: Position,
    /// Token the spell is aimed at, if any.
    pub target_token_id: Option<Uuid>,
    /// When true, the destination is resolved to the target token's live
    /// position at execution time instead of the scheduled `to` literal.
    #[serde(default)]
    pub track_target: bool,
    /// 0 means no lingering effect after the transient animation.
    #[serde(default)]
    pub persist_duration: u32,
    pub duration_type: DurationType,
    #[serde(default)]
    pub round_created: u32,
    #[serde(default)]
    pub event_created: u32,
    /// Presentation extras (color, radius, shape preset) passed through to
    /// the spawned effect object untouched.
    #[serde(default)]
    pub props: serde_json::Value,
}

/// Attack payload. Transient only — attacks never spawn persistent effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackStrike {
    pub weapon: String,
    pub from: Position,
    pub to: Position,
    pub target_token_id: Option<Uuid>,
    #[serde(default)]
    pub track_target: bool,
}

/// Type-specific payload of a scheduled action. Matched exhaustively by the
/// execution engine; each variant carries its own required-field set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionKind {
    Move {
        from: Position,
        to: Position,
        #[serde(default)]
        duration_ms: u64,
    },
    Spell(SpellCast),
    Attack(AttackStrike),
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl ActionKind {
    /// Short label for logs and history entries.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            ActionKind::Move { .. } => "move",
            ActionKind::Spell(_) => "spell",
            ActionKind::Attack(_) => "attack",
            ActionKind::Custom { .. } => "custom",
        }
    }
}

/// A scheduled effect tied to a token and an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    /// Token performing (or originating) the action.
    pub token_id: Uuid,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl Action {
    #[must_use]
    pub fn new(token_id: Uuid, kind: ActionKind) -> Self {
        Self { id: Uuid::new_v4(), token_id, kind }
    }
}

// =============================================================================
// EVENTS AND ROUNDS
// =============================================================================

/// A sub-step of a round in which a batch of actions execute together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// 1-based position within the owning round.
    pub number: u32,
    /// Back-reference; must equal the owning round's number.
    pub round_number: u32,
    pub actions: Vec<Action>,
    pub executed: bool,
    pub ts: i64,
}

impl Event {
    #[must_use]
    pub fn new(number: u32, round_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            round_number,
            actions: Vec::new(),
            executed: false,
            ts: now_ms(),
        }
    }
}

/// One combat turn cycle, containing ordered events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: Uuid,
    /// 1-based, unique, monotonic across the timeline.
    pub number: u32,
    pub events: Vec<Event>,
    pub executed: bool,
    pub ts: i64,
}

impl Round {
    #[must_use]
    pub fn new(number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            events: vec![Event::new(1, number)],
            executed: false,
            ts: now_ms(),
        }
    }

    /// All actions of the round in event order. Derived on demand so it can
    /// never drift out of sync with the per-event lists.
    pub fn all_actions(&self) -> impl Iterator<Item = &Action> {
        self.events.iter().flat_map(|e| e.actions.iter())
    }

    #[must_use]
    pub fn action_count(&self) -> usize {
        self.events.iter().map(|e| e.actions.len()).sum()
    }

    #[must_use]
    pub fn event(&self, number: u32) -> Option<&Event> {
        self.events.iter().find(|e| e.number == number)
    }

    pub fn event_mut(&mut self, number: u32) -> Option<&mut Event> {
        self.events.iter_mut().find(|e| e.number == number)
    }

    /// Last event number present in the round. Rounds always hold at least
    /// one event, so an empty list only occurs on hand-built fixtures.
    #[must_use]
    pub fn last_event_number(&self) -> u32 {
        self.events.last().map_or(0, |e| e.number)
    }

    /// Append trailing events until `number` exists, then return it.
    pub fn ensure_event(&mut self, number: u32) -> &mut Event {
        let round_number = self.number;
        while self.last_event_number() < number {
            let next = self.last_event_number() + 1;
            self.events.push(Event::new(next, round_number));
        }
        // Events are created densely above, so the lookup cannot miss.
        self.event_mut(number).unwrap_or_else(|| unreachable!())
    }
}

// =============================================================================
// HISTORY AND EFFECT BOOKKEEPING
// =============================================================================

/// One line of the combat history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: i64,
    pub round: u32,
    pub event: u32,
    pub message: String,
}

/// Weak reference to a persistent effect object spawned in the map object
/// store. Stamps are optional: an effect missing its creation round or
/// duration is treated as never expiring rather than silently deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEffect {
    /// Id of the `persistent_effect` object in the map object store.
    pub object_id: Uuid,
    /// Id of the spell action that spawned it. Re-executing that action
    /// (replay) must not spawn a second effect.
    pub source_action_id: Uuid,
    pub round_created: Option<u32>,
    pub event_created: Option<u32>,
    pub persist_duration: Option<u32>,
    pub duration_type: DurationType,
}

// =============================================================================
// TIMELINE
// =============================================================================

/// Aggregate root for one map's combat state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    pub rounds: Vec<Round>,
    /// Number (not index) of the round the pointer is on.
    pub current_round: u32,
    /// Number of the event the pointer is on, within the current round.
    pub current_event: u32,
    pub is_active: bool,
    pub history: Vec<LogEntry>,
    pub tracked_effects: Vec<TrackedEffect>,
}

impl Timeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rounds: Vec::new(),
            current_round: 1,
            current_event: 1,
            is_active: false,
            history: Vec::new(),
            tracked_effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn round(&self, number: u32) -> Option<&Round> {
        self.rounds.iter().find(|r| r.number == number)
    }

    pub fn round_mut(&mut self, number: u32) -> Option<&mut Round> {
        self.rounds.iter_mut().find(|r| r.number == number)
    }

    #[must_use]
    pub fn last_round_number(&self) -> u32 {
        self.rounds.last().map_or(0, |r| r.number)
    }

    /// Append trailing rounds until `number` exists, then return it.
    /// Keeps round numbers dense and monotonic.
    pub fn ensure_round(&mut self, number: u32) -> &mut Round {
        while self.last_round_number() < number {
            let next = self.last_round_number() + 1;
            self.rounds.push(Round::new(next));
        }
        self.round_mut(number).unwrap_or_else(|| unreachable!())
    }

    /// Append a history entry stamped with the current pointer.
    pub fn log(&mut self, message: impl Into<String>) {
        self.history.push(LogEntry {
            ts: now_ms(),
            round: self.current_round,
            event: self.current_event,
            message: message.into(),
        });
    }

    /// Structural invariant check, used by tests and debug assertions:
    /// round numbers dense and 1-based, event back-references correct,
    /// pointer on an existing round/event, at most one trailing open round.
    #[must_use]
    pub fn check_invariants(&self) -> Result<(), String> {
        for (i, round) in self.rounds.iter().enumerate() {
            let expected = u32::try_from(i + 1).unwrap_or(u32::MAX);
            if round.number != expected {
                return Err(format!("round number {} at index {i}", round.number));
            }
            for (j, event) in round.events.iter().enumerate() {
                let expected = u32::try_from(j + 1).unwrap_or(u32::MAX);
                if event.number != expected {
                    return Err(format!(
                        "event number {} at index {j} of round {}",
                        event.number, round.number
                    ));
                }
                if event.round_number != round.number {
                    return Err(format!(
                        "event {} back-reference {} != round {}",
                        event.number, event.round_number, round.number
                    ));
                }
            }
        }
        let open = self.rounds.iter().filter(|r| !r.executed).count();
        if open > 1 {
            return Err(format!("{open} unexecuted rounds; at most one trailing open round allowed"));
        }
        if let Some(last) = self.rounds.last()
            && !last.executed
            && self.rounds.iter().rev().skip(1).any(|r| !r.executed)
        {
            return Err("unexecuted round is not the trailing one".into());
        }
        if !self.rounds.is_empty() {
            let Some(round) = self.round(self.current_round) else {
                return Err(format!("current_round {} does not exist", self.current_round));
            };
            if round.event(self.current_event).is_none() {
                return Err(format!(
                    "current_event {} does not exist in round {}",
                    self.current_event, self.current_round
                ));
            }
        }
        Ok(())
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "timeline_test.rs"]
mod tests;
