// Wire protocol for the draft event stream.
//
// The server pushes two frame shapes over the draft socket: a one-time
// `initial_events` backfill and single `draft_event` frames that may carry a
// full draft snapshot. Event payloads are decoded into typed variants keyed on
// `event_type`; anything outside the closed set is a protocol error for that
// frame only.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported frame type `{0}`")]
    UnsupportedFrame(String),
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Server-side primary key of a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftId(pub u64);

impl fmt::Display for DraftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event id, unique and monotonically increasing within one draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DraftStarted,
    DraftCompleted,
    CaptainAssigned,
    PlayerPicked,
    TieRoll,
    PickUndone,
}

impl EventType {
    /// Whether events of this type warrant a transient notification.
    /// `captain_assigned` and `pick_undone` only show up in history views.
    pub fn is_significant(self) -> bool {
        matches!(
            self,
            EventType::DraftStarted
                | EventType::DraftCompleted
                | EventType::PlayerPicked
                | EventType::TieRoll
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::DraftStarted => "draft_started",
            EventType::DraftCompleted => "draft_completed",
            EventType::CaptainAssigned => "captain_assigned",
            EventType::PlayerPicked => "player_picked",
            EventType::TieRoll => "tie_roll",
            EventType::PickUndone => "pick_undone",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user who caused an event. Display fields only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub pk: i64,
    pub username: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Actor {
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.username)
    }
}

/// Payload shared by `draft_started` and `draft_completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftLifecycle {
    pub draft_id: u64,
    pub draft_style: String,
    pub team_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptainAssigned {
    pub round: u32,
    pub captain_id: i64,
    pub captain_name: String,
    pub team_id: i64,
    pub was_tie: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerPicked {
    pub round: u32,
    pub captain_id: i64,
    pub captain_name: String,
    pub picked_id: i64,
    pub picked_name: String,
    pub team_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiedCaptain {
    pub id: i64,
    pub name: String,
    pub mmr: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptainRoll {
    pub captain_id: i64,
    pub roll: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TieRoll {
    pub tied_captains: Vec<TiedCaptain>,
    /// One inner list per roll-off round, until a single winner remains.
    pub roll_rounds: Vec<Vec<CaptainRoll>>,
    pub winner_id: i64,
    pub winner_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickUndone {
    pub round: u32,
    pub captain_name: String,
    pub picked_name: String,
}

/// Typed event payload, one variant per `event_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    DraftStarted(DraftLifecycle),
    DraftCompleted(DraftLifecycle),
    CaptainAssigned(CaptainAssigned),
    PlayerPicked(PlayerPicked),
    TieRoll(TieRoll),
    PickUndone(PickUndone),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::DraftStarted(_) => EventType::DraftStarted,
            EventPayload::DraftCompleted(_) => EventType::DraftCompleted,
            EventPayload::CaptainAssigned(_) => EventType::CaptainAssigned,
            EventPayload::PlayerPicked(_) => EventType::PlayerPicked,
            EventPayload::TieRoll(_) => EventType::TieRoll,
            EventPayload::PickUndone(_) => EventType::PickUndone,
        }
    }

    fn decode(event_type: EventType, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            EventType::DraftStarted => EventPayload::DraftStarted(serde_json::from_value(payload)?),
            EventType::DraftCompleted => {
                EventPayload::DraftCompleted(serde_json::from_value(payload)?)
            }
            EventType::CaptainAssigned => {
                EventPayload::CaptainAssigned(serde_json::from_value(payload)?)
            }
            EventType::PlayerPicked => EventPayload::PlayerPicked(serde_json::from_value(payload)?),
            EventType::TieRoll => EventPayload::TieRoll(serde_json::from_value(payload)?),
            EventType::PickUndone => EventPayload::PickUndone(serde_json::from_value(payload)?),
        })
    }

    fn encode(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventPayload::DraftStarted(p) | EventPayload::DraftCompleted(p) => {
                serde_json::to_value(p)
            }
            EventPayload::CaptainAssigned(p) => serde_json::to_value(p),
            EventPayload::PlayerPicked(p) => serde_json::to_value(p),
            EventPayload::TieRoll(p) => serde_json::to_value(p),
            EventPayload::PickUndone(p) => serde_json::to_value(p),
        }
    }
}

/// An immutable fact about a draft, as delivered by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub struct DraftEvent {
    pub id: EventId,
    pub payload: EventPayload,
    pub actor: Option<Actor>,
    pub created_at: DateTime<Utc>,
}

impl DraftEvent {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn is_significant(&self) -> bool {
        self.event_type().is_significant()
    }

    /// True when the event was created no more than `window` before `now`.
    /// Events stamped in the future (clock skew) count as recent.
    pub fn is_recent(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (now - self.created_at).to_std() {
            Ok(age) => age <= window,
            Err(_) => true,
        }
    }

    /// Human-readable toast text for significant events, `None` otherwise.
    pub fn notification_text(&self) -> Option<String> {
        match &self.payload {
            EventPayload::DraftStarted(p) => Some(format!(
                "Draft started: {} draft with {} teams",
                p.draft_style, p.team_count
            )),
            EventPayload::DraftCompleted(_) => Some("Draft complete! All teams are set.".into()),
            EventPayload::PlayerPicked(p) => Some(format!(
                "{} picked {} (round {})",
                p.captain_name, p.picked_name, p.round
            )),
            EventPayload::TieRoll(p) => Some(format!(
                "Tie resolved by roll: {} picks next",
                p.winner_name
            )),
            EventPayload::CaptainAssigned(_) | EventPayload::PickUndone(_) => None,
        }
    }
}

/// Serde shape of a [`DraftEvent`] on the wire: the payload stays untyped
/// until `event_type` is known.
#[derive(Serialize, Deserialize)]
struct WireEvent {
    id: EventId,
    event_type: EventType,
    payload: Value,
    #[serde(default)]
    actor: Option<Actor>,
    created_at: DateTime<Utc>,
}

impl TryFrom<WireEvent> for DraftEvent {
    type Error = serde_json::Error;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        Ok(DraftEvent {
            id: wire.id,
            payload: EventPayload::decode(wire.event_type, wire.payload)?,
            actor: wire.actor,
            created_at: wire.created_at,
        })
    }
}

impl From<DraftEvent> for WireEvent {
    fn from(event: DraftEvent) -> Self {
        WireEvent {
            id: event.id,
            event_type: event.event_type(),
            // Payload structs are plain data; encoding cannot fail.
            payload: event.payload.encode().unwrap_or(Value::Null),
            actor: event.actor,
            created_at: event.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Authoritative projection of the full draft state. Only `users_remaining`
/// is interpreted here; every other field is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_remaining: Option<Vec<Value>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DraftSnapshot {
    pub fn users_remaining_count(&self) -> usize {
        self.users_remaining.as_ref().map_or(0, Vec::len)
    }

    /// A draft is complete once the server reports an empty pool.
    pub fn is_pool_exhausted(&self) -> bool {
        self.users_remaining.as_ref().is_some_and(Vec::is_empty)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    InitialEvents {
        events: Vec<DraftEvent>,
    },
    DraftEvent {
        event: DraftEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        draft_state: Option<DraftSnapshot>,
    },
}

/// Decode a raw text frame. Unknown `type` tags are reported separately from
/// structurally broken JSON so the log line says which one happened.
pub fn decode_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    match value.get("type").and_then(Value::as_str) {
        Some("initial_events") | Some("draft_event") => Ok(serde_json::from_value(value)?),
        Some(other) => Err(ProtocolError::UnsupportedFrame(other.to_string())),
        None => Err(ProtocolError::UnsupportedFrame("<missing>".into())),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
