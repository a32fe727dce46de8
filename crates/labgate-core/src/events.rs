//! Normalization of machine payloads from push events and REST records.
//!
//! Server payloads drift in shape: ids arrive as numbers or strings,
//! booleans as `0`/`1`, the machine may be nested under `computer` or
//! `machine`, and timestamps come in several formats. Everything here turns
//! that into a [`MachinePatch`] plus a [`Revision`].

use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::machine::{MachineId, MachinePatch, MachineStatus};
use crate::time::Revision;

/// Namespace the broadcaster prefixes onto class-named events.
const EVENT_NAMESPACE: &str = "App\\Events\\";

/// Keys searched, in order, for a write's revision.
const REVISION_KEYS: [&str; 4] = ["revision", "sequence", "last_seen_at", "updated_at"];

/// Push events that carry machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushEventKind {
    /// Generic state update; only the fields in the payload change.
    #[serde(rename = "computer.status")]
    Status,
    #[serde(rename = "computer.locked")]
    Locked,
    #[serde(rename = "computer.unlocked")]
    Unlocked,
    #[serde(rename = "computer.online")]
    Online,
    #[serde(rename = "computer.offline")]
    Offline,
}

impl PushEventKind {
    pub const ALL: [PushEventKind; 5] = [
        Self::Status,
        Self::Locked,
        Self::Unlocked,
        Self::Online,
        Self::Offline,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "computer.status",
            Self::Locked => "computer.locked",
            Self::Unlocked => "computer.unlocked",
            Self::Online => "computer.online",
            Self::Offline => "computer.offline",
        }
    }

    /// Recognize an event name as broadcast, with or without the class
    /// namespace or the leading `.` used for custom broadcast names.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match canonical_event_name(name) {
            "computer.status" | "computer.updated" | "ComputerStatusUpdated"
            | "ComputerUpdated" => Some(Self::Status),
            "computer.locked" | "ComputerLocked" => Some(Self::Locked),
            "computer.unlocked" | "ComputerUnlocked" => Some(Self::Unlocked),
            "computer.online" | "ComputerOnline" => Some(Self::Online),
            "computer.offline" | "ComputerOffline" => Some(Self::Offline),
            _ => None,
        }
    }

    /// Fields the event name itself implies, applied over the payload.
    fn implied(self, patch: &mut MachinePatch) {
        match self {
            Self::Status => {}
            Self::Locked => patch.is_locked = Some(true),
            Self::Unlocked => patch.is_locked = Some(false),
            Self::Online => patch.is_online = Some(true),
            Self::Offline => patch.is_online = Some(false),
        }
    }
}

impl fmt::Display for PushEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip the class namespace and a leading `.` from a broadcast event name.
pub fn canonical_event_name(name: &str) -> &str {
    let name = name.trim();
    let name = name.strip_prefix(EVENT_NAMESPACE).unwrap_or(name);
    name.strip_prefix('.').unwrap_or(name)
}

/// A push event reduced to a mergeable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineUpdate {
    pub id: MachineId,
    pub patch: MachinePatch,
    pub revision: Revision,
}

/// A machine record from a REST response. The revision is optional here;
/// callers stamp records without one from their own clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    pub id: MachineId,
    pub patch: MachinePatch,
    pub revision: Option<Revision>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    NotAnObject,
    MissingId,
    /// Push writes without a revision cannot be ordered.
    MissingRevision { machine: MachineId },
    InvalidField { field: &'static str, value: String },
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "payload is not a JSON object"),
            Self::MissingId => write!(f, "payload has no machine id"),
            Self::MissingRevision { machine } => {
                write!(f, "payload for machine {machine} carries no revision")
            }
            Self::InvalidField { field, value } => {
                write!(f, "field `{field}` has unusable value {value}")
            }
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Normalize a push payload for `kind` into a write.
///
/// The machine may sit at the top level or under `computer` / `machine`.
/// The revision is looked up on the envelope first, then on the machine.
pub fn normalize(kind: PushEventKind, payload: &Value) -> Result<MachineUpdate, NormalizeError> {
    let envelope = payload.as_object().ok_or(NormalizeError::NotAnObject)?;
    let body = nested_machine(envelope).unwrap_or(envelope);

    let mut record = record_from_object(body)?;
    kind.implied(&mut record.patch);

    let revision = find_revision(envelope)
        .or(record.revision)
        .ok_or(NormalizeError::MissingRevision { machine: record.id })?;

    Ok(MachineUpdate {
        id: record.id,
        patch: record.patch,
        revision,
    })
}

/// Normalize one machine object from a REST listing or mutation response.
pub fn normalize_record(value: &Value) -> Result<MachineRecord, NormalizeError> {
    let object = value.as_object().ok_or(NormalizeError::NotAnObject)?;
    record_from_object(object)
}

/// Parse a revision from a JSON value: a non-negative integer, a numeric
/// string, an RFC 3339 timestamp, or a `YYYY-MM-DD HH:MM:SS` UTC timestamp.
/// Timestamps become milliseconds since the Unix epoch. Values above
/// [`Revision::MAX`] are rejected.
pub fn parse_revision(value: &Value) -> Option<Revision> {
    parse_raw_revision(value).filter(|rev| *rev <= Revision::MAX)
}

fn parse_raw_revision(value: &Value) -> Option<Revision> {
    match value {
        Value::Number(n) => n.as_u64().map(Revision),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<u64>() {
                return Some(Revision(n));
            }
            let millis = DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        .map(|dt| dt.and_utc().timestamp_millis())
                })
                .ok()?;
            u64::try_from(millis).ok().map(Revision)
        }
        _ => None,
    }
}

fn nested_machine(envelope: &Map<String, Value>) -> Option<&Map<String, Value>> {
    ["computer", "machine"]
        .iter()
        .find_map(|key| envelope.get(*key).and_then(Value::as_object))
}

fn find_revision(object: &Map<String, Value>) -> Option<Revision> {
    REVISION_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(parse_revision))
}

fn record_from_object(object: &Map<String, Value>) -> Result<MachineRecord, NormalizeError> {
    let id = ["id", "computer_id", "machine_id"]
        .iter()
        .find_map(|key| object.get(*key).and_then(as_id))
        .ok_or(NormalizeError::MissingId)?;

    let mut patch = MachinePatch::default();

    if let Some(ip) = first(object, &["ip_address", "ip"]) {
        patch.ip_address = Some(as_text(ip, "ip_address")?);
    }
    if let Some(number) = first(object, &["computer_number", "machine_number", "number"]) {
        patch.number = Some(as_text(number, "computer_number")?);
    }
    if let Some(lab) = object.get("laboratory_id") {
        patch.laboratory_id = Some(as_optional_id(lab, "laboratory_id")?);
    } else if let Some(lab) = object.get("laboratory") {
        // Eager-loaded relation: `{ "id": .. }` or null
        let id = match lab {
            Value::Null => None,
            Value::Object(o) => o.get("id").and_then(as_id),
            other => return Err(invalid("laboratory", other)),
        };
        patch.laboratory_id = Some(id);
    }
    if let Some(online) = first(object, &["is_online", "online"]) {
        patch.is_online = Some(as_flag(online, "is_online")?);
    }
    if let Some(locked) = first(object, &["is_locked", "locked"]) {
        patch.is_locked = Some(as_flag(locked, "is_locked")?);
    }
    match object.get("status") {
        Some(Value::String(s)) => match MachineStatus::parse(s) {
            Some(status) => patch.status = Some(status),
            None => tracing::debug!(machine = id, status = %s, "Ignoring unknown machine status"),
        },
        Some(Value::Null) | None => {}
        Some(other) => return Err(invalid("status", other)),
    }

    Ok(MachineRecord {
        id,
        patch,
        revision: find_revision(object),
    })
}

fn first<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| object.get(*key).filter(|v| !v.is_null()))
}

fn invalid(field: &'static str, value: &Value) -> NormalizeError {
    NormalizeError::InvalidField {
        field,
        value: value.to_string(),
    }
}

fn as_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_optional_id(value: &Value, field: &'static str) -> Result<Option<u64>, NormalizeError> {
    if value.is_null() {
        return Ok(None);
    }
    as_id(value).map(Some).ok_or_else(|| invalid(field, value))
}

fn as_text(value: &Value, field: &'static str) -> Result<String, NormalizeError> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(invalid(field, other)),
    }
}

fn as_flag(value: &Value, field: &'static str) -> Result<bool, NormalizeError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(invalid(field, value)),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            _ => Err(invalid(field, value)),
        },
        other => Err(invalid(field, other)),
    }
}
