use crate::units::ids::{now_millis, IdGenerator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::TryFrom;
use std::fmt;

/// PduRef is the globally unique identity of a PDU: the `(pdu_id, origin)` pair.
///
/// On the wire it is a two element array, `["pdu_id", "origin"]`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct PduRef {
    pub pdu_id: String,
    pub origin: String,
}

impl PduRef {
    pub fn new(pdu_id: impl Into<String>, origin: impl Into<String>) -> Self {
        PduRef {
            pdu_id: pdu_id.into(),
            origin: origin.into(),
        }
    }

    /// `pdu_id@origin`, the form used by the client-facing event layer.
    pub fn to_event_id(&self) -> String {
        format!("{}@{}", self.pdu_id, self.origin)
    }

    /// Inverse of `to_event_id()`. An event id without an `@` was created locally.
    pub fn from_event_id(event_id: &str, local_server_name: &str) -> Self {
        match event_id.split_once('@') {
            Some((pdu_id, origin)) => PduRef::new(pdu_id, origin),
            None => PduRef::new(event_id, local_server_name),
        }
    }
}

impl From<(String, String)> for PduRef {
    fn from((pdu_id, origin): (String, String)) -> Self {
        PduRef { pdu_id, origin }
    }
}

impl From<PduRef> for (String, String) {
    fn from(pdu_ref: PduRef) -> Self {
        (pdu_ref.pdu_id, pdu_ref.origin)
    }
}

impl fmt::Display for PduRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pdu_id, self.origin)
    }
}

/// StateKey is the `(context, pdu_type, state_key)` triple. At most one PDU is current state for
/// any given StateKey.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct StateKey {
    pub context: String,
    pub pdu_type: String,
    pub state_key: String,
}

/// Fields only state PDUs carry.
#[derive(Clone, Debug, PartialEq)]
pub struct StateFields {
    pub state_key: String,
    /// Absent on the wire is kept absent. It ranks below every present power level.
    pub power_level: Option<i64>,
    /// The state PDU this one claims to supersede. `None` for the first state PDU of its key.
    pub prev_state: Option<PduRef>,
}

/// Pdu is a single causally tracked unit of room data or room state.
///
/// `destinations`, `transaction_id` and `outlier` are local bookkeeping and never go over the
/// wire. Keys we don't recognize are kept in `unrecognized_keys` and emitted again verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "PduJson", try_from = "PduJson")]
pub struct Pdu {
    pub pdu_id: String,
    pub origin: String,
    pub context: String,
    pub pdu_type: String,
    pub ts: i64,
    pub depth: u64,
    pub prev_pdus: Vec<PduRef>,
    pub content: Value,
    pub state: Option<StateFields>,
    pub destinations: Vec<String>,
    pub transaction_id: Option<String>,
    pub outlier: bool,
    pub unrecognized_keys: Map<String, Value>,
}

/// NewPdu holds what the application supplies when creating an outgoing PDU. Causal fields are
/// filled in later, just before the PDU is persisted.
#[derive(Clone, Debug, Default)]
pub struct NewPdu {
    pub pdu_id: Option<String>,
    pub ts: Option<i64>,
    pub context: String,
    pub pdu_type: String,
    pub content: Value,
    pub destinations: Vec<String>,
    pub state: Option<NewStateFields>,
    pub unrecognized_keys: Map<String, Value>,
}

#[derive(Clone, Debug, Default)]
pub struct NewStateFields {
    pub state_key: String,
    pub power_level: i64,
}

impl Pdu {
    /// Creates a new outgoing PDU, allocating `pdu_id` and `ts` if the caller didn't.
    pub fn create_new(origin: &str, fields: NewPdu, ids: &IdGenerator) -> Self {
        Pdu {
            pdu_id: fields.pdu_id.unwrap_or_else(|| ids.next_id()),
            origin: origin.to_string(),
            context: fields.context,
            pdu_type: fields.pdu_type,
            ts: fields.ts.unwrap_or_else(now_millis),
            depth: 0,
            prev_pdus: Vec::new(),
            content: fields.content,
            state: fields.state.map(|s| StateFields {
                state_key: s.state_key,
                power_level: Some(s.power_level),
                prev_state: None,
            }),
            destinations: fields.destinations,
            transaction_id: None,
            outlier: false,
            unrecognized_keys: fields.unrecognized_keys,
        }
    }

    /// Decodes a PDU from its wire JSON. The result is never an outlier; callers decide that.
    pub fn from_json(value: Value) -> Result<Self, PduDecodeError> {
        let wire: PduJson = serde_json::from_value(value)?;
        Pdu::try_from(wire)
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn pdu_ref(&self) -> PduRef {
        PduRef::new(self.pdu_id.clone(), self.origin.clone())
    }

    pub fn is_ref(&self, pdu_ref: &PduRef) -> bool {
        self.pdu_id == pdu_ref.pdu_id && self.origin == pdu_ref.origin
    }

    pub fn is_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn state_key(&self) -> Option<StateKey> {
        self.state.as_ref().map(|s| StateKey {
            context: self.context.clone(),
            pdu_type: self.pdu_type.clone(),
            state_key: s.state_key.clone(),
        })
    }

    pub fn prev_state(&self) -> Option<&PduRef> {
        self.state.as_ref().and_then(|s| s.prev_state.as_ref())
    }

    pub fn power_level(&self) -> Option<i64> {
        self.state.as_ref().and_then(|s| s.power_level)
    }

    pub fn with_outlier(mut self, outlier: bool) -> Self {
        self.outlier = outlier;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PduDecodeError {
    #[error("Malformed PDU: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("State PDU is missing required key `state_key`")]
    MissingStateKey,
    #[error("State PDU has only one of `prev_state_id` and `prev_state_origin`")]
    PartialPrevState,
}

// ------- Wire format --------

#[derive(Serialize, Deserialize)]
struct PduJson {
    pdu_id: String,
    context: String,
    origin: String,
    ts: i64,
    pdu_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    prev_pdus: Vec<PduRef>,
    #[serde(default)]
    depth: u64,
    content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    power_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev_state_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prev_state_origin: Option<String>,

    // Internal keys. Accepted so they don't land in the unrecognized bag, never emitted.
    #[serde(default, skip_serializing)]
    destinations: Vec<String>,
    #[serde(default, skip_serializing)]
    transaction_id: Option<String>,
    // Decoded PDUs are never outliers, whatever the sender claims.
    #[allow(dead_code)]
    #[serde(default, skip_serializing)]
    outlier: bool,

    #[serde(flatten)]
    unrecognized_keys: Map<String, Value>,
}

impl TryFrom<PduJson> for Pdu {
    type Error = PduDecodeError;

    fn try_from(mut wire: PduJson) -> Result<Self, Self::Error> {
        let state = if wire.is_state == Some(true) {
            let state_key = wire.state_key.ok_or(PduDecodeError::MissingStateKey)?;
            let prev_state = match (wire.prev_state_id, wire.prev_state_origin) {
                (Some(pdu_id), Some(origin)) => Some(PduRef { pdu_id, origin }),
                (None, None) => None,
                _ => return Err(PduDecodeError::PartialPrevState),
            };
            Some(StateFields {
                state_key,
                power_level: wire.power_level,
                prev_state,
            })
        } else {
            // State keys on a non-state PDU mean nothing to us, but they still go back out.
            let extra = &mut wire.unrecognized_keys;
            if let Some(is_state) = wire.is_state {
                extra.insert("is_state".into(), Value::from(is_state));
            }
            if let Some(state_key) = wire.state_key {
                extra.insert("state_key".into(), Value::from(state_key));
            }
            if let Some(power_level) = wire.power_level {
                extra.insert("power_level".into(), Value::from(power_level));
            }
            if let Some(prev_state_id) = wire.prev_state_id {
                extra.insert("prev_state_id".into(), Value::from(prev_state_id));
            }
            if let Some(prev_state_origin) = wire.prev_state_origin {
                extra.insert("prev_state_origin".into(), Value::from(prev_state_origin));
            }
            None
        };

        Ok(Pdu {
            pdu_id: wire.pdu_id,
            origin: wire.origin,
            context: wire.context,
            pdu_type: wire.pdu_type,
            ts: wire.ts,
            depth: wire.depth,
            prev_pdus: wire.prev_pdus,
            content: wire.content,
            state,
            destinations: wire.destinations,
            transaction_id: wire.transaction_id,
            outlier: false,
            unrecognized_keys: wire.unrecognized_keys,
        })
    }
}

impl From<Pdu> for PduJson {
    fn from(pdu: Pdu) -> Self {
        let (is_state, state_key, power_level, prev_state_id, prev_state_origin) = match pdu.state {
            Some(state) => {
                let (prev_id, prev_origin) = match state.prev_state {
                    Some(prev) => (Some(prev.pdu_id), Some(prev.origin)),
                    None => (None, None),
                };
                (Some(true), Some(state.state_key), state.power_level, prev_id, prev_origin)
            }
            None => (None, None, None, None, None),
        };

        PduJson {
            pdu_id: pdu.pdu_id,
            context: pdu.context,
            origin: pdu.origin,
            ts: pdu.ts,
            pdu_type: pdu.pdu_type,
            prev_pdus: pdu.prev_pdus,
            depth: pdu.depth,
            content: pdu.content,
            is_state,
            state_key,
            power_level,
            prev_state_id,
            prev_state_origin,
            destinations: pdu.destinations,
            transaction_id: pdu.transaction_id,
            outlier: pdu.outlier,
            unrecognized_keys: pdu.unrecognized_keys,
        }
    }
}
