use crate::units::ids::{now_millis, IdGenerator};
use crate::units::pdu::{Pdu, PduDecodeError, PduRef};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Transaction is a batch of PDUs sent from one home server to another in one round-trip.
///
/// PDUs are kept in their wire form so that one undecodable PDU never makes the whole envelope
/// undecodable. Transactions produced from responses to requests (get pdu, state, paginate) have
/// no `transaction_id`; those are never deduplicated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_ids: Vec<String>,
    #[serde(default)]
    pub pdus: Vec<Value>,
    #[serde(flatten)]
    pub unrecognized_keys: Map<String, Value>,
}

impl Transaction {
    /// Creates a new outgoing transaction to `destination`, stamping the new transaction id onto
    /// each PDU before encoding it.
    pub fn create_new(
        origin: &str,
        destination: &str,
        pdus: &mut [Pdu],
        ids: &IdGenerator,
    ) -> Result<Self, serde_json::Error> {
        let transaction_id = ids.next_id();

        let mut encoded = Vec::with_capacity(pdus.len());
        for pdu in pdus.iter_mut() {
            pdu.transaction_id = Some(transaction_id.clone());
            encoded.push(pdu.to_json()?);
        }

        Ok(Transaction {
            transaction_id: Some(transaction_id),
            origin: origin.to_string(),
            destination: Some(destination.to_string()),
            ts: now_millis(),
            previous_ids: Vec::new(),
            pdus: encoded,
            unrecognized_keys: Map::new(),
        })
    }

    /// Wraps PDUs in a transaction-shaped envelope for responding to requests.
    pub fn wrap_pdus(origin: &str, pdus: &[Pdu]) -> Result<Self, serde_json::Error> {
        let encoded = pdus.iter().map(Pdu::to_json).collect::<Result<Vec<_>, _>>()?;

        Ok(Transaction {
            transaction_id: None,
            origin: origin.to_string(),
            destination: None,
            ts: now_millis(),
            previous_ids: Vec::new(),
            pdus: encoded,
            unrecognized_keys: Map::new(),
        })
    }

    /// Decodes every PDU independently.
    pub fn decode_pdus(&self) -> Vec<Result<Pdu, PduDecodeError>> {
        self.pdus.iter().cloned().map(Pdu::from_json).collect()
    }

    /// `(pdu_id, origin)` of every PDU that is at least identifiable.
    pub fn pdu_refs(&self) -> Vec<PduRef> {
        self.pdus
            .iter()
            .filter_map(|p| {
                let pdu_id = p.get("pdu_id")?.as_str()?;
                let origin = p.get("origin")?.as_str()?;
                Some(PduRef::new(pdu_id, origin))
            })
            .collect()
    }

    pub fn from_json(value: Value) -> Result<Self, TransactionDecodeError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionDecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// TransactionResponse is how a home server answered a transaction: an HTTP-like status code and a
/// JSON body. Kept for received transactions so retries get the exact same answer.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionResponse {
    pub code: u16,
    pub body: Value,
}

impl TransactionResponse {
    pub fn new(code: u16, body: Value) -> Self {
        TransactionResponse { code, body }
    }

    pub fn is_success(&self) -> bool {
        self.code == 200
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionDecodeError {
    #[error("Malformed transaction: {0}")]
    Malformed(#[from] serde_json::Error),
}
