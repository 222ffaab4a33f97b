//! Per-node CRDT document.
//!
//! The merge algorithm is an injected capability: anything implementing
//! [`CrdtDocument`] with commutative, idempotent `apply_update` can back a
//! node. [`YrsDocument`] stores the attribute object as a top-level Yrs map,
//! one entry per attribute key, so concurrent writers touching different keys
//! both survive the merge.

use serde_json::{Map as JsonMap, Number, Value};
use std::collections::HashMap;
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use crate::error::{CoreError, Result};

const ATTRIBUTES_MAP: &str = "attributes";

pub trait CrdtDocument {
    /// Merge an encoded update. Applying the same update twice, or a set of
    /// updates in any order, converges to the same materialized value.
    fn apply_update(&mut self, update: &[u8]) -> Result<()>;

    /// Current attribute value as a JSON object.
    fn materialize(&self) -> Value;

    /// Encoded state vector, used as the `prior` argument of `diff_since`.
    fn state_vector(&self) -> Vec<u8>;

    /// Update carrying only what a peer at `prior_state_vector` is missing.
    fn diff_since(&self, prior_state_vector: &[u8]) -> Result<Vec<u8>>;

    /// Whole document as one update (compaction snapshot).
    fn encode_state(&self) -> Vec<u8>;

    /// Move the document to `value`, returning the fragment that does so.
    /// Only top-level keys whose value differs are touched.
    fn write(&mut self, value: &Value) -> Result<Vec<u8>>;
}

pub struct YrsDocument {
    doc: Doc,
    attributes: MapRef,
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl YrsDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let attributes = doc.get_or_insert_map(ATTRIBUTES_MAP);
        Self { doc, attributes }
    }

    /// Rebuild a document from a fragment log.
    pub fn replay<'a, I>(updates: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut document = Self::new();
        for update in updates {
            document.apply_update(update)?;
        }
        Ok(document)
    }

    /// Number of top-level attribute keys.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.attributes.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CrdtDocument for YrsDocument {
    fn apply_update(&mut self, update: &[u8]) -> Result<()> {
        let decoded =
            Update::decode_v1(update).map_err(|e| CoreError::CorruptUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| CoreError::CorruptUpdate(format!("{e:?}")))
    }

    fn materialize(&self) -> Value {
        let txn = self.doc.transact();
        let mut object = JsonMap::new();
        for (key, value) in self.attributes.iter(&txn) {
            if let Out::Any(any) = value {
                object.insert(key.to_string(), any_to_json(&any));
            }
        }
        Value::Object(object)
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff_since(&self, prior_state_vector: &[u8]) -> Result<Vec<u8>> {
        let prior = StateVector::decode_v1(prior_state_vector)
            .map_err(|e| CoreError::CorruptUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&prior))
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn write(&mut self, value: &Value) -> Result<Vec<u8>> {
        let target = value
            .as_object()
            .ok_or_else(|| CoreError::InvalidAttributes("attributes must be an object".into()))?;
        // Read first; the read transaction must be released before writing.
        let current = self.materialize();
        let current = current.as_object().cloned().unwrap_or_default();

        let mut txn = self.doc.transact_mut();
        for (key, value) in target {
            if current.get(key) != Some(value) {
                self.attributes.insert(&mut txn, key.as_str(), json_to_any(value));
            }
        }
        for key in current.keys() {
            if !target.contains_key(key) {
                self.attributes.remove(&mut txn, key.as_str());
            }
        }
        Ok(txn.encode_update_v1())
    }
}

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect()),
        Value::Object(map) => {
            let entries: HashMap<String, Any> =
                map.iter().map(|(k, v)| (k.clone(), json_to_any(v))).collect();
            Any::Map(Arc::new(entries))
        }
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}
