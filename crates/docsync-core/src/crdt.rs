//! Head-sets and the bridge between automerge documents and JSON values

use automerge::transaction::Transactable;
use automerge::{Automerge, ChangeHash, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};
use serde_json::{Map, Number, Value as Json};

use crate::error::{Error, Result};

/// The set of change hashes at the tip of a document's history.
///
/// Kept sorted so that two head-sets compare equal exactly when they
/// contain the same hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Heads(Vec<ChangeHash>);

impl Heads {
    pub fn new(mut hashes: Vec<ChangeHash>) -> Self {
        hashes.sort();
        hashes.dedup();
        Self(hashes)
    }

    /// Current heads of `doc`
    pub fn of(doc: &Automerge) -> Self {
        Self::new(doc.get_heads())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[ChangeHash] {
        &self.0
    }

    /// Keep only the hashes that `doc` knows about
    pub fn retain_known(&mut self, doc: &Automerge) {
        self.0.retain(|hash| doc.get_change_by_hash(hash).is_some());
    }
}

impl From<Vec<ChangeHash>> for Heads {
    fn from(hashes: Vec<ChangeHash>) -> Self {
        Self::new(hashes)
    }
}

impl std::fmt::Display for Heads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, hash) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let hex = hash.to_string();
            write!(f, "{}", &hex[..hex.len().min(8)])?;
        }
        write!(f, "]")
    }
}

/// Build a new document whose root map holds the entries of `seed`.
///
/// The seed must be a JSON object. An empty object yields an empty document
/// with no history.
pub fn from_seed(seed: &Json) -> Result<Automerge> {
    let entries = seed
        .as_object()
        .ok_or_else(|| Error::InvalidSeed(format!("expected an object, got {}", kind(seed))))?;

    let mut doc = Automerge::new();
    if entries.is_empty() {
        return Ok(doc);
    }

    doc.transact(|tx| {
        for (key, value) in entries {
            put_json(tx, &ROOT, key, value)?;
        }
        Ok::<_, automerge::AutomergeError>(())
    })
    .map_err(|failure| Error::Crdt(failure.error))?;

    Ok(doc)
}

/// Write `value` under `key` of the map `obj`, creating nested maps and lists.
pub fn put_json<T: Transactable>(
    tx: &mut T,
    obj: &ObjId,
    key: &str,
    value: &Json,
) -> std::result::Result<(), automerge::AutomergeError> {
    match value {
        Json::Object(entries) => {
            let child = tx.put_object(obj, key, ObjType::Map)?;
            for (k, v) in entries {
                put_json(tx, &child, k, v)?;
            }
        }
        Json::Array(items) => {
            let child = tx.put_object(obj, key, ObjType::List)?;
            for (i, item) in items.iter().enumerate() {
                insert_json(tx, &child, i, item)?;
            }
        }
        scalar => tx.put(obj, key, to_scalar(scalar))?,
    }
    Ok(())
}

fn insert_json<T: Transactable>(
    tx: &mut T,
    list: &ObjId,
    index: usize,
    value: &Json,
) -> std::result::Result<(), automerge::AutomergeError> {
    match value {
        Json::Object(entries) => {
            let child = tx.insert_object(list, index, ObjType::Map)?;
            for (k, v) in entries {
                put_json(tx, &child, k, v)?;
            }
        }
        Json::Array(items) => {
            let child = tx.insert_object(list, index, ObjType::List)?;
            for (i, item) in items.iter().enumerate() {
                insert_json(tx, &child, i, item)?;
            }
        }
        scalar => tx.insert(list, index, to_scalar(scalar))?,
    }
    Ok(())
}

fn to_scalar(value: &Json) -> ScalarValue {
    match value {
        Json::Null => ScalarValue::Null,
        Json::Bool(b) => ScalarValue::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Json::String(s) => ScalarValue::from(s.as_str()),
        // Containers are handled by the callers.
        Json::Array(_) | Json::Object(_) => ScalarValue::Null,
    }
}

/// Hydrate the whole document into a JSON value rooted at its root map.
pub fn to_json<R: ReadDoc>(doc: &R) -> Result<Json> {
    read_object(doc, &ROOT, ObjType::Map)
}

fn read_object<R: ReadDoc>(doc: &R, obj: &ObjId, obj_type: ObjType) -> Result<Json> {
    match obj_type {
        ObjType::Map | ObjType::Table => {
            let mut map = Map::new();
            for key in doc.keys(obj) {
                if let Some((value, id)) = doc.get(obj, key.as_str())? {
                    map.insert(key, read_value(doc, value, &id)?);
                }
            }
            Ok(Json::Object(map))
        }
        ObjType::List => {
            let mut items = Vec::with_capacity(doc.length(obj));
            for index in 0..doc.length(obj) {
                if let Some((value, id)) = doc.get(obj, index)? {
                    items.push(read_value(doc, value, &id)?);
                }
            }
            Ok(Json::Array(items))
        }
        ObjType::Text => Ok(Json::String(doc.text(obj)?)),
    }
}

fn read_value<R: ReadDoc>(doc: &R, value: Value<'_>, id: &ObjId) -> Result<Json> {
    match value {
        Value::Object(obj_type) => read_object(doc, id, obj_type),
        Value::Scalar(scalar) => Ok(scalar_to_json(scalar.as_ref())),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> Json {
    match scalar {
        ScalarValue::Null => Json::Null,
        ScalarValue::Boolean(b) => Json::Bool(*b),
        ScalarValue::Str(s) => Json::String(s.to_string()),
        ScalarValue::Int(i) => Json::from(*i),
        ScalarValue::Uint(u) => Json::from(*u),
        ScalarValue::F64(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        ScalarValue::Counter(_) | ScalarValue::Timestamp(_) => {
            scalar.to_i64().map(Json::from).unwrap_or(Json::Null)
        }
        ScalarValue::Bytes(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        _ => Json::Null,
    }
}

fn kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
