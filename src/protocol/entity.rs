//! Typed key/value parameters carried by requests and responses.
//!
//! An [`EntityBag`] is an ordered list of [`Entity`] records, each
//! holding one key and one typed [`Value`].  Keys are unique within
//! a bag: every setter replaces the value of an existing key in
//! place instead of appending a second record.
//!
//! Only six storage kinds exist on the wire.  The narrower integer
//! types are folded into them:
//!
//! * `u64`, `i32` and `u32` scalars are stored as `i64`;
//! * their list counterparts are stored as an `i64` list.
//!
//! The `u64` <-> `i64` conversion is a two's-complement bit cast
//! (`as`), never a numeric conversion, so `u64::MAX` survives the
//! round trip as `-1i64` on the wire.  The 32-bit getters truncate
//! the stored `i64` the same way.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the typed getters of an [`EntityBag`].
#[derive(Debug, Error)]
pub enum EntityError {
    /// No entity with the requested key exists.
    #[error("entity `{0}` not found")]
    NotFound(String),
    /// The key exists but holds a different kind of value.
    #[error("entity `{key}` holds {found}, not {expected}")]
    KindMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    /// The bytes slot could not be converted to or from JSON.
    #[error("entity `{key}` json: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The value slot of an [`Entity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Int64(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    StringList(Vec<String>),
    Int64List(Vec<i64>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Int64(_) => "int64",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
            Value::StringList(_) => "string list",
            Value::Int64List(_) => "int64 list",
        }
    }
}

/// A single key/value record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub value: Value,
}

/// Ordered, key-unique collection of entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityBag {
    entities: Vec<Entity>,
}

// Two's-complement reinterpretation between the unsigned API types and
// the signed storage type.  `as` between same-width integers keeps the
// bit pattern unchanged.
#[inline]
fn u64_to_bits(v: u64) -> i64 {
    v as i64
}

#[inline]
fn bits_to_u64(v: i64) -> u64 {
    v as u64
}

impl EntityBag {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys in the bag.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Iterate over the entities in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entity(key).is_some()
    }

    /// Look up the raw entity stored under `key`.
    pub fn entity(&self, key: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.key == key)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entities.iter_mut().find(|e| e.key == key) {
            Some(existing) => existing.value = value,
            None => self.entities.push(Entity { key, value }),
        }
    }

    /// Remove `key` from the bag, returning its value if it existed.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entities.iter().position(|e| e.key == key)?;
        Some(self.entities.remove(idx).value)
    }

    fn value(&self, key: &str) -> Result<&Value, EntityError> {
        self.entity(key)
            .map(|e| &e.value)
            .ok_or_else(|| EntityError::NotFound(key.to_string()))
    }

    fn mismatch(key: &str, expected: &'static str, found: &Value) -> EntityError {
        EntityError::KindMismatch {
            key: key.to_string(),
            expected,
            found: found.kind(),
        }
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    pub fn set_int64(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, Value::Int64(value));
    }

    pub fn set_int32(&mut self, key: impl Into<String>, value: i32) {
        self.set_int64(key, i64::from(value));
    }

    pub fn set_uint32(&mut self, key: impl Into<String>, value: u32) {
        self.set_int64(key, i64::from(value));
    }

    /// Store a `u64` by reinterpreting its bits as `i64`.
    pub fn set_uint64(&mut self, key: impl Into<String>, value: u64) {
        self.set_int64(key, u64_to_bits(value));
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, Value::Bool(value));
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.set(key, Value::Bytes(value.into()));
    }

    pub fn set_string_list<I, S>(&mut self, key: impl Into<String>, value: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(key, Value::StringList(value.into_iter().map(Into::into).collect()));
    }

    pub fn set_int64_list(&mut self, key: impl Into<String>, value: &[i64]) {
        self.set(key, Value::Int64List(value.to_vec()));
    }

    pub fn set_int32_list(&mut self, key: impl Into<String>, value: &[i32]) {
        self.set(key, Value::Int64List(value.iter().map(|v| i64::from(*v)).collect()));
    }

    pub fn set_uint32_list(&mut self, key: impl Into<String>, value: &[u32]) {
        self.set(key, Value::Int64List(value.iter().map(|v| i64::from(*v)).collect()));
    }

    pub fn set_uint64_list(&mut self, key: impl Into<String>, value: &[u64]) {
        self.set(key, Value::Int64List(value.iter().map(|v| u64_to_bits(*v)).collect()));
    }

    /// Serialize `value` as JSON into the bytes slot of `key`.
    pub fn set_json<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), EntityError> {
        let key = key.into();
        let bytes = serde_json::to_vec(value).map_err(|source| EntityError::Json {
            key: key.clone(),
            source,
        })?;
        self.set(key, Value::Bytes(bytes));
        Ok(())
    }

    pub fn get_string(&self, key: &str) -> Result<&str, EntityError> {
        match self.value(key)? {
            Value::String(s) => Ok(s),
            other => Err(Self::mismatch(key, "string", other)),
        }
    }

    pub fn get_int64(&self, key: &str) -> Result<i64, EntityError> {
        match self.value(key)? {
            Value::Int64(v) => Ok(*v),
            other => Err(Self::mismatch(key, "int64", other)),
        }
    }

    /// Read back a value stored with [`set_uint64`](Self::set_uint64).
    pub fn get_uint64(&self, key: &str) -> Result<u64, EntityError> {
        self.get_int64(key).map(bits_to_u64)
    }

    pub fn get_int32(&self, key: &str) -> Result<i32, EntityError> {
        self.get_int64(key).map(|v| v as i32)
    }

    pub fn get_uint32(&self, key: &str) -> Result<u32, EntityError> {
        self.get_int64(key).map(|v| v as u32)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, EntityError> {
        match self.value(key)? {
            Value::Bool(v) => Ok(*v),
            other => Err(Self::mismatch(key, "bool", other)),
        }
    }

    pub fn get_bytes(&self, key: &str) -> Result<&[u8], EntityError> {
        match self.value(key)? {
            Value::Bytes(v) => Ok(v),
            other => Err(Self::mismatch(key, "bytes", other)),
        }
    }

    pub fn get_string_list(&self, key: &str) -> Result<&[String], EntityError> {
        match self.value(key)? {
            Value::StringList(v) => Ok(v),
            other => Err(Self::mismatch(key, "string list", other)),
        }
    }

    pub fn get_int64_list(&self, key: &str) -> Result<&[i64], EntityError> {
        match self.value(key)? {
            Value::Int64List(v) => Ok(v),
            other => Err(Self::mismatch(key, "int64 list", other)),
        }
    }

    pub fn get_uint64_list(&self, key: &str) -> Result<Vec<u64>, EntityError> {
        Ok(self.get_int64_list(key)?.iter().map(|v| bits_to_u64(*v)).collect())
    }

    /// An absent key is `NotFound`; a present empty list is `Ok(vec![])`.
    pub fn get_int32_list(&self, key: &str) -> Result<Vec<i32>, EntityError> {
        Ok(self.get_int64_list(key)?.iter().map(|v| *v as i32).collect())
    }

    /// An absent key is `NotFound`; a present empty list is `Ok(vec![])`.
    pub fn get_uint32_list(&self, key: &str) -> Result<Vec<u32>, EntityError> {
        Ok(self.get_int64_list(key)?.iter().map(|v| *v as u32).collect())
    }

    /// Decode the JSON stored in the bytes slot of `key`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, EntityError> {
        let bytes = self.get_bytes(key)?;
        serde_json::from_slice(bytes).map_err(|source| EntityError::Json {
            key: key.to_string(),
            source,
        })
    }
}
