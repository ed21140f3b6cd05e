// Copyright 2026 foyer Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Immutable, reference counted source values.
//!
//! Every object and list is wrapped in an [`Arc`]. Cloning a [`SourceValue`] never copies data, and the address of
//! the shared allocation ([`ValuePtr`]) identifies a value for as long as any tree holds it. Copy-on-write patching
//! only allocates new objects/lists along dirty paths, every other subtree keeps its identity.

use std::{
    fmt::{Debug, Display},
    sync::Arc,
};

use indexmap::IndexMap;
use serde::{ser::SerializeMap, ser::SerializeSeq, Serialize, Serializer};
use serde_json::Number;

/// Fields of an object value, in response order, keyed by the response key (alias or field name).
pub type ObjectData = IndexMap<String, SourceValue>;
/// Shared object value.
pub type SourceObject = Arc<ObjectData>;
/// Shared list value.
pub type SourceList = Arc<Vec<SourceValue>>;

/// Identity of a shared object or list value.
///
/// Only valid while the value is alive; trees keep their root alive, which keeps every nested value alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValuePtr(usize);

impl ValuePtr {
    /// Identity of an object value.
    pub fn of_object(object: &SourceObject) -> Self {
        Self(Arc::as_ptr(object) as *const () as usize)
    }

    /// Identity of a list value.
    pub fn of_list(list: &SourceList) -> Self {
        Self(Arc::as_ptr(list) as *const () as usize)
    }
}

/// An immutable JSON-like value shared between chunks, trees and layers.
#[derive(Clone, Default)]
pub enum SourceValue {
    /// `null`.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Number.
    Number(Number),
    /// String.
    String(Arc<str>),
    /// List.
    List(SourceList),
    /// Object.
    Object(SourceObject),
}

impl SourceValue {
    /// Build an object value from the given entries.
    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, SourceValue)>,
        K: Into<String>,
    {
        Self::Object(Arc::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()))
    }

    /// Build a list value from the given items.
    pub fn list(items: impl IntoIterator<Item = SourceValue>) -> Self {
        Self::List(Arc::new(items.into_iter().collect()))
    }

    /// Build a string value.
    pub fn string(s: impl AsRef<str>) -> Self {
        Self::String(Arc::from(s.as_ref()))
    }

    /// Identity of the value if it is an object or a list.
    pub fn ptr(&self) -> Option<ValuePtr> {
        match self {
            SourceValue::Object(o) => Some(ValuePtr::of_object(o)),
            SourceValue::List(l) => Some(ValuePtr::of_list(l)),
            _ => None,
        }
    }

    /// Get the shared object if the value is an object.
    pub fn as_object(&self) -> Option<&SourceObject> {
        match self {
            SourceValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Get the shared list if the value is a list.
    pub fn as_list(&self) -> Option<&SourceList> {
        match self {
            SourceValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get the string slice if the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SourceValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` if the value is `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, SourceValue::Null)
    }

    /// Returns `true` if both values are the same shared value, or equal scalars.
    ///
    /// Never descends into objects or lists.
    pub fn same(&self, other: &SourceValue) -> bool {
        match (self, other) {
            (SourceValue::Object(a), SourceValue::Object(b)) => Arc::ptr_eq(a, b),
            (SourceValue::List(a), SourceValue::List(b)) => Arc::ptr_eq(a, b),
            (SourceValue::Object(_) | SourceValue::List(_), _) | (_, SourceValue::Object(_) | SourceValue::List(_)) => {
                false
            }
            (a, b) => a == b,
        }
    }

    /// Convert into a plain [`serde_json::Value`].
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SourceValue::Null => serde_json::Value::Null,
            SourceValue::Bool(b) => serde_json::Value::Bool(*b),
            SourceValue::Number(n) => serde_json::Value::Number(n.clone()),
            SourceValue::String(s) => serde_json::Value::String(s.to_string()),
            SourceValue::List(l) => serde_json::Value::Array(l.iter().map(|v| v.to_json()).collect()),
            SourceValue::Object(o) => {
                serde_json::Value::Object(o.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}

impl PartialEq for SourceValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SourceValue::Null, SourceValue::Null) => true,
            (SourceValue::Bool(a), SourceValue::Bool(b)) => a == b,
            (SourceValue::Number(a), SourceValue::Number(b)) => a == b,
            (SourceValue::String(a), SourceValue::String(b)) => a == b,
            (SourceValue::List(a), SourceValue::List(b)) => Arc::ptr_eq(a, b) || a == b,
            (SourceValue::Object(a), SourceValue::Object(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl Eq for SourceValue {}

impl From<serde_json::Value> for SourceValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => SourceValue::Null,
            serde_json::Value::Bool(b) => SourceValue::Bool(b),
            serde_json::Value::Number(n) => SourceValue::Number(n),
            serde_json::Value::String(s) => SourceValue::String(Arc::from(s)),
            serde_json::Value::Array(a) => SourceValue::List(Arc::new(a.into_iter().map(SourceValue::from).collect())),
            serde_json::Value::Object(o) => {
                SourceValue::Object(Arc::new(o.into_iter().map(|(k, v)| (k, SourceValue::from(v))).collect()))
            }
        }
    }
}

impl From<&serde_json::Value> for SourceValue {
    fn from(value: &serde_json::Value) -> Self {
        SourceValue::from(value.clone())
    }
}

impl From<SourceValue> for serde_json::Value {
    fn from(value: SourceValue) -> Self {
        value.to_json()
    }
}

impl From<&str> for SourceValue {
    fn from(s: &str) -> Self {
        SourceValue::string(s)
    }
}

impl From<bool> for SourceValue {
    fn from(b: bool) -> Self {
        SourceValue::Bool(b)
    }
}

impl From<i64> for SourceValue {
    fn from(n: i64) -> Self {
        SourceValue::Number(n.into())
    }
}

impl Serialize for SourceValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            SourceValue::Null => serializer.serialize_unit(),
            SourceValue::Bool(b) => serializer.serialize_bool(*b),
            SourceValue::Number(n) => n.serialize(serializer),
            SourceValue::String(s) => serializer.serialize_str(s),
            SourceValue::List(l) => {
                let mut seq = serializer.serialize_seq(Some(l.len()))?;
                for item in l.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            SourceValue::Object(o) => {
                let mut map = serializer.serialize_map(Some(o.len()))?;
                for (k, v) in o.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl Debug for SourceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Display for SourceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_conversion_keeps_order() {
        let json = json!({ "b": 1, "a": [true, null, "x"], "c": { "z": 1.5, "y": "s" } });
        let value = SourceValue::from(json.clone());
        assert_eq!(value.to_json(), json);
        assert_eq!(serde_json::to_string(&value).unwrap(), serde_json::to_string(&json).unwrap());

        let keys = value.as_object().unwrap().keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_equality_and_identity() {
        let a = SourceValue::from(json!({ "id": "1", "tags": ["x"] }));
        let b = SourceValue::from(json!({ "id": "1", "tags": ["x"] }));
        let c = a.clone();

        assert_eq!(a, b);
        assert!(!a.same(&b));
        assert!(a.same(&c));
        assert_eq!(a.ptr(), c.ptr());
        assert_ne!(a.ptr(), b.ptr());
        assert!(SourceValue::from(1i64).same(&SourceValue::from(1i64)));
        assert_ne!(SourceValue::from(1i64), SourceValue::from("1"));
    }
}
