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

//! Identity and field policies.
//!
//! Policies are registered per type with [`PolicyTableBuilder`] and resolved once into a [`PolicyTable`] lookup
//! table at configuration time.

use std::{fmt::Debug, sync::Arc};

use arbor_common::error::{Error, Result};
use hashbrown::HashMap;
use serde_json::{Map, Value};

use crate::{
    descriptor::{canonical_json, NormalizedField, OperationDescriptor, PossibleSelections, TYPENAME_FIELD},
    value::{ObjectData, SourceObject, SourceValue},
};

/// Result of an identify function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// The object is the node with the given key.
    Key(String),
    /// The object has no identity and is embedded in its parent.
    Keyless,
    /// Fall through to the next identification rule.
    Default,
}

/// Context passed to identify functions.
#[derive(Debug, Clone, Copy)]
pub struct IdentifyContext<'a> {
    /// Type name of the object, from `__typename` or the selection.
    pub type_name: Option<&'a str>,
    /// Operation the object was found in, if any.
    pub operation: Option<&'a OperationDescriptor>,
}

/// Custom identify function.
pub type IdentifyFn = Arc<dyn Fn(&ObjectData, &IdentifyContext<'_>) -> Identity + Send + Sync + 'static>;
/// Custom key arguments function: `(type, field, args) -> Some(key argument names)`, `None` keeps all arguments.
pub type KeyArgsFn = Arc<dyn Fn(&str, &str, &Map<String, Value>) -> Option<Vec<String>> + Send + Sync + 'static>;

/// Which arguments make up the identity of a field.
#[derive(Clone)]
pub enum KeyArgs {
    /// All arguments (the default).
    All,
    /// No arguments.
    Ignore,
    /// Only the named arguments.
    Only(Vec<String>),
    /// Computed by a function.
    Custom(KeyArgsFn),
}

impl Debug for KeyArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Ignore => write!(f, "Ignore"),
            Self::Only(names) => f.debug_tuple("Only").field(names).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Context passed to field `read` and `merge` functions.
#[derive(Debug, Clone, Copy)]
pub struct FieldContext<'a> {
    /// Parent type name.
    pub type_name: &'a str,
    /// Field name.
    pub field_name: &'a str,
    /// Normalized field identity.
    pub field: &'a NormalizedField,
    /// Resolved arguments.
    pub args: Option<&'a Map<String, Value>>,
    /// Variables of the operation.
    pub variables: &'a Map<String, Value>,
    /// Key of the parent node, if the parent is keyed.
    pub node: Option<&'a str>,
}

/// Field read function: `(existing, ctx) -> Some(value)`, `None` reports the field as missing.
pub type ReadFn = Arc<dyn Fn(Option<&SourceValue>, &FieldContext<'_>) -> Result<Option<SourceValue>> + Send + Sync + 'static>;
/// Field merge function: `(existing, incoming, ctx) -> merged`.
pub type MergeFn =
    Arc<dyn Fn(Option<&SourceValue>, &SourceValue, &FieldContext<'_>) -> Result<SourceValue> + Send + Sync + 'static>;

/// Policy of one field.
#[derive(Clone, Default)]
pub struct FieldPolicy {
    key_args: Option<KeyArgs>,
    read: Option<ReadFn>,
    merge: Option<MergeFn>,
}

impl Debug for FieldPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldPolicy")
            .field("key_args", &self.key_args)
            .field("read", &self.read.is_some())
            .field("merge", &self.merge.is_some())
            .finish()
    }
}

impl FieldPolicy {
    /// Create an empty field policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key arguments.
    pub fn with_key_args(mut self, key_args: KeyArgs) -> Self {
        self.key_args = Some(key_args);
        self
    }

    /// Set the read function.
    pub fn with_read<F>(mut self, read: F) -> Self
    where
        F: Fn(Option<&SourceValue>, &FieldContext<'_>) -> Result<Option<SourceValue>> + Send + Sync + 'static,
    {
        self.read = Some(Arc::new(read));
        self
    }

    /// Set the merge function.
    pub fn with_merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(Option<&SourceValue>, &SourceValue, &FieldContext<'_>) -> Result<SourceValue> + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(merge));
        self
    }
}

/// Policy of one type.
#[derive(Clone, Default)]
pub struct TypePolicy {
    key_fields: Option<Vec<String>>,
    identify: Option<IdentifyFn>,
    fields: HashMap<String, FieldPolicy>,
}

impl Debug for TypePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypePolicy")
            .field("key_fields", &self.key_fields)
            .field("identify", &self.identify.is_some())
            .field("fields", &self.fields)
            .finish()
    }
}

impl TypePolicy {
    /// Create an empty type policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identify objects of this type by the given fields instead of `id`.
    pub fn with_key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Identify objects of this type with a function.
    pub fn with_identify<F>(mut self, identify: F) -> Self
    where
        F: Fn(&ObjectData, &IdentifyContext<'_>) -> Identity + Send + Sync + 'static,
    {
        self.identify = Some(Arc::new(identify));
        self
    }

    /// Set the policy of a field.
    pub fn with_field(mut self, name: impl Into<String>, policy: FieldPolicy) -> Self {
        self.fields.insert(name.into(), policy);
        self
    }
}

/// Builder of [`PolicyTable`].
#[derive(Default)]
pub struct PolicyTableBuilder {
    types: HashMap<String, TypePolicy>,
    identify: Option<IdentifyFn>,
}

impl PolicyTableBuilder {
    /// Register the policy of a type, replacing any previous one.
    pub fn with_type_policy(mut self, type_name: impl Into<String>, policy: TypePolicy) -> Self {
        self.types.insert(type_name.into(), policy);
        self
    }

    /// Set the global identify function, consulted before any type policy.
    pub fn with_identify<F>(mut self, identify: F) -> Self
    where
        F: Fn(&ObjectData, &IdentifyContext<'_>) -> Identity + Send + Sync + 'static,
    {
        self.identify = Some(Arc::new(identify));
        self
    }

    /// Resolve the registered policies into a lookup table.
    pub fn build(self) -> PolicyTable {
        let has_read_policies = self.types.values().any(|t| t.fields.values().any(|f| f.read.is_some()));
        let has_merge_policies = self.types.values().any(|t| t.fields.values().any(|f| f.merge.is_some()));
        PolicyTable {
            types: self.types,
            identify: self.identify,
            has_read_policies,
            has_merge_policies,
        }
    }
}

/// Resolved identity and field policies.
#[derive(Clone, Default)]
pub struct PolicyTable {
    types: HashMap<String, TypePolicy>,
    identify: Option<IdentifyFn>,
    has_read_policies: bool,
    has_merge_policies: bool,
}

impl Debug for PolicyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyTable")
            .field("types", &self.types)
            .field("identify", &self.identify.is_some())
            .finish()
    }
}

impl PolicyTable {
    /// Compute the node key of an object, `None` for keyless objects.
    ///
    /// Rules in order: the global identify function, the type's identify function, the type's key fields,
    /// then `<__typename>:<id or _id>`. An identify function returning [`Identity::Default`] falls through.
    pub fn identify(&self, object: &ObjectData, ctx: &IdentifyContext<'_>) -> Option<String> {
        let type_name = object
            .get(TYPENAME_FIELD)
            .and_then(SourceValue::as_str)
            .or(ctx.type_name);
        let ctx = IdentifyContext {
            type_name,
            operation: ctx.operation,
        };

        if let Some(identify) = &self.identify {
            match identify(object, &ctx) {
                Identity::Key(key) => return Some(key),
                Identity::Keyless => return None,
                Identity::Default => {}
            }
        }

        let type_name = type_name?;
        let policy = self.types.get(type_name);

        if let Some(identify) = policy.and_then(|p| p.identify.as_ref()) {
            match identify(object, &ctx) {
                Identity::Key(key) => return Some(key),
                Identity::Keyless => return None,
                Identity::Default => {}
            }
        }

        if let Some(key_fields) = policy.and_then(|p| p.key_fields.as_ref()) {
            let mut keys = Map::new();
            for field in key_fields {
                keys.insert(field.clone(), object.get(field)?.to_json());
            }
            return Some(format!("{type_name}:{}", Value::Object(keys)));
        }

        let id = object.get("id").or_else(|| object.get("_id"))?;
        match id {
            SourceValue::Null => None,
            SourceValue::String(s) => Some(format!("{type_name}:{s}")),
            SourceValue::Number(n) => Some(format!("{type_name}:{n}")),
            v => Some(format!("{type_name}:{}", canonical_json(&v.to_json()))),
        }
    }

    /// Get the policy of a field.
    pub fn field_policy(&self, type_name: &str, field_name: &str) -> Option<&FieldPolicy> {
        self.types.get(type_name).and_then(|t| t.fields.get(field_name))
    }

    /// Get the key arguments of a field.
    pub fn key_args(&self, type_name: &str, field_name: &str) -> Option<&KeyArgs> {
        self.field_policy(type_name, field_name).and_then(|f| f.key_args.as_ref())
    }

    /// Get the read function of a field.
    pub fn read_policy(&self, type_name: &str, field_name: &str) -> Option<&ReadFn> {
        self.field_policy(type_name, field_name).and_then(|f| f.read.as_ref())
    }

    /// Get the merge function of a field.
    pub fn merge_policy(&self, type_name: &str, field_name: &str) -> Option<&MergeFn> {
        self.field_policy(type_name, field_name).and_then(|f| f.merge.as_ref())
    }

    /// Returns `true` if any field has a read function.
    pub fn has_read_policies(&self) -> bool {
        self.has_read_policies
    }

    /// Returns `true` if any field has a merge function.
    pub fn has_merge_policies(&self) -> bool {
        self.has_merge_policies
    }
}

/// Hooks used while applying merge policies to incoming data.
pub(crate) struct MergePass<'a> {
    pub policies: &'a PolicyTable,
    pub operation: &'a OperationDescriptor,
    /// Existing raw value of a field of a node.
    pub existing: &'a dyn Fn(&str, &NormalizedField) -> Option<SourceValue>,
    /// Called for every failed merge function; the incoming value is kept.
    pub on_error: &'a dyn Fn(Error, &FieldContext<'_>),
}

impl MergePass<'_> {
    /// Apply merge functions to incoming data, rebuilding only objects with merged fields.
    pub fn apply(&self, data: &SourceObject) -> SourceObject {
        let root_key = self.operation.root_node_key.clone();
        self.merge_object(
            data,
            &self.operation.possible_selections,
            Some(&self.operation.root_type),
            Some(&root_key),
        )
    }

    fn merge_object(
        &self,
        object: &SourceObject,
        selections: &PossibleSelections,
        type_hint: Option<&str>,
        node: Option<&str>,
    ) -> SourceObject {
        let type_name = object
            .get(TYPENAME_FIELD)
            .and_then(SourceValue::as_str)
            .or(type_hint);
        let selection = selections.resolve(type_name);

        let mut merged: Option<ObjectData> = None;
        for (data_key, info) in selection.fields.iter() {
            let Some(value) = object.get(data_key) else {
                continue;
            };
            let mut next = match &info.selection {
                Some(nested) => self.merge_value(value, nested),
                None => value.clone(),
            };

            if let Some(merge) = type_name.and_then(|t| self.policies.merge_policy(t, &info.name)) {
                let ctx = FieldContext {
                    type_name: type_name.unwrap_or_default(),
                    field_name: &info.name,
                    field: &info.normalized,
                    args: info.args.as_deref(),
                    variables: &self.operation.variables_with_defaults,
                    node,
                };
                let existing = node.and_then(|n| (self.existing)(n, &info.normalized));
                match merge(existing.as_ref(), &next, &ctx) {
                    Ok(v) => next = v,
                    Err(e) => (self.on_error)(e, &ctx),
                }
            }

            if !next.same(value) {
                merged.get_or_insert_with(|| object.as_ref().clone()).insert(data_key.clone(), next);
            }
        }

        match merged {
            Some(data) => Arc::new(data),
            None => object.clone(),
        }
    }

    fn merge_value(&self, value: &SourceValue, selections: &PossibleSelections) -> SourceValue {
        match value {
            SourceValue::Object(o) => {
                let type_hint = selections.default_selection().type_name.clone();
                let key = self.policies.identify(
                    o,
                    &IdentifyContext {
                        type_name: type_hint.as_deref(),
                        operation: Some(self.operation),
                    },
                );
                let merged = self.merge_object(o, selections, type_hint.as_deref(), key.as_deref());
                SourceValue::Object(merged)
            }
            SourceValue::List(l) => {
                let items = l.iter().map(|item| self.merge_value(item, selections)).collect::<Vec<_>>();
                if items.iter().zip(l.iter()).all(|(a, b)| a.same(b)) {
                    value.clone()
                } else {
                    SourceValue::List(Arc::new(items))
                }
            }
            v => v.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> ObjectData {
        SourceValue::from(value).as_object().unwrap().as_ref().clone()
    }

    #[test]
    fn test_default_identify() {
        let table = PolicyTable::default();
        let ctx = IdentifyContext {
            type_name: None,
            operation: None,
        };
        assert_eq!(
            table.identify(&object(json!({ "__typename": "User", "id": "1" })), &ctx),
            Some("User:1".to_string())
        );
        assert_eq!(
            table.identify(&object(json!({ "__typename": "User", "_id": 7 })), &ctx),
            Some("User:7".to_string())
        );
        assert_eq!(table.identify(&object(json!({ "id": "1" })), &ctx), None);
        assert_eq!(table.identify(&object(json!({ "__typename": "Address" })), &ctx), None);
    }

    #[test]
    fn test_identify_rules_order() {
        let table = PolicyTableBuilder::default()
            .with_identify(|object, _| match object.get("uuid") {
                Some(v) => Identity::Key(format!("Global:{}", v.as_str().unwrap_or_default())),
                None => Identity::Default,
            })
            .with_type_policy("Book", TypePolicy::new().with_key_fields(["isbn"]))
            .with_type_policy("Setting", TypePolicy::new().with_identify(|_, _| Identity::Keyless))
            .build();
        let ctx = IdentifyContext {
            type_name: None,
            operation: None,
        };

        assert_eq!(
            table.identify(&object(json!({ "__typename": "User", "uuid": "u" })), &ctx),
            Some("Global:u".to_string())
        );
        assert_eq!(
            table.identify(&object(json!({ "__typename": "Book", "id": "1", "isbn": "42" })), &ctx),
            Some(r#"Book:{"isbn":"42"}"#.to_string())
        );
        assert_eq!(table.identify(&object(json!({ "__typename": "Book", "id": "1" })), &ctx), None);
        assert_eq!(table.identify(&object(json!({ "__typename": "Setting", "id": "1" })), &ctx), None);
    }

    #[test]
    fn test_policy_flags() {
        let table = PolicyTableBuilder::default()
            .with_type_policy(
                "Query",
                TypePolicy::new().with_field("feed", FieldPolicy::new().with_merge(|_, incoming, _| Ok(incoming.clone()))),
            )
            .build();
        assert!(table.has_merge_policies());
        assert!(!table.has_read_policies());
        assert!(table.merge_policy("Query", "feed").is_some());
        assert!(table.read_policy("Query", "feed").is_none());
        assert!(table.field_policy("User", "feed").is_none());
    }
}
