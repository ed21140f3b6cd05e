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

//! Field modifiers of `modify`.

use std::{fmt::Debug, sync::Arc};

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::value::SourceValue;

/// Context passed to custom modifiers.
#[derive(Debug, Clone, Copy)]
pub struct ModifierContext<'a> {
    /// Node key.
    pub node: &'a str,
    /// Field name.
    pub field_name: &'a str,
    /// Store field name including key arguments.
    pub store_field_name: &'a str,
    /// Resolved arguments of the field.
    pub args: Option<&'a Map<String, Value>>,
}

/// Outcome of a modifier for one field.
#[derive(Debug, Clone, PartialEq)]
pub enum ModifierAction {
    /// Leave the field unchanged.
    Keep,
    /// Replace the value.
    Set(SourceValue),
    /// Delete the field.
    Delete,
    /// Keep the value but force watches reading the field to re-run.
    Invalidate,
}

/// Custom modifier function: `(existing, ctx) -> action`.
pub type ModifierFn = Arc<dyn Fn(&SourceValue, &ModifierContext<'_>) -> ModifierAction + Send + Sync + 'static>;

/// Modifier of one field.
#[derive(Clone)]
pub enum FieldModifier {
    /// Replace the value.
    Set(SourceValue),
    /// Delete the field.
    Delete,
    /// Force watches reading the field to re-run.
    Invalidate,
    /// Compute the action from the existing value.
    Custom(ModifierFn),
}

impl Debug for FieldModifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Set(v) => f.debug_tuple("Set").field(v).finish(),
            Self::Delete => write!(f, "Delete"),
            Self::Invalidate => write!(f, "Invalidate"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl FieldModifier {
    /// Create a custom modifier.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&SourceValue, &ModifierContext<'_>) -> ModifierAction + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Compute the action for the existing value.
    pub fn apply(&self, existing: &SourceValue, ctx: &ModifierContext<'_>) -> ModifierAction {
        match self {
            FieldModifier::Set(v) => ModifierAction::Set(v.clone()),
            FieldModifier::Delete => ModifierAction::Delete,
            FieldModifier::Invalidate => ModifierAction::Invalidate,
            FieldModifier::Custom(f) => f(existing, ctx),
        }
    }
}

/// Modifiers of the fields of one node.
///
/// A modifier registered by store field name (e.g. `user({"id":"1"})`) wins over one registered by field name, which
/// wins over the fallback.
#[derive(Debug, Clone, Default)]
pub struct Modifiers {
    fields: IndexMap<String, FieldModifier>,
    fallback: Option<FieldModifier>,
}

impl Modifiers {
    /// Create an empty set of modifiers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Modify a field by field name or store field name.
    pub fn with_field(mut self, field: impl Into<String>, modifier: FieldModifier) -> Self {
        self.fields.insert(field.into(), modifier);
        self
    }

    /// Modify every field without a dedicated modifier.
    pub fn with_fallback(mut self, modifier: FieldModifier) -> Self {
        self.fallback = Some(modifier);
        self
    }

    /// Find the modifier of a field.
    pub fn get(&self, field_name: &str, store_field_name: &str) -> Option<&FieldModifier> {
        self.fields
            .get(store_field_name)
            .or_else(|| self.fields.get(field_name))
            .or(self.fallback.as_ref())
    }

    /// Returns `true` if no modifier is registered.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.fallback.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modifier_precedence() {
        let modifiers = Modifiers::new()
            .with_field("user", FieldModifier::Delete)
            .with_field(r#"user({"id":"1"})"#, FieldModifier::Invalidate)
            .with_fallback(FieldModifier::custom(|existing, ctx| {
                if ctx.field_name == "count" {
                    let n = existing.to_json().as_i64().unwrap_or_default();
                    ModifierAction::Set(SourceValue::from(n + 1))
                } else {
                    ModifierAction::Keep
                }
            }));

        let ctx = |field_name, store_field_name| ModifierContext {
            node: "ROOT_QUERY",
            field_name,
            store_field_name,
            args: None,
        };

        let m = modifiers.get("user", r#"user({"id":"1"})"#).unwrap();
        assert_eq!(m.apply(&SourceValue::Null, &ctx("user", "")), ModifierAction::Invalidate);
        let m = modifiers.get("user", r#"user({"id":"2"})"#).unwrap();
        assert_eq!(m.apply(&SourceValue::Null, &ctx("user", "")), ModifierAction::Delete);
        let m = modifiers.get("count", "count").unwrap();
        assert_eq!(
            m.apply(&SourceValue::from(1i64), &ctx("count", "count")),
            ModifierAction::Set(SourceValue::from(2i64))
        );
        assert_eq!(
            m.apply(&SourceValue::from(1i64), &ctx("other", "other")),
            ModifierAction::Keep
        );
    }
}
