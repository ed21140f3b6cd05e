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

//! Materializes values for a target selection from node chunks across layers.

use std::sync::Arc;

use arbor_common::{
    error::{Error, ErrorKind},
    event::{Event, Notification},
};
use hashbrown::HashSet;
use itertools::Itertools;

use crate::{
    chunk::{FieldValue, ListChunk, ObjectChunk, TreeChunk},
    descriptor::{FieldInfo, NodeKey, OperationDescriptor, PossibleSelections},
    env::Env,
    indexer::{PathStep, Tree},
    policy::FieldContext,
    value::{ObjectData, SourceValue},
};

/// Kind of a missing value diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissingKind {
    /// No source defines the field.
    Field,
    /// The field references an evicted node.
    DanglingReference,
    /// A scalar was found at a composite position.
    LeafError,
    /// Sources disagree on `null` and non-null values.
    Conflict,
}

/// Diagnostic of a value that could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingField {
    /// Path from the root of the result.
    pub path: Vec<PathStep>,
    /// Kind.
    pub kind: MissingKind,
    /// Human readable message.
    pub message: String,
    /// Node the value was read from, if keyed.
    pub node: Option<NodeKey>,
}

impl MissingField {
    /// Dotted path from the root.
    pub fn path_string(&self) -> String {
        self.path.iter().join(".")
    }

    /// Convert into an error.
    pub fn to_error(&self) -> Error {
        match self.kind {
            MissingKind::DanglingReference => {
                let node = self.node.as_deref().unwrap_or_default();
                Error::dangling_reference(node).with_context("path", self.path_string())
            }
            MissingKind::Field | MissingKind::Conflict => Error::missing_field(self.path_string(), &self.message),
            MissingKind::LeafError => {
                Error::new(ErrorKind::InvalidData, &self.message).with_context("path", self.path_string())
            }
        }
    }
}

/// Source of node chunks for hydration.
pub trait NodeChunkLookup {
    /// Chunks of a node in precedence order, empty if unknown.
    fn node_chunks(&self, key: &str) -> Vec<TreeChunk>;

    /// Returns `true` if the node was evicted.
    fn is_deleted(&self, key: &str) -> bool;
}

/// Output of hydration.
#[derive(Debug)]
pub struct Hydrated {
    /// Result value, `None` if the root node is missing.
    pub value: Option<SourceValue>,
    /// Missing values.
    pub missing: Vec<MissingField>,
    /// Nodes the value was read from.
    pub touched: HashSet<NodeKey>,
}

/// Materialize the result of an operation.
pub fn hydrate_operation(env: &Env, operation: &OperationDescriptor, lookup: &dyn NodeChunkLookup) -> Hydrated {
    let mut hydrator = Hydrator::new(env, operation, lookup, true);
    let root = operation.root_node_key.clone();
    hydrator.touched.insert(root.clone());

    let value = if lookup.is_deleted(&root) {
        hydrator.report(MissingKind::DanglingReference, format!("dangling reference to missing node {root}"), Some(&root));
        None
    } else {
        let sources = lookup.node_chunks(&root);
        if sources.is_empty() {
            hydrator.report(MissingKind::Field, format!("can't find node {root}"), Some(&root));
            None
        } else {
            Some(hydrator.hydrate_object(&sources, &operation.possible_selections, Some(&root)))
        }
    };

    Hydrated {
        value,
        missing: hydrator.missing,
        touched: hydrator.touched,
    }
}

enum Outcome {
    Value(SourceValue),
    Missing(MissingKind, String),
}

/// Materializes values from chunks.
pub struct Hydrator<'a> {
    env: &'a Env,
    operation: &'a OperationDescriptor,
    lookup: &'a dyn NodeChunkLookup,
    read_policies: bool,

    path: Vec<PathStep>,
    missing: Vec<MissingField>,
    touched: HashSet<NodeKey>,
    dangling: Option<NodeKey>,
}

impl<'a> Hydrator<'a> {
    /// Create a hydrator; `read_policies` applies field read functions.
    pub fn new(
        env: &'a Env,
        operation: &'a OperationDescriptor,
        lookup: &'a dyn NodeChunkLookup,
        read_policies: bool,
    ) -> Self {
        Self {
            env,
            operation,
            lookup,
            read_policies: read_policies && env.policies().has_read_policies(),
            path: vec![],
            missing: vec![],
            touched: HashSet::new(),
            dangling: None,
        }
    }

    /// Missing values reported so far.
    pub fn into_missing(self) -> Vec<MissingField> {
        self.missing
    }

    /// Materialize a value of `tree` for the target selections, `None` if the value is missing.
    pub fn materialize(
        &mut self,
        tree: &Arc<Tree>,
        value: &FieldValue,
        selections: &Arc<PossibleSelections>,
    ) -> Option<SourceValue> {
        let outcome = match value {
            FieldValue::Object(chunk) => self.object_value(tree, chunk, None, selections),
            FieldValue::List(list) => self.list_value(tree, list, selections),
            FieldValue::CompositeNull => Outcome::Value(SourceValue::Null),
            FieldValue::CompositeUndefined => return None,
            v => Outcome::Value(v.raw()),
        };
        match outcome {
            Outcome::Value(v) => Some(v),
            Outcome::Missing(kind, message) => {
                let dangling = self.dangling.take();
                self.report(kind, message, dangling.as_ref());
                None
            }
        }
    }

    fn report(&mut self, kind: MissingKind, message: String, node: Option<&NodeKey>) {
        self.missing.push(MissingField {
            path: self.path.clone(),
            kind,
            message,
            node: node.cloned(),
        });
    }

    fn hydrate_object(
        &mut self,
        sources: &[TreeChunk],
        selections: &PossibleSelections,
        node: Option<&NodeKey>,
    ) -> SourceValue {
        let type_name = sources.iter().find_map(|s| s.chunk.type_name.clone());
        let selection = selections.resolve(type_name.as_deref()).clone();

        let mut object = ObjectData::with_capacity(selection.fields.len());
        for (data_key, info) in selection.fields.iter() {
            self.path.push(PathStep::Field(data_key.clone()));

            let outcome = match &info.selection {
                None => leaf_field(sources, info, node),
                Some(nested) => self.composite_field(sources, info, nested),
            };
            let outcome = self.apply_read_policy(type_name.as_deref(), info, node, outcome);
            match outcome {
                Outcome::Value(v) => {
                    object.insert(data_key.clone(), v);
                }
                Outcome::Missing(kind, message) => {
                    let dangling = match kind {
                        MissingKind::DanglingReference => self.dangling.take(),
                        _ => None,
                    };
                    self.report(kind, message, dangling.as_ref().or(node));
                }
            }

            self.path.pop();
        }
        SourceValue::Object(Arc::new(object))
    }

    fn composite_field(&mut self, sources: &[TreeChunk], info: &FieldInfo, selections: &Arc<PossibleSelections>) -> Outcome {
        let values = sources
            .iter()
            .filter_map(|s| s.field(&info.normalized).map(|v| (s, v)))
            .collect_vec();
        let Some((first_source, first)) = values.first() else {
            return Outcome::Missing(MissingKind::Field, format!("can't find field '{}'", info.name));
        };

        let nulls = values.iter().filter(|(_, v)| matches!(v, FieldValue::CompositeNull)).count();
        if nulls > 0 && nulls < values.len() {
            self.report(
                MissingKind::Conflict,
                format!("conflicting null and non-null values for field '{}'", info.name),
                None,
            );
        }

        match first {
            FieldValue::CompositeNull => Outcome::Value(SourceValue::Null),
            FieldValue::Object(chunk) => {
                let siblings = values
                    .iter()
                    .filter_map(|(s, v)| match v {
                        FieldValue::Object(c) if c.key.is_none() => Some(TreeChunk {
                            tree: s.tree.clone(),
                            chunk: c.clone(),
                        }),
                        _ => None,
                    })
                    .collect_vec();
                self.object_value(&first_source.tree, chunk, Some(siblings), selections)
            }
            FieldValue::List(list) => self.list_value(&first_source.tree, list, selections),
            v => Outcome::Missing(
                MissingKind::LeafError,
                format!("expected a composite value for field '{}', got {}", info.name, v.raw()),
            ),
        }
    }

    fn object_value(
        &mut self,
        tree: &Arc<Tree>,
        chunk: &Arc<ObjectChunk>,
        siblings: Option<Vec<TreeChunk>>,
        selections: &Arc<PossibleSelections>,
    ) -> Outcome {
        match &chunk.key {
            Some(key) => {
                self.touched.insert(key.clone());
                if self.lookup.is_deleted(key) {
                    self.dangling = Some(key.clone());
                    return Outcome::Missing(
                        MissingKind::DanglingReference,
                        format!("dangling reference to missing node {key}"),
                    );
                }
                let mut sources = self.lookup.node_chunks(key);
                if sources.is_empty() {
                    sources.push(TreeChunk {
                        tree: tree.clone(),
                        chunk: chunk.clone(),
                    });
                }
                Outcome::Value(self.hydrate_object(&sources, selections, Some(key)))
            }
            None => {
                let sources = siblings.unwrap_or_else(|| {
                    vec![TreeChunk {
                        tree: tree.clone(),
                        chunk: chunk.clone(),
                    }]
                });
                Outcome::Value(self.hydrate_object(&sources, selections, None))
            }
        }
    }

    fn list_value(&mut self, tree: &Arc<Tree>, list: &Arc<ListChunk>, selections: &Arc<PossibleSelections>) -> Outcome {
        let mut items = Vec::with_capacity(list.data.len());
        for index in 0..list.data.len() {
            self.path.push(PathStep::Index(index));
            let outcome = match tree.item_value(list, index) {
                None | Some(FieldValue::CompositeNull) | Some(FieldValue::CompositeUndefined) => {
                    Outcome::Value(SourceValue::Null)
                }
                Some(FieldValue::Object(chunk)) => self.object_value(tree, &chunk, None, selections),
                Some(FieldValue::List(nested)) => self.list_value(tree, &nested, selections),
                Some(v) => Outcome::Missing(
                    MissingKind::LeafError,
                    format!("expected a composite list item, got {}", v.raw()),
                ),
            };
            match outcome {
                Outcome::Value(v) => items.push(v),
                Outcome::Missing(kind, message) => {
                    let dangling = self.dangling.take();
                    self.report(kind, message, dangling.as_ref());
                    items.push(SourceValue::Null);
                }
            }
            self.path.pop();
        }
        Outcome::Value(SourceValue::List(Arc::new(items)))
    }

    fn apply_read_policy(
        &mut self,
        type_name: Option<&str>,
        info: &FieldInfo,
        node: Option<&NodeKey>,
        outcome: Outcome,
    ) -> Outcome {
        if !self.read_policies {
            return outcome;
        }
        let Some(type_name) = type_name else {
            return outcome;
        };
        let Some(read) = self.env.policies().read_policy(type_name, &info.name) else {
            return outcome;
        };

        let ctx = FieldContext {
            type_name,
            field_name: &info.name,
            field: &info.normalized,
            args: info.args.as_deref(),
            variables: &self.operation.variables_with_defaults,
            node: node.map(|n| &**n),
        };
        let existing = match &outcome {
            Outcome::Value(v) => Some(v),
            Outcome::Missing(..) => None,
        };
        match read(existing, &ctx) {
            Ok(Some(v)) => Outcome::Value(v),
            Ok(None) => Outcome::Missing(
                MissingKind::Field,
                format!("read function of '{type_name}.{}' returned no value", info.name),
            ),
            Err(e) => {
                let e = Error::policy(type_name, &info.name, e);
                tracing::warn!("[policy]: read function failed, fall back to the cached value: {e}");
                let mut notification =
                    Notification::new(Event::ReadPolicyError, e.to_string()).with_field(info.normalized.key());
                if let Some(node) = node {
                    notification = notification.with_node(node.as_ref());
                }
                self.env
                    .notify(notification.with_operation(self.operation.debug_name()));
                outcome
            }
        }
    }
}

fn leaf_field(sources: &[TreeChunk], info: &FieldInfo, node: Option<&NodeKey>) -> Outcome {
    match sources.iter().find_map(|s| s.field(&info.normalized)) {
        Some(v) => Outcome::Value(v.raw()),
        None => Outcome::Missing(
            MissingKind::Field,
            match node {
                Some(node) => format!("can't find field '{}' on {node}", info.name),
                None => format!("can't find field '{}' on object", info.name),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        descriptor::{Document, Field, SelectionSet},
        indexer::index_tree,
        policy::{FieldPolicy, PolicyTableBuilder, TypePolicy},
        test_utils::{object, operation_with_id, TreeLookup},
    };

    fn user_query(fields: &[&str]) -> Document {
        Document::query(
            "User",
            SelectionSet::new().field(
                Field::new("user")
                    .of_type("User")
                    .selection(SelectionSet::new().leaves(["__typename", "id"]).leaves(fields.iter().copied())),
            ),
        )
    }

    fn index(env: &Env, id: u32, document: Document, data: serde_json::Value) -> Arc<Tree> {
        let op = operation_with_id(id, document, json!({}));
        Arc::new(index_tree(env, &op, object(data), None, None))
    }

    #[test]
    fn test_aggregate_across_operations() {
        let env = Env::default();
        let mut lookup = TreeLookup::default();
        lookup.push_front(index(
            &env,
            0,
            user_query(&["name"]),
            json!({ "user": { "__typename": "User", "id": "1", "name": "Ada" } }),
        ));
        lookup.push_front(index(
            &env,
            1,
            user_query(&["email"]),
            json!({ "user": { "__typename": "User", "id": "1", "email": "ada@example.com" } }),
        ));

        let op = operation_with_id(2, user_query(&["name", "email"]), json!({}));
        let hydrated = hydrate_operation(&env, &op, &lookup);
        assert!(hydrated.missing.is_empty(), "{:?}", hydrated.missing);
        assert_eq!(
            hydrated.value.unwrap().to_json(),
            json!({ "user": { "__typename": "User", "id": "1", "name": "Ada", "email": "ada@example.com" } })
        );
        assert!(hydrated.touched.contains("User:1"));
        assert!(hydrated.touched.contains("ROOT_QUERY"));
    }

    #[test]
    fn test_missing_and_dangling() {
        let env = Env::default();
        let mut lookup = TreeLookup::default();
        lookup.push_front(index(
            &env,
            0,
            user_query(&["name"]),
            json!({ "user": { "__typename": "User", "id": "1", "name": "Ada" } }),
        ));

        let op = operation_with_id(1, user_query(&["name", "email"]), json!({}));
        let hydrated = hydrate_operation(&env, &op, &lookup);
        assert_eq!(hydrated.missing.len(), 1);
        assert_eq!(hydrated.missing[0].kind, MissingKind::Field);
        assert_eq!(hydrated.missing[0].path_string(), "user.email");
        assert_eq!(hydrated.missing[0].to_error().kind(), ErrorKind::MissingField);

        lookup.deleted.insert("User:1".to_string());
        let hydrated = hydrate_operation(&env, &op, &lookup);
        assert_eq!(hydrated.missing.len(), 1);
        assert_eq!(hydrated.missing[0].kind, MissingKind::DanglingReference);
        assert_eq!(hydrated.missing[0].node.as_deref(), Some("User:1"));
        let err = hydrated.missing[0].to_error();
        assert_eq!(err.kind(), ErrorKind::DanglingReference);
        assert_eq!(err.context_value("node"), Some("User:1"));
        assert_eq!(hydrated.value.unwrap().to_json(), json!({}));
    }

    #[test_log::test]
    fn test_read_policy_fallback() {
        let policies = PolicyTableBuilder::default()
            .with_type_policy(
                "User",
                TypePolicy::new()
                    .with_field(
                        "name",
                        FieldPolicy::new().with_read(|existing, _| {
                            Ok(existing.and_then(|v| v.as_str()).map(|s| SourceValue::string(s.to_uppercase())))
                        }),
                    )
                    .with_field(
                        "email",
                        FieldPolicy::new().with_read(|_, _| Err(Error::new(ErrorKind::External, "boom"))),
                    ),
            )
            .build();
        let env = Env::new(Default::default(), policies);
        let mut lookup = TreeLookup::default();
        lookup.push_front(index(
            &env,
            0,
            user_query(&["name", "email"]),
            json!({ "user": { "__typename": "User", "id": "1", "name": "Ada", "email": "a@b" } }),
        ));

        let op = operation_with_id(1, user_query(&["name", "email"]), json!({}));
        let hydrated = hydrate_operation(&env, &op, &lookup);
        assert!(hydrated.missing.is_empty());
        assert_eq!(
            hydrated.value.unwrap().to_json(),
            json!({ "user": { "__typename": "User", "id": "1", "name": "ADA", "email": "a@b" } })
        );
    }

    #[test]
    fn test_conflicting_null_is_reported() {
        let env = Env::default();
        let query = |id| {
            Document::query(
                "Address",
                SelectionSet::new().field(
                    Field::new("user").of_type("User").selection(
                        SelectionSet::new()
                            .leaves(["__typename", "id"])
                            .field(Field::new("address").selection(SelectionSet::new().leaves([id]))),
                    ),
                ),
            )
        };
        let mut lookup = TreeLookup::default();
        lookup.push_front(index(
            &env,
            0,
            query("city"),
            json!({ "user": { "__typename": "User", "id": "1", "address": { "city": "London" } } }),
        ));
        lookup.push_front(index(
            &env,
            1,
            query("zip"),
            json!({ "user": { "__typename": "User", "id": "1", "address": null } }),
        ));

        let op = operation_with_id(2, query("city"), json!({}));
        let hydrated = hydrate_operation(&env, &op, &lookup);
        let conflicts = hydrated.missing.iter().filter(|m| m.kind == MissingKind::Conflict).collect_vec();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path_string(), "user.address");
        // The first defining chunk wins.
        assert_eq!(
            hydrated.value.unwrap().to_json(),
            json!({ "user": { "__typename": "User", "id": "1", "address": null } })
        );
    }
}
