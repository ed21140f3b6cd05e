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

//! Structural diff of incoming nodes against the forest.

use std::sync::Arc;

use arbor_common::error::{Error, ErrorKind};
use hashbrown::HashMap;
use itertools::Itertools;

use crate::{
    chunk::{FieldValue, ListChunk, NodeAggregate, TreeChunk},
    descriptor::{NodeKey, TYPENAME_FIELD},
    difference::{CompositeListDifference, LayoutItem, ModelValue, ObjectDifference, ValueDifference},
    indexer::Tree,
    layer::{trees_with_node, Layer},
    value::SourceValue,
};

/// Non-fatal diff diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    /// The base selects a field the incoming data does not carry.
    #[error("field {field} of {node} at {path} is missing in incoming data")]
    MissingModelFields {
        /// Node key.
        node: String,
        /// Path from the node.
        path: String,
        /// Store field name.
        field: String,
    },
    /// The base misses a field the incoming data carries, it will be filled.
    #[error("field {field} of {node} at {path} is missing in cached data")]
    MissingBaseFields {
        /// Node key.
        node: String,
        /// Path from the node.
        path: String,
        /// Store field name.
        field: String,
    },
}

/// Result of diffing all nodes of an incoming tree.
#[derive(Debug, Default)]
pub struct NodeDiffResult {
    /// Differences of changed nodes.
    pub node_differences: HashMap<NodeKey, ObjectDifference>,
    /// Nodes not present in any context tree.
    pub new_nodes: Vec<NodeKey>,
    /// Diagnostics.
    pub errors: Vec<DiffError>,
    /// First hard error, re-raised by the caller after processing.
    pub first_error: Option<Error>,
}

/// Diff every node of `incoming` against the trees of `context`, ordered top-down.
pub fn diff_nodes(context: &[&Layer], incoming: &Arc<Tree>) -> NodeDiffResult {
    let mut result = NodeDiffResult::default();

    for (key, chunks) in incoming.nodes.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
        let model = NodeAggregate::new(
            chunks
                .iter()
                .map(|chunk| TreeChunk {
                    tree: incoming.clone(),
                    chunk: chunk.clone(),
                })
                .collect(),
        );
        let bases = trees_with_node(context, key, Some(incoming.operation.id))
            .into_iter()
            .flat_map(|tree| {
                tree.node_chunks(key).iter().map(|chunk| TreeChunk {
                    tree: tree.clone(),
                    chunk: chunk.clone(),
                })
            })
            .collect_vec();

        if bases.is_empty() {
            result.new_nodes.push(key.clone());
            continue;
        }

        if let Some(err) = type_conflict(key, &bases, &model) {
            tracing::warn!("[differ]: {err}");
            result.first_error.get_or_insert(err);
            continue;
        }

        let mut difference = ObjectDifference::new(model.selected_fields());
        let mut ctx = DiffContext::new(key.clone());
        for base in bases.iter() {
            if difference.is_complete() && base.chunk.is_complete() {
                continue;
            }
            ctx.diff_object(base, &model, &mut difference);
        }
        result.errors.extend(ctx.errors);

        if difference.is_dirty() {
            tracing::trace!(
                "[differ]: node {key} changed, dirty: {:?}, filled: {:?}",
                difference.dirty_fields,
                difference.filled_fields
            );
            result.node_differences.insert(key.clone(), difference);
        }
    }

    result
}

fn type_conflict(key: &NodeKey, bases: &[TreeChunk], model: &NodeAggregate) -> Option<Error> {
    let explicit = |c: &TreeChunk| c.chunk.data.get(TYPENAME_FIELD).and_then(SourceValue::as_str).map(str::to_string);
    let model_type = model.chunks().iter().find_map(explicit)?;
    let base_type = bases.iter().find_map(explicit)?;
    (model_type != base_type).then(|| {
        Error::new(ErrorKind::Diff, "node changes its type")
            .with_context("node", key)
            .with_context("from", base_type)
            .with_context("to", model_type)
    })
}

/// Incoming value of a field, with every keyless sibling to aggregate.
struct ModelSlot {
    tree: Arc<Tree>,
    value: FieldValue,
    siblings: Vec<TreeChunk>,
}

impl ModelSlot {
    fn replacement(&self, base: &FieldValue) -> ValueDifference {
        ValueDifference::Replacement {
            old_value: Some(base.raw()),
            new_value: ModelValue::Chunked {
                tree: self.tree.clone(),
                value: self.value.clone(),
            },
        }
    }
}

/// State of diffing one node.
#[derive(Debug)]
pub struct DiffContext {
    node: NodeKey,
    path: Vec<String>,
    errors: Vec<DiffError>,
}

impl DiffContext {
    /// Create a context for diffing the given node.
    pub fn new(node: NodeKey) -> Self {
        Self {
            node,
            path: vec![],
            errors: vec![],
        }
    }

    /// Diagnostics recorded so far.
    pub fn errors(&self) -> &[DiffError] {
        &self.errors
    }

    fn record(&mut self, error: DiffError) {
        if !self.errors.contains(&error) {
            self.errors.push(error);
        }
    }

    fn path(&self) -> String {
        self.path.join(".")
    }

    /// Diff a base chunk against the model aggregate, merging into `difference`.
    pub fn diff_object(&mut self, base: &TreeChunk, model: &NodeAggregate, difference: &mut ObjectDifference) {
        let selection = base.chunk.selection.clone();
        for field in selection.field_queue.iter() {
            let Some(info) = selection.field_by_normalized(field) else {
                continue;
            };

            let siblings = model
                .field_values(field)
                .filter_map(|(c, v)| match v {
                    FieldValue::Object(chunk) if chunk.key.is_none() => Some(TreeChunk {
                        tree: c.tree.clone(),
                        chunk,
                    }),
                    _ => None,
                })
                .collect_vec();
            let Some((model_chunk, model_value)) = model.field(field) else {
                self.record(DiffError::MissingModelFields {
                    node: self.node.to_string(),
                    path: self.path(),
                    field: field.to_string(),
                });
                difference.field_queue.remove(field);
                continue;
            };
            let slot = ModelSlot {
                tree: model_chunk.tree.clone(),
                value: model_value,
                siblings,
            };

            let base_value = match base.tree.field_value(&base.chunk, &info.data_key) {
                None | Some(FieldValue::CompositeUndefined) => {
                    self.record(DiffError::MissingBaseFields {
                        node: self.node.to_string(),
                        path: self.path(),
                        field: field.to_string(),
                    });
                    difference
                        .field_state
                        .entry(field.clone())
                        .or_insert_with(|| ValueDifference::Filler {
                            new_value: ModelValue::Chunked {
                                tree: slot.tree.clone(),
                                value: slot.value.clone(),
                            },
                        });
                    difference.filled_fields.insert(field.clone());
                    difference.field_queue.remove(field);
                    continue;
                }
                Some(v) => v,
            };

            let existing = difference.field_state.remove(field);
            self.path.push(info.data_key.clone());
            let (state, complete) = self.diff_value(&base.tree, &base_value, slot, existing);
            self.path.pop();

            if let Some(state) = state {
                if state.is_dirty() {
                    difference.dirty_fields.insert(field.clone());
                }
                difference.field_state.insert(field.clone(), state);
            }
            if complete {
                difference.field_queue.remove(field);
            }
        }
    }

    fn diff_value(
        &mut self,
        base_tree: &Arc<Tree>,
        base: &FieldValue,
        model: ModelSlot,
        existing: Option<ValueDifference>,
    ) -> (Option<ValueDifference>, bool) {
        let existing = match existing {
            Some(d @ (ValueDifference::Replacement { .. } | ValueDifference::Filler { .. })) => return (Some(d), true),
            other => other,
        };

        match (base, &model.value) {
            (FieldValue::Object(b), FieldValue::Object(m)) => match (&b.key, &m.key) {
                // Same node, diffed on its own.
                (Some(a), Some(c)) if a == c => (existing, true),
                (None, None) => {
                    let aggregate = NodeAggregate::new(model.siblings);
                    let mut diff = match existing {
                        Some(ValueDifference::Object(d)) => d,
                        _ => ObjectDifference::new(aggregate.selected_fields()),
                    };
                    let base = TreeChunk {
                        tree: base_tree.clone(),
                        chunk: b.clone(),
                    };
                    self.diff_object(&base, &aggregate, &mut diff);
                    let complete = diff.is_complete();
                    (Some(ValueDifference::Object(diff)), complete)
                }
                _ => (Some(model.replacement(base)), true),
            },
            (FieldValue::List(b), FieldValue::List(m)) => {
                let mut diff = match existing {
                    Some(ValueDifference::List(d)) => d,
                    _ => CompositeListDifference {
                        model: Some(ModelValue::Chunked {
                            tree: model.tree.clone(),
                            value: model.value.clone(),
                        }),
                        ..Default::default()
                    },
                };
                if self.diff_list(base_tree, b, &model.tree, m, &mut diff) {
                    let complete = diff.is_complete();
                    (Some(ValueDifference::List(diff)), complete)
                } else {
                    // The bases disagree on the list layout, replace it as a whole.
                    (Some(model.replacement(base)), true)
                }
            }
            (FieldValue::CompositeNull, FieldValue::CompositeNull) => (existing, true),
            (FieldValue::Object(_) | FieldValue::List(_) | FieldValue::CompositeNull, _)
            | (_, FieldValue::Object(_) | FieldValue::List(_) | FieldValue::CompositeNull) => {
                (Some(model.replacement(base)), true)
            }
            (b, m) if b.kind() == m.kind() && b.raw() == m.raw() => (existing, true),
            _ => (Some(model.replacement(base)), true),
        }
    }

    /// Returns `false` if the base list does not match the layout computed against a previous base.
    fn diff_list(
        &mut self,
        base_tree: &Arc<Tree>,
        base: &ListChunk,
        model_tree: &Arc<Tree>,
        model: &ListChunk,
        diff: &mut CompositeListDifference,
    ) -> bool {
        let base_keys = (0..base.data.len())
            .map(|j| base_tree.item_value(base, j).and_then(|v| v.node_key().cloned()))
            .collect_vec();

        if diff.initialized {
            if base_keys != diff.base_keys {
                return false;
            }
        } else {
            self.layout_list(base_tree, base, &base_keys, model_tree, model, diff);
            diff.base_keys = base_keys;
            diff.initialized = true;
        }

        for index in diff.item_queue.iter().copied().sorted().collect_vec() {
            let Some(source) = diff.source_index(index) else {
                diff.item_queue.remove(&index);
                continue;
            };
            let (Some(base_item), Some(model_item)) = (base_tree.item_value(base, source), model_tree.item_value(model, index))
            else {
                diff.item_queue.remove(&index);
                continue;
            };
            let siblings = match &model_item {
                FieldValue::Object(chunk) if chunk.key.is_none() => vec![TreeChunk {
                    tree: model_tree.clone(),
                    chunk: chunk.clone(),
                }],
                _ => vec![],
            };
            let slot = ModelSlot {
                tree: model_tree.clone(),
                value: model_item,
                siblings,
            };

            let existing = diff.item_state.remove(&index);
            self.path.push(index.to_string());
            let (state, complete) = self.diff_value(base_tree, &base_item, slot, existing);
            self.path.pop();

            if let Some(state) = state {
                if state.is_dirty() {
                    diff.dirty_items.insert(index);
                }
                diff.item_state.insert(index, state);
            }
            if complete {
                diff.item_queue.remove(&index);
            }
        }
        true
    }

    /// Compute the layout of the new list; only kept when item identity or order changes.
    fn layout_list(
        &mut self,
        base_tree: &Arc<Tree>,
        base: &ListChunk,
        base_keys: &[Option<NodeKey>],
        model_tree: &Arc<Tree>,
        model: &ListChunk,
        diff: &mut CompositeListDifference,
    ) {
        let mut positions: HashMap<&NodeKey, usize> = HashMap::new();
        for (j, key) in base_keys.iter().enumerate() {
            if let Some(key) = key {
                positions.entry(key).or_insert(j);
            }
        }
        let base_is_null = |j: usize| matches!(base_tree.item_value(base, j), Some(FieldValue::CompositeNull) | None);

        let mut moved = base.data.len() != model.data.len();
        let mut layout = Vec::with_capacity(model.data.len());
        for index in 0..model.data.len() {
            let item = match model_tree.item_value(model, index) {
                None | Some(FieldValue::CompositeNull) => {
                    moved |= !base_is_null(index);
                    LayoutItem::Null
                }
                Some(value) => {
                    let item = match value.node_key() {
                        Some(key) => match positions.get(key) {
                            Some(&j) if j == index => LayoutItem::Same,
                            Some(&j) => LayoutItem::MovedFrom(j),
                            None => LayoutItem::NewValue,
                        },
                        None if index < base.data.len() && base_keys[index].is_none() && !base_is_null(index) => {
                            LayoutItem::Same
                        }
                        None => LayoutItem::NewValue,
                    };
                    if item == LayoutItem::NewValue {
                        diff.item_state.insert(
                            index,
                            ValueDifference::Replacement {
                                old_value: None,
                                new_value: ModelValue::Chunked {
                                    tree: model_tree.clone(),
                                    value,
                                },
                            },
                        );
                        diff.dirty_items.insert(index);
                    }
                    item
                }
            };
            moved |= item != LayoutItem::Same && item != LayoutItem::Null;
            if matches!(item, LayoutItem::Same | LayoutItem::MovedFrom(_)) {
                diff.item_queue.insert(index);
            }
            layout.push(item);
        }

        if moved {
            diff.layout = Some(layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        descriptor::{Document, Field, NormalizedField, SelectionSet},
        env::Env,
        indexer::index_tree,
        test_utils::{object, operation_with_id},
    };

    fn user_query() -> Document {
        Document::query(
            "User",
            SelectionSet::new().field(
                Field::new("user").arg("id", "1").of_type("User").selection(
                    SelectionSet::new()
                        .leaves(["__typename", "id", "name"])
                        .field(Field::new("address").selection(SelectionSet::new().leaves(["city", "zip"])))
                        .field(
                            Field::new("friends")
                                .of_type("User")
                                .selection(SelectionSet::new().leaves(["__typename", "id"])),
                        ),
                ),
            ),
        )
    }

    fn user_data(name: &str, city: &str, friends: &[&str]) -> serde_json::Value {
        json!({
            "user": {
                "__typename": "User",
                "id": "1",
                "name": name,
                "address": { "city": city, "zip": "000" },
                "friends": friends.iter().map(|id| json!({ "__typename": "User", "id": id })).collect::<Vec<_>>(),
            }
        })
    }

    fn base_layer(env: &Env, data: serde_json::Value) -> Layer {
        let op = operation_with_id(0, user_query(), json!({}));
        let mut layer = Layer::base();
        layer.insert_tree(Arc::new(index_tree(env, &op, object(data), None, None)));
        layer
    }

    fn incoming(env: &Env, data: serde_json::Value) -> Arc<Tree> {
        let op = operation_with_id(1, user_query(), json!({}));
        Arc::new(index_tree(env, &op, object(data), None, None))
    }

    #[test_log::test]
    fn test_identical_data_is_clean() {
        let env = Env::default();
        let layer = base_layer(&env, user_data("Ada", "London", &["2", "3"]));
        let result = diff_nodes(&[&layer], &incoming(&env, user_data("Ada", "London", &["2", "3"])));
        assert!(result.node_differences.is_empty());
        assert!(result.errors.is_empty());
        assert!(result.first_error.is_none());
    }

    #[test_log::test]
    fn test_leaf_and_nested_changes() {
        let env = Env::default();
        let layer = base_layer(&env, user_data("Ada", "London", &["2", "3"]));
        let result = diff_nodes(&[&layer], &incoming(&env, user_data("Bob", "Paris", &["2", "3"])));

        assert_eq!(result.node_differences.len(), 1);
        let diff = &result.node_differences["User:1"];
        assert!(diff.is_complete());
        assert!(diff.dirty_fields.contains(&NormalizedField::plain("name")));
        assert!(diff.dirty_fields.contains(&NormalizedField::plain("address")));
        assert!(!diff.dirty_fields.contains(&NormalizedField::plain("friends")));

        let Some(ValueDifference::Object(address)) = diff.field_state.get(&NormalizedField::plain("address")) else {
            panic!("expected nested object difference");
        };
        assert!(address.dirty_fields.contains(&NormalizedField::plain("city")));
        assert!(!address.dirty_fields.contains(&NormalizedField::plain("zip")));
    }

    #[test_log::test]
    fn test_list_layout() {
        let env = Env::default();
        let layer = base_layer(&env, user_data("Ada", "London", &["2", "3"]));

        let result = diff_nodes(&[&layer], &incoming(&env, user_data("Ada", "London", &["3", "2", "4"])));
        let diff = &result.node_differences["User:1"];
        let Some(ValueDifference::List(friends)) = diff.field_state.get(&NormalizedField::plain("friends")) else {
            panic!("expected list difference");
        };
        assert_eq!(
            friends.layout.as_deref(),
            Some([LayoutItem::MovedFrom(1), LayoutItem::MovedFrom(0), LayoutItem::NewValue].as_slice())
        );
        assert!(friends.dirty_items.contains(&2));
        assert!(result.new_nodes.contains(&NodeKey::from("User:4")));
    }

    #[test_log::test]
    fn test_missing_fields() {
        let env = Env::default();
        let layer = base_layer(
            &env,
            json!({ "user": { "__typename": "User", "id": "1", "address": null, "friends": [] } }),
        );
        let result = diff_nodes(
            &[&layer],
            &incoming(
                &env,
                json!({ "user": { "__typename": "User", "id": "1", "name": "Ada", "friends": [] } }),
            ),
        );

        let diff = &result.node_differences["User:1"];
        assert!(diff.filled_fields.contains(&NormalizedField::plain("name")));
        assert!(!diff.dirty_fields.contains(&NormalizedField::plain("name")));
        assert!(!diff.dirty_fields.contains(&NormalizedField::plain("address")));
        assert!(result.errors.iter().any(|e| matches!(
            e,
            DiffError::MissingModelFields { field, .. } if field == "address"
        )));
        assert!(result.errors.iter().any(|e| matches!(
            e,
            DiffError::MissingBaseFields { field, .. } if field == "name"
        )));
    }

    #[test_log::test]
    fn test_retyped_object_is_a_new_node() {
        let env = Env::default();
        let layer = base_layer(&env, user_data("Ada", "London", &[]));
        let mut data = user_data("Ada", "London", &[]);
        data["user"]["__typename"] = json!("Admin");
        let result = diff_nodes(&[&layer], &incoming(&env, data));
        // Keys depend on the type name, so the root points to a new node.
        assert!(result.first_error.is_none());
        assert!(result.node_differences.contains_key("ROOT_QUERY"));
    }
}
