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

//! Copy-on-write application of node differences to a tree.

use std::{collections::VecDeque, sync::Arc};

use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    chunk::{FieldValue, ListChunk, ObjectChunk},
    descriptor::{NodeKey, PossibleSelections},
    difference::{CompositeListDifference, LayoutItem, ModelValue, ObjectDifference, ValueDifference},
    env::Env,
    hydrate::{Hydrator, MissingField, NodeChunkLookup},
    indexer::{index_tree, Tree},
    value::{ObjectData, SourceValue, ValuePtr},
};

/// Result of [`update_tree`].
#[derive(Debug)]
pub struct UpdateTreeResult {
    /// The patched tree, or the input tree if nothing changed.
    pub tree: Arc<Tree>,
    /// Returns `true` if the tree was rebuilt.
    pub changed: bool,
    /// Nodes whose data changed in this tree.
    pub changed_nodes: HashSet<NodeKey>,
    /// Values that could not be materialized for the selections of this tree.
    pub missing: Vec<MissingField>,
}

/// Apply node differences to a tree.
///
/// Only objects and lists on paths to changed values are copied; every other value keeps its identity, and the
/// chunks of unchanged values are recycled when the result is re-indexed.
pub fn update_tree(
    env: &Env,
    tree: &Arc<Tree>,
    differences: &HashMap<NodeKey, ObjectDifference>,
    lookup: &dyn NodeChunkLookup,
) -> UpdateTreeResult {
    let mut patcher = Patcher {
        tree,
        hydrator: Hydrator::new(env, &tree.operation, lookup, false),
        objects: HashMap::new(),
        lists: HashMap::new(),
        dirty: HashSet::new(),
        finalized: HashMap::new(),
    };

    let mut changed_nodes = HashSet::new();
    for (key, difference) in differences.iter() {
        for chunk in tree.node_chunks(key) {
            if patcher.apply_object(chunk, difference) {
                changed_nodes.insert(key.clone());
            }
        }
    }

    if changed_nodes.is_empty() {
        return UpdateTreeResult {
            tree: tree.clone(),
            changed: false,
            changed_nodes,
            missing: patcher.hydrator.into_missing(),
        };
    }

    patcher.mark_dirty_paths();
    let root = patcher.finalize(&SourceValue::Object(tree.result.clone()));
    let root = match root {
        SourceValue::Object(root) => root,
        _ => tree.result.clone(),
    };
    let missing = patcher.hydrator.into_missing();

    tracing::trace!(
        "[patcher]: rebuilt tree of {}, changed nodes: {:?}",
        tree.operation.debug_name(),
        changed_nodes
    );

    let patched = index_tree(env, &tree.operation, root, None, Some(tree));
    UpdateTreeResult {
        tree: Arc::new(patched),
        changed: true,
        changed_nodes,
        missing,
    }
}

#[derive(Debug, Default)]
struct ObjectDraft {
    set: IndexMap<String, SourceValue>,
    deleted: HashSet<String>,
}

#[derive(Debug)]
enum ItemSource {
    Base(usize),
    Value(SourceValue),
}

enum ListOutcome {
    Unchanged,
    Patched,
    Replace(SourceValue),
}

struct Patcher<'a> {
    tree: &'a Arc<Tree>,
    hydrator: Hydrator<'a>,

    objects: HashMap<ValuePtr, ObjectDraft>,
    lists: HashMap<ValuePtr, Vec<ItemSource>>,
    dirty: HashSet<ValuePtr>,
    finalized: HashMap<ValuePtr, SourceValue>,
}

impl Patcher<'_> {
    fn materialize(&mut self, value: &ModelValue, selections: Option<&Arc<PossibleSelections>>) -> Option<SourceValue> {
        match value {
            ModelValue::Raw(v) => Some(v.clone()),
            ModelValue::Delete => None,
            ModelValue::Chunked {
                value: FieldValue::CompositeUndefined,
                ..
            } => None,
            ModelValue::Chunked { tree, value } => {
                let Some(selections) = selections else {
                    return Some(value.raw());
                };
                let reusable = match value {
                    FieldValue::Object(c) => {
                        c.is_complete() && PossibleSelections::same_shape(&c.possible_selections, selections)
                    }
                    FieldValue::List(l) => {
                        l.is_complete() && PossibleSelections::same_shape(&l.possible_selections, selections)
                    }
                    _ => true,
                };
                if reusable {
                    Some(value.raw())
                } else {
                    self.hydrator.materialize(tree, value, selections)
                }
            }
        }
    }

    fn object_draft(&mut self, chunk: &ObjectChunk) -> &mut ObjectDraft {
        self.objects.entry(ValuePtr::of_object(&chunk.data)).or_default()
    }

    /// Returns `true` if the object changed.
    fn apply_object(&mut self, chunk: &ObjectChunk, difference: &ObjectDifference) -> bool {
        let mut changed = false;
        for field in difference.changed_fields() {
            let (Some(info), Some(state)) = (chunk.field_info(field), difference.field_state.get(field)) else {
                continue;
            };
            let data_key = info.data_key.clone();

            match state {
                ValueDifference::Replacement { new_value, .. } | ValueDifference::Filler { new_value } => {
                    let current = chunk
                        .data
                        .get(&data_key)
                        .filter(|_| !chunk.missing_fields.contains(&data_key));
                    match self.materialize(new_value, info.selection.as_ref()) {
                        Some(value) => {
                            if current.is_some_and(|c| *c == value) {
                                continue;
                            }
                            self.object_draft(chunk).set.insert(data_key, value);
                            changed = true;
                        }
                        None => {
                            if chunk.data.contains_key(&data_key) {
                                self.object_draft(chunk).deleted.insert(data_key);
                                changed = true;
                            }
                        }
                    }
                }
                ValueDifference::Object(nested) => {
                    if let Some(FieldValue::Object(c)) = self.tree.field_value(chunk, &data_key) {
                        if c.key.is_none() {
                            changed |= self.apply_object(&c, nested);
                        }
                    }
                }
                ValueDifference::List(nested) => {
                    if let Some(FieldValue::List(l)) = self.tree.field_value(chunk, &data_key) {
                        match self.apply_list(&l, nested) {
                            ListOutcome::Unchanged => {}
                            ListOutcome::Patched => changed = true,
                            ListOutcome::Replace(value) => {
                                self.object_draft(chunk).set.insert(data_key, value);
                                changed = true;
                            }
                        }
                    }
                }
            }
        }
        changed
    }

    fn apply_list(&mut self, list: &Arc<ListChunk>, difference: &CompositeListDifference) -> ListOutcome {
        let tree = self.tree.clone();
        if difference.initialized && difference.layout.is_some() {
            let keys = (0..list.data.len())
                .map(|j| tree.item_value(list, j).and_then(|v| v.node_key().cloned()))
                .collect_vec();
            if keys != difference.base_keys {
                // The layout was computed against another version of the list.
                return match &difference.model {
                    Some(model) => match self.materialize(model, Some(&list.possible_selections)) {
                        Some(value) => ListOutcome::Replace(value),
                        None => ListOutcome::Unchanged,
                    },
                    None => ListOutcome::Unchanged,
                };
            }
        }

        let len = difference.layout.as_ref().map_or(list.data.len(), Vec::len);
        let mut rebuilt = difference.layout.is_some();
        let mut changed = rebuilt;
        let mut items = Vec::with_capacity(len);

        for index in 0..len {
            let layout = difference.layout.as_ref().map_or(LayoutItem::Same, |l| l[index]);
            let source = match layout {
                LayoutItem::Same => Some(index),
                LayoutItem::MovedFrom(j) => Some(j),
                LayoutItem::NewValue | LayoutItem::Null => None,
            };

            let item = match (source, difference.item_state.get(&index)) {
                (None, Some(ValueDifference::Replacement { new_value, .. } | ValueDifference::Filler { new_value }))
                    if layout == LayoutItem::NewValue =>
                {
                    changed = true;
                    ItemSource::Value(self.materialize(new_value, Some(&list.possible_selections)).unwrap_or_default())
                }
                (None, _) => ItemSource::Value(SourceValue::Null),
                (
                    Some(j),
                    Some(ValueDifference::Replacement { new_value, .. } | ValueDifference::Filler { new_value }),
                ) => {
                    let value = self.materialize(new_value, Some(&list.possible_selections)).unwrap_or_default();
                    if list.data.get(j).is_some_and(|c| *c == value) {
                        ItemSource::Base(j)
                    } else {
                        rebuilt = true;
                        changed = true;
                        ItemSource::Value(value)
                    }
                }
                (Some(j), Some(ValueDifference::Object(nested))) => {
                    if let Some(FieldValue::Object(c)) = tree.item_value(list, j) {
                        if c.key.is_none() {
                            changed |= self.apply_object(&c, nested);
                        }
                    }
                    ItemSource::Base(j)
                }
                (Some(j), Some(ValueDifference::List(nested))) => match tree.item_value(list, j) {
                    Some(FieldValue::List(l)) => match self.apply_list(&l, nested) {
                        ListOutcome::Unchanged => ItemSource::Base(j),
                        ListOutcome::Patched => {
                            changed = true;
                            ItemSource::Base(j)
                        }
                        ListOutcome::Replace(value) => {
                            rebuilt = true;
                            changed = true;
                            ItemSource::Value(value)
                        }
                    },
                    _ => ItemSource::Base(j),
                },
                (Some(j), None) => ItemSource::Base(j),
            };
            items.push(item);
        }

        if rebuilt {
            self.lists.insert(ValuePtr::of_list(&list.data), items);
        }
        if changed {
            ListOutcome::Patched
        } else {
            ListOutcome::Unchanged
        }
    }

    /// Mark every drafted value and its ancestors.
    fn mark_dirty_paths(&mut self) {
        let mut queue: VecDeque<ValuePtr> = self.objects.keys().chain(self.lists.keys()).copied().collect();
        while let Some(ptr) = queue.pop_front() {
            if !self.dirty.insert(ptr) {
                continue;
            }
            if let Some(entry) = self.tree.data_map.get(&ptr) {
                queue.extend(entry.parents.iter().map(|p| p.parent));
            }
        }
    }

    fn finalize(&mut self, value: &SourceValue) -> SourceValue {
        let Some(ptr) = value.ptr() else {
            return value.clone();
        };
        if !self.dirty.contains(&ptr) {
            return value.clone();
        }
        if let Some(v) = self.finalized.get(&ptr) {
            return v.clone();
        }

        let patched = match value {
            SourceValue::Object(object) => {
                let mut draft = self.objects.remove(&ptr).unwrap_or_default();
                let mut data = ObjectData::with_capacity(object.len() + draft.set.len());
                for (key, v) in object.iter() {
                    if draft.deleted.contains(key) {
                        continue;
                    }
                    let v = match draft.set.shift_remove(key) {
                        Some(new) => new,
                        None => self.finalize(v),
                    };
                    data.insert(key.clone(), v);
                }
                data.extend(draft.set);
                SourceValue::Object(Arc::new(data))
            }
            SourceValue::List(list) => {
                let items = match self.lists.remove(&ptr) {
                    Some(items) => items
                        .into_iter()
                        .map(|item| match item {
                            ItemSource::Base(j) => list.get(j).map(|v| self.finalize(v)).unwrap_or_default(),
                            ItemSource::Value(v) => v,
                        })
                        .collect(),
                    None => list.iter().map(|v| self.finalize(v)).collect(),
                };
                SourceValue::List(Arc::new(items))
            }
            v => v.clone(),
        };
        self.finalized.insert(ptr, patched.clone());
        patched
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        descriptor::{Document, Field, NormalizedField, SelectionSet},
        differ::diff_nodes,
        layer::Layer,
        test_utils::{object, operation_with_id, TreeLookup},
    };

    fn user_query(name: &str, fields: SelectionSet) -> Document {
        Document::query(
            name,
            SelectionSet::new().field(Field::new("user").arg("id", "1").of_type("User").selection(fields)),
        )
    }

    fn full_selection() -> SelectionSet {
        SelectionSet::new()
            .leaves(["__typename", "id", "name"])
            .field(Field::new("address").selection(SelectionSet::new().leaves(["city"])))
            .field(
                Field::new("friends")
                    .of_type("User")
                    .selection(SelectionSet::new().leaves(["__typename", "id", "name"])),
            )
    }

    fn user(name: &str, city: &str, friends: &[(&str, &str)]) -> serde_json::Value {
        json!({
            "user": {
                "__typename": "User",
                "id": "1",
                "name": name,
                "address": { "city": city },
                "friends": friends
                    .iter()
                    .map(|(id, name)| json!({ "__typename": "User", "id": id, "name": name }))
                    .collect::<Vec<_>>(),
            }
        })
    }

    fn patch(env: &Env, base: &Arc<Tree>, incoming: &Arc<Tree>) -> UpdateTreeResult {
        let mut layer = Layer::base();
        layer.insert_tree(base.clone());
        let diff = diff_nodes(&[&layer], incoming);
        let lookup = TreeLookup::new(vec![incoming.clone(), base.clone()]);
        update_tree(env, base, &diff.node_differences, &lookup)
    }

    #[test_log::test]
    fn test_patch_keeps_unchanged_values() {
        let env = Env::default();
        let op = operation_with_id(0, user_query("Full", full_selection()), json!({}));
        let base = Arc::new(index_tree(&env, &op, object(user("Ada", "London", &[("2", "Bob")])), None, None));

        let name_only = user_query("Name", SelectionSet::new().leaves(["__typename", "id", "name"]));
        let op = operation_with_id(1, name_only, json!({}));
        let incoming = Arc::new(index_tree(
            &env,
            &op,
            object(json!({ "user": { "__typename": "User", "id": "1", "name": "Grace" } })),
            None,
            None,
        ));

        let result = patch(&env, &base, &incoming);
        assert!(result.changed);
        assert!(result.changed_nodes.contains("User:1"));
        assert_eq!(result.tree.result.get("user").unwrap().to_json(), user("Grace", "London", &[("2", "Bob")])["user"]);

        let address = |tree: &Tree| tree.result["user"].as_object().unwrap()["address"].clone();
        assert!(address(&result.tree).same(&address(&base)));
        assert!(!result.tree.result["user"].same(&base.result["user"]));
    }

    #[test_log::test]
    fn test_patch_reorders_list() {
        let env = Env::default();
        let op = operation_with_id(0, user_query("Full", full_selection()), json!({}));
        let base = Arc::new(index_tree(
            &env,
            &op,
            object(user("Ada", "London", &[("2", "Bob"), ("3", "Eve")])),
            None,
            None,
        ));
        let op = operation_with_id(1, user_query("Full", full_selection()), json!({}));
        let incoming = Arc::new(index_tree(
            &env,
            &op,
            object(user("Ada", "London", &[("3", "Eve"), ("2", "Bob"), ("4", "Dan")])),
            None,
            None,
        ));

        let result = patch(&env, &base, &incoming);
        assert!(result.changed);
        assert!(result.missing.is_empty());
        assert_eq!(
            SourceValue::Object(result.tree.result.clone()).to_json(),
            user("Ada", "London", &[("3", "Eve"), ("2", "Bob"), ("4", "Dan")])
        );

        // Moved items keep their identity.
        let friends = |tree: &Tree| tree.result["user"].as_object().unwrap()["friends"].as_list().unwrap().clone();
        assert!(friends(&result.tree)[0].same(&friends(&base)[1]));
        assert!(result.tree.nodes.contains_key("User:4"));
    }

    #[test]
    fn test_delete_field() {
        let env = Env::default();
        let op = operation_with_id(0, user_query("Full", full_selection()), json!({}));
        let base = Arc::new(index_tree(&env, &op, object(user("Ada", "London", &[])), None, None));

        let mut difference = ObjectDifference::new([]);
        difference.replace(NormalizedField::plain("name"), None, ModelValue::Delete);
        let differences = [(NodeKey::from("User:1"), difference)].into_iter().collect();
        let lookup = TreeLookup::new(vec![base.clone()]);

        let result = update_tree(&env, &base, &differences, &lookup);
        assert!(result.changed);
        assert!(!result.tree.is_complete());
        assert!(!result.tree.result["user"].as_object().unwrap().contains_key("name"));

        // Deleting a missing field is a no-op.
        let again = update_tree(&env, &result.tree, &differences, &lookup);
        assert!(!again.changed);
        assert!(Arc::ptr_eq(&again.tree, &result.tree));
    }
}
