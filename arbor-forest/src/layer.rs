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

use std::{fmt::Display, sync::Arc};

use hashbrown::{HashMap, HashSet};
use serde_json::{Map, Value};

use crate::{
    descriptor::{NodeKey, OperationDescriptor, OperationId},
    hydrate::MissingField,
    indexer::Tree,
    modifier::Modifiers,
    value::{SourceObject, SourceValue},
};

/// Identity of a layer, stable while layers above or below are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl LayerId {
    /// Id of the base layer.
    pub const BASE: LayerId = LayerId(0);

    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// Materialized result of reading one operation.
#[derive(Debug)]
pub struct ReadResult {
    /// The operation.
    pub operation: OperationId,
    /// Result value, `None` if the root node is missing.
    pub value: Option<SourceValue>,
    /// Missing fields and dangling references.
    pub missing: Vec<MissingField>,
    /// Nodes the result was read from.
    pub touched: HashSet<NodeKey>,
}

impl ReadResult {
    /// Returns `true` if nothing is missing.
    pub fn is_complete(&self) -> bool {
        self.value.is_some() && self.missing.is_empty()
    }

    /// Returns `true` if both results carry equal data and diagnostics.
    pub fn same_content(&self, other: &ReadResult) -> bool {
        self.value == other.value && self.missing == other.missing
    }
}

/// Memoized read of one operation.
#[derive(Debug, Clone)]
pub struct ReadMemo {
    /// Last result.
    pub result: Arc<ReadResult>,
    /// The result must be recomputed before use; kept to de-duplicate equal results.
    pub stale: bool,
}

/// A recorded command of an optimistic transaction, replayed when lower layers change.
#[derive(Debug, Clone)]
pub enum Command {
    /// Write data for an operation.
    Write {
        /// The operation.
        operation: Arc<OperationDescriptor>,
        /// Incoming data, merged again on replay.
        data: SourceObject,
    },
    /// Modify the fields of a node.
    Modify {
        /// Node key.
        node: NodeKey,
        /// Modifiers.
        modifiers: Modifiers,
    },
    /// Evict a node or one of its fields.
    Evict {
        /// Node key.
        node: NodeKey,
        /// Field name, `None` evicts the node.
        field: Option<String>,
        /// Arguments selecting one variant of the field, `None` matches every variant.
        args: Option<Map<String, Value>>,
    },
}

/// Commands of the transaction that created an optimistic layer.
#[derive(Debug, Clone, Default)]
pub struct RecordedTransaction {
    /// Commands in execution order.
    pub commands: Vec<Command>,
}

/// Trees sharing one identity space.
#[derive(Debug)]
pub struct Layer {
    /// Layer id.
    pub id: LayerId,
    /// Tag of an optimistic layer.
    pub tag: Option<String>,
    /// Trees by operation.
    pub trees: HashMap<OperationId, Arc<Tree>>,
    /// Reverse index. Entries of replaced or evicted trees are cleaned lazily.
    pub operations_by_nodes: HashMap<NodeKey, HashSet<OperationId>>,
    /// Nodes evicted in this layer.
    pub deleted_nodes: HashSet<NodeKey>,
    /// Memoized reads whose topmost read layer is this layer.
    pub read_results: HashMap<OperationId, ReadMemo>,
    /// Replay record of an optimistic layer.
    pub replay: Option<RecordedTransaction>,
}

impl Layer {
    /// Create the base layer.
    pub fn base() -> Self {
        Self::new(LayerId::BASE, None, None)
    }

    /// Create an optimistic layer.
    pub fn optimistic(id: LayerId, tag: impl Into<String>) -> Self {
        Self::new(id, Some(tag.into()), Some(RecordedTransaction::default()))
    }

    fn new(id: LayerId, tag: Option<String>, replay: Option<RecordedTransaction>) -> Self {
        Self {
            id,
            tag,
            trees: HashMap::new(),
            operations_by_nodes: HashMap::new(),
            deleted_nodes: HashSet::new(),
            read_results: HashMap::new(),
            replay,
        }
    }

    /// Returns `true` for optimistic layers.
    pub fn is_optimistic(&self) -> bool {
        self.replay.is_some()
    }

    /// Get the tree of an operation.
    pub fn tree(&self, operation: OperationId) -> Option<&Arc<Tree>> {
        self.trees.get(&operation)
    }

    /// Publish a tree, returning the replaced one.
    pub fn insert_tree(&mut self, tree: Arc<Tree>) -> Option<Arc<Tree>> {
        let operation = tree.operation.id;
        for key in tree.nodes.keys() {
            self.operations_by_nodes.entry(key.clone()).or_default().insert(operation);
        }
        self.trees.insert(operation, tree)
    }

    /// Remove the tree of an operation. The reverse index is left as is.
    pub fn remove_tree(&mut self, operation: OperationId) -> Option<Arc<Tree>> {
        self.read_results.remove(&operation);
        self.trees.remove(&operation)
    }

    /// Operations that may hold chunks of a node, including stale ids.
    pub fn operations_with_node<'a>(&'a self, key: &str) -> impl Iterator<Item = OperationId> + 'a {
        self.operations_by_nodes.get(key).into_iter().flatten().copied()
    }

    /// Node keys known to this layer.
    pub fn node_keys(&self) -> HashSet<NodeKey> {
        self.operations_by_nodes
            .keys()
            .chain(self.deleted_nodes.iter())
            .cloned()
            .collect()
    }

    /// Mark memos reading any of the given nodes stale.
    pub fn invalidate_nodes(&mut self, nodes: &HashSet<NodeKey>) {
        if nodes.is_empty() {
            return;
        }
        for memo in self.read_results.values_mut() {
            if !memo.stale && memo.result.touched.iter().any(|n| nodes.contains(n)) {
                memo.stale = true;
            }
        }
    }

    /// Mark memos of the given operations stale.
    pub fn invalidate_operations<'a>(&mut self, operations: impl IntoIterator<Item = &'a OperationId>) {
        for operation in operations {
            if let Some(memo) = self.read_results.get_mut(operation) {
                memo.stale = true;
            }
        }
    }

    /// Mark every memo stale.
    pub fn invalidate_all(&mut self) {
        self.read_results.values_mut().for_each(|m| m.stale = true);
    }

    /// Drop all data before replaying the recorded commands; memos are kept stale.
    pub fn clear_for_replay(&mut self) {
        self.trees.clear();
        self.operations_by_nodes.clear();
        self.deleted_nodes.clear();
        self.invalidate_all();
    }
}

/// Trees holding chunks of a node, topmost copy of each operation only.
///
/// `layers` are ordered top-down. The tree of `prefer` comes first, then trees by layer from the top and by
/// operation id descending.
pub fn trees_with_node<'a>(layers: &[&'a Layer], key: &str, prefer: Option<OperationId>) -> Vec<&'a Arc<Tree>> {
    let mut trees = vec![];
    for (position, layer) in layers.iter().enumerate() {
        let mut operations = layer.operations_with_node(key).collect::<Vec<_>>();
        operations.sort_unstable_by(|a, b| b.cmp(a));
        for operation in operations {
            let shadowed = layers[..position].iter().any(|l| l.trees.contains_key(&operation));
            if shadowed {
                continue;
            }
            if let Some(tree) = layer.tree(operation).filter(|t| t.nodes.contains_key(key)) {
                trees.push(tree);
            }
        }
    }
    if let Some(prefer) = prefer {
        if let Some(position) = trees.iter().position(|t| t.operation.id == prefer) {
            let tree = trees.remove(position);
            trees.insert(0, tree);
        }
    }
    trees
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        descriptor::{Document, Field, SelectionSet},
        env::Env,
        indexer::index_tree,
        test_utils::{object, operation},
    };

    #[test]
    fn test_insert_and_invalidate() {
        let env = Env::default();
        let op = operation(
            Document::query(
                "User",
                SelectionSet::new().field(
                    Field::new("user")
                        .of_type("User")
                        .selection(SelectionSet::new().leaves(["__typename", "id"])),
                ),
            ),
            json!({}),
        );
        let tree = Arc::new(index_tree(
            &env,
            &op,
            object(json!({ "user": { "__typename": "User", "id": "1" } })),
            None,
            None,
        ));

        let mut layer = Layer::base();
        assert!(!layer.is_optimistic());
        assert!(layer.insert_tree(tree.clone()).is_none());
        assert_eq!(layer.operations_with_node("User:1").collect::<Vec<_>>(), vec![op.id]);

        layer.read_results.insert(
            op.id,
            ReadMemo {
                result: Arc::new(ReadResult {
                    operation: op.id,
                    value: Some(SourceValue::Object(tree.result.clone())),
                    missing: vec![],
                    touched: tree.nodes.keys().cloned().collect(),
                }),
                stale: false,
            },
        );
        layer.invalidate_nodes(&["User:2".into()].into_iter().collect());
        assert!(!layer.read_results[&op.id].stale);
        layer.invalidate_nodes(&["User:1".into()].into_iter().collect());
        assert!(layer.read_results[&op.id].stale);

        // The reverse index keeps stale ids after removal.
        assert!(layer.remove_tree(op.id).is_some());
        assert_eq!(layer.operations_with_node("User:1").count(), 1);
        assert!(layer.tree(op.id).is_none());
    }

    #[test]
    fn test_clear_for_replay() {
        let mut layer = Layer::optimistic(LayerId::new(1), "opt");
        assert!(layer.is_optimistic());
        layer.deleted_nodes.insert("User:1".into());
        assert!(layer.node_keys().contains("User:1"));
        layer.clear_for_replay();
        assert!(layer.node_keys().is_empty());
        assert_eq!(layer.tag.as_deref(), Some("opt"));
    }
}
