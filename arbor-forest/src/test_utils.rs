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

//! Helpers shared by unit tests.

use std::sync::Arc;

use hashbrown::HashSet;

use crate::{
    chunk::TreeChunk,
    descriptor::{Document, OperationDescriptor, OperationId},
    hydrate::NodeChunkLookup,
    indexer::Tree,
    policy::PolicyTable,
    value::{SourceObject, SourceValue},
};

/// Resolve a document as operation `0`.
pub fn operation(document: Document, variables: serde_json::Value) -> Arc<OperationDescriptor> {
    operation_with_id(0, document, variables)
}

/// Resolve a document with the given operation id.
pub fn operation_with_id(id: u32, document: Document, variables: serde_json::Value) -> Arc<OperationDescriptor> {
    Arc::new(
        OperationDescriptor::resolve(
            OperationId::new(id),
            Arc::new(document),
            variables.as_object(),
            None,
            &PolicyTable::default(),
        )
        .unwrap(),
    )
}

/// Convert JSON into a shared object.
pub fn object(value: serde_json::Value) -> SourceObject {
    SourceValue::from(value).as_object().unwrap().clone()
}

/// Node chunk lookup over trees in precedence order.
#[derive(Default)]
pub struct TreeLookup {
    pub trees: Vec<Arc<Tree>>,
    pub deleted: HashSet<String>,
}

impl TreeLookup {
    pub fn new(trees: Vec<Arc<Tree>>) -> Self {
        Self {
            trees,
            deleted: HashSet::new(),
        }
    }

    /// Add a tree with the highest precedence.
    pub fn push_front(&mut self, tree: Arc<Tree>) {
        self.trees.insert(0, tree);
    }
}

impl NodeChunkLookup for TreeLookup {
    fn node_chunks(&self, key: &str) -> Vec<TreeChunk> {
        self.trees
            .iter()
            .flat_map(|tree| {
                tree.node_chunks(key).iter().map(|chunk| TreeChunk {
                    tree: tree.clone(),
                    chunk: chunk.clone(),
                })
            })
            .collect()
    }

    fn is_deleted(&self, key: &str) -> bool {
        self.deleted.contains(key)
    }
}
