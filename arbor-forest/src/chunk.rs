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

//! Chunks: normalized views of source values through one selection.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::{
    descriptor::{FieldInfo, NodeKey, NormalizedField, PossibleSelections, ResolvedSelection, TypeName},
    indexer::Tree,
    value::{SourceList, SourceObject, SourceValue},
};

/// Kind of a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Composite object.
    Object,
    /// List of composite values.
    CompositeList,
    /// `null` at a composite position.
    CompositeNull,
    /// Missing value at a composite position.
    CompositeUndefined,
    /// Object at a leaf position (custom scalar).
    ComplexScalar,
    /// List at a leaf position.
    LeafList,
    /// Scalar at a composite position.
    LeafError,
    /// Scalar at a leaf position.
    Scalar,
}

/// An object value seen through one resolved selection of one operation.
#[derive(Debug)]
pub struct ObjectChunk {
    /// Node identity, `None` for keyless objects.
    pub key: Option<NodeKey>,
    /// Concrete type name.
    pub type_name: Option<TypeName>,
    /// Selections of the position the object was found at.
    pub possible_selections: Arc<PossibleSelections>,
    /// Selection resolved for the concrete type.
    pub selection: Arc<ResolvedSelection>,
    /// Shared source data.
    pub data: SourceObject,
    /// Response keys of selected fields absent from the data.
    pub missing_fields: HashSet<String>,
    /// Response keys of composite fields whose value is incomplete.
    pub partial_fields: HashSet<String>,
}

impl ObjectChunk {
    /// Returns `true` if neither this chunk nor any nested value misses data.
    pub fn is_complete(&self) -> bool {
        self.missing_fields.is_empty() && self.partial_fields.is_empty()
    }

    /// Get the selected field with the given normalized identity.
    pub fn field_info(&self, field: &NormalizedField) -> Option<&FieldInfo> {
        self.selection.field_by_normalized(field)
    }
}

/// A list value seen through the selection of its items.
#[derive(Debug)]
pub struct ListChunk {
    /// Selections of the items.
    pub possible_selections: Arc<PossibleSelections>,
    /// Shared source data.
    pub data: SourceList,
    /// Indices of items that are missing or violate the expected shape.
    pub missing_items: HashSet<usize>,
    /// Indices of items whose value is incomplete.
    pub partial_items: HashSet<usize>,
    /// Empty chunks standing in for items that violate the expected shape.
    pub coerced: HashMap<usize, Arc<ObjectChunk>>,
}

impl ListChunk {
    /// Returns `true` if no item misses data.
    pub fn is_complete(&self) -> bool {
        self.missing_items.is_empty() && self.partial_items.is_empty()
    }
}

/// A chunk registered for a source value.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Object chunk.
    Object(Arc<ObjectChunk>),
    /// List chunk.
    List(Arc<ListChunk>),
}

impl Chunk {
    /// Selections the chunk was indexed with.
    pub fn possible_selections(&self) -> &Arc<PossibleSelections> {
        match self {
            Chunk::Object(c) => &c.possible_selections,
            Chunk::List(c) => &c.possible_selections,
        }
    }
}

/// Value of a field or list item resolved through a tree.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Scalar at a leaf position.
    Scalar(SourceValue),
    /// List at a leaf position.
    LeafList(SourceValue),
    /// Object at a leaf position.
    ComplexScalar(SourceValue),
    /// Scalar at a composite position.
    LeafError(SourceValue),
    /// Composite object.
    Object(Arc<ObjectChunk>),
    /// Composite list.
    List(Arc<ListChunk>),
    /// `null` at a composite position.
    CompositeNull,
    /// Missing value at a composite position.
    CompositeUndefined,
}

impl FieldValue {
    /// Kind of the value.
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::Scalar(_) => ValueKind::Scalar,
            FieldValue::LeafList(_) => ValueKind::LeafList,
            FieldValue::ComplexScalar(_) => ValueKind::ComplexScalar,
            FieldValue::LeafError(_) => ValueKind::LeafError,
            FieldValue::Object(_) => ValueKind::Object,
            FieldValue::List(_) => ValueKind::CompositeList,
            FieldValue::CompositeNull => ValueKind::CompositeNull,
            FieldValue::CompositeUndefined => ValueKind::CompositeUndefined,
        }
    }

    /// Raw source value, `null` for missing composite values.
    pub fn raw(&self) -> SourceValue {
        match self {
            FieldValue::Scalar(v) | FieldValue::LeafList(v) | FieldValue::ComplexScalar(v) | FieldValue::LeafError(v) => {
                v.clone()
            }
            FieldValue::Object(c) => SourceValue::Object(c.data.clone()),
            FieldValue::List(c) => SourceValue::List(c.data.clone()),
            FieldValue::CompositeNull | FieldValue::CompositeUndefined => SourceValue::Null,
        }
    }

    /// Returns `true` for leaf kinds.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            FieldValue::Scalar(_) | FieldValue::LeafList(_) | FieldValue::ComplexScalar(_)
        )
    }

    /// Node key of a keyed object value.
    pub fn node_key(&self) -> Option<&NodeKey> {
        match self {
            FieldValue::Object(c) => c.key.as_ref(),
            _ => None,
        }
    }
}

/// A chunk together with the tree it belongs to.
#[derive(Debug, Clone)]
pub struct TreeChunk {
    /// Owning tree.
    pub tree: Arc<Tree>,
    /// The chunk.
    pub chunk: Arc<ObjectChunk>,
}

impl TreeChunk {
    /// Resolve a field of the chunk by normalized identity.
    ///
    /// Returns `None` if the chunk does not select the field or the data misses it.
    pub fn field(&self, field: &NormalizedField) -> Option<FieldValue> {
        let info = self.chunk.field_info(field)?;
        match self.tree.field_value(&self.chunk, &info.data_key)? {
            FieldValue::CompositeUndefined => None,
            v => Some(v),
        }
    }
}

/// Read-only logical merge of chunks sharing one node key.
///
/// The first chunk in aggregation order that defines a field wins.
#[derive(Debug, Clone, Default)]
pub struct NodeAggregate {
    chunks: Vec<TreeChunk>,
}

impl NodeAggregate {
    /// Create an aggregate over the given chunks, in precedence order.
    pub fn new(chunks: Vec<TreeChunk>) -> Self {
        Self { chunks }
    }

    /// Chunks of the aggregate.
    pub fn chunks(&self) -> &[TreeChunk] {
        &self.chunks
    }

    /// Returns `true` if the aggregate has no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Type name of the first chunk that knows it.
    pub fn type_name(&self) -> Option<&TypeName> {
        self.chunks.iter().find_map(|c| c.chunk.type_name.as_ref())
    }

    /// Value of a field from the first chunk defining it.
    pub fn field(&self, field: &NormalizedField) -> Option<(&TreeChunk, FieldValue)> {
        self.chunks.iter().find_map(|c| c.field(field).map(|v| (c, v)))
    }

    /// Values of a field from every chunk defining it, in precedence order.
    pub fn field_values<'a>(&'a self, field: &'a NormalizedField) -> impl Iterator<Item = (&'a TreeChunk, FieldValue)> + 'a {
        self.chunks.iter().filter_map(move |c| c.field(field).map(|v| (c, v)))
    }

    /// Normalized fields selected by any chunk, in first-seen order.
    pub fn selected_fields(&self) -> Vec<NormalizedField> {
        let mut seen = HashSet::new();
        self.chunks
            .iter()
            .flat_map(|c| c.chunk.selection.field_queue.iter())
            .filter(|f| seen.insert((*f).clone()))
            .cloned()
            .collect()
    }
}
