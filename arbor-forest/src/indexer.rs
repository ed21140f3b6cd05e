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

//! Indexes an operation result into a [`Tree`] of chunks.

use std::{fmt::Display, sync::Arc};

use hashbrown::{HashMap, HashSet};

use crate::{
    chunk::{Chunk, FieldValue, ListChunk, ObjectChunk},
    descriptor::{NodeKey, OperationDescriptor, PossibleSelections, TypeName, TYPENAME_FIELD},
    env::Env,
    value::{ObjectData, SourceList, SourceObject, SourceValue, ValuePtr},
};

/// One step of a path from the root of a result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    /// Object field by response key.
    Field(String),
    /// List item by index.
    Index(usize),
}

impl Display for PathStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathStep::Field(k) => write!(f, "{k}"),
            PathStep::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Link from a value to one of its parents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    /// Parent object or list.
    pub parent: ValuePtr,
    /// Step from the parent to the value.
    pub step: PathStep,
}

/// Index entry of one shared value.
#[derive(Debug, Default)]
pub struct DataEntry {
    /// Every position the value was found at.
    pub parents: Vec<ParentLink>,
    /// Chunks of the value, one per distinct selection shape.
    pub chunks: Vec<Chunk>,
}

/// Response keys known to be missing, by object identity.
pub type KnownMissing = HashMap<ValuePtr, HashSet<String>>;

/// Indexed result of one operation.
#[derive(Debug)]
pub struct Tree {
    /// The operation.
    pub operation: Arc<OperationDescriptor>,
    /// Result data.
    pub result: SourceObject,
    /// Node key of the root object.
    pub root_node_key: NodeKey,
    /// Root chunk.
    pub root: Arc<ObjectChunk>,
    /// Chunks by node key.
    pub nodes: HashMap<NodeKey, Vec<Arc<ObjectChunk>>>,
    /// Index of every object and list by identity.
    pub data_map: HashMap<ValuePtr, DataEntry>,
    /// Chunks with missing fields.
    pub incomplete_chunks: Vec<Arc<ObjectChunk>>,
}

impl Tree {
    /// Returns `true` if no selected field is missing anywhere in the tree.
    pub fn is_complete(&self) -> bool {
        self.root.is_complete()
    }

    /// Chunks of a node in this tree.
    pub fn node_chunks(&self, key: &str) -> &[Arc<ObjectChunk>] {
        self.nodes.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Find the chunk indexed for a value with the given selections.
    pub fn chunk_for(&self, value: &SourceValue, selections: &Arc<PossibleSelections>) -> Option<&Chunk> {
        let entry = self.data_map.get(&value.ptr()?)?;
        entry
            .chunks
            .iter()
            .find(|c| Arc::ptr_eq(c.possible_selections(), selections))
            .or_else(|| {
                entry
                    .chunks
                    .iter()
                    .find(|c| PossibleSelections::same_shape(c.possible_selections(), selections))
            })
    }

    /// Resolve a field of a chunk of this tree by response key.
    ///
    /// Missing leaf fields resolve to `None`, missing composite fields to [`FieldValue::CompositeUndefined`].
    pub fn field_value(&self, chunk: &ObjectChunk, data_key: &str) -> Option<FieldValue> {
        let info = chunk.selection.field(data_key)?;
        let value = match chunk.data.get(data_key) {
            Some(value) if !chunk.missing_fields.contains(data_key) => value,
            _ => return info.is_composite().then_some(FieldValue::CompositeUndefined),
        };
        let value = match &info.selection {
            None => match value {
                SourceValue::List(_) => FieldValue::LeafList(value.clone()),
                SourceValue::Object(_) => FieldValue::ComplexScalar(value.clone()),
                v => FieldValue::Scalar(v.clone()),
            },
            Some(selections) => self.composite_value(value, selections),
        };
        Some(value)
    }

    /// Resolve an item of a list chunk of this tree.
    pub fn item_value(&self, list: &ListChunk, index: usize) -> Option<FieldValue> {
        if let Some(coerced) = list.coerced.get(&index) {
            return Some(FieldValue::Object(coerced.clone()));
        }
        let value = list.data.get(index)?;
        Some(self.composite_value(value, &list.possible_selections))
    }

    fn composite_value(&self, value: &SourceValue, selections: &Arc<PossibleSelections>) -> FieldValue {
        match value {
            SourceValue::Null => FieldValue::CompositeNull,
            SourceValue::Object(_) | SourceValue::List(_) => match self.chunk_for(value, selections) {
                Some(Chunk::Object(c)) => FieldValue::Object(c.clone()),
                Some(Chunk::List(c)) => FieldValue::List(c.clone()),
                None => FieldValue::LeafError(value.clone()),
            },
            v => FieldValue::LeafError(v.clone()),
        }
    }

    /// Path from the root to the first position of a value.
    pub fn path_to(&self, ptr: ValuePtr) -> Vec<PathStep> {
        let mut path = vec![];
        let mut current = ptr;
        while let Some(link) = self.data_map.get(&current).and_then(|e| e.parents.first()) {
            path.push(link.step.clone());
            current = link.parent;
        }
        path.reverse();
        path
    }
}

/// Index the result of an operation.
///
/// Chunks of values that `previous` already indexed with the same selections are reused.
pub fn index_tree(
    env: &Env,
    operation: &Arc<OperationDescriptor>,
    result: SourceObject,
    known_missing: Option<&KnownMissing>,
    previous: Option<&Tree>,
) -> Tree {
    let mut indexer = Indexer {
        env,
        operation,
        known_missing,
        previous,
        nodes: HashMap::new(),
        data_map: HashMap::new(),
        incomplete_chunks: vec![],
    };
    let root = indexer.index_object(
        &result,
        &operation.possible_selections,
        Some(&operation.root_type),
        Some(operation.root_node_key.clone()),
        None,
    );
    Tree {
        operation: operation.clone(),
        result,
        root_node_key: operation.root_node_key.clone(),
        root,
        nodes: indexer.nodes,
        data_map: indexer.data_map,
        incomplete_chunks: indexer.incomplete_chunks,
    }
}

struct Indexer<'a> {
    env: &'a Env,
    operation: &'a OperationDescriptor,
    known_missing: Option<&'a KnownMissing>,
    previous: Option<&'a Tree>,

    nodes: HashMap<NodeKey, Vec<Arc<ObjectChunk>>>,
    data_map: HashMap<ValuePtr, DataEntry>,
    incomplete_chunks: Vec<Arc<ObjectChunk>>,
}

impl Indexer<'_> {
    /// Returns the chunk if the value was already indexed with the same selections, registering the new position.
    fn visited(&mut self, ptr: ValuePtr, selections: &Arc<PossibleSelections>, parent: &Option<ParentLink>) -> Option<Chunk> {
        let entry = self.data_map.get_mut(&ptr)?;
        let chunk = entry
            .chunks
            .iter()
            .find(|c| PossibleSelections::same_shape(c.possible_selections(), selections))?
            .clone();
        entry.parents.extend(parent.clone());
        Some(chunk)
    }

    /// Reuse the chunk `previous` built for the same value and shape, re-registering its subtree from the old chunks
    /// without resolving selections or identities again.
    fn recycle(
        &mut self,
        ptr: ValuePtr,
        selections: &Arc<PossibleSelections>,
        key: Option<&NodeKey>,
        parent: &Option<ParentLink>,
    ) -> Option<Chunk> {
        if self.known_missing.is_some_and(|k| !k.is_empty()) {
            return None;
        }
        let chunk = self
            .previous?
            .data_map
            .get(&ptr)?
            .chunks
            .iter()
            .find(|c| {
                PossibleSelections::same_shape(c.possible_selections(), selections)
                    && match (c, key) {
                        (Chunk::Object(c), Some(key)) => c.key.as_ref() == Some(key),
                        _ => true,
                    }
            })?
            .clone();
        self.adopt(ptr, &chunk, parent.clone());
        Some(chunk)
    }

    fn adopt(&mut self, ptr: ValuePtr, chunk: &Chunk, parent: Option<ParentLink>) {
        if self.visited(ptr, chunk.possible_selections(), &parent).is_some() {
            return;
        }
        match chunk {
            Chunk::Object(object) => {
                for (data_key, info) in object.selection.fields.iter() {
                    let (Some(nested), Some(value)) = (&info.selection, object.data.get(data_key)) else {
                        continue;
                    };
                    let link = ParentLink {
                        parent: ptr,
                        step: PathStep::Field(data_key.clone()),
                    };
                    self.adopt_composite(value, nested, link);
                }
                if !object.missing_fields.is_empty() {
                    self.incomplete_chunks.push(object.clone());
                }
                if let Some(key) = &object.key {
                    self.nodes.entry(key.clone()).or_default().push(object.clone());
                }
            }
            Chunk::List(list) => {
                for (index, item) in list.data.iter().enumerate() {
                    let link = ParentLink {
                        parent: ptr,
                        step: PathStep::Index(index),
                    };
                    match list.coerced.get(&index) {
                        Some(coerced) => {
                            self.incomplete_chunks.push(coerced.clone());
                            self.register(ValuePtr::of_object(&coerced.data), Chunk::Object(coerced.clone()), Some(link));
                        }
                        None => self.adopt_composite(item, &list.possible_selections, link),
                    }
                }
            }
        }
        self.register(ptr, chunk.clone(), parent);
    }

    fn adopt_composite(&mut self, value: &SourceValue, selections: &Arc<PossibleSelections>, link: ParentLink) {
        let ptr = match value {
            SourceValue::Object(o) => ValuePtr::of_object(o),
            SourceValue::List(l) => ValuePtr::of_list(l),
            _ => return,
        };
        if self.recycle(ptr, selections, None, &Some(link.clone())).is_none() {
            self.index_composite(value, selections, link);
        }
    }

    fn register(&mut self, ptr: ValuePtr, chunk: Chunk, parent: Option<ParentLink>) {
        let entry = self.data_map.entry(ptr).or_default();
        entry.parents.extend(parent);
        entry.chunks.push(chunk);
    }

    fn index_object(
        &mut self,
        object: &SourceObject,
        selections: &Arc<PossibleSelections>,
        type_hint: Option<&TypeName>,
        fixed_key: Option<NodeKey>,
        parent: Option<ParentLink>,
    ) -> Arc<ObjectChunk> {
        let ptr = ValuePtr::of_object(object);
        if let Some(Chunk::Object(chunk)) = self.visited(ptr, selections, &parent) {
            return chunk;
        }
        if let Some(Chunk::Object(chunk)) = self.recycle(ptr, selections, fixed_key.as_ref(), &parent) {
            return chunk;
        }

        let type_name = object
            .get(TYPENAME_FIELD)
            .and_then(SourceValue::as_str)
            .map(TypeName::from)
            .or_else(|| type_hint.cloned());
        let selection = selections.resolve(type_name.as_deref()).clone();

        let mut missing_fields = HashSet::new();
        let mut partial_fields = HashSet::new();
        for (data_key, info) in selection.fields.iter() {
            let Some(value) = object.get(data_key) else {
                missing_fields.insert(data_key.clone());
                continue;
            };
            let Some(nested) = &info.selection else {
                continue;
            };
            let link = ParentLink {
                parent: ptr,
                step: PathStep::Field(data_key.clone()),
            };
            let complete = self.index_composite(value, nested, link);
            if !complete {
                partial_fields.insert(data_key.clone());
            }
        }

        let known = self.known_missing.and_then(|k| k.get(&ptr));
        if let Some(known) = known {
            missing_fields.extend(known.iter().filter(|k| selection.fields.contains_key(*k)).cloned());
        }

        let key = fixed_key.or_else(|| {
            self.env
                .identify(object, type_name.as_deref(), Some(self.operation))
                .map(NodeKey::from)
        });

        let recycled = self
            .previous
            .filter(|_| known.is_none())
            .and_then(|p| p.data_map.get(&ptr))
            .and_then(|e| {
                e.chunks.iter().find_map(|c| match c {
                    Chunk::Object(c)
                        if PossibleSelections::same_shape(&c.possible_selections, selections)
                            && c.key == key
                            && c.missing_fields == missing_fields
                            && c.partial_fields == partial_fields =>
                    {
                        Some(c.clone())
                    }
                    _ => None,
                })
            });

        let chunk = recycled.unwrap_or_else(|| {
            Arc::new(ObjectChunk {
                key,
                type_name,
                possible_selections: selections.clone(),
                selection,
                data: object.clone(),
                missing_fields,
                partial_fields,
            })
        });

        if !chunk.missing_fields.is_empty() {
            self.incomplete_chunks.push(chunk.clone());
        }
        if let Some(key) = &chunk.key {
            self.nodes.entry(key.clone()).or_default().push(chunk.clone());
        }
        self.register(ptr, Chunk::Object(chunk.clone()), parent);
        chunk
    }

    fn index_list(
        &mut self,
        list: &SourceList,
        selections: &Arc<PossibleSelections>,
        parent: Option<ParentLink>,
    ) -> Arc<ListChunk> {
        let ptr = ValuePtr::of_list(list);
        if let Some(Chunk::List(chunk)) = self.visited(ptr, selections, &parent) {
            return chunk;
        }
        if let Some(Chunk::List(chunk)) = self.recycle(ptr, selections, None, &parent) {
            return chunk;
        }

        let mut missing_items = HashSet::new();
        let mut partial_items = HashSet::new();
        let mut coerced = HashMap::new();
        for (index, item) in list.iter().enumerate() {
            let link = ParentLink {
                parent: ptr,
                step: PathStep::Index(index),
            };
            match item {
                SourceValue::Null => {}
                SourceValue::Object(_) | SourceValue::List(_) => {
                    if !self.index_composite(item, selections, link) {
                        partial_items.insert(index);
                    }
                }
                _ => {
                    let chunk = self.coerce(selections, link);
                    missing_items.insert(index);
                    coerced.insert(index, chunk);
                }
            }
        }

        let recycled = self
            .previous
            .filter(|_| coerced.is_empty())
            .and_then(|p| p.data_map.get(&ptr))
            .and_then(|e| {
                e.chunks.iter().find_map(|c| match c {
                    Chunk::List(c)
                        if PossibleSelections::same_shape(&c.possible_selections, selections)
                            && c.coerced.is_empty()
                            && c.missing_items == missing_items
                            && c.partial_items == partial_items =>
                    {
                        Some(c.clone())
                    }
                    _ => None,
                })
            });

        let chunk = recycled.unwrap_or_else(|| {
            Arc::new(ListChunk {
                possible_selections: selections.clone(),
                data: list.clone(),
                missing_items,
                partial_items,
                coerced,
            })
        });
        self.register(ptr, Chunk::List(chunk.clone()), parent);
        chunk
    }

    /// Index a composite value, returns `true` if it is complete.
    fn index_composite(&mut self, value: &SourceValue, selections: &Arc<PossibleSelections>, link: ParentLink) -> bool {
        match value {
            SourceValue::Object(o) => {
                let type_hint = selections.default_selection().type_name.clone();
                self.index_object(o, selections, type_hint.as_ref(), None, Some(link))
                    .is_complete()
            }
            SourceValue::List(l) => self.index_list(l, selections, Some(link)).is_complete(),
            // Scalars at composite positions are leaf errors, surfaced on read.
            _ => true,
        }
    }

    /// Stand-in for a list item that is not an object: an empty chunk missing every field.
    fn coerce(&mut self, selections: &Arc<PossibleSelections>, link: ParentLink) -> Arc<ObjectChunk> {
        let selection = selections.default_selection().clone();
        let data: SourceObject = Arc::new(ObjectData::new());
        let chunk = Arc::new(ObjectChunk {
            key: None,
            type_name: selection.type_name.clone(),
            possible_selections: selections.clone(),
            missing_fields: selection.fields.keys().cloned().collect(),
            partial_fields: HashSet::new(),
            selection,
            data: data.clone(),
        });
        self.incomplete_chunks.push(chunk.clone());
        self.register(ValuePtr::of_object(&data), Chunk::Object(chunk.clone()), Some(link));
        chunk
    }
}
