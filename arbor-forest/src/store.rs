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

//! The layered store.
//!
//! Layers are kept bottom-up in one vector: index `0` is the base layer, every index above is an optimistic layer.
//! A read sees a contiguous range of layers from the base up to its top layer, a write goes to its target layer and
//! every optimistic layer above it.

use std::{collections::BTreeMap, sync::Arc};

use arbor_common::{
    error::{Error, Result},
    event::{Event, Notification},
    strict_assert,
};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use serde_json::{Map, Value};

use crate::{
    chunk::{FieldValue, NodeAggregate, TreeChunk},
    descriptor::{Document, NodeKey, NormalizedField, OperationDescriptor, OperationId},
    difference::{ModelValue, ObjectDifference},
    differ::diff_nodes,
    env::Env,
    eviction::{pick_victims, should_auto_evict, AccessClock},
    hydrate::{hydrate_operation, NodeChunkLookup},
    indexer::{index_tree, Tree},
    layer::{trees_with_node, Command, Layer, LayerId, ReadMemo, ReadResult},
    modifier::{ModifierAction, ModifierContext, Modifiers},
    patcher::update_tree,
    policy::{FieldContext, MergePass},
    value::SourceObject,
};

/// Node chunks of a range of layers, ordered top-down.
pub struct LayeredLookup<'a> {
    layers: Vec<&'a Layer>,
    prefer: Option<OperationId>,
    incoming: Option<&'a Arc<Tree>>,
}

impl<'a> LayeredLookup<'a> {
    /// Create a lookup over layers ordered top-down.
    pub fn new(layers: Vec<&'a Layer>) -> Self {
        Self {
            layers,
            prefer: None,
            incoming: None,
        }
    }

    /// Put the chunks of the given operation's tree first.
    pub fn prefer(mut self, operation: OperationId) -> Self {
        self.prefer = Some(operation);
        self
    }

    /// Put the chunks of an incoming tree before every layer.
    pub fn with_incoming(mut self, incoming: &'a Arc<Tree>) -> Self {
        self.incoming = Some(incoming);
        self
    }
}

impl NodeChunkLookup for LayeredLookup<'_> {
    fn node_chunks(&self, key: &str) -> Vec<TreeChunk> {
        let mut chunks = vec![];
        if let Some(incoming) = self.incoming {
            chunks.extend(incoming.node_chunks(key).iter().map(|chunk| TreeChunk {
                tree: incoming.clone(),
                chunk: chunk.clone(),
            }));
        }
        for tree in trees_with_node(&self.layers, key, self.prefer) {
            if self.incoming.is_some_and(|i| i.operation.id == tree.operation.id) {
                continue;
            }
            chunks.extend(tree.node_chunks(key).iter().map(|chunk| TreeChunk {
                tree: tree.clone(),
                chunk: chunk.clone(),
            }));
        }
        chunks
    }

    fn is_deleted(&self, key: &str) -> bool {
        if self.incoming.is_some_and(|i| i.nodes.contains_key(key)) {
            return false;
        }
        for layer in self.layers.iter() {
            if layer.deleted_nodes.contains(key) {
                return true;
            }
            let live = layer
                .operations_with_node(key)
                .any(|op| layer.tree(op).is_some_and(|t| t.nodes.contains_key(key)));
            if live {
                return false;
            }
        }
        false
    }
}

/// Changes made by store mutations, accumulated by transactions.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Operations whose trees changed, with changed store field names by node.
    pub affected_operations: HashMap<OperationId, HashMap<NodeKey, HashSet<String>>>,
    /// Nodes whose data changed, were evicted or re-written.
    pub affected_nodes: HashSet<NodeKey>,
    /// Nodes invalidated by modifiers; every watch reading them is notified.
    pub forced_nodes: HashSet<NodeKey>,
    /// Optimistic layers were removed or replayed.
    pub layers_changed: bool,
    /// Operations evicted from the base layer.
    pub evicted: Vec<Arc<OperationDescriptor>>,
    /// First diff error, re-raised after the changes are dispatched.
    pub error: Option<Error>,
}

impl ChangeSet {
    /// Merge another change set into this one. The first error wins.
    pub fn merge(&mut self, other: ChangeSet) {
        for (operation, nodes) in other.affected_operations {
            let entry = self.affected_operations.entry(operation).or_default();
            for (node, fields) in nodes {
                entry.entry(node).or_default().extend(fields);
            }
        }
        self.affected_nodes.extend(other.affected_nodes);
        self.forced_nodes.extend(other.forced_nodes);
        self.layers_changed |= other.layers_changed;
        self.evicted.extend(other.evicted);
        if self.error.is_none() {
            self.error = other.error;
        }
    }

    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.affected_operations.is_empty()
            && self.affected_nodes.is_empty()
            && self.forced_nodes.is_empty()
            && !self.layers_changed
            && self.evicted.is_empty()
    }

    fn record_fields(&mut self, operation: OperationId, nodes: &HashSet<NodeKey>, differences: &HashMap<NodeKey, ObjectDifference>) {
        let entry = self.affected_operations.entry(operation).or_default();
        for node in nodes {
            let fields = entry.entry(node.clone()).or_default();
            if let Some(difference) = differences.get(node) {
                fields.extend(difference.changed_fields().map(|f| f.key().to_string()));
            }
        }
    }
}

/// Store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Optimistic layers.
    pub optimistic_layers: usize,
    /// Trees of every layer.
    pub trees: usize,
    /// Trees of the base layer.
    pub base_trees: usize,
    /// Registered operations.
    pub operations: usize,
    /// Watched operations.
    pub watched_operations: usize,
}

type OperationKey = (usize, String, Option<String>);

fn registry_key(operation: &OperationDescriptor) -> OperationKey {
    (
        Arc::as_ptr(&operation.document) as usize,
        operation.variables_key.clone(),
        operation.is_fragment().then(|| operation.root_node_key.to_string()),
    )
}

/// A base layer plus a stack of optimistic layers, and the operation registry.
///
/// Registered operations are released once they are neither watched nor hold a tree in any layer after an eviction
/// or an unwatch. Operations that are only read stay registered.
#[derive(Debug)]
pub struct Store {
    env: Env,
    layers: Vec<Layer>,
    next_layer_id: u64,

    operations: HashMap<OperationId, Arc<OperationDescriptor>>,
    registry: HashMap<OperationKey, OperationId>,
    next_operation_id: u32,
    watched: HashMap<OperationId, usize>,
    clock: AccessClock,
}

impl Store {
    /// Create an empty store.
    pub fn new(env: Env) -> Self {
        Self {
            env,
            layers: vec![Layer::base()],
            next_layer_id: 1,
            operations: HashMap::new(),
            registry: HashMap::new(),
            next_operation_id: 0,
            watched: HashMap::new(),
            clock: AccessClock::default(),
        }
    }

    /// The environment.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Resolve and register an operation, returning the registered descriptor if one exists.
    ///
    /// Operations are identified by document identity, identifying variables and root node key.
    pub fn operation(
        &mut self,
        document: &Arc<Document>,
        variables: Option<&Map<String, Value>>,
        root_node_key: Option<&str>,
    ) -> Result<Arc<OperationDescriptor>> {
        let id = OperationId::new(self.next_operation_id);
        let descriptor =
            OperationDescriptor::resolve(id, document.clone(), variables, root_node_key, self.env.policies())?;
        let key = registry_key(&descriptor);
        if let Some(registered) = self.registry.get(&key).and_then(|id| self.operations.get(id)) {
            return Ok(registered.clone());
        }
        let descriptor = Arc::new(descriptor);
        self.next_operation_id += 1;
        self.registry.insert(key, id);
        self.operations.insert(id, descriptor.clone());
        Ok(descriptor)
    }

    /// Get a registered operation.
    pub fn operation_by_id(&self, id: OperationId) -> Option<&Arc<OperationDescriptor>> {
        self.operations.get(&id)
    }

    fn release_operation(&mut self, id: OperationId) {
        if self.watched.contains_key(&id) || self.layers.iter().any(|l| l.trees.contains_key(&id)) {
            return;
        }
        if let Some(operation) = self.operations.remove(&id) {
            self.registry.remove(&registry_key(&operation));
            for layer in self.layers.iter_mut() {
                layer.read_results.remove(&id);
            }
            tracing::trace!("[store]: release operation {}", operation.debug_name());
        }
    }

    /// Get a layer.
    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Ids of the optimistic layers, bottom-up.
    pub fn optimistic_layers(&self) -> Vec<LayerId> {
        self.layers[1..].iter().map(|l| l.id).collect()
    }

    fn index_of(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    fn read_index(&self, active: Option<LayerId>, optimistic: bool) -> usize {
        if optimistic {
            return self.layers.len() - 1;
        }
        active.and_then(|id| self.index_of(id)).unwrap_or_default()
    }

    fn write_index(&self, active: Option<LayerId>) -> usize {
        active.and_then(|id| self.index_of(id)).unwrap_or_default()
    }

    fn write_indices(&self, target: usize) -> Vec<usize> {
        if target == 0 {
            vec![0]
        } else {
            (target..self.layers.len()).collect()
        }
    }

    fn context(&self, top: usize) -> Vec<&Layer> {
        strict_assert!(top < self.layers.len());
        self.layers[..=top].iter().rev().collect()
    }

    /// Layers a read sees, ordered top-down.
    ///
    /// Optimistic reads see the full stack, reads inside an optimistic transaction see the layers up to the
    /// transaction layer, plain reads see the base layer.
    pub fn effective_read_layers(&self, active: Option<LayerId>, optimistic: bool) -> Vec<&Layer> {
        self.context(self.read_index(active, optimistic))
    }

    /// Layers a write goes to, bottom-up: the target layer and every optimistic layer above it.
    pub fn effective_write_layers(&self, active: Option<LayerId>) -> Vec<LayerId> {
        self.write_indices(self.write_index(active))
            .into_iter()
            .map(|i| self.layers[i].id)
            .collect()
    }

    /// Push an optimistic layer on top of the stack.
    pub fn push_optimistic_layer(&mut self, tag: impl Into<String>) -> LayerId {
        let id = LayerId::new(self.next_layer_id);
        self.next_layer_id += 1;
        let layer = Layer::optimistic(id, tag);
        tracing::debug!("[store]: push optimistic {id} tagged {:?}", layer.tag);
        self.layers.push(layer);
        id
    }

    /// Remove every optimistic layer with the tag and replay the surviving layers above the first one.
    pub fn remove_optimistic_layer(&mut self, tag: &str) -> ChangeSet {
        self.remove_layers(&|l: &Layer| l.tag.as_deref() == Some(tag))
    }

    /// Remove one optimistic layer and replay the layers above it.
    pub fn remove_layer(&mut self, id: LayerId) -> ChangeSet {
        self.remove_layers(&|l: &Layer| l.id == id)
    }

    fn remove_layers(&mut self, predicate: &dyn Fn(&Layer) -> bool) -> ChangeSet {
        let Some(first) = self.layers.iter().skip(1).position(predicate).map(|p| p + 1) else {
            return ChangeSet::default();
        };

        let mut changes = ChangeSet {
            layers_changed: true,
            ..Default::default()
        };
        let mut survivors = vec![];
        for layer in self.layers.split_off(first) {
            if predicate(&layer) {
                tracing::debug!("[store]: remove optimistic {} tagged {:?}", layer.id, layer.tag);
                changes.affected_nodes.extend(layer.node_keys());
                for operation in layer.trees.keys() {
                    changes.affected_operations.entry(*operation).or_default();
                }
            } else {
                survivors.push(layer);
            }
        }

        let start = self.layers.len();
        self.layers.extend(survivors);
        if start < self.layers.len() {
            let replayed = self.replay_layers(start);
            changes.merge(replayed);
        }
        changes
    }

    fn replay_layers(&mut self, from: usize) -> ChangeSet {
        let mut changes = ChangeSet {
            layers_changed: true,
            ..Default::default()
        };
        let mut records = vec![];
        for layer in self.layers[from..].iter_mut() {
            changes.affected_nodes.extend(layer.node_keys());
            for operation in layer.trees.keys() {
                changes.affected_operations.entry(*operation).or_default();
            }
            records.push((layer.id, layer.replay.clone().unwrap_or_default()));
            layer.clear_for_replay();
        }
        for (id, record) in records {
            tracing::debug!("[store]: replay {id} with {} commands", record.commands.len());
            for command in record.commands {
                let replayed = self.execute(Some(id), command);
                changes.merge(replayed);
            }
        }
        changes
    }

    fn execute(&mut self, active: Option<LayerId>, command: Command) -> ChangeSet {
        match command {
            Command::Write { operation, data } => {
                let data = self.apply_merge_policies(active, &operation, data);
                self.write_data(active, &operation, data)
            }
            Command::Modify { node, modifiers } => self.modify_data(active, &node, &modifiers).1,
            Command::Evict { node, field, args } => self.evict_data(active, &node, field.as_deref(), args.as_ref()).1,
        }
    }

    fn record(&mut self, active: Option<LayerId>, command: Command) {
        let index = self.write_index(active);
        if let Some(replay) = self.layers[index].replay.as_mut() {
            replay.commands.push(command);
        }
    }

    fn invalidate_from(&mut self, from: usize, nodes: &HashSet<NodeKey>, operations: &[OperationId]) {
        for layer in self.layers[from..].iter_mut() {
            layer.invalidate_nodes(nodes);
            layer.invalidate_operations(operations);
        }
    }

    /// Write the result of an operation.
    ///
    /// Merge policies run against the layers below the target on every execution, replays included. Base writes
    /// rebase the optimistic layers holding affected data and may trigger auto eviction.
    pub fn write(&mut self, active: Option<LayerId>, operation: &Arc<OperationDescriptor>, data: SourceObject) -> ChangeSet {
        self.record(
            active,
            Command::Write {
                operation: operation.clone(),
                data: data.clone(),
            },
        );
        self.clock.touch(operation.id);

        let data = self.apply_merge_policies(active, operation, data);
        let mut changes = self.write_data(active, operation, data);
        if self.write_index(active) == 0 {
            let rebased = self.rebase(&changes);
            changes.merge(rebased);
            if should_auto_evict(&self.env, &self.layers[0]) {
                let evicted = self.evict_old_data();
                changes.merge(evicted);
            }
        }
        changes
    }

    fn apply_merge_policies(
        &self,
        active: Option<LayerId>,
        operation: &Arc<OperationDescriptor>,
        data: SourceObject,
    ) -> SourceObject {
        if !self.env.policies().has_merge_policies() {
            return data;
        }
        let lookup = LayeredLookup::new(self.context(self.write_index(active)));
        let existing = |node: &str, field: &NormalizedField| {
            if lookup.is_deleted(node) {
                return None;
            }
            NodeAggregate::new(lookup.node_chunks(node))
                .field(field)
                .map(|(_, v)| v.raw())
        };
        let env = &self.env;
        let on_error = |e: Error, ctx: &FieldContext<'_>| {
            let e = Error::policy(ctx.type_name, ctx.field_name, e);
            tracing::warn!("[policy]: merge function failed, keep the incoming value: {e}");
            let mut notification = Notification::new(Event::MergePolicyError, e.to_string())
                .with_operation(operation.debug_name())
                .with_field(ctx.field.key());
            if let Some(node) = ctx.node {
                notification = notification.with_node(node);
            }
            env.notify(notification);
        };
        MergePass {
            policies: env.policies(),
            operation,
            existing: &existing,
            on_error: &on_error,
        }
        .apply(&data)
    }

    fn write_data(&mut self, active: Option<LayerId>, operation: &Arc<OperationDescriptor>, data: SourceObject) -> ChangeSet {
        let incoming = Arc::new(index_tree(&self.env, operation, data, None, None));
        let target = self.write_index(active);
        let mut changes = ChangeSet::default();

        for w in self.write_indices(target) {
            let diff = diff_nodes(&self.context(w), &incoming);
            for error in diff.errors.iter() {
                tracing::trace!("[store]: {error}");
            }
            if let Some(error) = diff.first_error {
                changes.error.get_or_insert(error);
            }

            let mut changed_nodes = self.patch_layer(w, &diff.node_differences, Some(&incoming), &mut changes);

            let existing = self.context(w).iter().find_map(|l| l.tree(operation.id)).cloned();
            let install = w == target || self.layers[w].trees.contains_key(&operation.id);
            let layer = &mut self.layers[w];
            let mut installed = vec![];
            if install && existing.as_ref().is_none_or(|t| t.result != incoming.result) {
                layer.insert_tree(incoming.clone());
                installed.push(operation.id);
                let nodes: HashSet<NodeKey> = incoming.nodes.keys().cloned().collect();
                changes.record_fields(operation.id, &nodes, &diff.node_differences);
                match existing {
                    None => changed_nodes.extend(nodes),
                    Some(existing) => {
                        changed_nodes.extend(diff.node_differences.keys().cloned());
                        changed_nodes.extend(existing.nodes.keys().filter(|k| !nodes.contains(*k)).cloned());
                    }
                }
            }
            for key in incoming.nodes.keys() {
                if layer.deleted_nodes.remove(key) {
                    changed_nodes.insert(key.clone());
                }
            }
            changed_nodes.extend(diff.new_nodes.iter().cloned());

            tracing::trace!(
                "[store]: write {} to {}, changed nodes: {changed_nodes:?}",
                operation.debug_name(),
                self.layers[w].id
            );
            self.invalidate_from(w, &changed_nodes, &installed);
            changes.affected_nodes.extend(changed_nodes);
        }
        changes
    }

    /// Patch every tree holding a changed node into layer `w`, returning the changed nodes.
    fn patch_layer(
        &mut self,
        w: usize,
        differences: &HashMap<NodeKey, ObjectDifference>,
        incoming: Option<&Arc<Tree>>,
        changes: &mut ChangeSet,
    ) -> HashSet<NodeKey> {
        if differences.is_empty() {
            return HashSet::new();
        }

        let results = {
            let context = self.context(w);
            let skip = incoming.map(|t| t.operation.id);
            let mut trees = BTreeMap::new();
            for key in differences.keys() {
                for tree in trees_with_node(&context, key, None) {
                    if Some(tree.operation.id) != skip {
                        trees.entry(tree.operation.id).or_insert_with(|| tree.clone());
                    }
                }
            }
            trees
                .into_values()
                .map(|tree| {
                    let mut lookup = LayeredLookup::new(context.clone()).prefer(tree.operation.id);
                    if let Some(incoming) = incoming {
                        lookup = lookup.with_incoming(incoming);
                    }
                    update_tree(&self.env, &tree, differences, &lookup)
                })
                .filter(|r| r.changed)
                .collect_vec()
        };

        let mut changed_nodes = HashSet::new();
        for result in results {
            let operation = result.tree.operation.id;
            for missing in result.missing.iter() {
                tracing::trace!("[store]: patched {operation} misses {}: {}", missing.path_string(), missing.message);
            }
            changes.record_fields(operation, &result.changed_nodes, differences);
            changed_nodes.extend(result.changed_nodes);
            self.layers[w].insert_tree(result.tree);
        }
        changed_nodes
    }

    /// Rebase the optimistic layers holding data changed by a base write.
    fn rebase(&mut self, changes: &ChangeSet) -> ChangeSet {
        let from = (1..self.layers.len()).find(|&i| {
            let layer = &self.layers[i];
            changes
                .affected_nodes
                .iter()
                .any(|n| layer.operations_by_nodes.contains_key(n) || layer.deleted_nodes.contains(n))
                || changes.affected_operations.keys().any(|op| layer.trees.contains_key(op))
        });
        match from {
            Some(from) => self.replay_layers(from),
            None => ChangeSet::default(),
        }
    }

    /// Apply modifiers to the fields of a node. Returns `true` if any field changed or was invalidated.
    pub fn modify(&mut self, active: Option<LayerId>, node: &str, modifiers: &Modifiers) -> (bool, ChangeSet) {
        self.record(
            active,
            Command::Modify {
                node: NodeKey::from(node),
                modifiers: modifiers.clone(),
            },
        );
        self.modify_data(active, node, modifiers)
    }

    fn modify_data(&mut self, active: Option<LayerId>, node: &str, modifiers: &Modifiers) -> (bool, ChangeSet) {
        let target = self.write_index(active);
        let (differences, invalidated) = self.modifier_differences(target, node, modifiers);

        let mut changes = self.apply_differences(target, &differences);
        if invalidated {
            let nodes = HashSet::from_iter([NodeKey::from(node)]);
            self.invalidate_from(target, &nodes, &[]);
            changes.forced_nodes.extend(nodes);
        }
        let modified = invalidated || !changes.affected_nodes.is_empty();
        (modified, changes)
    }

    fn apply_differences(&mut self, target: usize, differences: &HashMap<NodeKey, ObjectDifference>) -> ChangeSet {
        let mut changes = ChangeSet::default();
        if differences.is_empty() {
            return changes;
        }
        for w in self.write_indices(target) {
            let changed_nodes = self.patch_layer(w, differences, None, &mut changes);
            self.invalidate_from(w, &changed_nodes, &[]);
            changes.affected_nodes.extend(changed_nodes);
        }
        changes
    }

    fn node_aggregate(&self, target: usize, node: &str) -> Option<NodeAggregate> {
        let lookup = LayeredLookup::new(self.context(target));
        if lookup.is_deleted(node) {
            return None;
        }
        let aggregate = NodeAggregate::new(lookup.node_chunks(node));
        (!aggregate.is_empty()).then_some(aggregate)
    }

    fn modifier_differences(
        &self,
        target: usize,
        node: &str,
        modifiers: &Modifiers,
    ) -> (HashMap<NodeKey, ObjectDifference>, bool) {
        let mut differences = HashMap::new();
        let Some(aggregate) = self.node_aggregate(target, node) else {
            return (differences, false);
        };

        let mut difference = ObjectDifference::default();
        let mut invalidated = false;
        for field in aggregate.selected_fields() {
            let Some((source, value)) = aggregate.field(&field) else {
                continue;
            };
            let Some(modifier) = modifiers.get(field.name(), field.key()) else {
                continue;
            };
            let args = source.chunk.field_info(&field).and_then(|info| info.args.clone());
            let ctx = ModifierContext {
                node,
                field_name: field.name(),
                store_field_name: field.key(),
                args: args.as_deref(),
            };
            let existing = value.raw();
            match modifier.apply(&existing, &ctx) {
                ModifierAction::Keep => {}
                ModifierAction::Set(v) => {
                    if v != existing {
                        difference.replace(field, Some(existing), ModelValue::Raw(v));
                    }
                }
                ModifierAction::Delete => difference.replace(field, Some(existing), ModelValue::Delete),
                ModifierAction::Invalidate => invalidated = true,
            }
        }

        if difference.is_dirty() {
            differences.insert(NodeKey::from(node), difference);
        }
        (differences, invalidated)
    }

    /// Evict a node, or the variants of one of its fields. Returns `true` if anything was evicted.
    pub fn evict(
        &mut self,
        active: Option<LayerId>,
        node: &str,
        field: Option<&str>,
        args: Option<&Map<String, Value>>,
    ) -> (bool, ChangeSet) {
        self.record(
            active,
            Command::Evict {
                node: NodeKey::from(node),
                field: field.map(str::to_string),
                args: args.cloned(),
            },
        );
        let (evicted, mut changes) = self.evict_data(active, node, field, args);
        if evicted && self.write_index(active) == 0 {
            let rebased = self.rebase(&changes);
            changes.merge(rebased);
        }
        (evicted, changes)
    }

    fn evict_data(
        &mut self,
        active: Option<LayerId>,
        node: &str,
        field: Option<&str>,
        args: Option<&Map<String, Value>>,
    ) -> (bool, ChangeSet) {
        let target = self.write_index(active);
        let Some(aggregate) = self.node_aggregate(target, node) else {
            return (false, ChangeSet::default());
        };

        match field {
            None => {
                let key = NodeKey::from(node);
                let mut changes = ChangeSet::default();
                for chunk in aggregate.chunks() {
                    changes.affected_operations.entry(chunk.tree.operation.id).or_default();
                }
                for w in self.write_indices(target) {
                    self.layers[w].deleted_nodes.insert(key.clone());
                }
                let nodes = HashSet::from_iter([key]);
                self.invalidate_from(target, &nodes, &[]);
                changes.affected_nodes.extend(nodes);
                tracing::debug!("[store]: evicted node {node}");
                (true, changes)
            }
            Some(field) => {
                let mut difference = ObjectDifference::default();
                for normalized in aggregate.selected_fields() {
                    if normalized.name() != field || aggregate.field(&normalized).is_none() {
                        continue;
                    }
                    let matched = match args {
                        None => true,
                        Some(args) => {
                            let own_args = aggregate
                                .chunks()
                                .iter()
                                .find_map(|c| c.chunk.field_info(&normalized).and_then(|i| i.args.clone()));
                            own_args.as_deref() == Some(args)
                                || normalized.key() == NormalizedField::with_args(field, args).key()
                        }
                    };
                    if matched {
                        difference.replace(normalized, None, ModelValue::Delete);
                    }
                }
                if !difference.is_dirty() {
                    return (false, ChangeSet::default());
                }
                let differences = HashMap::from_iter([(NodeKey::from(node), difference)]);
                let changes = self.apply_differences(target, &differences);
                tracing::debug!("[store]: evicted field {field} of node {node}");
                (true, changes)
            }
        }
    }

    /// Read an operation, reusing the memoized result while it is valid.
    ///
    /// A recomputed result equal to the stale memo keeps the memo's identity.
    pub fn read(&mut self, active: Option<LayerId>, optimistic: bool, operation: &Arc<OperationDescriptor>) -> Arc<ReadResult> {
        self.clock.touch(operation.id);
        let top = self.read_index(active, optimistic);
        if let Some(memo) = self.layers[top].read_results.get(&operation.id).filter(|m| !m.stale) {
            return memo.result.clone();
        }

        let hydrated = {
            let lookup = LayeredLookup::new(self.context(top)).prefer(operation.id);
            hydrate_operation(&self.env, operation, &lookup)
        };
        let result = ReadResult {
            operation: operation.id,
            value: hydrated.value,
            missing: hydrated.missing,
            touched: hydrated.touched,
        };

        let layer = &mut self.layers[top];
        let result = match layer.read_results.get(&operation.id) {
            Some(memo) if memo.result.same_content(&result) && memo.result.touched == result.touched => {
                memo.result.clone()
            }
            _ => Arc::new(result),
        };
        layer.read_results.insert(
            operation.id,
            ReadMemo {
                result: result.clone(),
                stale: false,
            },
        );
        result
    }

    /// Pin an operation against eviction.
    pub fn watch_operation(&mut self, operation: OperationId) {
        *self.watched.entry(operation).or_default() += 1;
    }

    /// Release a pin taken by [`Store::watch_operation`].
    pub fn unwatch_operation(&mut self, operation: OperationId) {
        if let Some(count) = self.watched.get_mut(&operation) {
            strict_assert!(*count > 0);
            *count -= 1;
            if *count == 0 {
                self.watched.remove(&operation);
                self.release_operation(operation);
            }
        }
    }

    fn is_pinned(&self, operation: OperationId) -> bool {
        if self.watched.contains_key(&operation) {
            return true;
        }
        let non_evictable = &self.env.config().non_evictable_queries;
        !non_evictable.is_empty()
            && self
                .operation_by_id(operation)
                .is_some_and(|op| op.root_field_names().any(|f| non_evictable.contains(f)))
    }

    /// Evict the least recently accessed trees of the base layer exceeding their partition cap.
    pub fn evict_old_data(&mut self) -> ChangeSet {
        let victims = pick_victims(&self.env, &self.layers[0], &self.clock, |id| self.is_pinned(id));

        let mut changes = ChangeSet::default();
        for id in victims.iter().copied() {
            let Some(tree) = self.layers[0].remove_tree(id) else {
                continue;
            };
            self.clock.remove(id);
            let nodes: HashSet<NodeKey> = tree.nodes.keys().cloned().collect();
            self.invalidate_from(0, &nodes, &[]);
            changes.affected_nodes.extend(nodes);
            self.env.notify(
                Notification::new(Event::Evict, "evicted least recently used operation")
                    .with_operation(tree.operation.debug_name()),
            );
            self.release_operation(id);
            changes.evicted.push(tree.operation.clone());
        }
        if !victims.is_empty() {
            tracing::debug!("[eviction]: evicted {} operations", victims.len());
        }
        changes
    }

    /// Serialize the normalized content of the base layer, or of the full stack.
    ///
    /// Nodes map store field names to values, keyed objects are written as `{ "__ref": key }`.
    pub fn extract(&self, optimistic: bool) -> Value {
        let context = self.effective_read_layers(None, optimistic);
        let lookup = LayeredLookup::new(context.clone());
        let keys = context
            .iter()
            .flat_map(|l| l.operations_by_nodes.keys())
            .unique()
            .sorted()
            .collect_vec();

        let mut nodes = Map::new();
        for key in keys {
            if lookup.is_deleted(key) {
                continue;
            }
            let aggregate = NodeAggregate::new(lookup.node_chunks(key));
            if aggregate.is_empty() {
                continue;
            }
            nodes.insert(key.to_string(), extract_object(&aggregate));
        }
        Value::Object(nodes)
    }

    /// Drop every layer, tree and memo. Registered and watched operations are kept.
    pub fn reset(&mut self) {
        self.layers = vec![Layer::base()];
        self.clock.clear();
        tracing::debug!("[store]: reset");
    }

    /// Statistics.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            optimistic_layers: self.layers.len() - 1,
            trees: self.layers.iter().map(|l| l.trees.len()).sum(),
            base_trees: self.layers[0].trees.len(),
            operations: self.operations.len(),
            watched_operations: self.watched.len(),
        }
    }
}

fn extract_object(aggregate: &NodeAggregate) -> Value {
    let mut fields = Map::new();
    for field in aggregate.selected_fields() {
        if let Some((source, value)) = aggregate.field(&field) {
            fields.insert(field.key().to_string(), extract_value(&source.tree, &value));
        }
    }
    Value::Object(fields)
}

fn extract_value(tree: &Arc<Tree>, value: &FieldValue) -> Value {
    match value {
        FieldValue::Object(chunk) => match &chunk.key {
            Some(key) => serde_json::json!({ "__ref": key.to_string() }),
            None => extract_object(&NodeAggregate::new(vec![TreeChunk {
                tree: tree.clone(),
                chunk: chunk.clone(),
            }])),
        },
        FieldValue::List(list) => Value::Array(
            (0..list.data.len())
                .map(|i| match tree.item_value(list, i) {
                    Some(item) => extract_value(tree, &item),
                    None => Value::Null,
                })
                .collect(),
        ),
        v => v.raw().to_json(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use arbor_common::{error::ErrorKind, event::EventListener};
    use serde_json::json;

    use super::*;
    use crate::{
        descriptor::{Field, SelectionSet},
        env::CacheConfig,
        hydrate::MissingKind,
        modifier::FieldModifier,
        policy::{FieldPolicy, PolicyTable, PolicyTableBuilder, TypePolicy},
        test_utils::object,
        value::SourceValue,
    };

    fn user_document() -> Arc<Document> {
        Arc::new(Document::query(
            "User",
            SelectionSet::new().field(
                Field::new("user")
                    .var_arg("id", "id")
                    .of_type("User")
                    .selection(SelectionSet::new().leaves(["__typename", "id", "name"])),
            ),
        ))
    }

    fn profile_document() -> Arc<Document> {
        Arc::new(Document::query(
            "Profile",
            SelectionSet::new().field(
                Field::new("user").var_arg("id", "id").of_type("User").selection(
                    SelectionSet::new()
                        .leaves(["__typename", "id"])
                        .field(Field::new("address").selection(SelectionSet::new().leaves(["city"]))),
                ),
            ),
        ))
    }

    fn user(id: &str, name: &str) -> SourceObject {
        object(json!({ "user": { "__typename": "User", "id": id, "name": name } }))
    }

    fn register(store: &mut Store, document: &Arc<Document>, id: &str) -> Arc<OperationDescriptor> {
        store
            .operation(document, json!({ "id": id }).as_object(), None)
            .unwrap()
    }

    fn name_of(result: &ReadResult) -> Option<String> {
        let value = result.value.as_ref()?.to_json();
        value["user"]["name"].as_str().map(str::to_string)
    }

    #[test_log::test]
    fn test_operation_registry() {
        let mut store = Store::new(Env::default());
        let document = user_document();
        let a = register(&mut store, &document, "1");
        let b = register(&mut store, &document, "1");
        let c = register(&mut store, &document, "2");
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(a.id, c.id);
        assert_eq!(store.statistics().operations, 2);
    }

    #[test_log::test]
    fn test_write_read_and_memo() {
        let mut store = Store::new(Env::default());
        let document = user_document();
        let op = register(&mut store, &document, "1");

        let changes = store.write(None, &op, user("1", "Ada"));
        assert!(changes.affected_operations.contains_key(&op.id));
        assert!(changes.error.is_none());

        let first = store.read(None, false, &op);
        assert!(first.is_complete());
        assert_eq!(
            first.value.as_ref().unwrap().to_json(),
            json!({ "user": { "__typename": "User", "id": "1", "name": "Ada" } })
        );
        assert!(Arc::ptr_eq(&first, &store.read(None, false, &op)));

        // Writing identical data changes nothing.
        let changes = store.write(None, &op, user("1", "Ada"));
        assert!(changes.affected_operations.is_empty());
        assert!(changes.affected_nodes.is_empty());
        assert!(Arc::ptr_eq(&first, &store.read(None, false, &op)));
    }

    #[test_log::test]
    fn test_write_patches_other_trees() {
        let mut store = Store::new(Env::default());
        let profile = register(&mut store, &profile_document(), "1");
        let name = register(&mut store, &user_document(), "1");

        store.write(
            None,
            &profile,
            object(json!({ "user": { "__typename": "User", "id": "1", "address": { "city": "London" } } })),
        );
        store.write(None, &name, user("1", "Ada"));
        let before = store.read(None, false, &profile);

        let changes = store.write(None, &name, user("1", "Bob"));
        assert!(changes.affected_nodes.contains("User:1"));
        assert_eq!(name_of(&store.read(None, false, &name)).as_deref(), Some("Bob"));

        // The profile does not select the name, its result keeps its identity.
        let after = store.read(None, false, &profile);
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test_log::test]
    fn test_structural_sharing() {
        let document = Arc::new(Document::query(
            "Dashboard",
            SelectionSet::new()
                .field(
                    Field::new("user").var_arg("id", "id").of_type("User").selection(
                        SelectionSet::new()
                            .leaves(["__typename", "id", "name"])
                            .field(Field::new("address").selection(SelectionSet::new().leaves(["city"]))),
                    ),
                )
                .field(Field::new("settings").selection(SelectionSet::new().leaves(["theme"]))),
        ));
        let mut store = Store::new(Env::default());
        let dashboard = register(&mut store, &document, "1");
        store.write(
            None,
            &dashboard,
            object(json!({
                "user": { "__typename": "User", "id": "1", "name": "Ada", "address": { "city": "London" } },
                "settings": { "theme": "dark" },
            })),
        );
        let before = store.layers[0].tree(dashboard.id).unwrap().result.clone();

        let op = register(&mut store, &user_document(), "1");
        store.write(None, &op, user("1", "Bob"));
        let after = store.layers[0].tree(dashboard.id).unwrap().result.clone();

        assert!(!Arc::ptr_eq(&before, &after));
        assert!(before["settings"].same(&after["settings"]));
        let address = |result: &SourceObject| result["user"].as_object().unwrap()["address"].clone();
        assert!(address(&before).same(&address(&after)));
        assert_eq!(after["user"].as_object().unwrap()["name"], SourceValue::from("Bob"));
    }

    #[test_log::test]
    fn test_optimistic_isolation_and_removal() {
        let mut store = Store::new(Env::default());
        let op = register(&mut store, &user_document(), "1");
        store.write(None, &op, user("1", "Ada"));

        let a = store.push_optimistic_layer("a");
        store.write(Some(a), &op, user("1", "Bob"));
        let b = store.push_optimistic_layer("b");
        let other = register(&mut store, &user_document(), "2");
        store.write(Some(b), &other, user("2", "Eve"));

        assert_eq!(name_of(&store.read(None, false, &op)).as_deref(), Some("Ada"));
        assert_eq!(name_of(&store.read(None, true, &op)).as_deref(), Some("Bob"));
        assert_eq!(name_of(&store.read(Some(a), false, &op)).as_deref(), Some("Bob"));
        assert!(!store.read(None, false, &other).is_complete());
        assert_eq!(store.effective_write_layers(Some(a)), vec![a, b]);

        let changes = store.remove_optimistic_layer("a");
        assert!(changes.layers_changed);
        assert_eq!(store.optimistic_layers(), vec![b]);
        assert_eq!(name_of(&store.read(None, true, &op)).as_deref(), Some("Ada"));
        assert_eq!(name_of(&store.read(None, true, &other)).as_deref(), Some("Eve"));

        store.remove_optimistic_layer("b");
        assert!(!store.read(None, true, &other).is_complete());
    }

    #[test_log::test]
    fn test_base_write_rebases_layers() {
        let mut store = Store::new(Env::default());
        let op = register(&mut store, &user_document(), "1");
        store.write(None, &op, user("1", "Ada"));

        let layer = store.push_optimistic_layer("opt");
        store.modify(
            Some(layer),
            "User:1",
            &Modifiers::new().with_field(
                "name",
                FieldModifier::custom(|existing, _| {
                    ModifierAction::Set(SourceValue::string(format!("{}!", existing.as_str().unwrap_or_default())))
                }),
            ),
        );
        assert_eq!(name_of(&store.read(None, true, &op)).as_deref(), Some("Ada!"));

        let changes = store.write(None, &op, user("1", "Bob"));
        assert!(changes.layers_changed);
        assert_eq!(name_of(&store.read(None, false, &op)).as_deref(), Some("Bob"));
        assert_eq!(name_of(&store.read(None, true, &op)).as_deref(), Some("Bob!"));
    }

    #[test_log::test]
    fn test_modify_and_evict() {
        let mut store = Store::new(Env::default());
        let op = register(&mut store, &user_document(), "1");
        store.write(None, &op, user("1", "Ada"));

        let (modified, changes) = store.modify(
            None,
            "User:1",
            &Modifiers::new().with_field("name", FieldModifier::Set(SourceValue::from("Bob"))),
        );
        assert!(modified);
        assert!(changes.affected_operations[&op.id]["User:1"].contains("name"));
        assert_eq!(name_of(&store.read(None, false, &op)).as_deref(), Some("Bob"));

        let (modified, changes) = store.modify(None, "User:1", &Modifiers::new().with_fallback(FieldModifier::Invalidate));
        assert!(modified);
        assert!(changes.forced_nodes.contains("User:1"));
        assert!(!store.modify(None, "User:404", &Modifiers::new().with_fallback(FieldModifier::Delete)).0);

        let (evicted, _) = store.evict(None, "User:1", Some("name"), None);
        assert!(evicted);
        let result = store.read(None, false, &op);
        assert_eq!(result.missing.len(), 1);
        assert_eq!(result.missing[0].kind, MissingKind::Field);

        let (evicted, _) = store.evict(None, "User:1", None, None);
        assert!(evicted);
        let result = store.read(None, false, &op);
        assert_eq!(result.missing[0].kind, MissingKind::DanglingReference);
        assert_eq!(result.missing[0].to_error().kind(), ErrorKind::DanglingReference);
        assert!(!store.evict(None, "User:1", None, None).0);

        // Re-writing the node brings it back.
        store.write(None, &op, user("1", "Ada"));
        assert!(store.read(None, false, &op).is_complete());
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl EventListener for Counter {
        fn on_notify(&self, notification: &Notification) {
            if notification.event == Event::Evict {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test_log::test]
    fn test_evict_old_data() {
        let counter = Arc::new(Counter::default());
        let env = Env::new(
            CacheConfig {
                max_operation_count: 2,
                auto_evict: false,
                ..Default::default()
            },
            PolicyTable::default(),
        )
        .with_event_listener(counter.clone());
        let mut store = Store::new(env);
        let document = user_document();
        let ops = ["1", "2", "3"].map(|id| register(&mut store, &document, id));
        for op in ops.iter() {
            let id = op.variables_with_defaults["id"].as_str().unwrap().to_string();
            store.write(None, op, user(&id, "x"));
        }
        store.watch_operation(ops[0].id);
        store.read(None, false, &ops[1]);

        let changes = store.evict_old_data();
        assert_eq!(changes.evicted.iter().map(|op| op.id).collect_vec(), vec![ops[2].id]);
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
        assert_eq!(store.statistics().base_trees, 2);

        // The evicted operation is released, registering it again assigns a new id.
        assert_eq!(store.statistics().operations, 2);
        assert!(store.operation_by_id(ops[2].id).is_none());
        let again = register(&mut store, &document, "3");
        assert_ne!(again.id, ops[2].id);
        assert!(!store.read(None, false, &again).is_complete());

        // Unwatching an operation that holds a tree keeps it registered.
        store.unwatch_operation(ops[0].id);
        assert!(store.operation_by_id(ops[0].id).is_some());
    }

    fn concat_names() -> PolicyTable {
        PolicyTableBuilder::default()
            .with_type_policy(
                "User",
                TypePolicy::new().with_field(
                    "name",
                    FieldPolicy::new().with_merge(|existing, incoming, _| {
                        Ok(match existing.and_then(|v| v.as_str()) {
                            Some(existing) => SourceValue::string(format!("{existing}+{}", incoming.as_str().unwrap_or_default())),
                            None => incoming.clone(),
                        })
                    }),
                ),
            )
            .build()
    }

    #[test_log::test]
    fn test_merge_policy_and_extract() {
        let mut store = Store::new(Env::new(CacheConfig::default(), concat_names()));
        let op = register(&mut store, &user_document(), "1");
        store.write(None, &op, user("1", "Ada"));
        store.write(None, &op, user("1", "Bob"));
        assert_eq!(name_of(&store.read(None, false, &op)).as_deref(), Some("Ada+Bob"));

        assert_eq!(
            store.extract(false),
            json!({
                "ROOT_QUERY": { r#"user({"id":"1"})"#: { "__ref": "User:1" } },
                "User:1": { "__typename": "User", "id": "1", "name": "Ada+Bob" },
            })
        );
    }

    #[test_log::test]
    fn test_merge_policy_replay() {
        let mut store = Store::new(Env::new(CacheConfig::default(), concat_names()));
        let op = register(&mut store, &user_document(), "1");
        store.write(None, &op, user("1", "W0"));

        let a = store.push_optimistic_layer("a");
        store.write(Some(a), &op, user("1", "A"));
        let b = store.push_optimistic_layer("b");
        store.write(Some(b), &op, user("1", "B"));
        assert_eq!(name_of(&store.read(None, true, &op)).as_deref(), Some("W0+A+B"));

        // The surviving layer merges its own incoming data again, without the removed layer.
        store.remove_optimistic_layer("a");
        assert_eq!(name_of(&store.read(None, true, &op)).as_deref(), Some("W0+B"));

        // Rebasing on a base write merges against the new base.
        store.write(None, &op, user("1", "W1"));
        assert_eq!(name_of(&store.read(None, false, &op)).as_deref(), Some("W0+W1"));
        assert_eq!(name_of(&store.read(None, true, &op)).as_deref(), Some("W0+W1+B"));
    }

    #[derive(Default)]
    struct MergeErrors(AtomicUsize);

    impl EventListener for MergeErrors {
        fn on_notify(&self, notification: &Notification) {
            if notification.event == Event::MergePolicyError {
                assert_eq!(notification.node.as_deref(), Some("User:1"));
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test_log::test]
    fn test_merge_policy_error_keeps_incoming() {
        let policies = PolicyTableBuilder::default()
            .with_type_policy(
                "User",
                TypePolicy::new().with_field(
                    "name",
                    FieldPolicy::new().with_merge(|existing, incoming, _| match existing {
                        Some(_) => Err(Error::new(ErrorKind::External, "merge rejected")),
                        None => Ok(incoming.clone()),
                    }),
                ),
            )
            .build();
        let errors = Arc::new(MergeErrors::default());
        let env = Env::new(CacheConfig::default(), policies).with_event_listener(errors.clone());
        let mut store = Store::new(env);
        let op = register(&mut store, &user_document(), "1");

        store.write(None, &op, user("1", "Ada"));
        assert_eq!(errors.0.load(Ordering::Relaxed), 0);

        let changes = store.write(None, &op, user("1", "Bob"));
        assert!(changes.error.is_none());
        assert_eq!(errors.0.load(Ordering::Relaxed), 1);
        assert_eq!(name_of(&store.read(None, false, &op)).as_deref(), Some("Bob"));
    }

    #[test_log::test]
    fn test_non_evictable_queries() {
        let env = Env::new(
            CacheConfig {
                max_operation_count: 1,
                auto_evict: false,
                non_evictable_queries: ["user".to_string()].into_iter().collect(),
                ..Default::default()
            },
            PolicyTable::default(),
        );
        let mut store = Store::new(env);
        let settings = Arc::new(Document::query(
            "Settings",
            SelectionSet::new().field(Field::new("settings").selection(SelectionSet::new().leaves(["theme"]))),
        ));
        let settings = store.operation(&settings, None, None).unwrap();
        store.write(None, &settings, object(json!({ "settings": { "theme": "dark" } })));
        let users = ["1", "2"].map(|id| register(&mut store, &user_document(), id));
        store.write(None, &users[0], user("1", "Ada"));
        store.write(None, &users[1], user("2", "Bob"));
        assert!(store.is_pinned(users[0].id));
        assert!(!store.is_pinned(settings.id));

        // Pinned trees count into the partition but only the unpinned one is evicted.
        assert_eq!(store.evict_old_data().evicted.iter().map(|op| op.id).collect_vec(), vec![settings.id]);
        assert_eq!(store.statistics().base_trees, 2);
        assert!(store.evict_old_data().evicted.is_empty());
    }
}
