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

use std::{fmt::Debug, sync::Arc};

use arbor_common::error::{Error, ErrorKind, Result};
use arbor_forest::{
    descriptor::{Document, NodeKey, OperationDescriptor, OperationId, ROOT_QUERY, TYPENAME_FIELD},
    env::Env,
    layer::LayerId,
    modifier::Modifiers,
    store::{Statistics, Store},
    value::SourceValue,
};
use itertools::Itertools;
use serde_json::{Map, Value};

use crate::{
    transaction::{ChangeRecord, Frame},
    watch::{DiffOutcome, WatchCallback, WatchHandle, WatchHook, Watches},
};

macro_rules! operation_target {
    ($name:ident) => {
        impl $name {
            /// Set the variables of the operation. Must be a JSON object.
            pub fn with_variables(mut self, variables: Value) -> Self {
                self.variables = Some(variables);
                self
            }

            /// Set the root node of a fragment operation.
            pub fn with_root_id(mut self, root_id: impl Into<String>) -> Self {
                self.root_id = Some(root_id.into());
                self
            }
        }
    };
}

/// Options of [`ForestCache::write`].
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// The operation document.
    pub document: Arc<Document>,
    /// Variables of the operation.
    pub variables: Option<Value>,
    /// Root node of a fragment operation.
    pub root_id: Option<String>,
    /// The result to write. Must be a JSON object.
    pub data: Value,
}

impl WriteOptions {
    /// Write `data` as the result of `document`.
    pub fn new(document: &Arc<Document>, data: Value) -> Self {
        Self {
            document: document.clone(),
            variables: None,
            root_id: None,
            data,
        }
    }
}

operation_target!(WriteOptions);

/// Outcome of [`ForestCache::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Root node of the written data.
    pub root_node_key: NodeKey,
    /// Operations whose cached results changed.
    pub affected_operations: Vec<OperationId>,
}

/// Options of [`ForestCache::read`].
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// The operation document.
    pub document: Arc<Document>,
    /// Variables of the operation.
    pub variables: Option<Value>,
    /// Root node of a fragment operation.
    pub root_id: Option<String>,
    /// Read through the optimistic layers.
    pub optimistic: bool,
    /// Return incomplete data instead of failing.
    pub return_partial_data: bool,
}

impl ReadOptions {
    /// Read the result of `document`. Non optimistic, fails on incomplete data.
    pub fn new(document: &Arc<Document>) -> Self {
        Self {
            document: document.clone(),
            variables: None,
            root_id: None,
            optimistic: false,
            return_partial_data: false,
        }
    }

    /// Set whether to read through the optimistic layers.
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    /// Set whether to return incomplete data.
    pub fn with_return_partial_data(mut self, return_partial_data: bool) -> Self {
        self.return_partial_data = return_partial_data;
        self
    }
}

operation_target!(ReadOptions);

/// Options of [`ForestCache::diff`].
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// The operation document.
    pub document: Arc<Document>,
    /// Variables of the operation.
    pub variables: Option<Value>,
    /// Root node of a fragment operation.
    pub root_id: Option<String>,
    /// Diff against the optimistic layers.
    pub optimistic: bool,
    /// Return incomplete data instead of failing.
    pub return_partial_data: bool,
}

impl DiffOptions {
    /// Diff `document` against the cache. Optimistic, returns partial data.
    pub fn new(document: &Arc<Document>) -> Self {
        Self {
            document: document.clone(),
            variables: None,
            root_id: None,
            optimistic: true,
            return_partial_data: true,
        }
    }

    /// Set whether to diff against the optimistic layers.
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    /// Set whether to return incomplete data.
    pub fn with_return_partial_data(mut self, return_partial_data: bool) -> Self {
        self.return_partial_data = return_partial_data;
        self
    }
}

operation_target!(DiffOptions);

/// Options of [`ForestCache::watch`].
pub struct WatchOptions {
    /// The operation document.
    pub document: Arc<Document>,
    /// Variables of the operation.
    pub variables: Option<Value>,
    /// Root node of a fragment operation.
    pub root_id: Option<String>,
    /// Watch the optimistic view.
    pub optimistic: bool,
    /// Call the callback with the current diff on registration.
    pub immediate: bool,
    /// Called when the diff changed.
    pub callback: WatchCallback,
}

impl Debug for WatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchOptions")
            .field("document", &self.document.name())
            .field("variables", &self.variables)
            .field("root_id", &self.root_id)
            .field("optimistic", &self.optimistic)
            .field("immediate", &self.immediate)
            .finish()
    }
}

impl WatchOptions {
    /// Watch `document`. Optimistic, not immediate.
    pub fn new<F>(document: &Arc<Document>, callback: F) -> Self
    where
        F: FnMut(&DiffOutcome, Option<&DiffOutcome>) + Send + 'static,
    {
        Self {
            document: document.clone(),
            variables: None,
            root_id: None,
            optimistic: true,
            immediate: false,
            callback: Box::new(callback),
        }
    }

    /// Set whether to watch the optimistic view.
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    /// Set whether to call the callback on registration.
    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }
}

operation_target!(WatchOptions);

/// Options of [`ForestCache::modify`].
#[derive(Debug, Clone, Default)]
pub struct ModifyOptions {
    /// Node to modify, the root query node by default.
    pub id: Option<String>,
    /// Field modifiers.
    pub fields: Modifiers,
    /// Modify the top optimistic layer when called outside an optimistic transaction.
    pub optimistic: bool,
}

impl ModifyOptions {
    /// Modify the fields of node `id`.
    pub fn new(id: impl Into<String>, fields: Modifiers) -> Self {
        Self {
            id: Some(id.into()),
            fields,
            optimistic: false,
        }
    }

    /// Set whether to modify the top optimistic layer.
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }
}

/// Options of [`ForestCache::evict`].
#[derive(Debug, Clone, Default)]
pub struct EvictOptions {
    /// Node to evict from, the root query node by default.
    pub id: Option<String>,
    /// Field to evict, `None` evicts the whole node.
    pub field_name: Option<String>,
    /// Arguments selecting one variant of the field, `None` evicts every variant.
    pub args: Option<Map<String, Value>>,
}

impl EvictOptions {
    /// Evict node `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Evict only one field of the node.
    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    /// Evict only the field variant with the given arguments.
    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = Some(args);
        self
    }
}

/// Options of [`ForestCache::batch`].
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Write into a new optimistic layer with this tag.
    pub optimistic: Option<String>,
    /// Remove the optimistic layers with this tag after the update.
    pub remove_optimistic: Option<String>,
}

impl BatchOptions {
    /// Set the tag of the optimistic layer to write into.
    pub fn with_optimistic(mut self, tag: impl Into<String>) -> Self {
        self.optimistic = Some(tag.into());
        self
    }

    /// Set the tag of the optimistic layers to remove after the update.
    pub fn with_remove_optimistic(mut self, tag: impl Into<String>) -> Self {
        self.remove_optimistic = Some(tag.into());
        self
    }
}

/// Statistics of a [`ForestCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Store statistics.
    pub store: Statistics,
    /// Registered watches.
    pub watches: usize,
}

/// A normalized cache of operation results with optimistic layers and watches.
///
/// Build one with [`crate::ForestCacheBuilder`].
pub struct ForestCache {
    pub(crate) store: Store,
    pub(crate) frames: Vec<Frame>,
    pub(crate) watches: Watches,
    pub(crate) hook: Option<Arc<dyn WatchHook>>,
}

impl Debug for ForestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForestCache")
            .field("store", &self.store)
            .field("frames", &self.frames)
            .field("watches", &self.watches)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

fn variables_of(variables: Option<&Value>) -> Result<Option<&Map<String, Value>>> {
    match variables {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(v) => Err(Error::new(ErrorKind::InvalidData, "variables must be an object").with_context("variables", v)),
    }
}

impl ForestCache {
    pub(crate) fn new(env: Env, hook: Option<Arc<dyn WatchHook>>) -> Self {
        Self {
            store: Store::new(env),
            frames: vec![],
            watches: Watches::default(),
            hook,
        }
    }

    /// Layer of the innermost transaction, `None` for the base layer.
    pub(crate) fn active_layer(&self) -> Option<LayerId> {
        self.frames.last().and_then(|f| f.layer())
    }

    fn mutation_layer(&self, optimistic: bool) -> Option<LayerId> {
        self.active_layer().or_else(|| {
            optimistic
                .then(|| self.store.optimistic_layers().last().copied())
                .flatten()
        })
    }

    fn resolve(
        &mut self,
        document: &Arc<Document>,
        variables: Option<&Value>,
        root_id: Option<&str>,
    ) -> Result<Arc<OperationDescriptor>> {
        let variables = variables_of(variables)?;
        self.store.operation(document, variables, root_id)
    }

    /// Write the result of an operation.
    pub fn write(&mut self, options: WriteOptions) -> Result<WriteOutcome> {
        let operation = self.resolve(&options.document, options.variables.as_ref(), options.root_id.as_deref())?;
        let SourceValue::Object(data) = SourceValue::from(options.data) else {
            return Err(Error::new(ErrorKind::InvalidData, "written data must be an object")
                .with_context("operation", operation.debug_name()));
        };
        self.in_transaction(|cache| {
            let active = cache.active_layer();
            let changes = cache.store.write(active, &operation, data);
            let outcome = WriteOutcome {
                root_node_key: operation.root_node_key.clone(),
                affected_operations: changes.affected_operations.keys().copied().sorted().collect(),
            };
            cache.accumulate(
                changes,
                ChangeRecord::Write {
                    operation: operation.id,
                    root_node_key: operation.root_node_key.clone(),
                },
            );
            outcome
        })
    }

    /// Read the result of an operation.
    ///
    /// Without `return_partial_data` a missing field or a dangling reference fails the read.
    pub fn read(&mut self, options: ReadOptions) -> Result<Option<SourceValue>> {
        let outcome = self.diff_operation(
            &options.document,
            options.variables.as_ref(),
            options.root_id.as_deref(),
            options.optimistic,
            options.return_partial_data,
        )?;
        Ok(outcome.result)
    }

    /// Diff an operation against the cache.
    pub fn diff(&mut self, options: DiffOptions) -> Result<DiffOutcome> {
        self.diff_operation(
            &options.document,
            options.variables.as_ref(),
            options.root_id.as_deref(),
            options.optimistic,
            options.return_partial_data,
        )
    }

    fn diff_operation(
        &mut self,
        document: &Arc<Document>,
        variables: Option<&Value>,
        root_id: Option<&str>,
        optimistic: bool,
        return_partial_data: bool,
    ) -> Result<DiffOutcome> {
        let operation = self.resolve(document, variables, root_id)?;
        let active = self.active_layer();
        let outcome = DiffOutcome::new(self.store.read(active, optimistic, &operation));
        if !return_partial_data {
            if let Some(missing) = outcome.missing.first() {
                return Err(missing.to_error().with_context("operation", operation.debug_name()));
            }
        }
        Ok(outcome)
    }

    /// Watch an operation. The operation is pinned against eviction until unwatched.
    pub fn watch(&mut self, options: WatchOptions) -> Result<WatchHandle> {
        let operation = self.resolve(&options.document, options.variables.as_ref(), options.root_id.as_deref())?;
        self.store.watch_operation(operation.id);
        let initial = DiffOutcome::new(self.store.read(None, options.optimistic, &operation));
        Ok(self.watches.insert(
            operation,
            options.optimistic,
            options.callback,
            initial,
            options.immediate,
        ))
    }

    /// Unregister a watch. Returns `true` if the watch was registered.
    pub fn unwatch(&mut self, handle: WatchHandle) -> bool {
        match self.watches.remove(handle) {
            Some(operation) => {
                self.store.unwatch_operation(operation);
                true
            }
            None => false,
        }
    }

    /// Apply modifiers to the fields of a node. Returns `true` if any field changed or was invalidated.
    pub fn modify(&mut self, options: ModifyOptions) -> Result<bool> {
        let node = options.id.unwrap_or_else(|| ROOT_QUERY.to_string());
        self.in_transaction(|cache| {
            let active = cache.mutation_layer(options.optimistic);
            let (modified, changes) = cache.store.modify(active, &node, &options.fields);
            cache.accumulate(
                changes,
                ChangeRecord::Modify {
                    node: NodeKey::from(node),
                    modified,
                },
            );
            modified
        })
    }

    /// Evict a node, or the variants of one of its fields. Returns `true` if anything was evicted.
    pub fn evict(&mut self, options: EvictOptions) -> Result<bool> {
        let node = options.id.unwrap_or_else(|| ROOT_QUERY.to_string());
        self.in_transaction(|cache| {
            let active = cache.active_layer();
            let (evicted, changes) =
                cache
                    .store
                    .evict(active, &node, options.field_name.as_deref(), options.args.as_ref());
            cache.accumulate(
                changes,
                ChangeRecord::Evict {
                    node: NodeKey::from(node),
                    field: options.field_name,
                    evicted,
                },
            );
            evicted
        })
    }

    /// Run `update` in a transaction, optionally writing into a new optimistic layer and removing layers afterwards.
    ///
    /// Watches are notified once the outermost transaction closes.
    pub fn batch<T>(&mut self, options: BatchOptions, update: impl FnOnce(&mut ForestCache) -> Result<T>) -> Result<T> {
        self.run_transaction(
            options.optimistic.as_deref(),
            options.remove_optimistic.as_deref(),
            update,
        )
    }

    /// Run `update` in a transaction. With a tag, writes go into a new optimistic layer with that tag.
    pub fn perform_transaction<T>(
        &mut self,
        update: impl FnOnce(&mut ForestCache) -> Result<T>,
        optimistic_tag: Option<&str>,
    ) -> Result<T> {
        self.run_transaction(optimistic_tag, None, update)
    }

    /// Remove every optimistic layer with the tag.
    pub fn remove_optimistic(&mut self, tag: &str) -> Result<()> {
        self.in_transaction(|cache| {
            let changes = cache.store.remove_optimistic_layer(tag);
            cache.accumulate(changes, ChangeRecord::RemoveOptimistic { tag: tag.to_string() });
        })
    }

    /// Evict least recently used operations exceeding their partition cap. Returns the evicted operations.
    pub fn gc(&mut self) -> Result<Vec<String>> {
        self.in_transaction(|cache| {
            let changes = cache.store.evict_old_data();
            let evicted = changes
                .evicted
                .iter()
                .map(|op| op.debug_name())
                .collect_vec();
            cache.accumulate(changes, ChangeRecord::Gc { evicted: evicted.len() });
            evicted
        })
    }

    /// Serialize the normalized content of the base layer, or of the full stack.
    pub fn extract(&self, optimistic: bool) -> Value {
        self.store.extract(optimistic)
    }

    /// Compute the node key of an object with the identity policies.
    pub fn identify(&self, object: &Value) -> Option<String> {
        let Value::Object(map) = object else {
            return None;
        };
        let type_name = map.get(TYPENAME_FIELD).and_then(Value::as_str);
        let SourceValue::Object(data) = SourceValue::from(object.clone()) else {
            return None;
        };
        self.store.env().identify(&data, type_name, None)
    }

    /// Drop every layer, tree and memo. Watches are kept and re-diffed.
    pub fn reset(&mut self) -> Result<()> {
        if !self.frames.is_empty() {
            return Err(Error::new(ErrorKind::Transaction, "cannot reset inside a transaction"));
        }
        self.store.reset();
        self.watches.dispatch(
            &mut self.store,
            self.hook.as_deref(),
            &Default::default(),
            &Default::default(),
            true,
        );
        Ok(())
    }

    /// Statistics.
    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            store: self.store.statistics(),
            watches: self.watches.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use arbor_forest::descriptor::{Field, SelectionSet};
    use serde_json::json;

    use super::*;
    use crate::ForestCacheBuilder;

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

    #[test_log::test]
    fn test_invalid_input() {
        let mut cache = ForestCacheBuilder::new().build().unwrap();
        let document = user_document();

        let err = cache.write(WriteOptions::new(&document, json!([1, 2]))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let err = cache
            .read(ReadOptions::new(&document).with_variables(json!("1")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test_log::test]
    fn test_read_partial_data() {
        let mut cache = ForestCacheBuilder::new().build().unwrap();
        let document = user_document();
        cache
            .write(
                WriteOptions::new(&document, json!({ "user": { "__typename": "User", "id": "1" } }))
                    .with_variables(json!({ "id": "1" })),
            )
            .unwrap();

        let err = cache
            .read(ReadOptions::new(&document).with_variables(json!({ "id": "1" })))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingField);
        assert_eq!(err.context_value("path"), Some("user.name"));

        let partial = cache
            .read(
                ReadOptions::new(&document)
                    .with_variables(json!({ "id": "1" }))
                    .with_return_partial_data(true),
            )
            .unwrap();
        assert_eq!(
            partial.unwrap().to_json(),
            json!({ "user": { "__typename": "User", "id": "1" } })
        );
    }

    #[test_log::test]
    fn test_identify() {
        let cache = ForestCacheBuilder::new().build().unwrap();
        assert_eq!(
            cache.identify(&json!({ "__typename": "User", "id": "1" })).as_deref(),
            Some("User:1")
        );
        assert_eq!(cache.identify(&json!({ "name": "x" })), None);
        assert_eq!(cache.identify(&json!(1)), None);
    }
}
