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

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use arbor_common::event::{Event, Notification};
use arbor_forest::{
    descriptor::{NodeKey, OperationDescriptor, OperationId},
    hydrate::MissingField,
    layer::ReadResult,
    store::{ChangeSet, Store},
    value::SourceValue,
};
use hashbrown::HashSet;
use itertools::Itertools;

/// Result of diffing an operation against the cache.
///
/// Two outcomes computed from the same memoized read share their identity, see [`DiffOutcome::same_result`].
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// Data read, `None` if the root node is unknown.
    pub result: Option<SourceValue>,
    /// Returns `true` if no field is missing.
    pub complete: bool,
    /// Diagnostics of the values that could not be read.
    pub missing: Vec<MissingField>,
    read: Arc<ReadResult>,
}

impl DiffOutcome {
    pub(crate) fn new(read: Arc<ReadResult>) -> Self {
        Self {
            result: read.value.clone(),
            complete: read.is_complete(),
            missing: read.missing.clone(),
            read,
        }
    }

    /// Returns `true` if both outcomes come from the same read result.
    pub fn same_result(&self, other: &DiffOutcome) -> bool {
        Arc::ptr_eq(&self.read, &other.read)
    }

    /// Nodes read to compute the outcome.
    pub fn touched(&self) -> &HashSet<NodeKey> {
        &self.read.touched
    }
}

/// Decision of a [`WatchHook`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchDecision {
    /// Notify if the diff changed.
    #[default]
    Default,
    /// Do not notify.
    Skip,
    /// Notify even if the diff did not change.
    Force,
}

/// A watch about to be notified.
#[derive(Debug)]
pub struct WatchUpdate<'a> {
    /// The watched operation.
    pub operation: &'a OperationDescriptor,
    /// Returns `true` if the watch reads optimistic data.
    pub optimistic: bool,
    /// Last diff, `None` if the watch never fired.
    pub last: Option<&'a DiffOutcome>,
    /// The new diff.
    pub next: &'a DiffOutcome,
}

/// Hook to suppress or force watch notifications.
pub trait WatchHook: Send + Sync + 'static {
    /// Called for every re-diffed watch before the fire decision.
    #[expect(unused_variables)]
    fn on_update(&self, update: &WatchUpdate<'_>) -> WatchDecision {
        WatchDecision::Default
    }
}

/// Watch callback, called with the new diff and the last delivered one.
pub type WatchCallback = Box<dyn FnMut(&DiffOutcome, Option<&DiffOutcome>) + Send + 'static>;

/// Handle of a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

struct Watch {
    operation: Arc<OperationDescriptor>,
    optimistic: bool,
    callback: WatchCallback,
    last: DiffOutcome,
    fired: bool,
}

impl Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("operation", &self.operation.debug_name())
            .field("optimistic", &self.optimistic)
            .field("fired", &self.fired)
            .finish()
    }
}

impl Watch {
    fn is_candidate(&self, changes: &ChangeSet, optimize_fragment_reads: bool) -> bool {
        !self.last.complete
            || (self.optimistic && changes.layers_changed)
            || self.is_affected(changes, optimize_fragment_reads)
    }

    /// Returns `true` if the changes touch the operation or a node of its last diff.
    fn is_affected(&self, changes: &ChangeSet, optimize_fragment_reads: bool) -> bool {
        if optimize_fragment_reads && self.operation.is_fragment() {
            let root = &self.operation.root_node_key;
            if changes.affected_nodes.contains(root) || changes.forced_nodes.contains(root) {
                return true;
            }
        } else if changes.affected_operations.contains_key(&self.operation.id) {
            return true;
        }
        self.last
            .touched()
            .iter()
            .any(|n| changes.affected_nodes.contains(n) || changes.forced_nodes.contains(n))
    }

}

/// Registered watches.
#[derive(Debug, Default)]
pub(crate) struct Watches {
    next_id: u64,
    watches: BTreeMap<WatchHandle, Watch>,
}

impl Watches {
    pub(crate) fn len(&self) -> usize {
        self.watches.len()
    }

    /// Register a watch with its initial diff. With `immediate` the callback is called with it.
    pub(crate) fn insert(
        &mut self,
        operation: Arc<OperationDescriptor>,
        optimistic: bool,
        mut callback: WatchCallback,
        initial: DiffOutcome,
        immediate: bool,
    ) -> WatchHandle {
        let handle = WatchHandle(self.next_id);
        self.next_id += 1;
        if immediate {
            callback(&initial, None);
        }
        tracing::debug!("[watch]: watch {} as {handle:?}", operation.debug_name());
        self.watches.insert(
            handle,
            Watch {
                operation,
                optimistic,
                callback,
                last: initial,
                fired: immediate,
            },
        );
        handle
    }

    /// Unregister a watch, returning its operation.
    pub(crate) fn remove(&mut self, handle: WatchHandle) -> Option<OperationId> {
        self.watches.remove(&handle).map(|w| w.operation.id)
    }

    /// Re-diff the watches affected by the changes and notify the changed ones. A watch that never fired is also
    /// notified when its own operation was written.
    ///
    /// With `all` every watch is re-diffed.
    pub(crate) fn dispatch(
        &mut self,
        store: &mut Store,
        hook: Option<&dyn WatchHook>,
        changes: &ChangeSet,
        written: &HashSet<OperationId>,
        all: bool,
    ) {
        let optimize_fragment_reads = store.env().config().optimize_fragment_reads;
        let candidates = self
            .watches
            .iter()
            .filter(|(_, w)| all || w.is_candidate(changes, optimize_fragment_reads))
            .map(|(handle, _)| *handle)
            .collect_vec();
        tracing::debug!(
            "[watch]: {} candidates of {} watches",
            candidates.len(),
            self.watches.len()
        );

        for handle in candidates {
            let Some(watch) = self.watches.get_mut(&handle) else {
                continue;
            };
            let next = DiffOutcome::new(store.read(None, watch.optimistic, &watch.operation));

            if watch.last.complete && !next.complete && !written.contains(&watch.operation.id) {
                let name = watch.operation.debug_name();
                tracing::warn!("[watch]: operation {name} became incomplete without being written");
                store.env().notify(
                    Notification::new(Event::StaleOperation, "operation became incomplete without being written")
                        .with_operation(name),
                );
            }

            let changed = !watch.last.same_result(&next);
            let forced = watch.last.touched().iter().any(|n| changes.forced_nodes.contains(n));
            let first = !watch.fired && written.contains(&watch.operation.id);
            let decision = hook.map_or(WatchDecision::Default, |hook| {
                hook.on_update(&WatchUpdate {
                    operation: &watch.operation,
                    optimistic: watch.optimistic,
                    last: watch.fired.then_some(&watch.last),
                    next: &next,
                })
            });
            let fire = match decision {
                WatchDecision::Default => changed || forced || first,
                WatchDecision::Skip => false,
                WatchDecision::Force => true,
            };
            if fire {
                tracing::trace!("[watch]: notify {handle:?} of {}", watch.operation.debug_name());
                (watch.callback)(&next, watch.fired.then_some(&watch.last));
                watch.fired = true;
            }
            watch.last = next;
        }
    }
}
