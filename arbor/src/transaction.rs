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

//! Transactions.
//!
//! Every mutation runs inside a transaction frame. Frames are kept on a stack owned by the cache, nested frames
//! hand their accumulated changes to their parent on close and only the outermost frame notifies watches.

use arbor_common::{
    error::{Error, Result},
    strict_assert, strict_assert_eq,
};
use arbor_forest::{
    descriptor::{NodeKey, OperationId},
    layer::LayerId,
    store::ChangeSet,
};
use hashbrown::HashSet;

use crate::cache::ForestCache;

/// State of a transaction frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Pushed onto the stack.
    Open,
    /// Running the update closure.
    Executing,
    /// Finishing a successful update.
    Committing,
    /// Popped from the stack.
    Closed,
}

impl TransactionState {
    fn can_move_to(self, next: TransactionState) -> bool {
        matches!(
            (self, next),
            (TransactionState::Open, TransactionState::Executing)
                | (TransactionState::Executing, TransactionState::Committing)
                | (TransactionState::Executing, TransactionState::Closed)
                | (TransactionState::Committing, TransactionState::Closed)
        )
    }
}

/// A changelog entry of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    /// Data was written for an operation.
    Write {
        /// The written operation.
        operation: OperationId,
        /// Root node of the written data.
        root_node_key: NodeKey,
    },
    /// A node was modified.
    Modify {
        /// The node.
        node: NodeKey,
        /// Returns `true` if any field changed or was invalidated.
        modified: bool,
    },
    /// A node or a field was evicted.
    Evict {
        /// The node.
        node: NodeKey,
        /// The field, `None` for the whole node.
        field: Option<String>,
        /// Returns `true` if anything was evicted.
        evicted: bool,
    },
    /// Optimistic layers were removed.
    RemoveOptimistic {
        /// Tag of the removed layers.
        tag: String,
    },
    /// Least recently used operations were evicted.
    Gc {
        /// Count of evicted operations.
        evicted: usize,
    },
}

#[derive(Debug)]
pub(crate) struct Frame {
    state: TransactionState,
    layer: Option<LayerId>,
    created_layer: Option<LayerId>,
    changes: ChangeSet,
    written: HashSet<OperationId>,
    changelog: Vec<ChangeRecord>,
}

impl Frame {
    fn open(layer: Option<LayerId>, created_layer: Option<LayerId>) -> Self {
        Self {
            state: TransactionState::Open,
            layer,
            created_layer,
            changes: ChangeSet::default(),
            written: HashSet::new(),
            changelog: vec![],
        }
    }

    fn transition(&mut self, next: TransactionState) {
        strict_assert!(
            self.state.can_move_to(next),
            "invalid transaction transition {:?} => {:?}",
            self.state,
            next
        );
        tracing::trace!("[transaction]: {:?} => {next:?}", self.state);
        self.state = next;
    }

    /// Layer the frame writes to, `None` for the base layer.
    pub(crate) fn layer(&self) -> Option<LayerId> {
        self.layer
    }

    pub(crate) fn accumulate(&mut self, changes: ChangeSet, record: ChangeRecord) {
        strict_assert_eq!(self.state, TransactionState::Executing);
        if let ChangeRecord::Write { operation, .. } = &record {
            self.written.insert(*operation);
        }
        self.changes.merge(changes);
        self.changelog.push(record);
    }

    fn absorb(&mut self, child: Frame) {
        strict_assert_eq!(child.state, TransactionState::Closed);
        self.changes.merge(child.changes);
        self.written.extend(child.written);
        self.changelog.extend(child.changelog);
    }
}

impl ForestCache {
    /// Run `update` in a new transaction frame.
    ///
    /// With `optimistic` the frame writes into a new optimistic layer with the tag. With `remove_optimistic` the
    /// layers with that tag are removed once `update` succeeded. On error the optimistic layer created by the frame is
    /// discarded and the error is returned unchanged.
    pub(crate) fn run_transaction<T>(
        &mut self,
        optimistic: Option<&str>,
        remove_optimistic: Option<&str>,
        update: impl FnOnce(&mut ForestCache) -> Result<T>,
    ) -> Result<T> {
        let inherited = self.active_layer();
        let created = optimistic.map(|tag| self.store.push_optimistic_layer(tag));
        let mut frame = Frame::open(created.or(inherited), created);
        frame.transition(TransactionState::Executing);
        self.frames.push(frame);
        let depth = self.frames.len();
        tracing::debug!("[transaction]: open at depth {depth}, layer: {:?}", created.or(inherited));

        let mut result = update(self);

        let mut unclosed = ChangeSet::default();
        if self.frames.len() > depth {
            let open = self.frames.split_off(depth);
            tracing::warn!("[transaction]: {} frames left open at depth {depth}", open.len());
            let count = open.len();
            for frame in open {
                unclosed.merge(frame.changes);
                if let Some(id) = frame.created_layer {
                    unclosed.merge(self.store.remove_layer(id));
                }
            }
            result = Err(Error::consistency("nested transaction frames left open").with_context("frames", count));
        }
        let Some(mut frame) = (self.frames.len() == depth).then(|| self.frames.pop()).flatten() else {
            return Err(Error::consistency("transaction frame missing on close").with_context("depth", depth));
        };
        frame.changes.merge(unclosed);

        let result = match result {
            Ok(value) => {
                frame.transition(TransactionState::Committing);
                if let Some(tag) = remove_optimistic {
                    let changes = self.store.remove_optimistic_layer(tag);
                    frame.changes.merge(changes);
                    frame.changelog.push(ChangeRecord::RemoveOptimistic { tag: tag.to_string() });
                }
                Ok(value)
            }
            Err(e) => {
                tracing::debug!("[transaction]: update failed at depth {depth}: {e}");
                if let Some(id) = frame.created_layer {
                    let changes = self.store.remove_layer(id);
                    frame.changes.merge(changes);
                }
                Err(e)
            }
        };
        frame.transition(TransactionState::Closed);

        match self.frames.last_mut() {
            Some(parent) => {
                parent.absorb(frame);
                result
            }
            None => {
                let deferred = self.dispatch(frame);
                match (result, deferred) {
                    (Ok(_), Some(e)) => Err(e),
                    (result, _) => result,
                }
            }
        }
    }

    /// Run `f` in the current transaction, or in a new one if none is open.
    pub(crate) fn in_transaction<T>(&mut self, f: impl FnOnce(&mut ForestCache) -> T) -> Result<T> {
        if self.frames.is_empty() {
            self.run_transaction(None, None, |cache| Ok(f(cache)))
        } else {
            Ok(f(self))
        }
    }

    /// Add changes to the innermost frame.
    pub(crate) fn accumulate(&mut self, changes: ChangeSet, record: ChangeRecord) {
        if let Some(frame) = self.frames.last_mut() {
            frame.accumulate(changes, record);
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Option<Error> {
        let Frame {
            changes,
            written,
            changelog,
            ..
        } = frame;
        tracing::debug!(
            "[transaction]: close with {} records, {} affected operations, {} affected nodes",
            changelog.len(),
            changes.affected_operations.len(),
            changes.affected_nodes.len()
        );
        if !changes.is_empty() {
            self.watches
                .dispatch(&mut self.store, self.hook.as_deref(), &changes, &written, false);
        }
        changes.error
    }
}
