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

use arbor_common::{
    error::{Error, ErrorKind, Result},
    event::{Event, EventListener, Notification},
};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    descriptor::OperationDescriptor,
    policy::{IdentifyContext, PolicyTable},
    value::ObjectData,
};

/// Name of the partition used when no partition key function is configured.
pub const DEFAULT_PARTITION: &str = "default";

/// Eviction config of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Maximum count of operation trees kept in the partition.
    pub max_operation_count: usize,
}

/// Cache config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum count of operation trees kept in the base layer, per partition unless overridden.
    pub max_operation_count: usize,
    /// Evict automatically after base writes once the tree count exceeds twice the cap.
    pub auto_evict: bool,
    /// Root field names whose operations are never evicted.
    pub non_evictable_queries: HashSet<String>,
    /// Per-partition overrides.
    pub partitions: HashMap<String, PartitionConfig>,
    /// Match fragment watches by their root node only.
    pub optimize_fragment_reads: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_operation_count: 1000,
            auto_evict: true,
            non_evictable_queries: HashSet::new(),
            partitions: HashMap::new(),
            optimize_fragment_reads: false,
        }
    }
}

impl CacheConfig {
    /// Validate the config.
    pub fn validate(&self) -> Result<()> {
        if self.max_operation_count == 0 {
            return Err(Error::new(ErrorKind::Config, "max_operation_count must be greater than 0"));
        }
        if let Some((name, _)) = self.partitions.iter().find(|(_, p)| p.max_operation_count == 0) {
            return Err(
                Error::new(ErrorKind::Config, "max_operation_count must be greater than 0").with_context("partition", name)
            );
        }
        Ok(())
    }
}

/// Function mapping an operation to its eviction partition name.
pub type PartitionKeyFn = Arc<dyn Fn(&OperationDescriptor) -> Option<String> + Send + Sync + 'static>;

/// Environment shared by every component of a store.
pub struct Env {
    config: CacheConfig,
    policies: PolicyTable,
    partition_key: Option<PartitionKeyFn>,
    listener: Option<Arc<dyn EventListener>>,
    warned_partitions: Mutex<HashSet<String>>,
}

impl Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("config", &self.config)
            .field("policies", &self.policies)
            .field("partition_key", &self.partition_key.is_some())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new(CacheConfig::default(), PolicyTable::default())
    }
}

impl Env {
    /// Create a new environment.
    pub fn new(config: CacheConfig, policies: PolicyTable) -> Self {
        Self {
            config,
            policies,
            partition_key: None,
            listener: None,
            warned_partitions: Mutex::new(HashSet::new()),
        }
    }

    /// Set the partition key function.
    pub fn with_partition_key(mut self, partition_key: PartitionKeyFn) -> Self {
        self.partition_key = Some(partition_key);
        self
    }

    /// Set the event listener.
    pub fn with_event_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Cache config.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Resolved policies.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Compute the node key of an object.
    pub fn identify(
        &self,
        object: &ObjectData,
        type_name: Option<&str>,
        operation: Option<&OperationDescriptor>,
    ) -> Option<String> {
        self.policies
            .identify(object, &IdentifyContext { type_name, operation })
    }

    /// Deliver a notification to the listener, if any.
    pub fn notify(&self, notification: Notification) {
        if let Some(listener) = &self.listener {
            listener.on_notify(&notification);
        }
    }

    /// Resolve the partition name and cap of an operation.
    ///
    /// Unknown partition names fall back to the default partition, warning once per name.
    pub fn partition_of(&self, operation: &OperationDescriptor) -> (String, usize) {
        let Some(name) = self.partition_key.as_ref().and_then(|f| f(operation)) else {
            return (DEFAULT_PARTITION.to_string(), self.config.max_operation_count);
        };
        if let Some(partition) = self.config.partitions.get(&name) {
            return (name, partition.max_operation_count);
        }
        if name != DEFAULT_PARTITION && self.warned_partitions.lock().insert(name.clone()) {
            tracing::warn!(
                "[eviction]: unknown partition {name} of operation {}, fall back to the default partition",
                operation.debug_name()
            );
            self.notify(
                Notification::new(Event::PartitionFallback, format!("unknown partition {name}"))
                    .with_operation(operation.debug_name()),
            );
        }
        (DEFAULT_PARTITION.to_string(), self.config.max_operation_count)
    }
}
