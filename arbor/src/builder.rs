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

use std::sync::Arc;

use arbor_common::{error::Result, event::EventListener};
use arbor_forest::{
    descriptor::OperationDescriptor,
    env::{CacheConfig, Env, PartitionConfig, PartitionKeyFn},
    policy::PolicyTable,
};

use crate::{cache::ForestCache, watch::WatchHook};

/// Builder of a [`ForestCache`].
#[derive(Default)]
pub struct ForestCacheBuilder {
    config: CacheConfig,
    policies: PolicyTable,
    partition_key: Option<PartitionKeyFn>,
    event_listener: Option<Arc<dyn EventListener>>,
    watch_hook: Option<Arc<dyn WatchHook>>,
}

impl ForestCacheBuilder {
    /// Create a builder with the default config and no policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the whole cache config.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the max operation count of the default partition.
    ///
    /// The default value is 1000.
    pub fn with_max_operation_count(mut self, max_operation_count: usize) -> Self {
        self.config.max_operation_count = max_operation_count;
        self
    }

    /// Set whether base writes evict least recently used operations once the operation count exceeds twice the cap.
    ///
    /// The default value is `true`.
    pub fn with_auto_evict(mut self, auto_evict: bool) -> Self {
        self.config.auto_evict = auto_evict;
        self
    }

    /// Pin the operations selecting any of the given root fields against eviction.
    pub fn with_non_evictable_queries<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .non_evictable_queries
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Add an eviction partition with its own cap.
    pub fn with_partition(mut self, name: impl Into<String>, max_operation_count: usize) -> Self {
        self.config
            .partitions
            .insert(name.into(), PartitionConfig { max_operation_count });
        self
    }

    /// Set the function mapping operations to eviction partitions.
    pub fn with_partition_key<F>(mut self, partition_key: F) -> Self
    where
        F: Fn(&OperationDescriptor) -> Option<String> + Send + Sync + 'static,
    {
        self.partition_key = Some(Arc::new(partition_key));
        self
    }

    /// Set whether fragment watches are selected by their root node.
    pub fn with_optimize_fragment_reads(mut self, optimize_fragment_reads: bool) -> Self {
        self.config.optimize_fragment_reads = optimize_fragment_reads;
        self
    }

    /// Set the identity and field policies.
    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Set the listener of cache notifications.
    pub fn with_event_listener(mut self, event_listener: Arc<dyn EventListener>) -> Self {
        self.event_listener = Some(event_listener);
        self
    }

    /// Set the hook deciding watch notifications.
    pub fn with_watch_hook(mut self, watch_hook: Arc<dyn WatchHook>) -> Self {
        self.watch_hook = Some(watch_hook);
        self
    }

    /// Build the cache.
    pub fn build(self) -> Result<ForestCache> {
        self.config.validate()?;
        tracing::debug!("[cache]: build with config {:?}", self.config);
        let mut env = Env::new(self.config, self.policies);
        if let Some(partition_key) = self.partition_key {
            env = env.with_partition_key(partition_key);
        }
        if let Some(event_listener) = self.event_listener {
            env = env.with_event_listener(event_listener);
        }
        Ok(ForestCache::new(env, self.watch_hook))
    }
}

#[cfg(test)]
mod tests {
    use arbor_common::error::ErrorKind;

    use super::*;

    #[test]
    fn test_build() {
        let cache = ForestCacheBuilder::new()
            .with_max_operation_count(10)
            .with_partition("small", 2)
            .with_non_evictable_queries(["viewer"])
            .build()
            .unwrap();
        assert_eq!(cache.statistics().store.operations, 0);

        let err = ForestCacheBuilder::new().with_partition("empty", 0).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.context_value("partition"), Some("empty"));
    }
}
