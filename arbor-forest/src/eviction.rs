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

//! Partitioned lru eviction of base layer trees.

use hashbrown::HashMap;
use itertools::Itertools;

use crate::{descriptor::OperationId, env::Env, layer::Layer};

/// Access clock of operations.
///
/// Ticks are logical, every access advances the clock by one.
#[derive(Debug, Default)]
pub struct AccessClock {
    tick: u64,
    atime: HashMap<OperationId, u64>,
}

impl AccessClock {
    /// Record an access.
    pub fn touch(&mut self, operation: OperationId) {
        self.tick += 1;
        self.atime.insert(operation, self.tick);
    }

    /// Last access time of an operation, `0` if never accessed.
    pub fn atime(&self, operation: OperationId) -> u64 {
        self.atime.get(&operation).copied().unwrap_or_default()
    }

    /// Forget an operation.
    pub fn remove(&mut self, operation: OperationId) {
        self.atime.remove(&operation);
    }

    /// Forget every operation.
    pub fn clear(&mut self) {
        self.tick = 0;
        self.atime.clear();
    }
}

/// Returns `true` if the base layer holds enough trees to trigger auto eviction.
pub fn should_auto_evict(env: &Env, base: &Layer) -> bool {
    env.config().auto_evict && base.trees.len() > env.config().max_operation_count.saturating_mul(2)
}

/// Pick the trees of the base layer to evict, least recently accessed first.
///
/// `is_pinned` excludes operations from eviction, they still count into their partition.
pub fn pick_victims(
    env: &Env,
    base: &Layer,
    clock: &AccessClock,
    is_pinned: impl Fn(OperationId) -> bool,
) -> Vec<OperationId> {
    let mut partitions: HashMap<String, (usize, Vec<OperationId>)> = HashMap::new();
    for (id, tree) in base.trees.iter() {
        let (name, cap) = env.partition_of(&tree.operation);
        let entry = partitions.entry(name).or_insert_with(|| (cap, vec![]));
        entry.1.push(*id);
    }

    let mut victims = vec![];
    for (name, (cap, operations)) in partitions.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
        let Some(excess) = operations.len().checked_sub(cap).filter(|excess| *excess > 0) else {
            continue;
        };
        let before = victims.len();
        victims.extend(
            operations
                .into_iter()
                .filter(|id| !is_pinned(*id))
                .sorted_by_key(|id| (clock.atime(*id), *id))
                .take(excess),
        );
        tracing::debug!(
            "[eviction]: partition {name} exceeds its cap {cap} by {excess}, {} operations picked",
            victims.len() - before
        );
    }
    victims
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        descriptor::{Document, Field, OperationDescriptor, SelectionSet},
        env::{CacheConfig, PartitionConfig},
        indexer::index_tree,
        policy::PolicyTable,
        test_utils::{object, operation_with_id},
    };

    fn fill(env: &Env, base: &mut Layer, clock: &mut AccessClock, names: &[&str]) -> Vec<OperationId> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let document = Document::query(*name, SelectionSet::new().field(Field::new(*name)));
                let op = operation_with_id(i as u32, document, json!({}));
                let mut data = serde_json::Map::new();
                data.insert(name.to_string(), json!(1));
                let tree = index_tree(env, &op, object(serde_json::Value::Object(data)), None, None);
                base.insert_tree(Arc::new(tree));
                clock.touch(op.id);
                op.id
            })
            .collect()
    }

    #[test_log::test]
    fn test_lru_victims() {
        let env = Env::new(
            CacheConfig {
                max_operation_count: 2,
                ..Default::default()
            },
            PolicyTable::default(),
        );
        let mut base = Layer::base();
        let mut clock = AccessClock::default();
        let ids = fill(&env, &mut base, &mut clock, &["a", "b", "c", "d"]);

        // `a` becomes the most recent one.
        clock.touch(ids[0]);
        assert_eq!(pick_victims(&env, &base, &clock, |_| false), vec![ids[1], ids[2]]);
        // Pinned operations are skipped.
        assert_eq!(pick_victims(&env, &base, &clock, |id| id == ids[1]), vec![ids[2], ids[3]]);
        assert!(!should_auto_evict(&env, &base));
    }

    #[test_log::test]
    fn test_partitions() {
        let mut config = CacheConfig {
            max_operation_count: 10,
            ..Default::default()
        };
        config
            .partitions
            .insert("small".to_string(), PartitionConfig { max_operation_count: 1 });
        let env = Env::new(config, PolicyTable::default()).with_partition_key(Arc::new(|op: &OperationDescriptor| {
            match op.document.name() {
                "a" | "b" => Some("small".to_string()),
                "c" => Some("unknown".to_string()),
                _ => None,
            }
        }));
        let mut base = Layer::base();
        let mut clock = AccessClock::default();
        let ids = fill(&env, &mut base, &mut clock, &["a", "b", "c", "d"]);

        assert_eq!(pick_victims(&env, &base, &clock, |_| false), vec![ids[0]]);
    }
}
