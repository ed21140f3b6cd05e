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

//! The forest engine of arbor.
//!
//! Operation results are kept as indexed trees grouped into layers. Writes diff incoming trees against the layers
//! and patch every tree sharing a changed node, reads hydrate results from the chunks of all trees holding a node.

pub mod chunk;
pub mod descriptor;
/// Differences between node values.
pub mod difference;
pub mod differ;
/// Configuration and the environment passed through every operation.
pub mod env;
pub mod eviction;
pub mod hydrate;
pub mod indexer;
/// Layers of trees and memoized reads.
pub mod layer;
pub mod modifier;
pub mod patcher;
pub mod policy;
/// Commonly used types.
pub mod prelude;
pub mod store;
pub mod value;

#[cfg(test)]
mod test_utils;
