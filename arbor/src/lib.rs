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

//! A normalized, incrementally diffable cache of graph shaped operation results.
//!
//! Operations sharing nodes are kept as indexed trees. Writes compute minimal differences and patch every cached
//! result sharing a changed node with structural sharing, optimistic writes live in stacked layers that are replayed
//! when lower layers change, and watches are notified only when their own view changed.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use arbor::{Document, Field, ForestCacheBuilder, ReadOptions, SelectionSet, WriteOptions};
//! use serde_json::json;
//!
//! let document = Arc::new(Document::query(
//!     "User",
//!     SelectionSet::new().field(
//!         Field::new("user")
//!             .var_arg("id", "id")
//!             .selection(SelectionSet::new().leaves(["__typename", "id", "name"])),
//!     ),
//! ));
//! let data = json!({ "user": { "__typename": "User", "id": "1", "name": "Alice" } });
//!
//! let mut cache = ForestCacheBuilder::new().build().unwrap();
//! cache
//!     .write(WriteOptions::new(&document, data.clone()).with_variables(json!({ "id": "1" })))
//!     .unwrap();
//! let read = cache
//!     .read(ReadOptions::new(&document).with_variables(json!({ "id": "1" })))
//!     .unwrap();
//! assert_eq!(read.unwrap().to_json(), data);
//! ```

mod builder;
mod cache;
mod prelude;
mod transaction;
mod watch;

pub use prelude::*;
