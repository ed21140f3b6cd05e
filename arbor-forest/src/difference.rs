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

use hashbrown::{HashMap, HashSet};

use crate::{
    chunk::FieldValue,
    descriptor::{NodeKey, NormalizedField},
    indexer::Tree,
    value::SourceValue,
};

/// New value carried by a [`ValueDifference`].
#[derive(Debug, Clone)]
pub enum ModelValue {
    /// A value of an indexed tree, re-shaped on patch if selections differ.
    Chunked {
        /// Tree the value was indexed in.
        tree: Arc<Tree>,
        /// The value.
        value: FieldValue,
    },
    /// A raw value inserted as is.
    Raw(SourceValue),
    /// Remove the field.
    Delete,
}

/// Difference of one value.
#[derive(Debug, Clone)]
pub enum ValueDifference {
    /// Field-wise difference of a keyless object.
    Object(ObjectDifference),
    /// Item-wise difference of a list.
    List(CompositeListDifference),
    /// Replace the value.
    Replacement {
        /// Value in the base, if known.
        old_value: Option<SourceValue>,
        /// Value to write.
        new_value: ModelValue,
    },
    /// Fill a value missing in the base.
    Filler {
        /// Value to write.
        new_value: ModelValue,
    },
}

impl ValueDifference {
    /// Returns `true` if applying the difference changes the base.
    pub fn is_dirty(&self) -> bool {
        match self {
            ValueDifference::Object(d) => d.is_dirty(),
            ValueDifference::List(d) => d.is_dirty(),
            ValueDifference::Replacement { .. } | ValueDifference::Filler { .. } => true,
        }
    }

    /// Returns `true` if every nested field and item was compared.
    pub fn is_complete(&self) -> bool {
        match self {
            ValueDifference::Object(d) => d.is_complete(),
            ValueDifference::List(d) => d.is_complete(),
            ValueDifference::Replacement { .. } | ValueDifference::Filler { .. } => true,
        }
    }
}

/// Field-wise difference of an object, keyed by normalized field identity.
#[derive(Debug, Clone, Default)]
pub struct ObjectDifference {
    /// Fields not compared yet.
    pub field_queue: HashSet<NormalizedField>,
    /// Differences by field.
    pub field_state: HashMap<NormalizedField, ValueDifference>,
    /// Fields whose value changed.
    pub dirty_fields: HashSet<NormalizedField>,
    /// Fields missing in the base that are filled from the model.
    pub filled_fields: HashSet<NormalizedField>,
}

impl ObjectDifference {
    /// Create a difference with the given fields queued.
    pub fn new(fields: impl IntoIterator<Item = NormalizedField>) -> Self {
        Self {
            field_queue: fields.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Returns `true` if every field was compared.
    pub fn is_complete(&self) -> bool {
        self.field_queue.is_empty()
    }

    /// Returns `true` if any field is dirty or filled.
    pub fn is_dirty(&self) -> bool {
        !self.dirty_fields.is_empty() || !self.filled_fields.is_empty()
    }

    /// Fields that need to be visited by the patcher.
    pub fn changed_fields(&self) -> impl Iterator<Item = &NormalizedField> {
        self.dirty_fields
            .iter()
            .chain(self.filled_fields.iter().filter(|f| !self.dirty_fields.contains(*f)))
    }

    /// Record a replacement of a field.
    pub fn replace(&mut self, field: NormalizedField, old_value: Option<SourceValue>, new_value: ModelValue) {
        self.field_queue.remove(&field);
        self.dirty_fields.insert(field.clone());
        self.field_state
            .insert(field, ValueDifference::Replacement { old_value, new_value });
    }
}

/// Placement of one item of a patched list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutItem {
    /// Keep the base item at the same index.
    Same,
    /// Take the base item at the given index.
    MovedFrom(usize),
    /// A new value, carried in the item state.
    NewValue,
    /// `null`.
    Null,
}

/// Item-wise difference of a list, keyed by the index in the new list.
#[derive(Debug, Clone, Default)]
pub struct CompositeListDifference {
    /// Items not compared yet.
    pub item_queue: HashSet<usize>,
    /// Differences by item.
    pub item_state: HashMap<usize, ValueDifference>,
    /// Items whose value changed.
    pub dirty_items: HashSet<usize>,
    /// New layout, set only when item identity or order changes.
    pub layout: Option<Vec<LayoutItem>>,
    /// Identity of the base items the layout was computed against.
    pub(crate) base_keys: Vec<Option<NodeKey>>,
    pub(crate) initialized: bool,
    /// Incoming list, written as a whole to trees whose list does not match `base_keys`.
    pub(crate) model: Option<ModelValue>,
}

impl CompositeListDifference {
    /// Returns `true` if every item was compared.
    pub fn is_complete(&self) -> bool {
        self.item_queue.is_empty()
    }

    /// Returns `true` if the layout or any item changed.
    pub fn is_dirty(&self) -> bool {
        self.layout.is_some() || !self.dirty_items.is_empty()
    }

    /// Source index in the base list of an item of the new list.
    pub fn source_index(&self, index: usize) -> Option<usize> {
        match &self.layout {
            None => Some(index),
            Some(layout) => match layout.get(index)? {
                LayoutItem::Same => Some(index),
                LayoutItem::MovedFrom(from) => Some(*from),
                LayoutItem::NewValue | LayoutItem::Null => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_difference_state() {
        let name = NormalizedField::plain("name");
        let age = NormalizedField::plain("age");
        let mut diff = ObjectDifference::new([name.clone(), age.clone()]);
        assert!(!diff.is_complete());
        assert!(!diff.is_dirty());

        diff.replace(name.clone(), None, ModelValue::Raw(SourceValue::from("Bob")));
        diff.filled_fields.insert(age.clone());
        diff.field_queue.remove(&age);

        assert!(diff.is_complete());
        assert!(diff.is_dirty());
        let mut changed = diff.changed_fields().cloned().collect::<Vec<_>>();
        changed.sort();
        assert_eq!(changed, vec![age, name]);
    }

    #[test]
    fn test_list_source_index() {
        let mut diff = CompositeListDifference::default();
        assert_eq!(diff.source_index(3), Some(3));
        assert!(!diff.is_dirty());

        diff.layout = Some(vec![LayoutItem::MovedFrom(1), LayoutItem::Same, LayoutItem::NewValue, LayoutItem::Null]);
        assert!(diff.is_dirty());
        assert_eq!(diff.source_index(0), Some(1));
        assert_eq!(diff.source_index(1), Some(1));
        assert_eq!(diff.source_index(2), None);
        assert_eq!(diff.source_index(3), None);
        assert_eq!(diff.source_index(4), None);
    }
}
