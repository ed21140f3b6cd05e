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

use serde::{Deserialize, Serialize};

/// Event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    /// A field `read` policy failed, the existing value is used instead.
    ReadPolicyError,
    /// A field `merge` policy failed, the incoming value is used instead.
    MergePolicyError,
    /// A watched operation degraded from complete to incomplete as a side effect of an unrelated write.
    StaleOperation,
    /// An unknown partition name was returned by the partition key function, the default partition is used.
    PartitionFallback,
    /// An operation was evicted from the cache.
    Evict,
}

impl Event {
    /// Stable upper snake case code of the event.
    pub fn code(&self) -> &'static str {
        match self {
            Event::ReadPolicyError => "READ_POLICY_ERROR",
            Event::MergePolicyError => "MERGE_POLICY_ERROR",
            Event::StaleOperation => "STALE_OPERATION",
            Event::PartitionFallback => "PARTITION_FALLBACK",
            Event::Evict => "EVICT",
        }
    }
}

/// Structured notification delivered to the [`EventListener`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Event identifier.
    pub event: Event,
    /// Human readable message.
    pub message: String,
    /// Debug name of the related operation, if any.
    pub operation: Option<String>,
    /// Related node key, if any.
    pub node: Option<String>,
    /// Related field name, if any.
    pub field: Option<String>,
}

impl Notification {
    /// Create a new notification with the given event and message.
    pub fn new(event: Event, message: impl Into<String>) -> Self {
        Self {
            event,
            message: message.into(),
            operation: None,
            node: None,
            field: None,
        }
    }

    /// Attach the related operation.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Attach the related node key.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Attach the related field name.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Trait for the customized event listener.
pub trait EventListener: Send + Sync + 'static {
    /// Called when the cache emits a notification.
    #[expect(unused_variables)]
    fn on_notify(&self, notification: &Notification) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_serde() {
        let notification = Notification::new(Event::MergePolicyError, "merge failed")
            .with_operation("UserQuery")
            .with_node("User:1")
            .with_field("friends");

        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["event"], "MergePolicyError");
        assert_eq!(json["node"], "User:1");

        let decoded: Notification = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, notification);
        assert_eq!(decoded.event.code(), "MERGE_POLICY_ERROR");
    }
}
