//! Types carried by the replication bus.

use crate::error::{Result, StorageError};
use crate::types::{KeyColumn, MessageId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Payload of one message row: a single key's new value, or its deletion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// Key in its column text form.
    pub key: String,
    /// Codec text of the new value; `None` means the key was deleted.
    pub value: Option<String>,
    /// Key column type of the originating table.
    pub key_column: KeyColumn,
    /// Name of the codec that produced `value`.
    pub codec: String,
    /// Rust type name of the value, for diagnostics.
    pub value_type: String,
}

impl ChangeMessage {
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StorageError::Encode(e.to_string()))
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| StorageError::Decode(e.to_string()))
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// A decoded message handed to subscribers.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub id: MessageId,
    pub message: ChangeMessage,
}

/// Lifecycle of a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusState {
    /// Open, but no poll task scheduled yet.
    Created,
    /// Poll task scheduled.
    Polling,
    /// Stopped; no further ticks run.
    Stopped,
}

/// Unique identifier for a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Callback invoked for every delivered message, in id order.
pub type Subscriber = Arc<dyn Fn(&Delivery) + Send + Sync>;
