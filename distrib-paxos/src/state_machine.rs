//! What a replica does with committed log entries.
//!
//! Entries are applied strictly in index order, once each. An empty command
//! is a no-op filler: leaders use it to plug indices nobody proposed into.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{LogIndex, PaxosError, Value};

/// Deterministic consumer of the committed log.
pub trait StateMachine: Send {
    /// Apply the command committed at `index` and return its result.
    ///
    /// An error is reported to whoever waits on `index`; the log still moves
    /// past it.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Value, String>;
}

/// Commands understood by [`KvStateMachine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KvOperation {
    /// Set `key` to `value`, returning the new value.
    Set {
        /// Key to write.
        key: String,
        /// New value.
        value: String,
    },
    /// Read `key` at this point of the log, returning its value or nothing.
    Get {
        /// Key to read.
        key: String,
    },
}

impl KvOperation {
    /// Encode as a log command.
    pub fn encode(&self) -> Result<Value, PaxosError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Read-only view of a [`KvStateMachine`]'s map.
#[derive(Debug, Clone, Default)]
pub struct KvView {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl KvView {
    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether no key was written yet.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

/// Key/value map driven by the committed log.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    view: KvView,
}

impl KvStateMachine {
    /// Create an empty state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// A view that keeps observing the map after the machine moves into a
    /// replica.
    pub fn view(&self) -> KvView {
        self.view.clone()
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, _index: LogIndex, command: &[u8]) -> Result<Value, String> {
        if command.is_empty() {
            return Ok(Value::new());
        }
        let operation: KvOperation =
            serde_json::from_slice(command).map_err(|err| err.to_string())?;
        match operation {
            KvOperation::Set { key, value } => {
                self.view.data.write().insert(key, value.clone());
                Ok(value.into_bytes())
            }
            KvOperation::Get { key } => Ok(self
                .view
                .get(&key)
                .map(String::into_bytes)
                .unwrap_or_default()),
        }
    }
}
