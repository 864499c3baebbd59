//! The demo state machine: a replicated string-to-string map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::runtime::{RestoreError, StateMachine};

/// Commands for the key-value store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
}

/// Result of applying a command to the KV store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResult {
    Ok,
    Value(Option<String>),
}

/// A simple in-memory key-value store.
///
/// Keys are held in a BTreeMap so snapshots of equal state are
/// byte-for-byte equal.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine<KvCommand> for KvStore {
    type Output = KvResult;

    fn apply(&mut self, command: KvCommand) -> KvResult {
        match command {
            KvCommand::Get { key } => KvResult::Value(self.data.get(&key).cloned()),
            KvCommand::Set { key, value } => {
                self.data.insert(key, value);
                KvResult::Ok
            }
            KvCommand::Delete { key } => {
                self.data.remove(&key);
                KvResult::Ok
            }
        }
    }

    fn query(&self, query: KvCommand) -> KvResult {
        match query {
            KvCommand::Get { key } => KvResult::Value(self.data.get(&key).cloned()),
            // A write arriving as a query is never applied.
            KvCommand::Set { .. } | KvCommand::Delete { .. } => KvResult::Ok,
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        // Serializing a string map cannot fail.
        serde_json::to_vec(&self.data).unwrap_or_default()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), RestoreError> {
        self.data = serde_json::from_slice(data).map_err(|e| RestoreError(e.to_string()))?;
        Ok(())
    }
}
