//! Core types shared by the handler, bus and cache.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// Identifier of a row in a `<table>_messages` table.
///
/// Assigned by the database; strictly increasing in insertion order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct MessageId(pub i64);

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SQL column type used for the key of a value table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyColumn {
    /// Free-form string keys.
    Varchar,
    /// UUID keys, stored in their 36-character hyphenated form.
    Uuid,
}

impl KeyColumn {
    /// Column type used in `CREATE TABLE`.
    pub fn sql_type(self) -> &'static str {
        match self {
            KeyColumn::Varchar => "VARCHAR(255)",
            KeyColumn::Uuid => "CHAR(36)",
        }
    }
}

impl fmt::Display for KeyColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyColumn::Varchar => write!(f, "varchar"),
            KeyColumn::Uuid => write!(f, "uuid"),
        }
    }
}

/// A key type that can be stored in a value table's primary key column.
pub trait TableKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Column descriptor selecting the DDL for this key type.
    const COLUMN: KeyColumn;

    /// Text stored in the key column.
    fn to_column(&self) -> String;

    /// Parse the text read back from the key column.
    fn from_column(text: &str) -> Result<Self>;
}

impl TableKey for String {
    const COLUMN: KeyColumn = KeyColumn::Varchar;

    fn to_column(&self) -> String {
        self.clone()
    }

    fn from_column(text: &str) -> Result<Self> {
        Ok(text.to_string())
    }
}

impl TableKey for Uuid {
    const COLUMN: KeyColumn = KeyColumn::Uuid;

    fn to_column(&self) -> String {
        self.hyphenated().to_string()
    }

    fn from_column(text: &str) -> Result<Self> {
        Uuid::parse_str(text)
            .map_err(|e| StorageError::Decode(format!("invalid uuid key {:?}: {}", text, e)))
    }
}

/// Check that `name` is safe to interpolate into SQL as a table name.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

/// Name of the message table that replicates `table`.
pub fn messages_table(table: &str) -> String {
    format!("{}_messages", table)
}
