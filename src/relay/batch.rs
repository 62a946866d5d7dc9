// ABOUTME: Extraction unit (Batch) and its wire wrapper (Envelope + message metadata)
// ABOUTME: Metadata travels as string properties next to the compressed payload

use std::collections::BTreeMap;

use crate::schema::{ColumnDescriptor, ColumnValue};

use super::codec::CodecError;

/// One captured row, positionally aligned to the batch schema.
pub type RowValues = Vec<ColumnValue>;

/// Rows extracted from one table in one cycle, with the schema they were read under.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub table: String,
    pub identity_column: String,
    pub schema: Vec<ColumnDescriptor>,
    pub rows: Vec<RowValues>,
}

impl Batch {
    pub fn new(
        table: impl Into<String>,
        identity_column: impl Into<String>,
        schema: Vec<ColumnDescriptor>,
    ) -> Self {
        Self {
            table: table.into(),
            identity_column: identity_column.into(),
            schema,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|c| c.name == name)
    }

    pub fn identity_index(&self) -> Option<usize> {
        self.column_index(&self.identity_column)
    }

    pub fn version_index(&self) -> Option<usize> {
        self.schema.iter().position(|c| c.is_version)
    }

    /// Version values of all rows, in row order. Rows whose version is not a
    /// non-negative integer are reported as `None`.
    pub fn versions(&self) -> Vec<Option<u64>> {
        match self.version_index() {
            Some(idx) => self
                .rows
                .iter()
                .map(|row| row.get(idx).and_then(ColumnValue::as_version))
                .collect(),
            None => vec![None; self.rows.len()],
        }
    }
}

/// Attributes sent alongside an envelope payload, readable without
/// decompressing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub table: String,
    pub change_from: u64,
    pub change_to: u64,
    pub changes: u64,
}

impl MessageMetadata {
    pub const TABLE: &'static str = "Table";
    pub const CHANGE_FROM: &'static str = "ChangeFrom";
    pub const CHANGE_TO: &'static str = "ChangeTo";
    pub const CHANGES: &'static str = "Changes";

    pub fn to_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (Self::TABLE.to_string(), self.table.clone()),
            (Self::CHANGE_FROM.to_string(), self.change_from.to_string()),
            (Self::CHANGE_TO.to_string(), self.change_to.to_string()),
            (Self::CHANGES.to_string(), self.changes.to_string()),
        ])
    }

    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self, CodecError> {
        let table = properties
            .get(Self::TABLE)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CodecError::corrupt("message metadata has no Table"))?
            .clone();

        Ok(Self {
            table,
            change_from: integer_property(properties, Self::CHANGE_FROM)?,
            change_to: integer_property(properties, Self::CHANGE_TO)?,
            changes: integer_property(properties, Self::CHANGES)?,
        })
    }
}

fn integer_property(properties: &BTreeMap<String, String>, key: &str) -> Result<u64, CodecError> {
    let raw = properties
        .get(key)
        .ok_or_else(|| CodecError::corrupt(format!("message metadata has no {}", key)))?;
    raw.trim().parse().map_err(|_| {
        CodecError::corrupt(format!("message metadata {} is not an integer: {:?}", key, raw))
    })
}

/// Compressed, metadata-tagged wire unit carrying one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub table: String,
    pub version_from: u64,
    pub version_to: u64,
    pub change_count: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            table: self.table.clone(),
            change_from: self.version_from,
            change_to: self.version_to,
            changes: self.change_count,
        }
    }

    pub fn from_parts(metadata: MessageMetadata, payload: Vec<u8>) -> Self {
        Self {
            table: metadata.table,
            version_from: metadata.change_from,
            version_to: metadata.change_to,
            change_count: metadata.changes,
            payload,
        }
    }
}
