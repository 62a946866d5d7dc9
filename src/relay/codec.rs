// ABOUTME: Envelope codec - batch to canonical JSON, gzip-compressed, and back
// ABOUTME: Any payload that does not decode to a well-formed batch is a CorruptEnvelope

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{ColumnDescriptor, ColumnValue};

use super::batch::{Batch, Envelope, MessageMetadata};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("corrupt envelope: {0}")]
    CorruptEnvelope(String),
    #[error("failed to encode batch: {0}")]
    Encode(String),
}

impl CodecError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        CodecError::CorruptEnvelope(reason.into())
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, CodecError::CorruptEnvelope(_))
    }
}

// Field order here is the wire order.
#[derive(Serialize)]
struct WireBatchRef<'a> {
    #[serde(rename = "IdColumn")]
    id_column: &'a str,
    #[serde(rename = "Schema")]
    schema: &'a [ColumnDescriptor],
    #[serde(rename = "Values")]
    values: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct WireBatch {
    #[serde(rename = "IdColumn")]
    id_column: String,
    #[serde(rename = "Schema")]
    schema: Vec<ColumnDescriptor>,
    #[serde(rename = "Values")]
    values: Vec<Vec<Value>>,
}

/// Serialize and compress a batch.
pub fn encode(batch: &Batch) -> Result<Vec<u8>, CodecError> {
    let wire = WireBatchRef {
        id_column: &batch.identity_column,
        schema: &batch.schema,
        values: batch
            .rows
            .iter()
            .map(|row| row.iter().map(ColumnValue::to_json).collect())
            .collect(),
    };
    let json = serde_json::to_vec(&wire).map_err(|e| CodecError::Encode(e.to_string()))?;
    compress(&json)
}

/// Decompress and deserialize a payload for `table`.
pub fn decode(table: &str, payload: &[u8]) -> Result<Batch, CodecError> {
    let json = decompress(payload)?;
    let wire: WireBatch = serde_json::from_slice(&json)
        .map_err(|e| CodecError::corrupt(format!("payload is not a batch document: {}", e)))?;

    if wire.id_column.is_empty() {
        return Err(CodecError::corrupt("IdColumn is empty"));
    }
    if !wire.schema.iter().any(|c| c.name == wire.id_column) {
        return Err(CodecError::corrupt(format!(
            "identity column {} is not in the schema",
            wire.id_column
        )));
    }
    let version_columns = wire.schema.iter().filter(|c| c.is_version).count();
    if version_columns != 1 {
        return Err(CodecError::corrupt(format!(
            "schema must flag exactly one version column, found {}",
            version_columns
        )));
    }

    let types: Vec<_> = wire.schema.iter().map(|c| c.resolved_type()).collect();
    let mut rows = Vec::with_capacity(wire.values.len());
    for (row_idx, raw) in wire.values.iter().enumerate() {
        if raw.len() != wire.schema.len() {
            return Err(CodecError::corrupt(format!(
                "row {} has {} values but the schema has {} columns",
                row_idx,
                raw.len(),
                wire.schema.len()
            )));
        }
        let mut row = Vec::with_capacity(raw.len());
        for ((value, column), ty) in raw.iter().zip(&wire.schema).zip(&types) {
            let decoded = match ty {
                Some(ty) => ColumnValue::from_json(*ty, value).map_err(|reason| {
                    CodecError::corrupt(format!(
                        "row {} column {}: {}",
                        row_idx, column.name, reason
                    ))
                })?,
                None => ColumnValue::from_untyped_json(value),
            };
            row.push(decoded);
        }
        rows.push(row);
    }

    Ok(Batch {
        table: table.to_string(),
        identity_column: wire.id_column,
        schema: wire.schema,
        rows,
    })
}

impl Envelope {
    /// Build the wire envelope for a non-empty batch covering
    /// `(version_from, version_to]`.
    pub fn seal(batch: &Batch, version_from: u64, version_to: u64) -> Result<Self, CodecError> {
        if batch.is_empty() {
            return Err(CodecError::Encode(format!(
                "refusing to seal an empty batch for {}",
                batch.table
            )));
        }
        let payload = encode(batch)?;
        Ok(Envelope::from_parts(
            MessageMetadata {
                table: batch.table.clone(),
                change_from: version_from,
                change_to: version_to,
                changes: batch.len() as u64,
            },
            payload,
        ))
    }

    /// Decode the payload and check it against the envelope's metadata.
    pub fn open(&self) -> Result<Batch, CodecError> {
        let batch = decode(&self.table, &self.payload)?;

        if batch.len() as u64 != self.change_count {
            return Err(CodecError::corrupt(format!(
                "metadata announces {} changes but the payload holds {} rows",
                self.change_count,
                batch.len()
            )));
        }
        for (row_idx, version) in batch.versions().into_iter().enumerate() {
            match version {
                Some(v) if v > self.version_from && v <= self.version_to => {}
                Some(v) => {
                    return Err(CodecError::corrupt(format!(
                        "row {} has version {} outside ({}, {}]",
                        row_idx, v, self.version_from, self.version_to
                    )))
                }
                None => {
                    return Err(CodecError::corrupt(format!(
                        "row {} has no integer version",
                        row_idx
                    )))
                }
            }
        }
        Ok(batch)
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    encoder.finish().map_err(|e| CodecError::Encode(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::corrupt(format!("payload is not valid gzip: {}", e)))?;
    Ok(out)
}
