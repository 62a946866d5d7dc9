// ABOUTME: Runtime-discovered table shape: column descriptors, logical types, values
// ABOUTME: Column order is significant; row values are positionally aligned to it

pub mod types;
pub mod value;

pub use types::LogicalType;
pub use value::ColumnValue;

use serde::{Deserialize, Serialize};

/// Metadata for one column, as discovered when a batch is extracted.
///
/// Serialized field names are the envelope's wire names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    #[serde(rename = "ColumnName")]
    pub name: String,
    /// Type name as reported by the source driver
    #[serde(rename = "DataTypeName")]
    pub logical_type: String,
    #[serde(rename = "IsIdentity")]
    pub is_identity: bool,
    #[serde(rename = "IsVersion", default)]
    pub is_version: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, logical_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logical_type: logical_type.into(),
            is_identity: false,
            is_version: false,
        }
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self
    }

    pub fn version(mut self) -> Self {
        self.is_version = true;
        self
    }

    /// The bindable type for this column, if its type name is known.
    pub fn resolved_type(&self) -> Option<LogicalType> {
        LogicalType::from_type_name(&self.logical_type)
    }
}
