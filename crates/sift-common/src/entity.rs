use crate::Checksum;
use std::fmt;

/// One record of a sync subject.
///
/// An entity is identified by a stable string id and exposes the relational
/// row surface the store implementations consume: table name, column list,
/// and the values matching that list. The fingerprint is the checksum the
/// delta compares; subjects without checksums leave it `None`.
pub trait Entity: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);

    fn fingerprint(&self) -> Option<&Checksum>;

    fn set_fingerprint(&mut self, checksum: Checksum);

    /// Table holding this subject's rows.
    fn table(&self) -> &'static str;

    /// Primary key column.
    fn id_column(&self) -> &'static str {
        "id"
    }

    /// Column holding the fingerprint.
    fn fingerprint_column(&self) -> &'static str {
        "properties_checksum"
    }

    /// Columns written on insert and update, excluding the id column.
    /// Includes the fingerprint column.
    fn columns(&self) -> &'static [&'static str];

    /// Values in `columns()` order.
    fn values(&self) -> Vec<FieldValue>;
}

/// The narrow set of SQL-bindable values a row can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Null,
}

/// Compact (id, checksum) pair streamed by both the cache and the store
/// before any hydration happens. `None` is distinguishable from every
/// checksum value.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedChecksum {
    pub id: String,
    pub checksum: Option<Checksum>,
}

impl KeyedChecksum {
    pub fn new(id: impl Into<String>, checksum: Option<Checksum>) -> Self {
        Self {
            id: id.into(),
            checksum,
        }
    }
}

/// A subject factory rejected a cache payload.
#[derive(Debug, thiserror::Error)]
#[error("decode entity {id}: {source}")]
pub struct DecodeError {
    pub id: String,
    #[source]
    pub source: serde_json::Error,
}
