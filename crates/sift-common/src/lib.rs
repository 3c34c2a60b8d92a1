// Shared contracts for the sync engine: the entity surface, checksums,
// keyed checksum pairs, and sync subjects. Every other crate builds on these.
pub mod checksum;
pub mod entity;
pub mod subject;

pub use checksum::Checksum;
pub use entity::{DecodeError, Entity, FieldValue, KeyedChecksum};
pub use subject::SyncSubject;
