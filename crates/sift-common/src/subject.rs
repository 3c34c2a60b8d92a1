use crate::{DecodeError, Entity};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

type PayloadFactory =
    Arc<dyn Fn(&str, &[u8]) -> Result<Box<dyn Entity>, DecodeError> + Send + Sync>;
type ShellFactory = Arc<dyn Fn() -> Box<dyn Entity> + Send + Sync>;

/// The parameter set naming one reconcilable entity type: a subject key
/// (the cache namespace suffix and log name), a payload factory, and a flag
/// for whether the subject's rows carry content checksums.
///
/// Subjects are created at configuration load, shared via `Arc`, and stay
/// immutable for the process lifetime.
pub struct SyncSubject {
    key: String,
    with_checksum: bool,
    factory: PayloadFactory,
    shell: ShellFactory,
}

impl SyncSubject {
    /// Build a subject for a concrete entity type. The payload factory
    /// decodes one JSON cache payload into a fresh `T`; shells are `T`'s
    /// default value carrying only an id.
    pub fn new<T>(key: impl Into<String>) -> Self
    where
        T: Entity + Default + DeserializeOwned + 'static,
    {
        let factory: PayloadFactory = Arc::new(|id: &str, payload: &[u8]| {
            let mut entity: T = serde_json::from_slice(payload).map_err(|source| DecodeError {
                id: id.to_string(),
                source,
            })?;
            entity.set_id(id.to_string());
            Ok(Box::new(entity) as Box<dyn Entity>)
        });
        let shell: ShellFactory = Arc::new(|| Box::new(T::default()) as Box<dyn Entity>);
        Self {
            key: key.into(),
            with_checksum: false,
            factory,
            shell,
        }
    }

    /// Mark the subject's rows as carrying content checksums.
    pub fn checksummed(mut self) -> Self {
        self.with_checksum = true;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn with_checksum(&self) -> bool {
        self.with_checksum
    }

    /// Materialize one entity from a raw cache payload.
    pub fn decode(&self, id: &str, payload: &[u8]) -> Result<Box<dyn Entity>, DecodeError> {
        (self.factory)(id, payload)
    }

    /// An empty entity carrying only the id. Enough for deletes and for
    /// creates on subjects without checksums.
    pub fn new_shell(&self, id: &str) -> Box<dyn Entity> {
        let mut entity = (self.shell)();
        entity.set_id(id.to_string());
        entity
    }
}

impl fmt::Debug for SyncSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSubject")
            .field("key", &self.key)
            .field("with_checksum", &self.with_checksum)
            .finish_non_exhaustive()
    }
}
