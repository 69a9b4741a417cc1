use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{ConfigData, Snapshot};
use crate::db::Database;
use crate::error::PublishError;

/// Holds the currently published [`Snapshot`].
///
/// Readers take the read lock only long enough to clone the `Arc`; a publish
/// builds the new snapshot before taking the write lock, so readers never wait
/// on snapshot construction and never observe a half-built view.
pub struct ConfigStore {
    current: RwLock<Option<Arc<Snapshot>>>,
    /// Last issued version. Held for the whole publish so versions are
    /// handed out in publish order.
    publish_lock: Mutex<u64>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            publish_lock: Mutex::new(0),
        }
    }

    /// The current snapshot, or `None` until the first successful publish.
    #[inline]
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }

    /// Build and publish a new version. On error the previous snapshot stays
    /// in place.
    ///
    /// Data read at an older store revision than the one being served is not
    /// published; the current snapshot is returned instead.
    pub fn publish(&self, data: ConfigData) -> Result<Arc<Snapshot>, PublishError> {
        let mut last_version = self.publish_lock.lock();
        let revision = data.revision;
        if let Some(current) = self.current() {
            if revision < current.revision() {
                tracing::debug!(
                    revision,
                    current = current.revision(),
                    "skipping publish of an older revision"
                );
                return Ok(current);
            }
        }
        let version = *last_version + 1;

        let snapshot = match Snapshot::build(version, data) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::error!(revision, error = %e, "rejected configuration publish");
                return Err(e);
            }
        };

        *self.current.write() = Some(snapshot.clone());
        *last_version = version;

        let summary = snapshot.summary();
        tracing::info!(
            version,
            revision,
            features = summary.features,
            environments = summary.environments,
            "published configuration snapshot"
        );
        Ok(snapshot)
    }

    /// Reload from the database and publish when the stored revision moved
    /// past the current snapshot's. Returns the snapshot now being served.
    pub fn refresh(&self, db: &Database) -> anyhow::Result<Arc<Snapshot>> {
        if let Some(current) = self.current() {
            if db.config_revision()? == current.revision() {
                return Ok(current);
            }
        }
        let data = db.load_config()?;
        Ok(self.publish(data)?)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
