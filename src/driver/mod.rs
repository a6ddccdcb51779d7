//! Volume Driver
//!
//! Volume lifecycle, snapshots and clones, and iSCSI export on top of the
//! appliance session client.

pub mod export;
pub mod lifecycle;
pub mod model;
pub mod registry;
pub mod snapshots;

pub use export::ExportManager;
pub use lifecycle::VolumeManager;
pub use model::{
    BackendStats, CloneMode, ConnectionInfo, ConnectorInfo, ImageLocation, ImageRef,
    ProvisioningMode, Snapshot, SnapshotSpec, SnapshotState, Volume, VolumeOrigin, VolumeSpec,
    VolumeState,
};
pub use snapshots::SnapshotEngine;

use crate::appliance::objects::{Dataset, DatasetType};
use crate::appliance::{ApplianceCommand, ApplianceTransport, SessionClient, SessionConfig};
use crate::config::DriverConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::DriverMetrics;
use crate::naming::{split_snapshot, DatasetLayout};
use model::{bytes_to_gib, gib_to_bytes};
use registry::{EntityTable, EntryRef};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Driver Context
// =============================================================================

/// State shared by the manager, the snapshot engine, the export helper and
/// background transfer pollers
pub struct DriverContext {
    pub client: SessionClient,
    pub layout: DatasetLayout,
    pub config: DriverConfig,
    pub volumes: EntityTable<Volume>,
    pub snapshots: EntityTable<Snapshot>,
}

impl DriverContext {
    /// Build a context over any transport
    pub fn new(config: DriverConfig, transport: Arc<dyn ApplianceTransport>) -> Result<Self> {
        let layout = config.layout()?;
        let metrics = Arc::new(DriverMetrics::new()?);
        let client = SessionClient::new(
            transport,
            SessionConfig {
                credentials: config.appliance.credentials()?,
                retry: config.retry.clone(),
                token_ttl_secs: config.appliance.token_ttl_secs,
            },
            metrics,
        );

        Ok(Self {
            client,
            layout,
            config,
            volumes: EntityTable::new(),
            snapshots: EntityTable::new(),
        })
    }

    pub fn metrics(&self) -> &Arc<DriverMetrics> {
        self.client.metrics()
    }

    pub async fn execute(&self, command: ApplianceCommand) -> Result<Value> {
        self.client.execute(&command).await
    }

    // =========================================================================
    // Datasets
    // =========================================================================

    pub async fn get_dataset(&self, path: &str) -> Result<Dataset> {
        let value = self
            .execute(ApplianceCommand::GetDataset {
                id: path.to_string(),
            })
            .await?;
        Dataset::from_value(&value)
    }

    /// Like [`get_dataset`](Self::get_dataset), with a missing dataset as `None`
    pub async fn find_dataset(&self, path: &str) -> Result<Option<Dataset>> {
        match self.get_dataset(path).await {
            Ok(dataset) => Ok(Some(dataset)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll until a freshly created dataset is visible
    pub async fn wait_for_dataset(&self, path: &str) -> Result<Dataset> {
        let transfer = &self.config.transfer;
        for attempt in 1..=transfer.settle_attempts.max(1) {
            if let Some(dataset) = self.find_dataset(path).await? {
                return Ok(dataset);
            }
            debug!("waiting for dataset {} (attempt {})", path, attempt);
            tokio::time::sleep(transfer.settle_interval()).await;
        }
        Err(Error::Appliance {
            operation: "pool.dataset.get".into(),
            status: None,
            message: format!("dataset {} did not appear", path),
        })
    }

    /// Fail with `CapacityExceeded` unless the parent has `bytes` available
    pub async fn ensure_capacity(&self, bytes: u64) -> Result<()> {
        let parent = self.get_dataset(self.layout.parent()).await?;
        if parent.available < bytes {
            return Err(Error::CapacityExceeded(format!(
                "{} GiB requested, {} GiB available under {}",
                bytes_to_gib(bytes),
                parent.available / model::GIB,
                self.layout.parent()
            )));
        }
        Ok(())
    }

    /// Grow a zvol to `size_gib` unless it is already at least that large
    pub async fn grow_to(&self, dataset: &Dataset, size_gib: u64) -> Result<()> {
        let volsize = gib_to_bytes(size_gib);
        if dataset.volsize.map_or(true, |current| current < volsize) {
            self.execute(ApplianceCommand::ResizeZvol {
                id: dataset.id.clone(),
                volsize,
            })
            .await?;
        }
        Ok(())
    }

    /// Destroy a dataset; a missing dataset is success
    pub async fn destroy_dataset(&self, path: &str) -> Result<()> {
        match self
            .execute(ApplianceCommand::DeleteDataset {
                id: path.to_string(),
                recursive: true,
            })
            .await
        {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Destroy a snapshot; a missing snapshot is success
    pub async fn destroy_snapshot(&self, path: &str) -> Result<()> {
        match self
            .execute(ApplianceCommand::DeleteSnapshot {
                id: path.to_string(),
            })
            .await
        {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Remove a partially created dataset, logging instead of failing.
    /// A failed lookup still attempts the destroy.
    pub async fn discard_dataset(&self, path: &str) {
        match self.find_dataset(path).await {
            Ok(None) => return,
            Ok(Some(_)) => {}
            Err(e) => debug!("could not check for leftover dataset {}: {}", path, e),
        }
        if let Err(e) = self.destroy_dataset(path).await {
            warn!("failed to clean up dataset {}: {}", path, e);
        }
    }

    /// Remove a snapshot the driver created, logging instead of failing
    pub async fn discard_snapshot(&self, path: &str) {
        if let Err(e) = self.destroy_snapshot(path).await {
            warn!("failed to clean up snapshot {}: {}", path, e);
        }
    }

    // =========================================================================
    // Registry Lookups
    // =========================================================================

    /// Entry for a volume, adopting a driver-named zvol the registry does
    /// not know yet. `None` if neither knows the id.
    pub async fn volume_entry(&self, id: &str) -> Result<Option<EntryRef<Volume>>> {
        if let Some(entry) = self.volumes.get(id) {
            return Ok(Some(entry));
        }

        let path = self.layout.volume_path(id)?;
        let dataset = match self.find_dataset(&path).await? {
            Some(dataset) if dataset.dataset_type == DatasetType::Volume => dataset,
            _ => return Ok(None),
        };

        let origin = match dataset.origin.clone() {
            Some(snapshot_path) => VolumeOrigin::Snapshot {
                snapshot_id: None,
                snapshot_path,
            },
            None => VolumeOrigin::Blank,
        };
        let provisioning = if dataset.is_sparse() {
            ProvisioningMode::Thin
        } else {
            ProvisioningMode::Thick
        };
        let mut volume = Volume::new(
            id,
            path,
            bytes_to_gib(dataset.volsize.unwrap_or(0)),
            provisioning,
            origin,
        );
        volume.transition(VolumeState::Available);

        debug!("adopted volume {} from appliance", id);
        Ok(Some(self.volumes.insert_if_absent(id, volume)))
    }

    /// Like [`volume_entry`](Self::volume_entry), failing with `NotFound`
    pub async fn require_volume(&self, id: &str) -> Result<EntryRef<Volume>> {
        self.volume_entry(id)
            .await?
            .ok_or_else(|| Error::volume_not_found(id))
    }

    /// Entry for a snapshot, adopting one found on the appliance.
    /// Snapshots are registered under their full snapshot path.
    pub async fn snapshot_entry(
        &self,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<Option<EntryRef<Snapshot>>> {
        let path = self.layout.snapshot_path(volume_id, snapshot_id)?;
        if let Some(entry) = self.snapshots.get(&path) {
            return Ok(Some(entry));
        }

        match self
            .execute(ApplianceCommand::GetSnapshot { id: path.clone() })
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        let size_gib = self
            .volumes
            .get(volume_id)
            .map(|v| v.read().size_gib)
            .unwrap_or(0);
        let snapshot = Snapshot {
            id: snapshot_id.to_string(),
            volume_id: volume_id.to_string(),
            snapshot_path: path,
            size_gib,
            state: SnapshotState::Available,
            created_at: chrono::Utc::now(),
        };
        debug!("adopted snapshot {} from appliance", snapshot.snapshot_path);
        let key = snapshot.snapshot_path.clone();
        Ok(Some(self.snapshots.insert_if_absent(&key, snapshot)))
    }

    /// Live copy-on-write clones whose origin is `snapshot_path`
    pub fn clones_of(&self, snapshot_path: &str) -> Option<Volume> {
        self.volumes
            .find_live(|v| v.origin.cow_snapshot() == Some(snapshot_path))
    }

    /// A live copy-on-write clone of any snapshot of `dataset_path`
    pub fn clone_of_any_snapshot(&self, dataset_path: &str) -> Option<Volume> {
        self.volumes.find_live(|v| {
            v.origin
                .cow_snapshot()
                .and_then(split_snapshot)
                .map_or(false, |(dataset, _)| dataset == dataset_path)
        })
    }
}

/// Put a volume back into `previous` after a recoverable failure, or into
/// `error` otherwise
pub(crate) fn settle_failure(entry: &EntryRef<Volume>, previous: VolumeState, err: &Error) {
    let next = if err.is_recoverable() {
        previous
    } else {
        VolumeState::Error
    };
    entry.update(|v| v.transition(next));
}


#[cfg(test)]
mod tests {
    use super::testing::context;
    use super::*;

    #[tokio::test]
    async fn test_volume_entry_adopts_existing_zvol() {
        let (ctx, appliance) = context();
        appliance.insert_zvol("tank/cinder/volume-a", 3 * model::GIB);

        let entry = ctx.volume_entry("a").await.unwrap().unwrap();
        let volume = entry.read();
        assert_eq!(volume.size_gib, 3);
        assert_eq!(volume.state, VolumeState::Available);
        assert_eq!(volume.provisioning, ProvisioningMode::Thin);

        assert!(ctx.volume_entry("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_missing_dataset_is_success() {
        let (ctx, _) = context();
        ctx.destroy_dataset("tank/cinder/volume-none").await.unwrap();
        ctx.destroy_snapshot("tank/cinder/volume-none@snapshot-x").await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_capacity() {
        let (ctx, appliance) = context();
        appliance.set_capacity(4 * model::GIB);
        ctx.ensure_capacity(model::GIB).await.unwrap();
        assert!(matches!(
            ctx.ensure_capacity(8 * model::GIB).await,
            Err(Error::CapacityExceeded(_))
        ));
    }
}
