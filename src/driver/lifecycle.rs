//! Volume Lifecycle Manager
//!
//! Entry point for the host framework. Drives each volume through
//! `creating -> available <-> in-use`, `available -> extending -> available`
//! and `available|error -> deleting -> deleted`, delegating snapshot and
//! clone work to the [`SnapshotEngine`] and exports to the
//! [`ExportManager`].

use super::export::ExportManager;
use super::model::{
    bytes_to_gib, gib_to_bytes, BackendStats, CloneMode, ConnectionInfo, ConnectorInfo,
    ImageLocation, ImageRef, ProvisioningMode, Snapshot, SnapshotSpec, SnapshotState, Volume,
    VolumeOrigin, VolumeSpec, VolumeState, GIB,
};
use super::snapshots::SnapshotEngine;
use super::{settle_failure, DriverContext};
use crate::appliance::objects::{Dataset, DatasetType};
use crate::appliance::{ApplianceCommand, ApplianceTransport, HttpTransport};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::metrics::DriverMetrics;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Vendor reported in capacity stats
pub const VENDOR_NAME: &str = "iXsystems";

/// Storage protocol reported in capacity stats
pub const STORAGE_PROTOCOL: &str = "iSCSI";

/// Image formats that can be cloned directly from an appliance volume
const CLONEABLE_DISK_FORMAT: &str = "raw";
const CLONEABLE_CONTAINER_FORMAT: &str = "bare";

// =============================================================================
// Volume Manager
// =============================================================================

/// Volume lifecycle manager
#[derive(Clone)]
pub struct VolumeManager {
    ctx: Arc<DriverContext>,
    engine: SnapshotEngine,
    exports: ExportManager,
}

impl VolumeManager {
    /// Create a manager over any transport
    pub fn new(config: DriverConfig, transport: Arc<dyn ApplianceTransport>) -> Result<Self> {
        Ok(Self::from_context(Arc::new(DriverContext::new(config, transport)?)))
    }

    /// Create a manager talking HTTPS to the configured appliance
    pub fn connect(config: DriverConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.appliance)?;
        info!("Using appliance API at {}", transport.base_url());
        Self::new(config, Arc::new(transport))
    }

    pub fn from_context(ctx: Arc<DriverContext>) -> Self {
        Self {
            engine: SnapshotEngine::new(ctx.clone()),
            exports: ExportManager::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    pub fn engine(&self) -> &SnapshotEngine {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<DriverMetrics> {
        self.ctx.metrics()
    }

    /// Run an operation and record its outcome
    async fn observe<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let result = fut.await;
        if let Err(e) = &result {
            debug!("{} failed: {}", operation, e);
        }
        self.metrics().record_operation(operation, &result);
        result
    }

    // =========================================================================
    // Setup & Stats
    // =========================================================================

    /// Verify the appliance is reachable and the parent dataset is usable
    pub async fn check_setup(&self) -> Result<()> {
        self.observe("check_setup", async {
            let parent = self.ctx.layout.parent();
            let dataset = self.ctx.find_dataset(parent).await?.ok_or_else(|| {
                Error::Configuration(format!("parent dataset {} does not exist", parent))
            })?;
            if dataset.dataset_type != DatasetType::Filesystem {
                return Err(Error::Configuration(format!(
                    "parent dataset {} is not a filesystem",
                    parent
                )));
            }
            info!("Parent dataset {} is ready", parent);
            Ok(())
        })
        .await
    }

    /// Capacity report for the scheduler
    pub async fn backend_stats(&self) -> Result<BackendStats> {
        self.observe("backend_stats", async {
            let parent = self.ctx.get_dataset(self.ctx.layout.parent()).await?;
            let gib = GIB as f64;
            Ok(BackendStats {
                volume_backend_name: self.ctx.config.backend_name.clone(),
                vendor_name: VENDOR_NAME.to_string(),
                driver_version: crate::VERSION.to_string(),
                storage_protocol: STORAGE_PROTOCOL.to_string(),
                total_capacity_gb: (parent.total_bytes() as f64 / gib * 100.0).round() / 100.0,
                free_capacity_gb: (parent.available as f64 / gib * 100.0).round() / 100.0,
                reserved_percentage: self.ctx.config.reserved_percentage,
                thin_provisioning_support: true,
                thick_provisioning_support: true,
                online_extend_support: true,
                multiattach: false,
            })
        })
        .await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current record of a volume
    pub async fn get_volume(&self, id: &str) -> Result<Volume> {
        self.ctx
            .volume_entry(id)
            .await?
            .map(|e| e.read())
            .filter(|v| v.state.is_live())
            .ok_or_else(|| Error::volume_not_found(id))
    }

    /// All live volumes known to this driver, ordered by id
    pub fn list_volumes(&self) -> Vec<Volume> {
        let mut volumes = self.ctx.volumes.live_records();
        volumes.sort_by(|a, b| a.id.cmp(&b.id));
        volumes
    }

    pub async fn get_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<Snapshot> {
        self.engine.get_snapshot(volume_id, snapshot_id).await
    }

    // =========================================================================
    // Create / Delete / Extend
    // =========================================================================

    /// Allocate a new zvol
    pub async fn create_volume(&self, spec: VolumeSpec) -> Result<Volume> {
        self.observe("create_volume", self.create_volume_inner(spec))
            .await
    }

    async fn create_volume_inner(&self, spec: VolumeSpec) -> Result<Volume> {
        if spec.size_gib == 0 {
            return Err(Error::InvalidSize {
                requested_gib: 0,
                reason: "must be at least 1 GiB".into(),
            });
        }
        let path = self.ctx.layout.volume_path(&spec.id)?;
        let provisioning = spec
            .provisioning
            .unwrap_or(self.ctx.config.default_provisioning);

        let (entry, _guard) = self.ctx.volumes.begin_create(
            &spec.id,
            Volume::new(&spec.id, &path, spec.size_gib, provisioning, VolumeOrigin::Blank),
        )?;

        let result = async {
            if self.ctx.find_dataset(&path).await?.is_some() {
                return Err(Error::AlreadyExists {
                    kind: "Dataset".into(),
                    id: path.clone(),
                });
            }
            if provisioning == ProvisioningMode::Thick {
                self.ctx.ensure_capacity(gib_to_bytes(spec.size_gib)).await?;
            }

            let created = async {
                self.ctx
                    .execute(ApplianceCommand::CreateZvol {
                        name: path.clone(),
                        volsize: gib_to_bytes(spec.size_gib),
                        sparse: provisioning.is_sparse(),
                    })
                    .await?;
                self.ctx.get_dataset(&path).await.map(|_| ())
            }
            .await;
            if created.is_err() {
                // The dataset may exist even though the call failed.
                self.ctx.discard_dataset(&path).await;
            }
            created
        }
        .await;

        match result {
            Ok(()) => {
                info!(
                    "Created {} volume {} ({} GiB)",
                    provisioning, path, spec.size_gib
                );
                Ok(entry.update(|v| {
                    v.transition(VolumeState::Available);
                    v.clone()
                }))
            }
            Err(e) => {
                self.ctx.volumes.remove(&spec.id, &entry);
                Err(e)
            }
        }
    }

    /// Destroy a volume and its snapshots.
    ///
    /// Unknown and already deleted volumes succeed. Fails with
    /// `SnapshotInUse` while a copy-on-write clone depends on one of the
    /// volume's snapshots.
    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        self.observe("delete_volume", self.delete_volume_inner(id))
            .await
    }

    async fn delete_volume_inner(&self, id: &str) -> Result<()> {
        let Some(entry) = self.ctx.volume_entry(id).await? else {
            debug!("volume {} already gone", id);
            return Ok(());
        };
        let _guard = entry.lock().await;

        let volume = entry.read();
        match volume.state {
            VolumeState::Deleted => return Ok(()),
            VolumeState::Available | VolumeState::Error => {}
            state => {
                return Err(Error::InvalidState {
                    kind: "Volume".into(),
                    id: id.to_string(),
                    state: state.to_string(),
                    operation: "delete".into(),
                })
            }
        }

        if let Some(clone) = self.ctx.clone_of_any_snapshot(&volume.dataset_path) {
            return Err(Error::SnapshotInUse {
                snapshot: clone
                    .origin
                    .cow_snapshot()
                    .unwrap_or(volume.dataset_path.as_str())
                    .to_string(),
            });
        }

        let previous = volume.state;
        entry.update(|v| v.transition(VolumeState::Deleting));

        if let Err(e) = self.ctx.destroy_dataset(&volume.dataset_path).await {
            settle_failure(&entry, previous, &e);
            return Err(e);
        }

        entry.update(|v| {
            v.export = None;
            v.transition(VolumeState::Deleted);
        });
        self.ctx.volumes.remove(id, &entry);
        self.ctx.snapshots.remove_matching(
            |s| s.volume_id == id,
            |s| s.transition(SnapshotState::Deleted),
        );
        info!("Deleted volume {}", volume.dataset_path);

        if let Some(snapshot) = volume.origin.owned_snapshot() {
            self.ctx.discard_snapshot(snapshot).await;
        }
        Ok(())
    }

    /// Grow a volume. The new size must exceed the current one.
    pub async fn extend_volume(&self, id: &str, new_size_gib: u64) -> Result<Volume> {
        self.observe("extend_volume", self.extend_volume_inner(id, new_size_gib))
            .await
    }

    async fn extend_volume_inner(&self, id: &str, new_size_gib: u64) -> Result<Volume> {
        let entry = self.ctx.require_volume(id).await?;
        let _guard = entry.lock().await;

        let volume = entry.read();
        match volume.state {
            VolumeState::Available | VolumeState::InUse => {}
            VolumeState::Deleted => return Err(Error::volume_not_found(id)),
            state => {
                return Err(Error::InvalidState {
                    kind: "Volume".into(),
                    id: id.to_string(),
                    state: state.to_string(),
                    operation: "extend".into(),
                })
            }
        }
        if new_size_gib <= volume.size_gib {
            return Err(Error::InvalidSize {
                requested_gib: new_size_gib,
                reason: format!("must exceed the current size of {} GiB", volume.size_gib),
            });
        }

        let previous = volume.state;
        entry.update(|v| v.transition(VolumeState::Extending));

        let result = async {
            if volume.provisioning == ProvisioningMode::Thick {
                self.ctx
                    .ensure_capacity(gib_to_bytes(new_size_gib - volume.size_gib))
                    .await?;
            }
            self.ctx
                .execute(ApplianceCommand::ResizeZvol {
                    id: volume.dataset_path.clone(),
                    volsize: gib_to_bytes(new_size_gib),
                })
                .await
        }
        .await;

        if let Err(e) = result {
            settle_failure(&entry, previous, &e);
            return Err(e);
        }

        info!(
            "Extended volume {} from {} GiB to {} GiB",
            id, volume.size_gib, new_size_gib
        );
        Ok(entry.update(|v| {
            v.size_gib = new_size_gib;
            v.transition(previous);
            v.clone()
        }))
    }

    // =========================================================================
    // Clones
    // =========================================================================

    /// Clone a volume from an image cached on the appliance
    pub async fn clone_from_image(&self, spec: VolumeSpec, image: &ImageRef) -> Result<Volume> {
        self.observe("clone_from_image", async {
            if image.disk_format != CLONEABLE_DISK_FORMAT
                || image.container_format != CLONEABLE_CONTAINER_FORMAT
            {
                return Err(Error::UnsupportedFormat {
                    image_id: image.id.clone(),
                    reason: format!(
                        "{}/{} images cannot be cloned, only {}/{}",
                        image.disk_format,
                        image.container_format,
                        CLONEABLE_DISK_FORMAT,
                        CLONEABLE_CONTAINER_FORMAT
                    ),
                });
            }
            let source = match &image.location {
                ImageLocation::ApplianceVolume { volume_id } => volume_id,
                ImageLocation::External { .. } => {
                    return Err(Error::UnsupportedFormat {
                        image_id: image.id.clone(),
                        reason: "image is not stored on this appliance".into(),
                    })
                }
            };
            self.engine
                .snapshot_then_clone(spec, source, Some(image.id.clone()))
                .await
        })
        .await
    }

    /// Copy-on-write clone of a user snapshot
    pub async fn create_volume_from_snapshot(
        &self,
        spec: VolumeSpec,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<Volume> {
        self.observe(
            "create_volume_from_snapshot",
            self.engine.clone_snapshot(spec, volume_id, snapshot_id),
        )
        .await
    }

    /// Clone another volume
    pub async fn clone_volume(&self, spec: VolumeSpec, source_id: &str, mode: CloneMode) -> Result<Volume> {
        self.observe("clone_volume", async {
            match mode {
                CloneMode::CopyOnWrite => self.engine.snapshot_then_clone(spec, source_id, None).await,
                CloneMode::FullCopy => self.engine.full_copy_clone(spec, source_id).await,
            }
        })
        .await
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub async fn create_snapshot(&self, spec: SnapshotSpec) -> Result<Snapshot> {
        self.observe("create_snapshot", self.engine.create_snapshot(spec))
            .await
    }

    pub async fn delete_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<()> {
        self.observe(
            "delete_snapshot",
            self.engine.delete_snapshot(volume_id, snapshot_id),
        )
        .await
    }

    // =========================================================================
    // Attach / Detach
    // =========================================================================

    pub async fn attach(&self, id: &str, connector: &ConnectorInfo) -> Result<ConnectionInfo> {
        self.observe("attach", self.exports.attach(id, connector))
            .await
    }

    pub async fn detach(&self, id: &str) -> Result<()> {
        self.observe("detach", self.exports.detach(id)).await
    }

    // =========================================================================
    // Manage / Unmanage
    // =========================================================================

    /// Resolve a reference to an existing zvol: a full dataset path, or a
    /// name relative to the parent dataset
    fn existing_path(&self, existing_name: &str) -> String {
        let name = existing_name.trim_matches('/');
        if name.contains('/') {
            name.to_string()
        } else {
            format!("{}/{}", self.ctx.layout.parent(), name)
        }
    }

    /// Look up an existing zvol and its size in whole GiB
    async fn existing_zvol(&self, existing_name: &str) -> Result<(Dataset, u64)> {
        let dataset = self.ctx.get_dataset(&self.existing_path(existing_name)).await?;
        match (dataset.dataset_type, dataset.volsize) {
            (DatasetType::Volume, Some(volsize)) => Ok((dataset, bytes_to_gib(volsize))),
            _ => Err(Error::InvalidIdentifier {
                value: existing_name.to_string(),
                reason: "not a zvol".into(),
            }),
        }
    }

    /// Size an existing zvol would be managed with, in whole GiB
    pub async fn manage_existing_get_size(&self, existing_name: &str) -> Result<u64> {
        self.existing_zvol(existing_name).await.map(|(_, size_gib)| size_gib)
    }

    /// Adopt an existing zvol under a new volume id, without renaming it
    pub async fn manage_existing(&self, id: &str, existing_name: &str) -> Result<Volume> {
        self.observe("manage_existing", async {
            self.ctx.layout.volume_path(id)?;
            let (dataset, size_gib) = self.existing_zvol(existing_name).await?;
            let path = dataset.id.clone();

            if let Some(owner) = self.ctx.volumes.find_live(|v| v.dataset_path == path) {
                return Err(Error::AlreadyExists {
                    kind: "Managed dataset".into(),
                    id: format!("{} (volume {})", path, owner.id),
                });
            }

            let provisioning = if dataset.is_sparse() {
                ProvisioningMode::Thin
            } else {
                ProvisioningMode::Thick
            };
            let origin = match dataset.origin {
                Some(snapshot_path) => VolumeOrigin::Snapshot {
                    snapshot_id: None,
                    snapshot_path,
                },
                None => VolumeOrigin::Managed {
                    source_name: existing_name.to_string(),
                },
            };
            let (entry, _guard) = self
                .ctx
                .volumes
                .begin_create(id, Volume::new(id, &path, size_gib, provisioning, origin))?;

            info!("Managing existing zvol {} as volume {}", path, id);
            Ok(entry.update(|v| {
                v.transition(VolumeState::Available);
                v.clone()
            }))
        })
        .await
    }

    /// Stop managing a volume, leaving its dataset untouched
    pub async fn unmanage(&self, id: &str) -> Result<()> {
        self.observe("unmanage", async {
            let entry = self.ctx.require_volume(id).await?;
            let _guard = entry.lock().await;

            let volume = entry.read();
            match volume.state {
                VolumeState::Available | VolumeState::Error => {}
                VolumeState::Deleted => return Err(Error::volume_not_found(id)),
                state => {
                    return Err(Error::InvalidState {
                        kind: "Volume".into(),
                        id: id.to_string(),
                        state: state.to_string(),
                        operation: "unmanage".into(),
                    })
                }
            }

            self.ctx.volumes.remove(id, &entry);
            info!("Unmanaged volume {} ({})", id, volume.dataset_path);
            Ok(())
        })
        .await
    }
}
