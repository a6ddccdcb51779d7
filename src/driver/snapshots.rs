//! Snapshot & Clone Engine
//!
//! Snapshot creation and deletion, copy-on-write clones of user and
//! driver-owned snapshots, and full copies through one-time replication
//! jobs followed by a background poller.

use super::model::{
    Snapshot, SnapshotSpec, SnapshotState, TransferState, TransferStatus, Volume, VolumeOrigin,
    VolumeSpec, VolumeState,
};
use super::registry::{EntryRef, OpGuard};
use super::{DriverContext, ProvisioningMode};
use crate::appliance::objects::{parse_job_id, Job, JobState};
use crate::appliance::ApplianceCommand;
use crate::error::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Claim a source volume for reading without waiting on other operations
fn claim_source(entry: &EntryRef<Volume>, operation: &str) -> Result<(OpGuard, Volume)> {
    let busy = |volume: &Volume| Error::InvalidState {
        kind: "Volume".into(),
        id: volume.id.clone(),
        state: volume.state.to_string(),
        operation: operation.to_string(),
    };

    let guard = entry.try_lock().ok_or_else(|| busy(&entry.read()))?;
    let volume = entry.read();
    if volume.state == VolumeState::Deleted {
        return Err(Error::volume_not_found(&volume.id));
    }
    if !volume.state.is_settled() {
        return Err(busy(&volume));
    }
    Ok((guard, volume))
}

fn check_clone_size(requested_gib: u64, source_gib: u64) -> Result<()> {
    if requested_gib < source_gib {
        return Err(Error::InvalidSize {
            requested_gib,
            reason: format!("must be at least the source size of {} GiB", source_gib),
        });
    }
    Ok(())
}

// =============================================================================
// Snapshot Engine
// =============================================================================

/// Snapshot and clone operations
#[derive(Clone)]
pub struct SnapshotEngine {
    ctx: Arc<DriverContext>,
}

impl SnapshotEngine {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    /// Take a snapshot of a volume.
    ///
    /// Fails with an invalid-state error when the volume is mid-transition.
    pub async fn create_snapshot(&self, spec: SnapshotSpec) -> Result<Snapshot> {
        let path = self.ctx.layout.snapshot_path(&spec.volume_id, &spec.id)?;
        let volume_entry = self.ctx.require_volume(&spec.volume_id).await?;
        let (_volume_guard, volume) = claim_source(&volume_entry, "snapshot")?;

        let (entry, _guard) = self.ctx.snapshots.begin_create(
            &path,
            Snapshot {
                id: spec.id.clone(),
                volume_id: spec.volume_id.clone(),
                snapshot_path: path.clone(),
                size_gib: volume.size_gib,
                state: SnapshotState::Creating,
                created_at: Utc::now(),
            },
        )?;

        let name = self.ctx.layout.snapshot_name(&spec.id)?;
        let result = self
            .ctx
            .execute(ApplianceCommand::CreateSnapshot {
                dataset: volume.dataset_path.clone(),
                name,
            })
            .await;

        if let Err(e) = result {
            self.ctx.snapshots.remove(&path, &entry);
            return Err(e);
        }

        info!("Created snapshot {} of volume {}", path, spec.volume_id);
        Ok(entry.update(|s| {
            s.transition(SnapshotState::Available);
            s.clone()
        }))
    }

    /// Delete a snapshot. Missing snapshots succeed; snapshots with live
    /// copy-on-write clones fail with `SnapshotInUse`.
    pub async fn delete_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<()> {
        let Some(entry) = self.ctx.snapshot_entry(volume_id, snapshot_id).await? else {
            debug!("snapshot {} already gone", snapshot_id);
            return Ok(());
        };
        let _guard = entry.lock().await;

        let snapshot = entry.read();
        if snapshot.state == SnapshotState::Deleted {
            return Ok(());
        }
        if let Some(clone) = self.ctx.clones_of(&snapshot.snapshot_path) {
            debug!("snapshot {} still backs volume {}", snapshot.snapshot_path, clone.id);
            return Err(Error::SnapshotInUse {
                snapshot: snapshot.snapshot_path,
            });
        }

        let previous = snapshot.state;
        entry.update(|s| s.transition(SnapshotState::Deleting));

        match self.ctx.destroy_snapshot(&snapshot.snapshot_path).await {
            Ok(()) => {
                entry.update(|s| s.transition(SnapshotState::Deleted));
                self.ctx.snapshots.remove(&snapshot.snapshot_path, &entry);
                info!("Deleted snapshot {}", snapshot.snapshot_path);
                Ok(())
            }
            Err(e) => {
                let next = if e.is_recoverable() {
                    previous
                } else {
                    SnapshotState::Error
                };
                entry.update(|s| s.transition(next));
                Err(e)
            }
        }
    }

    /// Live snapshot record
    pub async fn get_snapshot(&self, volume_id: &str, snapshot_id: &str) -> Result<Snapshot> {
        self.ctx
            .snapshot_entry(volume_id, snapshot_id)
            .await?
            .map(|e| e.read())
            .filter(|s| s.state != SnapshotState::Deleted && s.volume_id == volume_id)
            .ok_or_else(|| Error::snapshot_not_found(snapshot_id))
    }

    // =========================================================================
    // Copy-on-Write Clones
    // =========================================================================

    /// Copy-on-write clone of a user snapshot
    pub async fn clone_snapshot(
        &self,
        spec: VolumeSpec,
        volume_id: &str,
        snapshot_id: &str,
    ) -> Result<Volume> {
        let target = self.ctx.layout.volume_path(&spec.id)?;
        let snapshot_entry = self
            .ctx
            .snapshot_entry(volume_id, snapshot_id)
            .await?
            .ok_or_else(|| Error::snapshot_not_found(snapshot_id))?;
        let _snapshot_guard = snapshot_entry.try_lock().ok_or_else(|| Error::InvalidState {
            kind: "Snapshot".into(),
            id: snapshot_id.to_string(),
            state: snapshot_entry.read().state.to_string(),
            operation: "clone".into(),
        })?;

        let snapshot = snapshot_entry.read();
        match snapshot.state {
            SnapshotState::Available => {}
            SnapshotState::Deleted => return Err(Error::snapshot_not_found(snapshot_id)),
            state => {
                return Err(Error::InvalidState {
                    kind: "Snapshot".into(),
                    id: snapshot_id.to_string(),
                    state: state.to_string(),
                    operation: "clone".into(),
                })
            }
        }
        check_clone_size(spec.size_gib, snapshot.size_gib)?;

        let origin = VolumeOrigin::Snapshot {
            snapshot_id: Some(snapshot.id.clone()),
            snapshot_path: snapshot.snapshot_path.clone(),
        };
        let (entry, _guard) = self.ctx.volumes.begin_create(
            &spec.id,
            Volume::new(&spec.id, &target, spec.size_gib, ProvisioningMode::Thin, origin),
        )?;

        match self.clone_into(&snapshot.snapshot_path, &target, spec.size_gib).await {
            Ok(()) => {
                info!("Cloned {} into {}", snapshot.snapshot_path, target);
                Ok(entry.update(|v| {
                    v.transition(VolumeState::Available);
                    v.clone()
                }))
            }
            Err(e) => {
                self.ctx.discard_dataset(&target).await;
                self.ctx.volumes.remove(&spec.id, &entry);
                Err(e)
            }
        }
    }

    /// Copy-on-write clone of a volume through a driver-owned snapshot
    pub async fn snapshot_then_clone(
        &self,
        spec: VolumeSpec,
        source_id: &str,
        image_id: Option<String>,
    ) -> Result<Volume> {
        let target = self.ctx.layout.volume_path(&spec.id)?;
        let snapshot_name = self.ctx.layout.clone_snapshot_name(&spec.id)?;
        let source_entry = self.ctx.require_volume(source_id).await?;
        let (_source_guard, source) = claim_source(&source_entry, "clone")?;
        check_clone_size(spec.size_gib, source.size_gib)?;

        let snapshot_path = self
            .ctx
            .layout
            .owned_snapshot_path(&source.dataset_path, &snapshot_name)?;
        let origin = VolumeOrigin::Clone {
            source_volume_id: source.id.clone(),
            snapshot_path: snapshot_path.clone(),
            image_id,
        };
        let (entry, _guard) = self.ctx.volumes.begin_create(
            &spec.id,
            Volume::new(&spec.id, &target, spec.size_gib, ProvisioningMode::Thin, origin),
        )?;

        let result = async {
            self.ctx
                .execute(ApplianceCommand::CreateSnapshot {
                    dataset: source.dataset_path.clone(),
                    name: snapshot_name.clone(),
                })
                .await?;
            self.clone_into(&snapshot_path, &target, spec.size_gib).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Cloned volume {} into {}", source.id, target);
                Ok(entry.update(|v| {
                    v.transition(VolumeState::Available);
                    v.clone()
                }))
            }
            Err(e) => {
                self.ctx.discard_dataset(&target).await;
                self.ctx.discard_snapshot(&snapshot_path).await;
                self.ctx.volumes.remove(&spec.id, &entry);
                Err(e)
            }
        }
    }

    async fn clone_into(&self, snapshot_path: &str, target: &str, size_gib: u64) -> Result<()> {
        self.ctx
            .execute(ApplianceCommand::CloneSnapshot {
                snapshot: snapshot_path.to_string(),
                dataset_dst: target.to_string(),
            })
            .await?;
        let dataset = self.ctx.wait_for_dataset(target).await?;
        self.ctx.grow_to(&dataset, size_gib).await
    }

    // =========================================================================
    // Full Copies
    // =========================================================================

    /// Start an independent copy of a volume.
    ///
    /// Returns the new volume in `creating`; a background task follows the
    /// replication job and settles the volume in `available` or `error`.
    /// The source stays claimed until then.
    pub async fn full_copy_clone(&self, spec: VolumeSpec, source_id: &str) -> Result<Volume> {
        let target = self.ctx.layout.volume_path(&spec.id)?;
        let snapshot_name = self.ctx.layout.transfer_snapshot_name(&spec.id)?;
        let source_entry = self.ctx.require_volume(source_id).await?;
        let (source_guard, source) = claim_source(&source_entry, "copy")?;
        check_clone_size(spec.size_gib, source.size_gib)?;
        let source_snapshot = self
            .ctx
            .layout
            .owned_snapshot_path(&source.dataset_path, &snapshot_name)?;
        let target_snapshot = self.ctx.layout.owned_snapshot_path(&target, &snapshot_name)?;

        let provisioning = spec
            .provisioning
            .unwrap_or(self.ctx.config.default_provisioning);
        let origin = VolumeOrigin::FullCopy {
            source_volume_id: source.id.clone(),
            source_path: source.dataset_path.clone(),
        };
        let (entry, guard) = self.ctx.volumes.begin_create(
            &spec.id,
            Volume::new(&spec.id, &target, spec.size_gib, provisioning, origin),
        )?;

        let started = async {
            self.ctx
                .execute(ApplianceCommand::CreateSnapshot {
                    dataset: source.dataset_path.clone(),
                    name: snapshot_name.clone(),
                })
                .await?;
            let value = self
                .ctx
                .execute(ApplianceCommand::StartReplication {
                    source_dataset: source.dataset_path.clone(),
                    target_dataset: target.clone(),
                    snapshot_name: snapshot_name.clone(),
                })
                .await?;
            parse_job_id(&value)
        }
        .await;

        let job_id = match started {
            Ok(job_id) => job_id,
            Err(e) => {
                self.ctx.discard_snapshot(&source_snapshot).await;
                self.ctx.volumes.remove(&spec.id, &entry);
                return Err(e);
            }
        };

        info!(
            "Started full copy of {} into {} (job {})",
            source.dataset_path, target, job_id
        );
        let volume = entry.update(|v| {
            v.transfer = Some(TransferStatus {
                job_id,
                state: TransferState::Running,
                progress_percent: Some(0.0),
                message: None,
            });
            v.clone()
        });

        let poller = TransferPoller {
            ctx: self.ctx.clone(),
            entry,
            job_id,
            source_snapshot,
            target_snapshot,
            target,
            size_gib: spec.size_gib,
        };
        tokio::spawn(poller.run(guard, source_guard));

        Ok(volume)
    }
}

// =============================================================================
// Transfer Poller
// =============================================================================

/// Follows one replication job to completion. Holds the serialization
/// tokens of both the target and the source volume until the target has
/// settled.
struct TransferPoller {
    ctx: Arc<DriverContext>,
    entry: EntryRef<Volume>,
    job_id: u64,
    source_snapshot: String,
    target_snapshot: String,
    target: String,
    size_gib: u64,
}

impl TransferPoller {
    async fn run(self, _target_guard: OpGuard, _source_guard: OpGuard) {
        let outcome = match self.wait_for_job().await {
            Ok(()) => self.finish().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!("Full copy into {} completed", self.target);
                self.entry.update(|v| {
                    if let Some(transfer) = v.transfer.as_mut() {
                        transfer.state = TransferState::Succeeded;
                        transfer.progress_percent = Some(100.0);
                    }
                    v.transition(VolumeState::Available);
                });
                self.ctx.metrics().record_operation("full_copy_transfer", &Ok(()));
            }
            Err(e) => {
                warn!("Full copy into {} failed: {}", self.target, e);
                self.ctx.discard_dataset(&self.target).await;
                self.ctx.discard_snapshot(&self.source_snapshot).await;
                self.entry.update(|v| {
                    if let Some(transfer) = v.transfer.as_mut() {
                        transfer.state = TransferState::Failed;
                        transfer.message = Some(e.to_string());
                    }
                    v.transition(VolumeState::Error);
                });
                self.ctx
                    .metrics()
                    .record_operation::<()>("full_copy_transfer", &Err(e));
            }
        }
    }

    async fn wait_for_job(&self) -> Result<()> {
        let transfer = &self.ctx.config.transfer;
        let mut failures = 0u32;

        loop {
            tokio::time::sleep(transfer.poll_interval()).await;

            let polled = self
                .ctx
                .execute(ApplianceCommand::GetJob { id: self.job_id })
                .await
                .and_then(|value| Job::from_query_result(&value, self.job_id));

            let job = match polled {
                Ok(job) => {
                    failures = 0;
                    job
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Polling job {} failed ({}/{}): {}",
                        self.job_id, failures, transfer.max_poll_failures, e
                    );
                    if failures >= transfer.max_poll_failures.max(1) {
                        return Err(e);
                    }
                    continue;
                }
            };

            self.entry.update(|v| {
                if let Some(status) = v.transfer.as_mut() {
                    status.progress_percent = job.percent();
                }
            });

            match job.state {
                JobState::Success => return Ok(()),
                JobState::Failed | JobState::Aborted => {
                    return Err(Error::Appliance {
                        operation: "replication.run_onetime".into(),
                        status: None,
                        message: job
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("job {} ended {:?}", self.job_id, job.state)),
                    })
                }
                JobState::Waiting | JobState::Running => {
                    debug!(
                        "job {} {:?}: {}",
                        self.job_id,
                        job.state,
                        job.description().unwrap_or("")
                    );
                }
            }
        }
    }

    /// Drop the transfer snapshots and apply any size increase
    async fn finish(&self) -> Result<()> {
        self.ctx.discard_snapshot(&self.source_snapshot).await;
        self.ctx.discard_snapshot(&self.target_snapshot).await;
        let dataset = self.ctx.wait_for_dataset(&self.target).await?;
        self.ctx.grow_to(&dataset, self.size_gib).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::{Fault, FaultRule, HttpMethod, SimulatorConfig};
    use crate::driver::model::GIB;
    use crate::driver::testing::{context, context_with};
    use crate::driver::VolumeManager;
    use assert_matches::assert_matches;
    use std::time::Duration;

    async fn setup() -> (VolumeManager, Arc<crate::appliance::InMemoryAppliance>) {
        setup_with(SimulatorConfig::default()).await
    }

    async fn setup_with(
        simulator: SimulatorConfig,
    ) -> (VolumeManager, Arc<crate::appliance::InMemoryAppliance>) {
        let (ctx, appliance) = context_with(simulator);
        let manager = VolumeManager::from_context(ctx);
        manager
            .create_volume(VolumeSpec::new("src", 2).with_provisioning(ProvisioningMode::Thin))
            .await
            .unwrap();
        (manager, appliance)
    }

    fn snapshot(id: &str) -> SnapshotSpec {
        SnapshotSpec {
            id: id.into(),
            volume_id: "src".into(),
        }
    }

    async fn settled(manager: &VolumeManager, id: &str) -> Volume {
        for _ in 0..500 {
            let volume = manager.get_volume(id).await.unwrap();
            if volume.state != VolumeState::Creating {
                return volume;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("volume {} never settled", id);
    }

    #[tokio::test]
    async fn test_create_and_delete_snapshot() {
        let (manager, appliance) = setup().await;
        let engine = manager.engine();

        let snap = engine.create_snapshot(snapshot("s1")).await.unwrap();
        assert_eq!(snap.state, SnapshotState::Available);
        assert_eq!(snap.snapshot_path, "tank/cinder/volume-src@snapshot-s1");
        assert!(appliance.snapshot_exists(&snap.snapshot_path));

        engine.delete_snapshot("src", "s1").await.unwrap();
        assert!(!appliance.snapshot_exists(&snap.snapshot_path));
        assert!(manager.context().snapshots.is_empty());
        // Second delete is a no-op.
        engine.delete_snapshot("src", "s1").await.unwrap();
        assert_matches!(engine.get_snapshot("src", "s1").await, Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_ids_are_scoped_to_their_volume() {
        let (manager, appliance) = setup().await;
        manager
            .create_volume(VolumeSpec::new("other", 2).with_provisioning(ProvisioningMode::Thin))
            .await
            .unwrap();
        let engine = manager.engine();

        engine.create_snapshot(snapshot("s1")).await.unwrap();
        let other = engine
            .create_snapshot(SnapshotSpec {
                id: "s1".into(),
                volume_id: "other".into(),
            })
            .await
            .unwrap();
        assert_eq!(other.snapshot_path, "tank/cinder/volume-other@snapshot-s1");

        let clone = engine
            .clone_snapshot(VolumeSpec::new("c1", 2), "other", "s1")
            .await
            .unwrap();
        assert_eq!(
            clone.origin.cow_snapshot(),
            Some("tank/cinder/volume-other@snapshot-s1")
        );
        manager.delete_volume("c1").await.unwrap();

        engine.delete_snapshot("other", "s1").await.unwrap();
        assert!(!appliance.snapshot_exists("tank/cinder/volume-other@snapshot-s1"));
        assert!(appliance.snapshot_exists("tank/cinder/volume-src@snapshot-s1"));
        assert_eq!(engine.get_snapshot("src", "s1").await.unwrap().volume_id, "src");
        assert_matches!(
            engine.get_snapshot("other", "s1").await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_snapshot_of_busy_volume_is_rejected() {
        let (manager, _) = setup().await;
        let entry = manager.context().volumes.get("src").unwrap();
        let _held = entry.lock().await;

        let result = manager.engine().create_snapshot(snapshot("s1")).await;
        let err = result.unwrap_err();
        assert_matches!(err, Error::InvalidState { .. });
        assert_eq!(err.kind(), crate::error::ErrorKind::Appliance);
    }

    #[tokio::test]
    async fn test_snapshot_of_errored_volume_is_rejected() {
        let (manager, _) = setup().await;
        let entry = manager.context().volumes.get("src").unwrap();
        entry.update(|v| v.transition(VolumeState::Error));

        assert_matches!(
            manager.engine().create_snapshot(snapshot("s1")).await,
            Err(Error::InvalidState { .. })
        );
    }

    #[tokio::test]
    async fn test_cow_clone_blocks_snapshot_deletion() {
        let (manager, appliance) = setup().await;
        let engine = manager.engine();
        engine.create_snapshot(snapshot("s1")).await.unwrap();

        let clone = engine
            .clone_snapshot(VolumeSpec::new("c1", 2), "src", "s1")
            .await
            .unwrap();
        assert_eq!(clone.state, VolumeState::Available);
        assert_eq!(
            appliance.dataset("tank/cinder/volume-c1").unwrap().origin.as_deref(),
            Some("tank/cinder/volume-src@snapshot-s1")
        );

        assert_matches!(
            engine.delete_snapshot("src", "s1").await,
            Err(Error::SnapshotInUse { .. })
        );
        assert_eq!(
            engine.get_snapshot("src", "s1").await.unwrap().state,
            SnapshotState::Available
        );

        manager.delete_volume("c1").await.unwrap();
        engine.delete_snapshot("src", "s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_from_snapshot_grows_to_requested_size() {
        let (manager, appliance) = setup().await;
        let engine = manager.engine();
        engine.create_snapshot(snapshot("s1")).await.unwrap();

        let clone = engine
            .clone_snapshot(VolumeSpec::new("c1", 5), "src", "s1")
            .await
            .unwrap();
        assert_eq!(clone.size_gib, 5);
        assert_eq!(appliance.dataset("tank/cinder/volume-c1").unwrap().volsize, 5 * GIB);

        assert_matches!(
            engine.clone_snapshot(VolumeSpec::new("c2", 1), "src", "s1").await,
            Err(Error::InvalidSize { .. })
        );
        assert!(appliance.dataset("tank/cinder/volume-c2").is_none());
    }

    #[tokio::test]
    async fn test_failed_clone_leaves_nothing_behind() {
        let (manager, appliance) = setup().await;
        appliance.inject(FaultRule::new(
            HttpMethod::Post,
            "zfs/snapshot/clone",
            Fault::Status(500, "clone failed".into()),
        ));

        let result = manager
            .engine()
            .snapshot_then_clone(VolumeSpec::new("c1", 2), "src", None)
            .await;
        assert_matches!(result, Err(Error::Appliance { .. }));
        assert!(appliance.dataset("tank/cinder/volume-c1").is_none());
        assert!(!appliance.snapshot_exists("tank/cinder/volume-src@clone-c1"));
        assert!(manager.context().volumes.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_full_copy_is_independent_of_source() {
        let (manager, appliance) = setup().await;
        let engine = manager.engine();
        engine.create_snapshot(snapshot("s1")).await.unwrap();

        let copy = engine
            .full_copy_clone(VolumeSpec::new("copy", 4), "src")
            .await
            .unwrap();
        assert_eq!(copy.state, VolumeState::Creating);
        assert_eq!(copy.transfer.as_ref().map(|t| t.state), Some(TransferState::Running));

        let copy = settled(&manager, "copy").await;
        assert_eq!(copy.state, VolumeState::Available);
        assert_eq!(copy.transfer.unwrap().state, TransferState::Succeeded);

        let dataset = appliance.dataset("tank/cinder/volume-copy").unwrap();
        assert_eq!(dataset.origin, None);
        assert_eq!(dataset.volsize, 4 * GIB);
        assert!(!appliance.snapshot_exists("tank/cinder/volume-src@fullcopy-copy"));
        assert!(!appliance.snapshot_exists("tank/cinder/volume-copy@fullcopy-copy"));

        // Neither the user snapshot nor the source volume is pinned by the copy.
        engine.delete_snapshot("src", "s1").await.unwrap();
        manager.delete_volume("src").await.unwrap();
        assert!(appliance.dataset("tank/cinder/volume-copy").is_some());
        manager.delete_volume("copy").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_full_copy_ends_in_error_without_target() {
        let (manager, appliance) = setup().await;
        appliance.fail_replication("target pool offline");

        manager
            .engine()
            .full_copy_clone(VolumeSpec::new("copy", 2), "src")
            .await
            .unwrap();
        let copy = settled(&manager, "copy").await;

        assert_eq!(copy.state, VolumeState::Error);
        let transfer = copy.transfer.unwrap();
        assert_eq!(transfer.state, TransferState::Failed);
        assert!(transfer.message.unwrap().contains("target pool offline"));
        assert!(appliance.dataset("tank/cinder/volume-copy").is_none());
        assert!(!appliance.snapshot_exists("tank/cinder/volume-src@fullcopy-copy"));

        manager.delete_volume("copy").await.unwrap();
    }

    #[tokio::test]
    async fn test_source_stays_claimed_until_copy_settles() {
        let (manager, appliance) = setup_with(SimulatorConfig {
            job_polls: 20,
            ..Default::default()
        })
        .await;

        manager
            .engine()
            .full_copy_clone(VolumeSpec::new("copy", 2), "src")
            .await
            .unwrap();
        assert_matches!(
            manager.engine().create_snapshot(snapshot("s1")).await,
            Err(Error::InvalidState { .. })
        );

        let deleting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.delete_volume("src").await }
        });

        let copy = settled(&manager, "copy").await;
        assert_eq!(copy.state, VolumeState::Available);
        deleting.await.unwrap().unwrap();

        assert!(appliance.dataset("tank/cinder/volume-src").is_none());
        assert_eq!(appliance.dataset("tank/cinder/volume-copy").unwrap().volsize, 2 * GIB);
    }

    #[tokio::test]
    async fn test_transfer_survives_transient_poll_failures() {
        let (manager, appliance) = setup().await;
        appliance.inject(FaultRule::new(HttpMethod::Get, "core/get_jobs", Fault::Transient).times(4));

        manager
            .engine()
            .full_copy_clone(VolumeSpec::new("copy", 2), "src")
            .await
            .unwrap();
        assert_eq!(settled(&manager, "copy").await.state, VolumeState::Available);
    }
}
