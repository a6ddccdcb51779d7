//! Driver Data Model
//!
//! Volumes, snapshots and the request/response types exchanged with the
//! host framework.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bytes in one GiB, the framework's size unit
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Convert a framework size to bytes
pub fn gib_to_bytes(size_gib: u64) -> u64 {
    size_gib.saturating_mul(GIB)
}

/// Convert bytes to whole GiB, rounding up
pub fn bytes_to_gib(bytes: u64) -> u64 {
    bytes / GIB + u64::from(bytes % GIB != 0)
}

// =============================================================================
// Provisioning
// =============================================================================

/// Allocation mode of a zvol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningMode {
    /// Sparse zvol, space allocated on write
    Thin,
    /// Space reserved up front
    Thick,
}

impl ProvisioningMode {
    pub fn is_sparse(&self) -> bool {
        matches!(self, ProvisioningMode::Thin)
    }
}

impl std::fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningMode::Thin => write!(f, "thin"),
            ProvisioningMode::Thick => write!(f, "thick"),
        }
    }
}

// =============================================================================
// States
// =============================================================================

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Extending,
    Deleting,
    Error,
    Deleted,
}

impl VolumeState {
    /// States in which the volume's dataset can be read from
    pub fn is_settled(&self) -> bool {
        matches!(self, VolumeState::Available | VolumeState::InUse)
    }

    /// Whether the volume still owns (or will own) an appliance dataset
    pub fn is_live(&self) -> bool {
        !matches!(self, VolumeState::Deleted)
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Creating => write!(f, "creating"),
            VolumeState::Available => write!(f, "available"),
            VolumeState::InUse => write!(f, "in-use"),
            VolumeState::Extending => write!(f, "extending"),
            VolumeState::Deleting => write!(f, "deleting"),
            VolumeState::Error => write!(f, "error"),
            VolumeState::Deleted => write!(f, "deleted"),
        }
    }
}

/// Lifecycle state of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotState {
    Creating,
    Available,
    Deleting,
    Error,
    Deleted,
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotState::Creating => write!(f, "creating"),
            SnapshotState::Available => write!(f, "available"),
            SnapshotState::Deleting => write!(f, "deleting"),
            SnapshotState::Error => write!(f, "error"),
            SnapshotState::Deleted => write!(f, "deleted"),
        }
    }
}

// =============================================================================
// Volumes
// =============================================================================

/// Where a volume's contents came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeOrigin {
    /// Empty zvol
    Blank,
    /// Copy-on-write clone of a user snapshot
    Snapshot {
        snapshot_id: Option<String>,
        snapshot_path: String,
    },
    /// Copy-on-write clone of a driver-owned snapshot of another volume
    Clone {
        source_volume_id: String,
        snapshot_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_id: Option<String>,
    },
    /// Independent copy produced by send/receive
    FullCopy {
        source_volume_id: String,
        source_path: String,
    },
    /// Pre-existing zvol adopted by the driver
    Managed { source_name: String },
}

impl VolumeOrigin {
    /// Snapshot this volume's dataset depends on, if it is a copy-on-write clone
    pub fn cow_snapshot(&self) -> Option<&str> {
        match self {
            VolumeOrigin::Snapshot { snapshot_path, .. }
            | VolumeOrigin::Clone { snapshot_path, .. } => Some(snapshot_path),
            _ => None,
        }
    }

    /// Driver-owned snapshot to clean up once this volume is gone
    pub fn owned_snapshot(&self) -> Option<&str> {
        match self {
            VolumeOrigin::Clone { snapshot_path, .. } => Some(snapshot_path),
            _ => None,
        }
    }
}

/// iSCSI export of an attached volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub target_id: u64,
    pub extent_id: u64,
    pub target_extent_id: u64,
    pub target_iqn: String,
    pub target_portal: String,
}

/// State of a replication transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Running,
    Succeeded,
    Failed,
}

/// Progress of a full-copy transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub job_id: u64,
    pub state: TransferState,
    pub progress_percent: Option<f64>,
    pub message: Option<String>,
}

/// A block volume backed by a zvol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub dataset_path: String,
    pub size_gib: u64,
    pub provisioning: ProvisioningMode,
    pub state: VolumeState,
    pub origin: VolumeOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Volume {
    pub fn new(
        id: impl Into<String>,
        dataset_path: impl Into<String>,
        size_gib: u64,
        provisioning: ProvisioningMode,
        origin: VolumeOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            dataset_path: dataset_path.into(),
            size_gib,
            provisioning,
            state: VolumeState::Creating,
            origin,
            export: None,
            transfer: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to a new state, bumping `updated_at`
    pub fn transition(&mut self, state: VolumeState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// A point-in-time snapshot of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Volume the snapshot was taken of
    pub volume_id: String,
    pub snapshot_path: String,
    pub size_gib: u64,
    pub state: SnapshotState,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn transition(&mut self, state: SnapshotState) {
        self.state = state;
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Request to create a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub id: String,
    pub size_gib: u64,
    /// Falls back to the configured default
    #[serde(default)]
    pub provisioning: Option<ProvisioningMode>,
}

impl VolumeSpec {
    pub fn new(id: impl Into<String>, size_gib: u64) -> Self {
        Self {
            id: id.into(),
            size_gib,
            provisioning: None,
        }
    }

    pub fn with_provisioning(mut self, provisioning: ProvisioningMode) -> Self {
        self.provisioning = Some(provisioning);
        self
    }
}

/// Request to create a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub id: String,
    pub volume_id: String,
}

/// Where an image's bits live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageLocation {
    /// Image cached in a volume on this appliance
    ApplianceVolume { volume_id: String },
    /// Image stored elsewhere
    External { url: String },
}

/// Image to clone a volume from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub disk_format: String,
    pub container_format: String,
    pub location: ImageLocation,
}

/// How to copy a source volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneMode {
    CopyOnWrite,
    FullCopy,
}

/// Initiator details passed with attach
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    #[serde(default)]
    pub initiator: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

/// Connection properties returned by attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    pub target_iqn: String,
    pub target_portal: String,
    pub target_lun: u32,
    pub volume_id: String,
    pub discard: bool,
}

/// Capacity report for the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub volume_backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: String,
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
    pub reserved_percentage: u8,
    pub thin_provisioning_support: bool,
    pub thick_provisioning_support: bool,
    pub online_extend_support: bool,
    pub multiattach: bool,
}
