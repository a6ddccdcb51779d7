//! Dataset/Snapshot Naming & Layout
//!
//! Maps framework volume and snapshot identifiers onto appliance dataset
//! paths. Every mapping is a pure function of its inputs: the identifier is
//! embedded verbatim behind a fixed prefix, so distinct identifiers can never
//! produce the same path.

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Prefix for volume datasets
pub const VOLUME_PREFIX: &str = "volume-";

/// Prefix for user snapshots
pub const SNAPSHOT_PREFIX: &str = "snapshot-";

/// Prefix for driver-owned clone snapshots
pub const CLONE_SNAPSHOT_PREFIX: &str = "clone-";

/// Prefix for full-copy transfer snapshots
pub const TRANSFER_SNAPSHOT_PREFIX: &str = "fullcopy-";

/// ZFS limit on the length of a full dataset or snapshot name
pub const MAX_DATASET_NAME_LEN: usize = 255;

// =============================================================================
// Dataset Layout
// =============================================================================

/// Deterministic layout of driver datasets under a parent filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    parent: String,
}

impl DatasetLayout {
    /// Create a layout rooted at `parent` (e.g. `tank/cinder`)
    pub fn new(parent: impl Into<String>) -> Result<Self> {
        let parent = parent.into();
        let trimmed = parent.trim_matches('/');

        if trimmed.is_empty() {
            return Err(Error::InvalidIdentifier {
                value: parent.clone(),
                reason: "dataset parent must not be empty".into(),
            });
        }

        for component in trimmed.split('/') {
            validate_component(component).map_err(|reason| Error::InvalidIdentifier {
                value: parent.clone(),
                reason: format!("invalid dataset component {:?}: {}", component, reason),
            })?;
        }

        Ok(Self {
            parent: trimmed.to_string(),
        })
    }

    /// Parent filesystem all volumes live under
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Dataset path for a volume
    pub fn volume_path(&self, volume_id: &str) -> Result<String> {
        check_identifier(volume_id)?;
        let path = format!("{}/{}{}", self.parent, VOLUME_PREFIX, volume_id);
        check_length(path)
    }

    /// Snapshot name (the part after `@`) for a user snapshot
    pub fn snapshot_name(&self, snapshot_id: &str) -> Result<String> {
        check_identifier(snapshot_id)?;
        Ok(format!("{}{}", SNAPSHOT_PREFIX, snapshot_id))
    }

    /// Full snapshot path for a user snapshot of a volume
    pub fn snapshot_path(&self, volume_id: &str, snapshot_id: &str) -> Result<String> {
        let dataset = self.volume_path(volume_id)?;
        let name = self.snapshot_name(snapshot_id)?;
        check_length(join_snapshot(&dataset, &name))
    }

    /// Full path of a driver-owned snapshot (clone or transfer base) of `dataset`
    pub fn owned_snapshot_path(&self, dataset: &str, snapshot_name: &str) -> Result<String> {
        check_length(join_snapshot(dataset, snapshot_name))
    }

    /// Snapshot name used when cloning a volume or image for `clone_volume_id`
    pub fn clone_snapshot_name(&self, clone_volume_id: &str) -> Result<String> {
        check_identifier(clone_volume_id)?;
        Ok(format!("{}{}", CLONE_SNAPSHOT_PREFIX, clone_volume_id))
    }

    /// Snapshot name used as the send/receive base for a full copy
    pub fn transfer_snapshot_name(&self, target_volume_id: &str) -> Result<String> {
        check_identifier(target_volume_id)?;
        Ok(format!("{}{}", TRANSFER_SNAPSHOT_PREFIX, target_volume_id))
    }

    /// iSCSI target/extent name for a volume
    ///
    /// IQN names only allow lowercase letters, digits, `-`, `.` and `:`.
    pub fn export_name(&self, volume_id: &str) -> Result<String> {
        check_identifier(volume_id)?;
        if let Some(bad) = volume_id
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | ':')))
        {
            return Err(Error::InvalidIdentifier {
                value: volume_id.to_string(),
                reason: format!("character {:?} is not allowed in an iSCSI name", bad),
            });
        }
        Ok(format!("{}{}", VOLUME_PREFIX, volume_id))
    }

    /// Recover the volume id from a dataset path produced by [`volume_path`]
    ///
    /// [`volume_path`]: DatasetLayout::volume_path
    pub fn parse_volume_id<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.parent.as_str())?.strip_prefix('/')?;
        let id = rest.strip_prefix(VOLUME_PREFIX)?;
        if check_identifier(id).is_ok() {
            Some(id)
        } else {
            None
        }
    }
}

fn join_snapshot(dataset: &str, snapshot_name: &str) -> String {
    format!("{}@{}", dataset, snapshot_name)
}

/// Split a snapshot path into dataset and snapshot name
pub fn split_snapshot(path: &str) -> Option<(&str, &str)> {
    path.split_once('@')
}

// =============================================================================
// Validation
// =============================================================================

fn check_identifier(id: &str) -> Result<()> {
    validate_component(id).map_err(|reason| Error::InvalidIdentifier {
        value: id.to_string(),
        reason: reason.to_string(),
    })
}

fn check_length(path: String) -> Result<String> {
    if path.len() > MAX_DATASET_NAME_LEN {
        return Err(Error::InvalidIdentifier {
            reason: format!(
                "resulting name is {} bytes, limit is {}",
                path.len(),
                MAX_DATASET_NAME_LEN
            ),
            value: path,
        });
    }
    Ok(path)
}

fn validate_component(component: &str) -> std::result::Result<(), &'static str> {
    if component.is_empty() {
        return Err("must not be empty");
    }
    if component == "." || component == ".." {
        return Err("must not be a relative path element");
    }
    if !component
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err("only ASCII letters, digits, '-', '_', '.' and ':' are allowed");
    }
    Ok(())
}
