//! Appliance Commands
//!
//! Every management-API call the driver makes, with its wire mapping and
//! its retry classification.

use super::objects::Dataset;
use super::transport::{ApiRequest, HttpMethod};
use serde_json::{json, Value};

/// Percent-encode an identifier for use as a path segment
fn encode(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

/// Anchor a literal snapshot name as a replication `name_regex`
pub fn exact_name_regex(name: &str) -> String {
    let mut regex = String::with_capacity(name.len() + 2);
    regex.push('^');
    for c in name.chars() {
        if matches!(c, '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\') {
            regex.push('\\');
        }
        regex.push(c);
    }
    regex.push('$');
    regex
}

// =============================================================================
// Commands
// =============================================================================

/// A management-API command
#[derive(Debug, Clone, PartialEq)]
pub enum ApplianceCommand {
    GetDataset {
        id: String,
    },
    CreateZvol {
        name: String,
        volsize: u64,
        sparse: bool,
    },
    ResizeZvol {
        id: String,
        volsize: u64,
    },
    DeleteDataset {
        id: String,
        recursive: bool,
    },
    GetSnapshot {
        id: String,
    },
    CreateSnapshot {
        dataset: String,
        name: String,
    },
    DeleteSnapshot {
        id: String,
    },
    CloneSnapshot {
        snapshot: String,
        dataset_dst: String,
    },
    /// One-time local send/receive of a single snapshot into a new dataset
    StartReplication {
        source_dataset: String,
        target_dataset: String,
        snapshot_name: String,
    },
    GetJob {
        id: u64,
    },
    GetIscsiGlobal,
    GetIscsiPortal {
        id: u64,
    },
    CreateIscsiTarget {
        name: String,
        portal_id: u64,
    },
    DeleteIscsiTarget {
        id: u64,
    },
    CreateIscsiExtent {
        name: String,
        disk_path: String,
        block_size: u32,
    },
    DeleteIscsiExtent {
        id: u64,
    },
    CreateIscsiTargetExtent {
        target_id: u64,
        extent_id: u64,
    },
}

impl ApplianceCommand {
    /// Stable name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ApplianceCommand::GetDataset { .. } => "pool.dataset.get",
            ApplianceCommand::CreateZvol { .. } => "pool.dataset.create",
            ApplianceCommand::ResizeZvol { .. } => "pool.dataset.update",
            ApplianceCommand::DeleteDataset { .. } => "pool.dataset.delete",
            ApplianceCommand::GetSnapshot { .. } => "zfs.snapshot.get",
            ApplianceCommand::CreateSnapshot { .. } => "zfs.snapshot.create",
            ApplianceCommand::DeleteSnapshot { .. } => "zfs.snapshot.delete",
            ApplianceCommand::CloneSnapshot { .. } => "zfs.snapshot.clone",
            ApplianceCommand::StartReplication { .. } => "replication.run_onetime",
            ApplianceCommand::GetJob { .. } => "core.get_jobs",
            ApplianceCommand::GetIscsiGlobal => "iscsi.global.get",
            ApplianceCommand::GetIscsiPortal { .. } => "iscsi.portal.get",
            ApplianceCommand::CreateIscsiTarget { .. } => "iscsi.target.create",
            ApplianceCommand::DeleteIscsiTarget { .. } => "iscsi.target.delete",
            ApplianceCommand::CreateIscsiExtent { .. } => "iscsi.extent.create",
            ApplianceCommand::DeleteIscsiExtent { .. } => "iscsi.extent.delete",
            ApplianceCommand::CreateIscsiTargetExtent { .. } => "iscsi.targetextent.create",
        }
    }

    /// Wire request for this command
    pub fn to_request(&self) -> ApiRequest {
        match self {
            ApplianceCommand::GetDataset { id } => {
                ApiRequest::new(HttpMethod::Get, format!("pool/dataset/id/{}", encode(id)))
            }
            ApplianceCommand::CreateZvol {
                name,
                volsize,
                sparse,
            } => ApiRequest::new(HttpMethod::Post, "pool/dataset").with_body(json!({
                "name": name,
                "type": "VOLUME",
                "volsize": volsize,
                "sparse": sparse,
            })),
            ApplianceCommand::ResizeZvol { id, volsize } => {
                ApiRequest::new(HttpMethod::Put, format!("pool/dataset/id/{}", encode(id)))
                    .with_body(json!({ "volsize": volsize }))
            }
            ApplianceCommand::DeleteDataset { id, recursive } => {
                ApiRequest::new(HttpMethod::Delete, format!("pool/dataset/id/{}", encode(id)))
                    .with_body(json!({ "recursive": recursive }))
            }
            ApplianceCommand::GetSnapshot { id } => {
                ApiRequest::new(HttpMethod::Get, format!("zfs/snapshot/id/{}", encode(id)))
            }
            ApplianceCommand::CreateSnapshot { dataset, name } => {
                ApiRequest::new(HttpMethod::Post, "zfs/snapshot").with_body(json!({
                    "dataset": dataset,
                    "name": name,
                }))
            }
            ApplianceCommand::DeleteSnapshot { id } => {
                ApiRequest::new(HttpMethod::Delete, format!("zfs/snapshot/id/{}", encode(id)))
            }
            ApplianceCommand::CloneSnapshot {
                snapshot,
                dataset_dst,
            } => ApiRequest::new(HttpMethod::Post, "zfs/snapshot/clone").with_body(json!({
                "snapshot": snapshot,
                "dataset_dst": dataset_dst,
            })),
            ApplianceCommand::StartReplication {
                source_dataset,
                target_dataset,
                snapshot_name,
            } => ApiRequest::new(HttpMethod::Post, "replication/run_onetime").with_body(json!({
                "direction": "PUSH",
                "transport": "LOCAL",
                "source_datasets": [source_dataset],
                "target_dataset": target_dataset,
                "recursive": false,
                "name_regex": exact_name_regex(snapshot_name),
                "retention_policy": "NONE",
                "readonly": "IGNORE",
                "allow_from_scratch": true,
            })),
            ApplianceCommand::GetJob { id } => {
                ApiRequest::new(HttpMethod::Get, "core/get_jobs").with_query("id", id.to_string())
            }
            ApplianceCommand::GetIscsiGlobal => ApiRequest::new(HttpMethod::Get, "iscsi/global"),
            ApplianceCommand::GetIscsiPortal { id } => {
                ApiRequest::new(HttpMethod::Get, format!("iscsi/portal/id/{}", id))
            }
            ApplianceCommand::CreateIscsiTarget { name, portal_id } => {
                ApiRequest::new(HttpMethod::Post, "iscsi/target").with_body(json!({
                    "name": name,
                    "alias": null,
                    "mode": "ISCSI",
                    "groups": [{
                        "portal": portal_id,
                        "initiator": null,
                        "auth": null,
                        "authmethod": "NONE",
                    }],
                }))
            }
            ApplianceCommand::DeleteIscsiTarget { id } => {
                ApiRequest::new(HttpMethod::Delete, format!("iscsi/target/id/{}", id))
            }
            ApplianceCommand::CreateIscsiExtent {
                name,
                disk_path,
                block_size,
            } => ApiRequest::new(HttpMethod::Post, "iscsi/extent").with_body(json!({
                "name": name,
                "type": "DISK",
                "blocksize": block_size,
                "enabled": true,
                "disk": format!("zvol/{}", disk_path),
            })),
            ApplianceCommand::DeleteIscsiExtent { id } => {
                ApiRequest::new(HttpMethod::Delete, format!("iscsi/extent/id/{}", id))
            }
            ApplianceCommand::CreateIscsiTargetExtent {
                target_id,
                extent_id,
            } => ApiRequest::new(HttpMethod::Post, "iscsi/targetextent").with_body(json!({
                "target": target_id,
                "extent": extent_id,
            })),
        }
    }

    /// Whether re-issuing the command after an unknown outcome is harmless.
    ///
    /// Reads are idempotent, resize sets an absolute size, and deletes are
    /// idempotent once "not found" is treated as success by the caller.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            ApplianceCommand::GetDataset { .. }
                | ApplianceCommand::ResizeZvol { .. }
                | ApplianceCommand::DeleteDataset { .. }
                | ApplianceCommand::GetSnapshot { .. }
                | ApplianceCommand::DeleteSnapshot { .. }
                | ApplianceCommand::GetJob { .. }
                | ApplianceCommand::GetIscsiGlobal
                | ApplianceCommand::GetIscsiPortal { .. }
                | ApplianceCommand::DeleteIscsiTarget { .. }
                | ApplianceCommand::DeleteIscsiExtent { .. }
        )
    }

    /// Read-only query that tells whether this non-idempotent command already
    /// took effect. Commands without a probe are never retried.
    pub fn confirmation_probe(&self) -> Option<ApplianceCommand> {
        match self {
            ApplianceCommand::CreateZvol { name, .. } => {
                Some(ApplianceCommand::GetDataset { id: name.clone() })
            }
            ApplianceCommand::CreateSnapshot { dataset, name } => {
                Some(ApplianceCommand::GetSnapshot {
                    id: format!("{}@{}", dataset, name),
                })
            }
            ApplianceCommand::CloneSnapshot { dataset_dst, .. } => {
                Some(ApplianceCommand::GetDataset {
                    id: dataset_dst.clone(),
                })
            }
            _ => None,
        }
    }

    /// Whether the probe result shows the desired state was reached
    pub fn confirmed_by(&self, observed: &Value) -> bool {
        match self {
            ApplianceCommand::CreateZvol { volsize, .. } => Dataset::from_value(observed)
                .map(|d| d.volsize.map_or(false, |size| size >= *volsize))
                .unwrap_or(false),
            ApplianceCommand::CreateSnapshot { .. } => !observed.is_null(),
            ApplianceCommand::CloneSnapshot { snapshot, .. } => Dataset::from_value(observed)
                .map(|d| d.origin.as_deref() == Some(snapshot.as_str()))
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl std::fmt::Display for ApplianceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
