//! Appliance API objects
//!
//! Typed views of the JSON documents returned by the management API.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

// =============================================================================
// Property Values
// =============================================================================

/// ZFS property as reported by the API (`{"value": "10G", "rawvalue": "10737418240"}`)
#[derive(Debug, Clone, Default, Deserialize)]
struct PropertyValue {
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    rawvalue: Option<Value>,
    #[serde(default)]
    parsed: Option<Value>,
}

impl PropertyValue {
    fn as_u64(&self) -> Option<u64> {
        [&self.rawvalue, &self.parsed, &self.value]
            .into_iter()
            .flatten()
            .find_map(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
    }

    fn as_string(&self) -> Option<String> {
        [&self.value, &self.rawvalue]
            .into_iter()
            .flatten()
            .find_map(|v| v.as_str().map(|s| s.to_string()))
            .filter(|s| !s.is_empty() && s != "-")
    }
}

// =============================================================================
// Datasets
// =============================================================================

/// Dataset type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetType {
    Filesystem,
    Volume,
}

#[derive(Debug, Deserialize)]
struct RawDataset {
    id: String,
    #[serde(rename = "type")]
    dataset_type: String,
    #[serde(default)]
    volsize: Option<PropertyValue>,
    #[serde(default)]
    used: Option<PropertyValue>,
    #[serde(default)]
    available: Option<PropertyValue>,
    #[serde(default)]
    origin: Option<PropertyValue>,
    #[serde(default)]
    refreservation: Option<PropertyValue>,
}

/// A dataset (filesystem or zvol)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub id: String,
    pub dataset_type: DatasetType,
    /// Size in bytes for zvols
    pub volsize: Option<u64>,
    pub used: u64,
    pub available: u64,
    /// Origin snapshot for clones
    pub origin: Option<String>,
    pub refreservation: Option<u64>,
}

impl Dataset {
    pub fn from_value(value: &Value) -> Result<Self> {
        let raw: RawDataset = serde_json::from_value(value.clone())?;
        let dataset_type = match raw.dataset_type.as_str() {
            "VOLUME" => DatasetType::Volume,
            "FILESYSTEM" => DatasetType::Filesystem,
            other => {
                return Err(Error::Internal(format!(
                    "unknown dataset type {} for dataset {}",
                    other, raw.id
                )))
            }
        };

        Ok(Self {
            id: raw.id,
            dataset_type,
            volsize: raw.volsize.as_ref().and_then(PropertyValue::as_u64),
            used: raw.used.as_ref().and_then(PropertyValue::as_u64).unwrap_or(0),
            available: raw
                .available
                .as_ref()
                .and_then(PropertyValue::as_u64)
                .unwrap_or(0),
            origin: raw.origin.as_ref().and_then(PropertyValue::as_string),
            refreservation: raw.refreservation.as_ref().and_then(PropertyValue::as_u64),
        })
    }

    /// A zvol without a reservation is sparse
    pub fn is_sparse(&self) -> bool {
        self.refreservation.unwrap_or(0) == 0
    }

    /// Capacity seen by consumers of this dataset
    pub fn total_bytes(&self) -> u64 {
        self.used.saturating_add(self.available)
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// A ZFS snapshot
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SnapshotInfo {
    /// Full name (`dataset@snapshot`)
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub snapshot_name: String,
}

impl SnapshotInfo {
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// State of an appliance job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Aborted)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct JobProgress {
    #[serde(default)]
    percent: Option<f64>,
    #[serde(default)]
    description: Option<String>,
}

/// An appliance job, e.g. a replication run
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: u64,
    pub state: JobState,
    #[serde(default)]
    progress: Option<JobProgress>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Parse the response of `core/get_jobs?id=N`, which is a list
    pub fn from_query_result(value: &Value, id: u64) -> Result<Self> {
        let jobs: Vec<Job> = serde_json::from_value(value.clone())?;
        jobs.into_iter()
            .find(|job| job.id == id)
            .ok_or_else(|| Error::NotFound {
                kind: "Job".into(),
                id: id.to_string(),
            })
    }

    pub fn percent(&self) -> Option<f64> {
        self.progress.as_ref().and_then(|p| p.percent)
    }

    pub fn description(&self) -> Option<&str> {
        self.progress.as_ref().and_then(|p| p.description.as_deref())
    }
}

/// Parse a job id returned by a job-starting call
pub fn parse_job_id(value: &Value) -> Result<u64> {
    value
        .as_u64()
        .or_else(|| value.get("id").and_then(Value::as_u64))
        .ok_or_else(|| Error::Internal(format!("expected job id, got {}", value)))
}

// =============================================================================
// iSCSI
// =============================================================================

/// Global iSCSI settings
#[derive(Debug, Clone, Deserialize)]
pub struct IscsiGlobal {
    #[serde(default)]
    pub id: u64,
    pub basename: String,
}

/// One listen address of a portal
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortalListen {
    pub ip: IpAddr,
    #[serde(default = "default_iscsi_port")]
    pub port: u16,
}

fn default_iscsi_port() -> u16 {
    3260
}

/// An iSCSI portal
#[derive(Debug, Clone, Deserialize)]
pub struct IscsiPortal {
    pub id: u64,
    pub listen: Vec<PortalListen>,
}

/// Object with a numeric id, as returned by iSCSI create calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ObjectId {
    pub id: u64,
}

/// Parse any JSON document into a typed object
pub fn parse<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    Ok(serde_json::from_value(value.clone())?)
}

// =============================================================================
// Error Bodies
// =============================================================================

/// Extract a human readable message from an error response body.
///
/// The API reports validation failures as `{"field": [{"message": ...}]}`
/// and call failures as `{"message": ...}`.
pub fn error_message(body: &str) -> String {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return body.trim().to_string(),
    };

    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return message.to_string();
    }

    let mut messages = Vec::new();
    if let Value::Object(fields) = &value {
        for entries in fields.values() {
            if let Value::Array(entries) = entries {
                messages.extend(
                    entries
                        .iter()
                        .filter_map(|e| e.get("message").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }
        }
    }

    if messages.is_empty() {
        match value {
            Value::String(s) => s,
            other => other.to_string(),
        }
    } else {
        messages.join("; ")
    }
}
