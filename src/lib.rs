//! TrueNAS Volume Driver
//!
//! Block volume driver for ZFS-based TrueNAS appliances. Volumes are zvols
//! under a configured parent dataset, snapshots are ZFS snapshots, clones
//! are either copy-on-write ZFS clones or full replication copies, and
//! volumes are exported to hosts over iSCSI.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                REST API (axum) / Rust API                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │                     VolumeManager                            │
//! │   ┌──────────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │   │  SnapshotEngine  │  │ ExportManager│  │ EntityTables  │  │
//! │   │ (CoW/full copy)  │  │   (iSCSI)    │  │ (per-id locks)│  │
//! │   └────────┬─────────┘  └──────┬───────┘  └───────────────┘  │
//! │            └───────────┬───────┘                             │
//! │                 ┌──────┴────────┐     ┌──────────────────┐   │
//! │                 │ SessionClient │────▶│ DatasetLayout    │   │
//! │                 │ (auth, retry) │     │ (naming)         │   │
//! │                 └──────┬────────┘     └──────────────────┘   │
//! ├────────────────────────┴─────────────────────────────────────┤
//! │        ApplianceTransport: HttpTransport | InMemoryAppliance │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`appliance`]: Session client, wire commands and transports
//! - [`driver`]: Volume lifecycle, snapshots, clones and exports
//! - [`naming`]: Deterministic dataset and snapshot paths
//! - [`api`]: REST API server
//! - [`config`]: Driver configuration
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod api;
pub mod appliance;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod naming;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use appliance::{
    ApplianceCommand, ApplianceTransport, Credentials, HttpTransport, InMemoryAppliance,
    SessionClient, SimulatorConfig,
};

pub use config::{ApplianceConfig, DriverConfig, IscsiConfig, RetryConfig, TransferConfig};

pub use driver::{
    BackendStats, CloneMode, ConnectionInfo, ConnectorInfo, ImageLocation, ImageRef,
    ProvisioningMode, Snapshot, SnapshotSpec, SnapshotState, Volume, VolumeManager, VolumeOrigin,
    VolumeSpec, VolumeState,
};

pub use error::{Error, ErrorKind, Result};

pub use metrics::DriverMetrics;

pub use naming::DatasetLayout;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
