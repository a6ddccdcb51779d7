//! iSCSI Export
//!
//! Attach publishes a volume as an iSCSI target with a single extent at
//! LUN 0; detach removes both again.

use super::model::{ConnectionInfo, ConnectorInfo, ExportInfo, Volume, VolumeState};
use super::registry::EntryRef;
use super::DriverContext;
use crate::appliance::objects::{parse, IscsiGlobal, IscsiPortal, ObjectId};
use crate::appliance::ApplianceCommand;
use crate::error::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Connection type reported to initiators
pub const DRIVER_VOLUME_TYPE: &str = "iscsi";

fn connection_info(volume: &Volume, export: &ExportInfo) -> ConnectionInfo {
    ConnectionInfo {
        driver_volume_type: DRIVER_VOLUME_TYPE.to_string(),
        target_iqn: export.target_iqn.clone(),
        target_portal: export.target_portal.clone(),
        target_lun: 0,
        volume_id: volume.id.clone(),
        discard: false,
    }
}

/// iSCSI target/extent management
#[derive(Clone)]
pub struct ExportManager {
    ctx: Arc<DriverContext>,
}

impl ExportManager {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    /// Export a volume and return how to reach it
    pub async fn attach(&self, volume_id: &str, connector: &ConnectorInfo) -> Result<ConnectionInfo> {
        let name = self.ctx.layout.export_name(volume_id)?;
        let entry = self.ctx.require_volume(volume_id).await?;
        let _guard = entry.lock().await;

        let volume = entry.read();
        match (volume.state, &volume.export) {
            (VolumeState::Available, _) => {}
            (VolumeState::InUse, Some(export)) => return Ok(connection_info(&volume, export)),
            (VolumeState::Deleted, _) => return Err(Error::volume_not_found(volume_id)),
            (state, _) => {
                return Err(Error::InvalidState {
                    kind: "Volume".into(),
                    id: volume_id.to_string(),
                    state: state.to_string(),
                    operation: "attach".into(),
                })
            }
        }

        let export = self.publish(&name, &volume.dataset_path).await?;
        info!(
            "Exported volume {} as {} for {}",
            volume_id,
            export.target_iqn,
            connector.initiator.as_deref().unwrap_or("unknown initiator")
        );

        Ok(entry.update(|v| {
            v.export = Some(export.clone());
            v.transition(VolumeState::InUse);
            connection_info(v, &export)
        }))
    }

    /// Remove a volume's export. Volumes that are not exported succeed.
    pub async fn detach(&self, volume_id: &str) -> Result<()> {
        let Some(entry) = self.ctx.volume_entry(volume_id).await? else {
            return Ok(());
        };
        let _guard = entry.lock().await;
        self.unpublish(&entry).await
    }

    /// Remove the export of a volume whose token the caller holds
    pub(crate) async fn unpublish(&self, entry: &EntryRef<Volume>) -> Result<()> {
        let volume = entry.read();
        if let Some(export) = &volume.export {
            self.remove_target(export.target_id).await?;
            self.remove_extent(export.extent_id).await?;
            info!("Removed export of volume {}", volume.id);
        }

        entry.update(|v| {
            v.export = None;
            if v.state == VolumeState::InUse {
                v.transition(VolumeState::Available);
            }
        });
        Ok(())
    }

    /// Create target, extent and mapping, undoing earlier steps on failure
    async fn publish(&self, name: &str, dataset_path: &str) -> Result<ExportInfo> {
        let iscsi = &self.ctx.config.iscsi;
        let global: IscsiGlobal = parse(&self.ctx.execute(ApplianceCommand::GetIscsiGlobal).await?)?;
        let portal: IscsiPortal = parse(
            &self
                .ctx
                .execute(ApplianceCommand::GetIscsiPortal { id: iscsi.portal_id })
                .await?,
        )?;
        let target_portal = self.portal_address(&portal)?;

        let target: ObjectId = parse(
            &self
                .ctx
                .execute(ApplianceCommand::CreateIscsiTarget {
                    name: name.to_string(),
                    portal_id: iscsi.portal_id,
                })
                .await?,
        )?;

        let extent = self
            .ctx
            .execute(ApplianceCommand::CreateIscsiExtent {
                name: name.to_string(),
                disk_path: dataset_path.to_string(),
                block_size: iscsi.block_size,
            })
            .await
            .and_then(|value| parse::<ObjectId>(&value));
        let extent = match extent {
            Ok(extent) => extent,
            Err(e) => {
                self.rollback(Some(target.id), None).await;
                return Err(e);
            }
        };

        let mapping = self
            .ctx
            .execute(ApplianceCommand::CreateIscsiTargetExtent {
                target_id: target.id,
                extent_id: extent.id,
            })
            .await
            .and_then(|value| parse::<ObjectId>(&value));
        let mapping = match mapping {
            Ok(mapping) => mapping,
            Err(e) => {
                self.rollback(Some(target.id), Some(extent.id)).await;
                return Err(e);
            }
        };

        Ok(ExportInfo {
            target_id: target.id,
            extent_id: extent.id,
            target_extent_id: mapping.id,
            target_iqn: format!("{}:{}", global.basename, name),
            target_portal,
        })
    }

    /// `host:port` initiators should connect to
    fn portal_address(&self, portal: &IscsiPortal) -> Result<String> {
        let listen = portal.listen.first().ok_or_else(|| Error::Appliance {
            operation: "iscsi.portal.get".into(),
            status: None,
            message: format!("portal {} has no listen address", portal.id),
        })?;

        if !listen.ip.is_unspecified() {
            return Ok(SocketAddr::new(listen.ip, listen.port).to_string());
        }

        let host = self
            .ctx
            .config
            .iscsi
            .portal_host
            .clone()
            .or_else(|| self.ctx.config.appliance_host())
            .ok_or_else(|| {
                Error::Configuration(
                    "portal listens on a wildcard address and no portal host is known".into(),
                )
            })?;
        Ok(format!("{}:{}", host, listen.port))
    }

    async fn rollback(&self, target_id: Option<u64>, extent_id: Option<u64>) {
        if let Some(id) = extent_id {
            if let Err(e) = self.remove_extent(id).await {
                warn!("failed to roll back iSCSI extent {}: {}", id, e);
            }
        }
        if let Some(id) = target_id {
            if let Err(e) = self.remove_target(id).await {
                warn!("failed to roll back iSCSI target {}: {}", id, e);
            }
        }
    }

    async fn remove_target(&self, id: u64) -> Result<()> {
        tolerate_missing(self.ctx.execute(ApplianceCommand::DeleteIscsiTarget { id }).await)
    }

    async fn remove_extent(&self, id: u64) -> Result<()> {
        tolerate_missing(self.ctx.execute(ApplianceCommand::DeleteIscsiExtent { id }).await)
    }
}

fn tolerate_missing<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
