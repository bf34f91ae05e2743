//! Node Surface: composes the image controller and mount manager to
//! stage, publish, expand and report on volumes local to this node.
//!
//! Ground: the access-mode/capability validation shape follows the
//! teacher's `check_access_mode` pattern in the legacy `node.rs`, adapted
//! to reject the `Block` access-type arm with `unimplemented` rather than
//! `invalid_argument` (spec.md §4.4/§9 "Dynamic polymorphism of access
//! types").

use std::collections::HashMap;

use tonic::{Request, Response, Status};

use crate::capacity::MAX_VOLUMES_PER_NODE;
use crate::csi::*;
use crate::error::CsiError;
use crate::image::ImageController;
use crate::mount;

#[derive(Clone)]
pub struct Node {
    pub engine: ImageController,
    pub node_name: String,
    pub topology_key: String,
    pub filesystems: Vec<String>,
}

fn mount_capability(capability: &Option<VolumeCapability>) -> Result<&volume_capability::MountVolume, CsiError> {
    let capability = capability
        .as_ref()
        .ok_or_else(|| CsiError::invalid_argument("volume_capability is required"))?;
    match &capability.access_type {
        Some(volume_capability::AccessType::Mount(mount)) => Ok(mount),
        Some(volume_capability::AccessType::Block(_)) => {
            Err(CsiError::unimplemented("block access type is not supported"))
        }
        None => Err(CsiError::invalid_argument(
            "volume capability must set an access type",
        )),
    }
}

#[tonic::async_trait]
impl node_server::Node for Node {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let request = request.into_inner();
        let result = (|| -> Result<(), CsiError> {
            if request.volume_id.is_empty() || request.staging_target_path.is_empty() {
                return Err(CsiError::invalid_argument(
                    "volume_id and staging_target_path must not be empty",
                ));
            }
            let mount_volume = mount_capability(&request.volume_capability)?;
            let fstype = if mount_volume.fs_type.is_empty() {
                self.filesystems
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "ext4".to_string())
            } else {
                if !self.filesystems.contains(&mount_volume.fs_type) {
                    return Err(CsiError::invalid_argument(format!(
                        "unsupported filesystem type {}",
                        mount_volume.fs_type
                    )));
                }
                mount_volume.fs_type.clone()
            };

            self.engine.format_if_needed(&request.volume_id, &fstype)?;
            let device = self.engine.attach(&request.volume_id)?;
            mount::mount(
                &device,
                &request.staging_target_path,
                &fstype,
                &mount_volume.mount_flags,
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(Response::new(NodeStageVolumeResponse {})),
            Err(error) => Err(error.into()),
        }
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let request = request.into_inner();
        let result = (|| -> Result<(), CsiError> {
            if request.volume_id.is_empty() || request.staging_target_path.is_empty() {
                return Err(CsiError::invalid_argument(
                    "volume_id and staging_target_path must not be empty",
                ));
            }
            // Unmount before detach to avoid tearing down a busy device.
            mount::unmount(&request.staging_target_path)?;
            self.engine.detach(&request.volume_id)?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(Response::new(NodeUnstageVolumeResponse {})),
            Err(error) => Err(error.into()),
        }
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        let result = (|| -> Result<(), CsiError> {
            if request.volume_id.is_empty()
                || request.staging_target_path.is_empty()
                || request.target_path.is_empty()
            {
                return Err(CsiError::invalid_argument(
                    "volume_id, staging_target_path and target_path must not be empty",
                ));
            }
            let mount_volume = mount_capability(&request.volume_capability)?;
            mount::bind_mount(
                &request.staging_target_path,
                &request.target_path,
                request.readonly,
                &mount_volume.mount_flags,
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(Response::new(NodePublishVolumeResponse {})),
            Err(error) => Err(error.into()),
        }
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() || request.target_path.is_empty() {
            return Err(CsiError::invalid_argument(
                "volume_id and target_path must not be empty",
            )
            .into());
        }

        match mount::unmount(&request.target_path) {
            Ok(()) => Ok(Response::new(NodeUnpublishVolumeResponse {})),
            Err(error) => Err(error.into()),
        }
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let request = request.into_inner();
        let result = (|| -> Result<i64, CsiError> {
            if request.volume_id.is_empty() {
                return Err(CsiError::invalid_argument("volume_id must not be empty"));
            }
            let (required, limit) = request
                .capacity_range
                .as_ref()
                .map(|r| (r.required_bytes, r.limit_bytes))
                .unwrap_or((0, 0));
            let size = crate::capacity::resolve_volume_size(required, limit)?;

            let new_size = self.engine.expand(&request.volume_id, size)?;
            self.engine.resize_fs(&request.volume_id)?;
            Ok(new_size as i64)
        })();

        match result {
            Ok(capacity_bytes) => Ok(Response::new(NodeExpandVolumeResponse { capacity_bytes })),
            Err(error) => Err(error.into()),
        }
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let request = request.into_inner();
        let result = (|| -> Result<Vec<VolumeUsage>, CsiError> {
            if !mount::is_mounted(&request.volume_path)? {
                return Err(CsiError::not_found(format!(
                    "{} is not a mounted path",
                    request.volume_path
                )));
            }
            let stats = self.engine.volume_stats(&request.volume_path)?;
            Ok(vec![
                VolumeUsage {
                    available: stats.available_bytes as i64,
                    total: stats.total_bytes as i64,
                    used: stats.used_bytes as i64,
                    unit: volume_usage::Unit::Bytes as i32,
                },
                VolumeUsage {
                    available: stats.available_inodes as i64,
                    total: stats.total_inodes as i64,
                    used: stats.used_inodes as i64,
                    unit: volume_usage::Unit::Inodes as i32,
                },
            ])
        })();

        match result {
            Ok(usage) => Ok(Response::new(NodeGetVolumeStatsResponse { usage })),
            Err(error) => Err(error.into()),
        }
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let caps = vec![
            node_service_capability::rpc::Type::StageUnstageVolume,
            node_service_capability::rpc::Type::ExpandVolume,
            node_service_capability::rpc::Type::GetVolumeStats,
        ];

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc { r#type: c as i32 },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let mut segments = HashMap::new();
        segments.insert(self.topology_key.clone(), self.node_name.clone());

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_name.clone(),
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            accessible_topology: Some(Topology { segments }),
        }))
    }
}
