//! Controller Surface: a stateless mediator over the image controller.
//!
//! Ground: modelled as a `tonic::async_trait impl controller_server::
//! Controller` the same shape as `identity.rs`'s `impl identity_server::
//! Identity for Identity`.

use std::collections::HashMap;

use tonic::{Request, Response, Status};

use crate::capacity::{resolve_volume_size, MAX_VOLUME_SIZE, MIN_VOLUME_SIZE};
use crate::csi::*;
use crate::error::CsiError;
use crate::image::ImageController;

#[derive(Clone)]
pub struct Controller {
    pub engine: ImageController,
    pub node: String,
    pub topology_key: String,
}

fn require_mount_single_writer(capabilities: &[VolumeCapability]) -> Result<(), CsiError> {
    if capabilities.is_empty() {
        return Err(CsiError::invalid_argument(
            "at least one volume capability is required",
        ));
    }
    for capability in capabilities {
        match &capability.access_type {
            Some(volume_capability::AccessType::Block(_)) => {
                return Err(CsiError::unimplemented("block access type is not supported"))
            }
            Some(volume_capability::AccessType::Mount(_)) => {}
            None => {
                return Err(CsiError::invalid_argument(
                    "volume capability must set an access type",
                ))
            }
        }
        let mode = capability
            .access_mode
            .as_ref()
            .map(|m| m.mode)
            .unwrap_or_default();
        if mode != volume_capability::access_mode::Mode::SingleNodeWriter as i32 {
            return Err(CsiError::invalid_argument(
                "only SINGLE_NODE_WRITER access mode is supported",
            ));
        }
    }
    Ok(())
}

#[tonic::async_trait]
impl controller_server::Controller for Controller {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let request = request.into_inner();

        let result = (|| -> Result<Volume, CsiError> {
            if request.name.is_empty() {
                return Err(CsiError::invalid_argument("volume name must not be empty"));
            }
            require_mount_single_writer(&request.volume_capabilities)?;

            let target_node = request
                .accessibility_requirements
                .as_ref()
                .and_then(|req| req.preferred.first())
                .and_then(|topology| topology.segments.get(&self.topology_key))
                .ok_or_else(|| {
                    CsiError::invalid_argument(format!(
                        "accessibility_requirements.preferred must carry topology key {}",
                        self.topology_key
                    ))
                })?;
            if target_node != &self.node {
                return Err(CsiError::invalid_argument(format!(
                    "requested node {} does not match this node {} for topology key {}",
                    target_node, self.node, self.topology_key
                )));
            }

            let (required, limit) = request
                .capacity_range
                .as_ref()
                .map(|r| (r.required_bytes, r.limit_bytes))
                .unwrap_or((0, 0));
            let size = resolve_volume_size(required, limit)?;

            self.engine.create(&request.name, size)?;
            let actual_size = self.engine.volume_size(&request.name)?;

            let mut segments = HashMap::new();
            segments.insert(self.topology_key.clone(), self.node.clone());

            Ok(Volume {
                capacity_bytes: actual_size as i64,
                volume_id: request.name.clone(),
                volume_context: HashMap::new(),
                accessible_topology: vec![Topology { segments }],
            })
        })();

        match result {
            Ok(volume) => Ok(Response::new(CreateVolumeResponse { volume: Some(volume) })),
            Err(error) => Err(error.into()),
        }
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("volume_id must not be empty").into());
        }

        match self.engine.delete(&request.volume_id) {
            Ok(()) => Ok(Response::new(DeleteVolumeResponse {})),
            Err(error) => Err(error.into()),
        }
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() {
            return Err(CsiError::invalid_argument("volume_id must not be empty").into());
        }

        let (required, limit) = request
            .capacity_range
            .as_ref()
            .map(|r| (r.required_bytes, r.limit_bytes))
            .unwrap_or((0, 0));

        match resolve_volume_size(required, limit) {
            Ok(size) => Ok(Response::new(ControllerExpandVolumeResponse {
                capacity_bytes: size as i64,
                node_expansion_required: true,
            })),
            Err(error) => Err(error.into()),
        }
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        match self.engine.pool_capacity() {
            Ok(free) => Ok(Response::new(GetCapacityResponse {
                available_capacity: free as i64,
                minimum_volume_size: MIN_VOLUME_SIZE as i64,
                maximum_volume_size: MAX_VOLUME_SIZE as i64,
            })),
            Err(error) => Err(error.into()),
        }
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let caps = vec![
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::ExpandVolume,
            controller_service_capability::rpc::Type::GetCapacity,
        ];

        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(
                        controller_service_capability::Rpc { r#type: c as i32 },
                    )),
                })
                .collect(),
        }))
    }
}
