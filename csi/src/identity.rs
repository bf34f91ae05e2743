//! Implementation of gRPC methods from the CSI Identity service.

use std::collections::HashMap;
use tonic::{Request, Response, Status};

use crate::csi::*;

pub const PLUGIN_NAME: &str = "local-sparse.csi.reinstall.ru";
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, Default)]
pub struct Identity {}

#[tonic::async_trait]
impl identity_server::Identity for Identity {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        tracing::debug!(
            name = PLUGIN_NAME,
            version = PLUGIN_VERSION,
            "GetPluginInfo request"
        );

        Ok(Response::new(GetPluginInfoResponse {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: PLUGIN_VERSION.to_owned(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let caps = vec![
            plugin_capability::service::Type::ControllerService,
            plugin_capability::service::Type::VolumeAccessibilityConstraints,
        ];
        tracing::debug!(?caps, "GetPluginCapabilities request");

        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| PluginCapability {
                    r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                        r#type: c as i32,
                    })),
                })
                .collect(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        // No remote engine to await initialisation from: the images
        // directory and host tooling are checked lazily on first use by
        // each RPC, so the plugin is always ready once the process is up.
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}
