//! CSI gRPC surface
//!
//! Implements the CSI `Identity` and `Node` services over a Unix domain
//! socket and translates kubelet calls into request-manager actions.
//! `NodePublishVolume` returns OK only once the volume's files are on disk
//! and mounted at the target path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use spiffe_common::{Error, EPHEMERAL_KEY};

use crate::manager::Manager;
use crate::proto::identity_server::{Identity, IdentityServer};
use crate::proto::node_server::{Node, NodeServer};
use crate::proto::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse,
    NodeGetInfoRequest, NodeGetInfoResponse, NodePublishVolumeRequest, NodePublishVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, ProbeRequest, ProbeResponse,
};

/// CSI Identity service: plugin name, version and liveness
pub struct IdentityService {
    driver_name: String,
    version: String,
}

impl IdentityService {
    /// Create the Identity service for this driver
    pub fn new(driver_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            version: version.into(),
        }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: self.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        // Node-only ephemeral driver: no controller service, no topology.
        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}

/// CSI Node service backed by the request manager
pub struct NodeService {
    manager: Arc<Manager>,
    node_id: String,
}

impl NodeService {
    /// Create the Node service
    pub fn new(manager: Arc<Manager>, node_id: impl Into<String>) -> Self {
        Self {
            manager,
            node_id: node_id.into(),
        }
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("target_path is required"));
        }

        let volume_context: BTreeMap<String, String> =
            req.volume_context.into_iter().collect();

        // Only inline ephemeral volumes make sense for identity material;
        // the kubelet marks them in the volume context.
        if let Some(ephemeral) = volume_context.get(EPHEMERAL_KEY) {
            if ephemeral != "true" {
                return Err(Status::invalid_argument(
                    "only ephemeral inline volumes are supported",
                ));
            }
        }

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            readonly = req.readonly,
            "node publish volume"
        );

        self.manager
            .publish(
                &req.volume_id,
                Path::new(&req.target_path),
                req.readonly,
                &volume_context,
            )
            .await
            .map_err(|e| {
                warn!(volume_id = %req.volume_id, error = %e, "publish failed");
                status_for(e)
            })?;

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume_id is required"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("target_path is required"));
        }

        info!(volume_id = %req.volume_id, target_path = %req.target_path, "node unpublish volume");

        self.manager
            .unpublish(&req.volume_id, Path::new(&req.target_path))
            .await
            .map_err(|e| {
                error!(volume_id = %req.volume_id, error = %e, "unpublish failed");
                status_for(e)
            })?;

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        // No staging, stats or expansion.
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

/// Map driver errors onto CSI status codes
fn status_for(err: Error) -> Status {
    match &err {
        Error::Identity { .. } | Error::Csr { .. } => Status::invalid_argument(err.to_string()),
        Error::Config { .. } => Status::failed_precondition(err.to_string()),
        Error::Request { terminal: true, .. } => Status::permission_denied(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// Resolve a CSI endpoint to a socket path: `unix:///csi/csi.sock`,
/// `unix:/csi/csi.sock` or a bare path.
fn socket_path(endpoint: &str) -> PathBuf {
    let trimmed = endpoint
        .strip_prefix("unix://")
        .or_else(|| endpoint.strip_prefix("unix:"))
        .unwrap_or(endpoint);
    PathBuf::from(trimmed)
}

/// Serve the CSI services on the configured Unix socket until `shutdown`
/// resolves.
pub async fn serve(
    endpoint: &str,
    identity: IdentityService,
    node: NodeService,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let path = socket_path(endpoint);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A previous run's socket would make bind fail.
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(&path)?;
    info!(socket = %path.display(), "CSI server listening");

    Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;

    info!("CSI server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_forms_resolve_to_the_same_socket() {
        for endpoint in ["unix:///csi/csi.sock", "unix:/csi/csi.sock", "/csi/csi.sock"] {
            assert_eq!(socket_path(endpoint), PathBuf::from("/csi/csi.sock"));
        }
    }

    #[test]
    fn error_mapping_matches_csi_expectations() {
        let cases = [
            (Error::identity("bad token"), tonic::Code::InvalidArgument),
            (Error::csr("bad params"), tonic::Code::InvalidArgument),
            (Error::config("no issuer"), tonic::Code::FailedPrecondition),
            (
                Error::request_terminal("vol", "denied"),
                tonic::Code::PermissionDenied,
            ),
            (Error::request("vol", "timeout"), tonic::Code::Internal),
            (Error::store("vol", "io"), tonic::Code::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(status_for(err).code(), code);
        }
    }
}
