//! node-local sparse-image CSI plugin.
//!
//! Implements the Identity, Controller and Node gRPC services over a
//! Unix domain socket, backing volumes with sparse files and loop
//! devices rather than a remote storage engine.

#[macro_use]
extern crate lazy_static;

use std::{
    convert::TryFrom,
    fs,
    io::ErrorKind,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use clap::{App, Arg};
use futures::TryFutureExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UnixListener,
};
use tonic::transport::{server::Connected, Server};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    config::Config,
    controller::Controller,
    csi::{controller_server::ControllerServer, identity_server::IdentityServer, node_server::NodeServer},
    identity::Identity,
    image::ImageController,
    mount::probe_filesystems,
    node::Node,
};

#[allow(dead_code)]
#[allow(clippy::type_complexity)]
#[allow(clippy::unit_arg)]
#[allow(clippy::redundant_closure)]
#[allow(clippy::enum_variant_names)]
#[allow(clippy::upper_case_acronyms)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

mod capacity;
mod config;
mod controller;
mod error;
mod findmnt;
mod identity;
mod image;
mod losetup;
mod mount;
mod node;
mod shutdown_event;

#[derive(Clone, Debug)]
pub struct UdsConnectInfo {
    pub peer_addr: Option<Arc<tokio::net::unix::SocketAddr>>,
    pub peer_cred: Option<tokio::net::unix::UCred>,
}

#[derive(Debug)]
struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        UdsConnectInfo {
            peer_addr: self.0.peer_addr().ok().map(Arc::new),
            peer_cred: self.0.peer_cred().ok(),
        }
    }
}

impl AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "process panicked, terminating");
        default_hook(info);
    }));
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let matches = App::new("local-sparse-csi-plugin")
        .about("node-local CSI plugin backing volumes with sparse images and loop devices")
        .arg(
            Arg::with_name("grpc-listen-socket")
                .long("grpc-listen-socket")
                .value_name("UNIX_PATH")
                .help("unix:// gRPC listen socket"),
        )
        .arg(
            Arg::with_name("images-dir")
                .long("images-dir")
                .value_name("PATH")
                .help("directory that holds sparse images"),
        )
        .arg(
            Arg::with_name("node")
                .long("node")
                .value_name("NODE_ID")
                .help("identity advertised in the topology segment"),
        )
        .arg(
            Arg::with_name("node-name-topology-key")
                .long("node-name-topology-key")
                .value_name("KEY")
                .help("topology key name"),
        )
        .arg(
            Arg::with_name("direct-io")
                .long("direct-io")
                .help("enable direct I/O on loop devices"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("log level threshold"),
        )
        .arg(Arg::with_name("log-json").long("log-json").help("emit JSON logs"))
        .get_matches();

    let config = Config::try_from(&matches)?;
    init_tracing(&config.log_level, config.log_json);
    install_panic_hook();

    let socket_path = config
        .grpc_listen_socket
        .strip_prefix("unix://")
        .expect("config validated the unix:// scheme");

    match fs::remove_file(socket_path) {
        Ok(_) => tracing::info!(socket_path, "removed stale listen socket"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(format!("error removing stale socket {}: {}", socket_path, err)),
    }

    let engine = ImageController::new(config.images_dir.clone(), config.direct_io);

    let controller = Controller {
        engine: engine.clone(),
        node: config.node.clone(),
        topology_key: config.node_name_topology_key.clone(),
    };
    let node = Node {
        engine,
        node_name: config.node.clone(),
        topology_key: config.node_name_topology_key.clone(),
        filesystems: probe_filesystems(),
    };

    let incoming = {
        let uds = UnixListener::bind(socket_path).map_err(|e| e.to_string())?;
        tracing::info!(socket_path, "listening");

        async_stream::stream! {
            loop {
                let item = uds.accept().map_ok(|(st, _)| UnixStream(st)).await;
                yield item;
            }
        }
    };

    if let Err(e) = Server::builder()
        .add_service(IdentityServer::new(Identity::default()))
        .add_service(ControllerServer::new(controller))
        .add_service(NodeServer::new(node))
        .serve_with_incoming_shutdown(incoming, shutdown_event::wait())
        .await
    {
        tracing::error!(error = %e, "server failed");
        return Err(e.to_string());
    }

    Ok(())
}
