//! TCP server exposing shared modules to remote managers.
//!
//! The accept loop and every session run as tasks on the caller's tokio runtime and stop
//! when the server's `CancellationToken` fires. Requests of one session are handled
//! concurrently on the blocking pool, since module code is synchronous; each response
//! carries the id of its request.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use labkit::{RemoteServerConfig, TlsFiles};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::RemoteError;
use crate::protocol::{Frame, Request, Response};
use crate::service::RemoteModuleService;
use crate::transport::{BoxedStream, ServerCodec, tls};

/// Responses waiting for the session writer.
const OUTBOX_CAPACITY: usize = 64;

pub struct RemoteModuleServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl RemoteModuleServer {
    /// Bind and start serving on the current tokio runtime. Pass `tls` to require
    /// mutually authenticated peers.
    ///
    /// # Errors
    /// Returns `RemoteError::Io` if the address cannot be bound and TLS errors for
    /// unusable certificate material.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        service: RemoteModuleService,
        tls: Option<&TlsFiles>,
    ) -> Result<Self, RemoteError> {
        let acceptor = tls
            .map(tls::server_config)
            .transpose()?
            .map(TlsAcceptor::from);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            listener,
            Arc::new(service),
            acceptor,
            cancel.clone(),
            tracker.clone(),
        ));

        tracing::info!(
            addr = %local_addr,
            tls = tls.is_some(),
            "Remote module server listening"
        );
        Ok(Self {
            local_addr,
            cancel,
            tracker,
        })
    }

    /// Bind according to the `global.remote_modules_server` section. TLS is enabled when
    /// both `certfile` and `keyfile` are set.
    ///
    /// # Errors
    /// See [`RemoteModuleServer::bind`].
    pub async fn from_config(
        config: &RemoteServerConfig,
        service: RemoteModuleService,
    ) -> Result<Self, RemoteError> {
        let tls = match (&config.certfile, &config.keyfile) {
            (Some(cert), Some(key)) => {
                let files = TlsFiles::new(cert, key);
                Some(match &config.cafile {
                    Some(ca) => files.with_ca_file(ca),
                    None => files,
                })
            }
            (None, None) => None,
            _ => {
                return Err(RemoteError::Tls {
                    reason: "certfile and keyfile must be given together".to_owned(),
                });
            }
        };
        Self::bind(
            (config.address.as_str(), config.port),
            service,
            tls.as_ref(),
        )
        .await
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Token that stops the server when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting, close every session and wait for in-flight requests.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(addr = %self.local_addr, "Remote module server stopped");
    }
}

impl Drop for RemoteModuleServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Arc<RemoteModuleService>,
    acceptor: Option<TlsAcceptor>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracker.spawn(session(
                    stream,
                    peer,
                    Arc::clone(&service),
                    acceptor.clone(),
                    cancel.child_token(),
                    tracker.clone(),
                ));
            }
            Err(e) => tracing::warn!(error = %e, "Accept failed"),
        }
    }
}

async fn handshake(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
) -> Result<BoxedStream, RemoteError> {
    stream.set_nodelay(true)?;
    Ok(match acceptor {
        Some(acceptor) => Box::new(acceptor.accept(stream).await?),
        None => Box::new(stream),
    })
}

async fn session(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<RemoteModuleService>,
    acceptor: Option<TlsAcceptor>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let stream = tokio::select! {
        () = cancel.cancelled() => return,
        stream = handshake(stream, acceptor) => match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Cannot start remote session");
                return;
            }
        },
    };
    tracing::debug!(peer = %peer, "Remote session opened");

    let (reader, writer) = tokio::io::split(stream);
    let mut requests = FramedRead::new(reader, ServerCodec::new());
    let mut responses = FramedWrite::new(writer, ServerCodec::new());
    let (outbox, mut pending) = mpsc::channel::<Frame<Response>>(OUTBOX_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(frame) = pending.recv().await {
            if let Err(e) = responses.send(frame).await {
                tracing::debug!(peer = %peer, error = %e, "Cannot answer remote peer");
                return;
            }
        }
    });

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = requests.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "Remote session ended");
                break;
            }
            None => break,
        };
        let service = Arc::clone(&service);
        let outbox = outbox.clone();
        tracker.spawn(async move {
            let id = frame.id;
            let response = answer(service, frame.body, peer).await;
            if outbox.send(Frame::new(id, response)).await.is_err() {
                tracing::debug!(peer = %peer, id, "Session closed before the answer was ready");
            }
        });
    }

    drop(outbox);
    if cancel.is_cancelled() {
        writer.abort();
    }
    if let Err(e) = writer.await
        && !e.is_cancelled()
    {
        tracing::warn!(peer = %peer, error = %e, "Remote session writer failed");
    }
    tracing::debug!(peer = %peer, "Remote session closed");
}

async fn answer(service: Arc<RemoteModuleService>, body: Value, peer: SocketAddr) -> Response {
    let request = match serde_json::from_value::<Request>(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Malformed request");
            return Response::error(format!("malformed request: {e}"));
        }
    };
    tracing::debug!(peer = %peer, op = request.op(), "Remote request");
    tokio::task::spawn_blocking(move || service.handle(request))
        .await
        .unwrap_or_else(|e| Response::error(format!("request handler failed: {e}")))
}
