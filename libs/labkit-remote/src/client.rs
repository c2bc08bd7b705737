//! Client side: connections to a remote manager and the proxy wrapping a shared module.
//!
//! Connections live on a small dedicated tokio runtime and are driven through
//! `Runtime::block_on`, so every call here blocks the calling thread. The manager's
//! lifecycle operations are synchronous, which is where these calls come from; do not
//! call them from async code.

use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use labkit::{
    Module, ModuleBase, ModuleCtx, ModuleState, RemoteModuleConnector, RemoteUrl, TlsFiles,
};
use parking_lot::Mutex;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

use crate::error::RemoteError;
use crate::protocol::{Frame, Request, Response};
use crate::transport::{BoxedStream, ClientCodec, tls};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Bound on every call. `None` waits indefinitely.
    pub io_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Some(Duration::from_secs(30)),
        }
    }
}

static CLIENT_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn client_runtime() -> Result<&'static Runtime, RemoteError> {
    if let Some(runtime) = CLIENT_RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("remote-client")
        .enable_all()
        .build()?;
    Ok(CLIENT_RUNTIME.get_or_init(|| runtime))
}

struct Connection {
    framed: Framed<BoxedStream, ClientCodec>,
    next_id: u64,
}

impl Connection {
    /// Send `request` and wait for the response with the same id. Answers to earlier
    /// calls that were abandoned on timeout are skipped.
    async fn call(&mut self, request: Request) -> Result<Response, RemoteError> {
        self.next_id += 1;
        let id = self.next_id;
        self.framed.send(Frame::new(id, request)).await?;
        loop {
            let frame = self.framed.next().await.ok_or(RemoteError::Closed)??;
            if frame.id == id {
                return Ok(frame.body);
            }
            tracing::debug!(expected = id, received = frame.id, "Discarding stale remote response");
        }
    }
}

/// Connection to one remote manager.
///
/// Calls are serialized. A call that times out leaves the connection usable; any other
/// transport failure drops it and the next call reconnects.
pub struct RemoteClient {
    host: String,
    port: u16,
    tls: Option<Arc<ClientConfig>>,
    options: ClientOptions,
    runtime: &'static Runtime,
    connection: Mutex<Option<Connection>>,
}

impl RemoteClient {
    /// Connect to `host:port`, over TLS when `tls` is given.
    ///
    /// # Errors
    /// Returns `RemoteError::Connect` if the peer cannot be reached in time and TLS
    /// errors for unusable certificate material or an invalid server name.
    pub fn connect(
        host: &str,
        port: u16,
        tls: Option<&TlsFiles>,
        options: &ClientOptions,
    ) -> Result<Self, RemoteError> {
        let client = Self {
            host: host.to_owned(),
            port,
            tls: tls.map(tls::client_config).transpose()?,
            options: *options,
            runtime: client_runtime()?,
            connection: Mutex::new(None),
        };
        let connection = client.runtime.block_on(client.open())?;
        *client.connection.lock() = Some(connection);
        Ok(client)
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&self) -> Result<Connection, RemoteError> {
        let addr = self.endpoint();
        let connect_error = |source| RemoteError::Connect {
            addr: addr.clone(),
            source,
        };
        let timed_out = || {
            connect_error(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection attempt timed out",
            ))
        };
        let stream = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(connect_error)?;
        stream.set_nodelay(true)?;

        let stream: BoxedStream = match &self.tls {
            Some(config) => {
                let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
                    RemoteError::Tls {
                        reason: format!("invalid server name '{}': {e}", self.host),
                    }
                })?;
                let handshake =
                    TlsConnector::from(Arc::clone(config)).connect(server_name, stream);
                Box::new(
                    tokio::time::timeout(self.options.connect_timeout, handshake)
                        .await
                        .map_err(|_| timed_out())??,
                )
            }
            None => Box::new(stream),
        };
        tracing::debug!(addr = %addr, tls = self.tls.is_some(), "Remote connection opened");
        Ok(Connection {
            framed: Framed::new(stream, ClientCodec::new()),
            next_id: 0,
        })
    }

    /// Send one request and wait for its response.
    ///
    /// # Errors
    /// Returns `RemoteError::Timeout` when `io_timeout` elapses and transport errors
    /// when the connection fails or cannot be re-established.
    pub fn call(&self, request: Request) -> Result<Response, RemoteError> {
        let op = request.op();
        let mut slot = self.connection.lock();
        self.runtime.block_on(async {
            let mut connection = match slot.take() {
                Some(connection) => connection,
                None => {
                    tracing::debug!(addr = %self.endpoint(), "Reconnecting to remote manager");
                    self.open().await?
                }
            };
            let outcome = match self.options.io_timeout {
                Some(limit) => tokio::time::timeout(limit, connection.call(request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(RemoteError::Timeout {
                            request: op,
                            after_ms: limit.as_millis(),
                        })
                    }),
                None => connection.call(request).await,
            };
            match &outcome {
                Ok(_) | Err(RemoteError::Timeout { .. }) => *slot = Some(connection),
                Err(e) => {
                    tracing::debug!(addr = %self.endpoint(), error = %e, "Dropping remote connection");
                }
            }
            outcome
        })
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("endpoint", &self.endpoint())
            .field("tls", &self.tls.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Fetch a shared module from a remote manager.
///
/// The server starts the module if needed. Any failure is returned as an error; no
/// proxy is handed out for a module that could not be obtained.
///
/// # Errors
/// Returns connection, TLS and `RemoteError::Unavailable` errors.
pub fn get_remote_module(
    host: &str,
    port: u16,
    name: &str,
    tls: Option<&TlsFiles>,
) -> Result<RemoteModuleProxy, RemoteError> {
    get_remote_module_with(host, port, name, tls, &ClientOptions::default())
}

/// [`get_remote_module`] with explicit timeouts.
///
/// # Errors
/// See [`get_remote_module`].
pub fn get_remote_module_with(
    host: &str,
    port: u16,
    name: &str,
    tls: Option<&TlsFiles>,
    options: &ClientOptions,
) -> Result<RemoteModuleProxy, RemoteError> {
    let client = RemoteClient::connect(host, port, tls, options)?;
    let request = Request::GetModule {
        name: name.to_owned(),
    };
    let op = request.op();
    match client.call(request)? {
        Response::Module {
            name,
            base,
            interfaces,
        } => {
            let endpoint = client.endpoint();
            tracing::info!(module = %name, base = %base, endpoint = %endpoint, "Remote module obtained");
            Ok(RemoteModuleProxy {
                name,
                base,
                interfaces,
                endpoint,
                client,
            })
        }
        Response::Error { message } => Err(RemoteError::Unavailable {
            name: name.to_owned(),
            reason: message,
        }),
        _ => Err(RemoteError::UnexpectedResponse { request: op }),
    }
}

fn list(
    host: &str,
    port: u16,
    tls: Option<&TlsFiles>,
    request: Request,
) -> Result<Vec<String>, RemoteError> {
    let client = RemoteClient::connect(host, port, tls, &ClientOptions::default())?;
    let op = request.op();
    match client.call(request)? {
        Response::Names { names } => Ok(names),
        Response::Error { message } => Err(RemoteError::Remote { message }),
        _ => Err(RemoteError::UnexpectedResponse { request: op }),
    }
}

/// Names shared by the remote manager.
///
/// # Errors
/// Returns connection and protocol errors.
pub fn list_shared(host: &str, port: u16, tls: Option<&TlsFiles>) -> Result<Vec<String>, RemoteError> {
    list(host, port, tls, Request::ListShared)
}

/// Shared names whose module is active on the remote manager.
///
/// # Errors
/// Returns connection and protocol errors.
pub fn list_active(host: &str, port: u16, tls: Option<&TlsFiles>) -> Result<Vec<String>, RemoteError> {
    list(host, port, tls, Request::ListActive)
}

/// Local stand-in for a module living in another process.
///
/// Connectors check capabilities against the interfaces the server reported. Method
/// calls are forwarded over the proxy's own connection, one at a time. The lifecycle of the
/// remote module belongs to its server: activating or deactivating the proxy does not
/// touch it.
pub struct RemoteModuleProxy {
    name: String,
    base: ModuleBase,
    interfaces: Vec<String>,
    endpoint: String,
    client: RemoteClient,
}

impl RemoteModuleProxy {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base of the module on the server.
    #[must_use]
    pub fn remote_base(&self) -> ModuleBase {
        self.base
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// State of the module on the server; `None` if it is not loaded there.
    ///
    /// # Errors
    /// Returns connection and protocol errors.
    pub fn remote_state(&self) -> Result<Option<ModuleState>, RemoteError> {
        let request = Request::State {
            module: self.name.clone(),
        };
        let op = request.op();
        match self.client.call(request)? {
            Response::State { state } => Ok(state),
            Response::Error { message } => Err(RemoteError::Remote { message }),
            _ => Err(RemoteError::UnexpectedResponse { request: op }),
        }
    }
}

impl Module for RemoteModuleProxy {
    fn interfaces(&self) -> Vec<String> {
        self.interfaces.clone()
    }

    fn on_activate(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_deactivate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn invoke(&self, method: &str, args: Value) -> anyhow::Result<Value> {
        let request = Request::Invoke {
            module: self.name.clone(),
            method: method.to_owned(),
            args,
        };
        let op = request.op();
        match self.client.call(request)? {
            Response::Value { value } => Ok(value),
            Response::Error { message } => Err(RemoteError::Remote { message }.into()),
            _ => Err(RemoteError::UnexpectedResponse { request: op }.into()),
        }
    }

    fn is_busy(&self) -> bool {
        match self.remote_state() {
            Ok(state) => state == Some(ModuleState::Locked),
            Err(e) => {
                tracing::debug!(module = %self.name, error = %e, "Cannot query remote state");
                false
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for RemoteModuleProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteModuleProxy")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("interfaces", &self.interfaces)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// `RemoteModuleConnector` over this crate's TCP protocol, for `Manager::builder`.
#[derive(Debug, Clone, Default)]
pub struct TcpRemoteConnector {
    options: ClientOptions,
}

impl TcpRemoteConnector {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

impl RemoteModuleConnector for TcpRemoteConnector {
    fn connect(&self, url: &RemoteUrl, tls: Option<&TlsFiles>) -> anyhow::Result<Arc<dyn Module>> {
        let proxy = get_remote_module_with(
            url.host(),
            url.port(),
            url.module_name(),
            tls,
            &self.options,
        )?;
        Ok(Arc::new(proxy))
    }
}
