#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Remote module sharing for `LabKit`.
//!
//! A manager that shares modules runs a [`RemoteModuleServer`]; a manager that uses
//! them is built with a [`TcpRemoteConnector`] so descriptors carrying a `remote` url
//! load as [`RemoteModuleProxy`] instances. Messages are length-delimited JSON frames over
//! tokio TCP streams, optionally mutually authenticated with rustls. The server runs on
//! the host's tokio runtime; the client side keeps a blocking API for the manager.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod service;
pub mod transport;

pub use client::{
    ClientOptions, RemoteClient, RemoteModuleProxy, TcpRemoteConnector, get_remote_module,
    get_remote_module_with, list_active, list_shared,
};
pub use error::RemoteError;
pub use protocol::{Frame, Request, Response};
pub use server::RemoteModuleServer;
pub use service::RemoteModuleService;
