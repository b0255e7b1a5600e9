//! sentrad: the system-wide access-control decision daemon.
//!
//! Untrusted clients, privileged admin tooling and external agents connect
//! over local stream sockets; a single dispatcher task resolves checks
//! against the persistent policy store and keeps client caches coherent by
//! dropping their connections whenever an admin mutation lands.

#![deny(unsafe_code)]

pub mod config;
mod dispatcher;
pub mod logging;
pub mod monitor;
pub mod plugins;
mod sockets;

pub use config::ServiceConfig;
pub use monitor::{JsonLinesSink, MonitorSink};
pub use plugins::{AgentBackedInterpreter, PluginRegistry, ServiceInterpreter, Verdict};

use dispatcher::{Dispatcher, SocketKind};
use monitor::MonitorBuffer;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use storage::{Database, StorageError};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The daemon: configuration plus the interpreter plugins and monitor sink
/// wired in before start.
pub struct Daemon {
    config: ServiceConfig,
    plugins: PluginRegistry,
    sink: Box<dyn MonitorSink>,
}

impl Daemon {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            plugins: PluginRegistry::new(),
            sink: Box::new(JsonLinesSink::stderr()),
        }
    }

    /// Register a service-side interpreter for plugin policy types.
    pub fn register_interpreter(&mut self, interpreter: Arc<dyn ServiceInterpreter>) {
        self.plugins.register(interpreter);
    }

    pub fn with_monitor_sink(mut self, sink: Box<dyn MonitorSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Open the database, bind both sockets and serve until the surrounding
    /// runtime tears the future down.
    pub async fn run(self) -> Result<(), ServiceError> {
        let db = Database::open(&self.config.database_dir)?;
        let client_listener = bind(&self.config.client_socket)?;
        let admin_listener = bind(&self.config.admin_socket)?;
        info!(
            client_socket = %self.config.client_socket.display(),
            admin_socket = %self.config.admin_socket.display(),
            database_dir = %self.config.database_dir.display(),
            db_corrupted = db.is_corrupted(),
            "sentrad listening"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(sockets::accept_loop(
            client_listener,
            SocketKind::Client,
            events_tx.clone(),
        ));
        tokio::spawn(sockets::accept_loop(admin_listener, SocketKind::Admin, events_tx));

        let monitor = MonitorBuffer::new(self.config.monitor_buffer_size, self.sink);
        Dispatcher::new(db, self.plugins, monitor, self.config.monitoring)
            .run(events_rx)
            .await;
        Ok(())
    }
}

fn bind(path: &Path) -> Result<UnixListener, ServiceError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    // A leftover socket file from a previous run would make bind fail.
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}
