//! Daemon configuration.
//!
//! Every field has a compiled-in default; a YAML file can override any
//! subset and the `sentrad` command line overrides the file.

use crate::ServiceError;
use sentra_core::limits::MONITOR_DEFAULT_BUFFER_SIZE;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Default location of the policy database.
pub const DEFAULT_DATABASE_DIR: &str = "/var/lib/sentra/db";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Socket accepting client checks and agent registrations.
    pub client_socket: PathBuf,
    /// Socket accepting privileged admin operations.
    pub admin_socket: PathBuf,
    /// Directory holding the persisted policy database.
    pub database_dir: PathBuf,
    /// Record a monitor entry per check.
    pub monitoring: bool,
    /// Entries buffered before flushing to the monitor sink.
    pub monitor_buffer_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            client_socket: PathBuf::from(sentra_core::paths::CLIENT_SOCKET),
            admin_socket: PathBuf::from(sentra_core::paths::ADMIN_SOCKET),
            database_dir: PathBuf::from(DEFAULT_DATABASE_DIR),
            monitoring: false,
            monitor_buffer_size: MONITOR_DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ServiceConfig {
    /// Load a config from a YAML file, validating field names strictly.
    pub fn load_from_yaml_path(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            ServiceError::Config(format!("cannot open config file {}: {e}", path.display()))
        })?;
        let config: ServiceConfig = serde_yaml::from_reader(BufReader::new(file))
            .map_err(|e| {
                ServiceError::Config(format!("malformed config file {}: {e}", path.display()))
            })?;
        if config.monitor_buffer_size == 0 {
            return Err(ServiceError::Config(
                "monitor_buffer_size must be at least 1".to_owned(),
            ));
        }
        Ok(config)
    }
}
