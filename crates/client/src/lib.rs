//! Sentra client library.
//!
//! Untrusted processes ask the daemon whether a (client, user, privilege)
//! triple is permitted. Answers are cached per process in a capacity-bounded
//! LRU keyed by the caller-supplied session; interpreter plugins translate
//! raw policy results into final allow/deny decisions. Admin tooling and
//! agents speak over the same framed protocol through their own handles.

#![deny(unsafe_code)]

pub mod admin;
pub mod agent;
pub mod api;
pub mod cache;
mod connection;
pub mod interpreter;

pub use admin::SentraAdmin;
pub use agent::{AgentAction, SentraAgent};
pub use api::SentraClient;
pub use cache::CapacityCache;
pub use interpreter::{ClientInterpreter, NaiveInterpreter, Usability};

use sentra_core::validation::ValidationError;
use thiserror::Error;
use wire::{ResponseCode, WireError};

/// Final outcome of a check as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
}

/// Opaque caller-supplied token scoping the decision cache. A change of
/// session resets the cache.
pub type ClientSession = String;

/// A session token unique to this process instance.
pub fn generate_session() -> ClientSession {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon refused the operation: {0:?}")]
    Refused(ResponseCode),
    #[error("connection closed by the daemon")]
    Disconnected,
    #[error("unexpected response frame")]
    UnexpectedResponse,
}

impl ClientError {
    /// Stable integer code of the client API surface.
    pub fn api_code(&self) -> i32 {
        use sentra_core::api;
        match self {
            ClientError::Validation(_) => api::INVALID_PARAM,
            ClientError::Refused(ResponseCode::NotAllowed) => api::ACCESS_DENIED,
            ClientError::Io(_) | ClientError::Disconnected => api::SERVICE_NOT_AVAILABLE,
            _ => api::SERVICE_NOT_AVAILABLE,
        }
    }

    /// Stable integer code of the admin API surface.
    pub fn admin_api_code(&self) -> i32 {
        use sentra_core::api::{self, admin};
        match self {
            ClientError::Validation(_) => api::INVALID_PARAM,
            ClientError::Refused(ResponseCode::NoBucket) => admin::BUCKET_NOT_FOUND,
            ClientError::Refused(ResponseCode::NotAllowed)
            | ClientError::Refused(ResponseCode::DbCorrupted) => admin::OPERATION_NOT_ALLOWED,
            ClientError::Protocol(_) | ClientError::UnexpectedResponse => {
                admin::UNEXPECTED_CLIENT_ERROR
            }
            ClientError::Io(_) | ClientError::Disconnected => api::SERVICE_NOT_AVAILABLE,
            _ => admin::UNEXPECTED_CLIENT_ERROR,
        }
    }
}
