//! The check API used by untrusted client processes.

use crate::cache::CapacityCache;
use crate::connection::Connection;
use crate::interpreter::ClientInterpreter;
use crate::{ClientError, ClientSession, Decision};
use sentra_core::monitor::MonitorEntry;
use sentra_core::types::PolicyKey;
use sentra_core::validation;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use wire::{Message, SequenceNumber};

/// Client handle: one connection to the daemon plus the process-local
/// decision cache. A server-initiated disconnect drops the cache entirely;
/// the next call reconnects and refills it.
pub struct SentraClient {
    socket_path: PathBuf,
    connection: Option<Connection>,
    cache: CapacityCache,
}

impl SentraClient {
    /// Handle speaking to the well-known client socket.
    pub fn new() -> Self {
        Self::with_socket(sentra_core::paths::CLIENT_SOCKET)
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self { socket_path: path.into(), connection: None, cache: CapacityCache::default() }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = CapacityCache::new(capacity);
        self
    }

    /// Register an interpreter for plugin policy types.
    pub fn register_interpreter(&mut self, interpreter: Arc<dyn ClientInterpreter>) {
        self.cache.register_interpreter(interpreter);
    }

    /// Check whether (client, user, privilege) is permitted, consulting the
    /// cache first.
    pub async fn check(
        &mut self,
        session: &ClientSession,
        client: &str,
        user: &str,
        privilege: &str,
    ) -> Result<Decision, ClientError> {
        let key = PolicyKey::new(client, user, privilege);
        validation::validate_key(&key)?;
        self.observe_invalidation();
        if let Some(decision) = self.cache.get(session, &key) {
            return Ok(decision);
        }
        let response =
            self.round_trip(Message::CheckPolicyRequest { key: key.clone() }).await?;
        match response {
            Message::CheckPolicyResponse { result } => {
                Ok(self.cache.update(session, &key, result))
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Check that must resolve without an agent round-trip on the daemon
    /// side. The daemon answers `Failed` when only an agent could decide.
    pub async fn simple_check(
        &mut self,
        session: &ClientSession,
        client: &str,
        user: &str,
        privilege: &str,
    ) -> Result<Decision, ClientError> {
        let key = PolicyKey::new(client, user, privilege);
        validation::validate_key(&key)?;
        self.observe_invalidation();
        if let Some(decision) = self.cache.get(session, &key) {
            return Ok(decision);
        }
        let response =
            self.round_trip(Message::SimpleCheckRequest { key: key.clone() }).await?;
        match response {
            Message::SimpleCheckResponse { code: wire::ResponseCode::Ok, result } => {
                Ok(self.cache.update(session, &key, result))
            }
            Message::SimpleCheckResponse { code, .. } => Err(ClientError::Refused(code)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Cancel the pending check with `sequence`. The daemon acknowledges
    /// with a `CancelResponse` echoing the same sequence number.
    pub async fn cancel(&mut self, sequence: SequenceNumber) -> Result<(), ClientError> {
        let connection = self.ensure_connected().await?;
        connection.send(&Message::CancelRequest, sequence).await?;
        Ok(())
    }

    /// Append a client-observed monitor entry; fire-and-forget.
    pub async fn monitor_put(&mut self, entry: MonitorEntry) -> Result<(), ClientError> {
        let connection = self.ensure_connected().await?;
        let sequence = connection.allocate_sequence();
        connection.send(&Message::MonitorEntryPut { entry }, sequence).await?;
        Ok(())
    }

    /// Drop every cached decision.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// A server-initiated disconnect is the invalidation signal: drop the
    /// cache before it can serve anything stale.
    fn observe_invalidation(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            if connection.poll_disconnect() {
                debug!(path = %connection.path().display(), "daemon closed the connection, dropping cache");
                self.connection = None;
                self.cache.clear();
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<&mut Connection, ClientError> {
        if self.connection.is_none() {
            self.connection = Some(Connection::connect(&self.socket_path).await?);
        }
        Ok(self.connection.as_mut().expect("connection just established"))
    }

    /// One request/response exchange. Any transport failure invalidates the
    /// cache (the daemon closes client connections to signal invalidation)
    /// and is retried once over a fresh connection.
    async fn round_trip(&mut self, message: Message) -> Result<Message, ClientError> {
        for attempt in 0..2 {
            match self.try_round_trip(&message).await {
                Ok(response) => return Ok(response),
                Err(e @ (ClientError::Disconnected | ClientError::Io(_))) => {
                    debug!(error = %e, "connection lost, dropping cache");
                    self.connection = None;
                    self.cache.clear();
                    if attempt == 1 {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(ClientError::Disconnected)
    }

    async fn try_round_trip(&mut self, message: &Message) -> Result<Message, ClientError> {
        let connection = self.ensure_connected().await?;
        connection.round_trip(message).await
    }
}

impl Default for SentraClient {
    fn default() -> Self {
        Self::new()
    }
}
