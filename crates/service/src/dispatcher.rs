//! The single dispatcher task.
//!
//! Every socket event funnels into one queue consumed here, so requests are
//! processed in receive order and every admin mutation is totally ordered
//! with respect to every check. Handlers never block: agent round-trips
//! park the originating check in a context table and the loop moves on.

use crate::monitor::MonitorBuffer;
use crate::plugins::{PluginRegistry, Verdict};
use sentra_core::monitor::MonitorEntry;
use sentra_core::time::now_ms;
use sentra_core::types::{PolicyKey, PolicyResult};
use sentra_core::validation;
use std::collections::HashMap;
use std::sync::Arc;
use storage::{Database, StorageError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use wire::{AgentMsgType, Message, ResponseCode, SequenceNumber, WireError};

pub(crate) type ConnId = u64;

/// Which endpoint accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketKind {
    Client,
    Admin,
}

/// Per-connection role, fixed at the first frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    /// Client-socket connection before its first frame.
    FreshClient,
    Client,
    Agent,
    Admin,
}

pub(crate) enum Event {
    Connected {
        conn: ConnId,
        kind: SocketKind,
        writer: mpsc::UnboundedSender<Vec<u8>>,
        close: Arc<Notify>,
    },
    Frame {
        conn: ConnId,
        sequence: SequenceNumber,
        message: Message,
    },
    ProtocolError {
        conn: ConnId,
        error: WireError,
    },
    Disconnected {
        conn: ConnId,
    },
}

struct ConnHandle {
    role: Role,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    close: Arc<Notify>,
    agent_type: Option<String>,
}

/// A check parked on an agent round-trip, keyed by (agent conn, check id).
struct CheckContext {
    client_conn: ConnId,
    client_sequence: SequenceNumber,
    key: PolicyKey,
    raw_result: PolicyResult,
    cancelled: bool,
}

pub(crate) struct Dispatcher {
    db: Database,
    plugins: PluginRegistry,
    monitor: MonitorBuffer,
    monitoring: bool,
    connections: HashMap<ConnId, ConnHandle>,
    agents: HashMap<String, ConnId>,
    pending: HashMap<(ConnId, SequenceNumber), CheckContext>,
    next_check_id: SequenceNumber,
}

impl Dispatcher {
    pub(crate) fn new(
        db: Database,
        plugins: PluginRegistry,
        monitor: MonitorBuffer,
        monitoring: bool,
    ) -> Self {
        Self {
            db,
            plugins,
            monitor,
            monitoring,
            connections: HashMap::new(),
            agents: HashMap::new(),
            pending: HashMap::new(),
            next_check_id: 0,
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            match event {
                Event::Connected { conn, kind, writer, close } => {
                    let role = match kind {
                        SocketKind::Client => Role::FreshClient,
                        SocketKind::Admin => Role::Admin,
                    };
                    debug!(conn, ?kind, "connection accepted");
                    self.connections
                        .insert(conn, ConnHandle { role, writer, close, agent_type: None });
                }
                Event::Frame { conn, sequence, message } => {
                    self.handle_frame(conn, sequence, message);
                }
                Event::ProtocolError { conn, error } => {
                    warn!(conn, %error, "protocol violation, closing connection");
                    self.close(conn);
                }
                Event::Disconnected { conn } => {
                    debug!(conn, "peer disconnected");
                    self.close(conn);
                }
            }
        }
        self.monitor.flush();
    }

    // ----------------------------------------------------------- dispatch

    fn handle_frame(&mut self, conn: ConnId, sequence: SequenceNumber, message: Message) {
        let role = match self.connections.get(&conn) {
            Some(handle) => handle.role.clone(),
            None => return,
        };
        match role {
            Role::FreshClient => match message {
                Message::AgentRegisterRequest { agent_type } => {
                    self.register_agent(conn, sequence, agent_type);
                }
                other => {
                    if let Some(handle) = self.connections.get_mut(&conn) {
                        handle.role = Role::Client;
                    }
                    self.handle_client_frame(conn, sequence, other);
                }
            },
            Role::Client => self.handle_client_frame(conn, sequence, message),
            Role::Agent => self.handle_agent_frame(conn, sequence, message),
            Role::Admin => self.handle_admin_frame(conn, sequence, message),
        }
    }

    fn handle_client_frame(&mut self, conn: ConnId, sequence: SequenceNumber, message: Message) {
        match message {
            Message::CheckPolicyRequest { key } => self.handle_check(conn, sequence, key),
            Message::SimpleCheckRequest { key } => self.handle_simple_check(conn, sequence, key),
            Message::CancelRequest => self.handle_cancel(conn, sequence),
            Message::MonitorEntryPut { entry } => self.monitor.push(entry),
            other => {
                warn!(conn, opcode = ?other.opcode(), "opcode not accepted from clients");
                self.close(conn);
            }
        }
    }

    fn handle_agent_frame(&mut self, conn: ConnId, sequence: SequenceNumber, message: Message) {
        match message {
            Message::AgentActionResponse { msg_type, data } => {
                self.handle_agent_response(conn, sequence, msg_type, data);
            }
            other => {
                warn!(conn, opcode = ?other.opcode(), "opcode not accepted from agents");
                self.close(conn);
            }
        }
    }

    fn handle_admin_frame(&mut self, conn: ConnId, sequence: SequenceNumber, message: Message) {
        match message {
            Message::InsertOrUpdateBucket { bucket, default_result } => {
                let outcome =
                    self.mutate(|s| s.insert_or_update_bucket(&bucket, default_result));
                self.answer_mutation(conn, sequence, outcome);
            }
            Message::RemoveBucket { bucket, recursive } => {
                let outcome = self.mutate(|s| s.delete_bucket(&bucket, recursive));
                self.answer_mutation(conn, sequence, outcome);
            }
            Message::SetPolicies { insert_or_update, remove } => {
                let outcome = self.mutate(|s| s.set_policies(&insert_or_update, &remove));
                self.answer_mutation(conn, sequence, outcome);
            }
            Message::EraseRequest { start_bucket, recursive, filter } => {
                let outcome = self.mutate(|s| s.erase(&start_bucket, recursive, &filter));
                self.answer_mutation(conn, sequence, outcome);
            }
            Message::AdminCheckRequest { key, start_bucket, recursive } => {
                self.handle_admin_check(conn, sequence, key, start_bucket, recursive);
            }
            Message::ListRequest { bucket, filter } => {
                let db_corrupted = self.db.is_corrupted();
                let response = match self.db.storage().list_policies(&bucket, &filter) {
                    Ok(policies) => Message::ListResponse {
                        policies,
                        bucket_valid: true,
                        db_corrupted,
                    },
                    Err(_) => Message::ListResponse {
                        policies: Vec::new(),
                        bucket_valid: false,
                        db_corrupted,
                    },
                };
                self.send(conn, sequence, &response);
            }
            Message::DescriptionListRequest => {
                let response = Message::DescriptionListResponse {
                    descriptions: self.plugins.descriptions(),
                    db_corrupted: self.db.is_corrupted(),
                };
                self.send(conn, sequence, &response);
            }
            Message::MonitorGetEntriesRequest { max_entries } => {
                let entries = self.monitor.take(max_entries as usize);
                self.send(conn, sequence, &Message::MonitorGetEntriesResponse { entries });
            }
            other => {
                warn!(conn, opcode = ?other.opcode(), "opcode not accepted on the admin socket");
                self.close(conn);
            }
        }
    }

    // ------------------------------------------------------------- checks

    fn handle_check(&mut self, conn: ConnId, sequence: SequenceNumber, key: PolicyKey) {
        if validation::validate_key(&key).is_err() {
            warn!(conn, %key, "check with invalid identifiers");
            self.respond_check(conn, sequence, PolicyResult::deny());
            return;
        }
        let result = self.db.storage().check(&key);
        self.record(&key, &result);
        if result.policy_type.is_predefined() {
            self.respond_check(conn, sequence, result);
            return;
        }
        let Some(plugin) = self.plugins.get(result.policy_type).map(Arc::clone) else {
            warn!(policy_type = %result.policy_type, "no service interpreter registered");
            self.respond_check(conn, sequence, PolicyResult::deny());
            return;
        };
        match plugin.check(&key, &result) {
            Verdict::Answer(final_result) => self.respond_check(conn, sequence, final_result),
            Verdict::AskAgent { agent_type, data } => {
                let Some(&agent_conn) = self.agents.get(&agent_type) else {
                    debug!(agent_type, "agent not registered, denying");
                    self.respond_check(conn, sequence, PolicyResult::deny());
                    return;
                };
                let check_id = self.allocate_check_id(agent_conn);
                self.pending.insert(
                    (agent_conn, check_id),
                    CheckContext {
                        client_conn: conn,
                        client_sequence: sequence,
                        key,
                        raw_result: result,
                        cancelled: false,
                    },
                );
                let request =
                    Message::AgentActionRequest { msg_type: AgentMsgType::Action, data };
                self.send(agent_conn, check_id, &request);
            }
        }
    }

    fn handle_simple_check(&mut self, conn: ConnId, sequence: SequenceNumber, key: PolicyKey) {
        if validation::validate_key(&key).is_err() {
            let response = Message::SimpleCheckResponse {
                code: ResponseCode::Failed,
                result: PolicyResult::deny(),
            };
            self.send(conn, sequence, &response);
            return;
        }
        let result = self.db.storage().check(&key);
        self.record(&key, &result);
        let response = if result.policy_type.is_predefined() {
            Message::SimpleCheckResponse { code: ResponseCode::Ok, result }
        } else {
            match self.plugins.get(result.policy_type).map(Arc::clone) {
                None => Message::SimpleCheckResponse {
                    code: ResponseCode::NoPolicyType,
                    result,
                },
                Some(plugin) => match plugin.check(&key, &result) {
                    Verdict::Answer(final_result) => Message::SimpleCheckResponse {
                        code: ResponseCode::Ok,
                        result: final_result,
                    },
                    // Resolving would need an agent round-trip; a simple
                    // check must answer synchronously.
                    Verdict::AskAgent { .. } => Message::SimpleCheckResponse {
                        code: ResponseCode::Failed,
                        result,
                    },
                },
            }
        };
        self.send(conn, sequence, &response);
    }

    fn handle_cancel(&mut self, conn: ConnId, sequence: SequenceNumber) {
        let mut cancelled_key = None;
        for (key, ctx) in self.pending.iter_mut() {
            if ctx.client_conn == conn && ctx.client_sequence == sequence && !ctx.cancelled {
                ctx.cancelled = true;
                cancelled_key = Some(*key);
                break;
            }
        }
        if let Some((agent_conn, check_id)) = cancelled_key {
            debug!(conn, sequence, "check cancelled while parked on agent");
            let cancel =
                Message::AgentActionRequest { msg_type: AgentMsgType::Cancel, data: Vec::new() };
            self.send(agent_conn, check_id, &cancel);
        }
        self.send(conn, sequence, &Message::CancelResponse);
    }

    fn respond_check(&self, conn: ConnId, sequence: SequenceNumber, result: PolicyResult) {
        self.send(conn, sequence, &Message::CheckPolicyResponse { result });
    }

    // -------------------------------------------------------------- agents

    fn register_agent(&mut self, conn: ConnId, sequence: SequenceNumber, agent_type: String) {
        if self.agents.contains_key(&agent_type) {
            warn!(conn, agent_type, "agent type already registered");
            self.send(
                conn,
                sequence,
                &Message::AgentRegisterResponse { code: ResponseCode::Failed },
            );
            self.close(conn);
            return;
        }
        info!(conn, agent_type, "agent registered");
        if let Some(handle) = self.connections.get_mut(&conn) {
            handle.role = Role::Agent;
            handle.agent_type = Some(agent_type.clone());
        }
        self.agents.insert(agent_type, conn);
        self.send(conn, sequence, &Message::AgentRegisterResponse { code: ResponseCode::Ok });
    }

    fn handle_agent_response(
        &mut self,
        conn: ConnId,
        check_id: SequenceNumber,
        msg_type: AgentMsgType,
        data: Vec<u8>,
    ) {
        let Some(ctx) = self.pending.remove(&(conn, check_id)) else {
            debug!(conn, check_id, "agent response without a pending check");
            return;
        };
        if ctx.cancelled {
            debug!(conn, check_id, "discarding agent response for cancelled check");
            return;
        }
        let final_result = match msg_type {
            AgentMsgType::Cancel => PolicyResult::deny(),
            AgentMsgType::Action => match self.plugins.get(ctx.raw_result.policy_type) {
                Some(plugin) => plugin.resolve(&ctx.key, &ctx.raw_result, &data),
                None => PolicyResult::deny(),
            },
        };
        self.respond_check(ctx.client_conn, ctx.client_sequence, final_result);
    }

    // --------------------------------------------------------------- admin

    fn handle_admin_check(
        &mut self,
        conn: ConnId,
        sequence: SequenceNumber,
        key: PolicyKey,
        start_bucket: String,
        recursive: bool,
    ) {
        let db_corrupted = self.db.is_corrupted();
        let response = match self.db.storage().check_from(&start_bucket, &key, recursive) {
            Ok(result) => Message::AdminCheckPolicyResponse {
                result,
                bucket_valid: true,
                db_corrupted,
            },
            Err(_) => Message::AdminCheckPolicyResponse {
                result: PolicyResult::deny(),
                bucket_valid: false,
                db_corrupted,
            },
        };
        self.send(conn, sequence, &response);
    }

    /// Run a mutation against the database and, when it changed anything,
    /// drop every client connection so caches start over.
    fn mutate<F>(&mut self, op: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut storage::PolicyStorage) -> Result<(), StorageError>,
    {
        let outcome = self.db.mutate(op);
        if outcome.is_ok() {
            self.invalidate_clients();
        }
        outcome
    }

    fn answer_mutation(
        &mut self,
        conn: ConnId,
        sequence: SequenceNumber,
        outcome: Result<(), StorageError>,
    ) {
        let code = match outcome {
            Ok(()) => ResponseCode::Ok,
            Err(e) => {
                debug!(error = %e, "admin mutation refused");
                storage_response_code(&e)
            }
        };
        self.send(conn, sequence, &Message::CodeResponse { code });
    }

    /// Close every client connection; their libraries treat the disconnect
    /// as "drop the cache entirely".
    fn invalidate_clients(&mut self) {
        let clients: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, handle)| handle.role == Role::Client)
            .map(|(&conn, _)| conn)
            .collect();
        if !clients.is_empty() {
            info!(count = clients.len(), "invalidating client caches");
        }
        for conn in clients {
            self.close(conn);
        }
    }

    // ------------------------------------------------------------ plumbing

    fn send(&self, conn: ConnId, sequence: SequenceNumber, message: &Message) {
        if let Some(handle) = self.connections.get(&conn) {
            let _ = handle.writer.send(message.encode(sequence));
        }
    }

    fn close(&mut self, conn: ConnId) {
        let Some(handle) = self.connections.remove(&conn) else {
            return;
        };
        handle.close.notify_one();
        drop(handle.writer);
        if let Some(agent_type) = handle.agent_type {
            self.agents.remove(&agent_type);
            // Parked checks this agent will never answer fail closed.
            let orphaned: Vec<(ConnId, SequenceNumber)> = self
                .pending
                .keys()
                .filter(|(agent_conn, _)| *agent_conn == conn)
                .copied()
                .collect();
            for key in orphaned {
                if let Some(ctx) = self.pending.remove(&key) {
                    if !ctx.cancelled {
                        self.respond_check(
                            ctx.client_conn,
                            ctx.client_sequence,
                            PolicyResult::deny(),
                        );
                    }
                }
            }
            return;
        }
        // A disappearing client cancels everything it had in flight.
        let mut cancelled: Vec<(ConnId, SequenceNumber)> = Vec::new();
        for (key, ctx) in self.pending.iter_mut() {
            if ctx.client_conn == conn && !ctx.cancelled {
                ctx.cancelled = true;
                cancelled.push(*key);
            }
        }
        for (agent_conn, check_id) in cancelled {
            let cancel =
                Message::AgentActionRequest { msg_type: AgentMsgType::Cancel, data: Vec::new() };
            self.send(agent_conn, check_id, &cancel);
        }
    }

    fn allocate_check_id(&mut self, agent_conn: ConnId) -> SequenceNumber {
        loop {
            let id = self.next_check_id;
            self.next_check_id = self.next_check_id.wrapping_add(1);
            if !self.pending.contains_key(&(agent_conn, id)) {
                return id;
            }
        }
    }

    fn record(&mut self, key: &PolicyKey, result: &PolicyResult) {
        if self.monitoring {
            self.monitor.push(MonitorEntry::new(key.clone(), result.policy_type, now_ms()));
        }
    }
}

fn storage_response_code(error: &StorageError) -> ResponseCode {
    match error {
        StorageError::NoBucket(_) => ResponseCode::NoBucket,
        StorageError::NotAllowed | StorageError::BucketLinked(_) => ResponseCode::NotAllowed,
        StorageError::Corrupted(_) => ResponseCode::DbCorrupted,
        StorageError::Validation(_)
        | StorageError::Io(_)
        | StorageError::LockUnavailable => ResponseCode::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_onto_wire_codes() {
        assert_eq!(
            storage_response_code(&StorageError::NoBucket("x".into())),
            ResponseCode::NoBucket
        );
        assert_eq!(storage_response_code(&StorageError::NotAllowed), ResponseCode::NotAllowed);
        assert_eq!(
            storage_response_code(&StorageError::Corrupted(
                storage::CorruptionKind::Checksum { file: "_".into() }
            )),
            ResponseCode::DbCorrupted
        );
        assert_eq!(storage_response_code(&StorageError::LockUnavailable), ResponseCode::Failed);
    }
}
