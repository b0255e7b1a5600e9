//! The agent API: external services the daemon consults for plugin-typed
//! policy results.

use crate::connection::Connection;
use crate::ClientError;
use std::path::Path;
use tracing::info;
use wire::{AgentMsgType, Message, ResponseCode, SequenceNumber};

/// One action forwarded by the daemon. The check id doubles as the sequence
/// number the response must echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentAction {
    pub check_id: SequenceNumber,
    pub msg_type: AgentMsgType,
    pub data: Vec<u8>,
}

/// A registered agent connection. Agents share the client socket; the
/// registration frame is what promotes the connection.
pub struct SentraAgent {
    connection: Connection,
    agent_type: String,
}

impl SentraAgent {
    /// Connect and register under `agent_type`.
    pub async fn register(path: &Path, agent_type: &str) -> Result<Self, ClientError> {
        let mut connection = Connection::connect(path).await?;
        let message = Message::AgentRegisterRequest { agent_type: agent_type.to_owned() };
        match connection.round_trip(&message).await? {
            Message::AgentRegisterResponse { code: ResponseCode::Ok } => {
                info!(agent_type, "agent registered");
                Ok(Self { connection, agent_type: agent_type.to_owned() })
            }
            Message::AgentRegisterResponse { code } => Err(ClientError::Refused(code)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Wait for the next action (or cancellation) from the daemon.
    pub async fn next_action(&mut self) -> Result<AgentAction, ClientError> {
        loop {
            let (check_id, message) = self.connection.receive().await?;
            match message {
                Message::AgentActionRequest { msg_type, data } => {
                    return Ok(AgentAction { check_id, msg_type, data })
                }
                // Anything else on an agent connection is noise; skip it.
                _ => continue,
            }
        }
    }

    /// Answer the action identified by `check_id`.
    pub async fn respond(
        &mut self,
        check_id: SequenceNumber,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        let message = Message::AgentActionResponse { msg_type: AgentMsgType::Action, data };
        self.connection.send(&message, check_id).await
    }
}
