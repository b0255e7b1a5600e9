//! Typed operations carried by frames.
//!
//! Every request and response is one variant of [`Message`]; codecs are pure
//! functions between variants and bytes. Which opcodes a connection may
//! carry is the dispatcher's decision, not the codec's.

use crate::frame::{decode_frame, encode_frame, SequenceNumber};
use crate::ser::{PayloadReader, PayloadWriter};
use crate::{BinaryQueue, WireError};
use sentra_core::monitor::MonitorEntry;
use sentra_core::types::{
    Policy, PolicyBucketId, PolicyDescription, PolicyKey, PolicyResult, PolicyType,
};

/// Stable frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Client operations. 7-19 reserved.
    CheckPolicyRequest = 0,
    CheckPolicyResponse = 1,
    CancelRequest = 2,
    CancelResponse = 3,
    SimpleCheckRequest = 4,
    SimpleCheckResponse = 5,
    MonitorEntryPut = 6,

    // Admin operations. 33-39 reserved.
    InsertOrUpdateBucket = 20,
    RemoveBucket = 21,
    SetPolicies = 22,
    CodeResponse = 23,
    AdminCheckRequest = 24,
    ListRequest = 25,
    ListResponse = 26,
    AdminCheckPolicyResponse = 27,
    EraseRequest = 28,
    DescriptionListRequest = 29,
    DescriptionListResponse = 30,
    MonitorGetEntriesRequest = 31,
    MonitorGetEntriesResponse = 32,

    // Agent operations.
    AgentRegisterRequest = 40,
    AgentRegisterResponse = 41,
    AgentActionRequest = 42,
    AgentActionResponse = 43,
}

impl OpCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use OpCode::*;
        Some(match v {
            0 => CheckPolicyRequest,
            1 => CheckPolicyResponse,
            2 => CancelRequest,
            3 => CancelResponse,
            4 => SimpleCheckRequest,
            5 => SimpleCheckResponse,
            6 => MonitorEntryPut,
            20 => InsertOrUpdateBucket,
            21 => RemoveBucket,
            22 => SetPolicies,
            23 => CodeResponse,
            24 => AdminCheckRequest,
            25 => ListRequest,
            26 => ListResponse,
            27 => AdminCheckPolicyResponse,
            28 => EraseRequest,
            29 => DescriptionListRequest,
            30 => DescriptionListResponse,
            31 => MonitorGetEntriesRequest,
            32 => MonitorGetEntriesResponse,
            40 => AgentRegisterRequest,
            41 => AgentRegisterResponse,
            42 => AgentActionRequest,
            43 => AgentActionResponse,
            _ => return None,
        })
    }
}

/// Result codes answered to admin mutations and registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseCode {
    Ok = 0,
    NoBucket = 1,
    NoPolicyType = 2,
    NotAllowed = 3,
    Failed = 4,
    DbCorrupted = 5,
}

impl ResponseCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        use ResponseCode::*;
        Some(match v {
            0 => Ok,
            1 => NoBucket,
            2 => NoPolicyType,
            3 => NotAllowed,
            4 => Failed,
            5 => DbCorrupted,
            _ => return None,
        })
    }
}

/// Direction-tag inside agent action frames: a fresh action to perform or a
/// cancellation of a previously forwarded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentMsgType {
    Action = 0,
    Cancel = 1,
}

impl AgentMsgType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Action),
            1 => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// One typed operation, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CheckPolicyRequest {
        key: PolicyKey,
    },
    CheckPolicyResponse {
        result: PolicyResult,
    },
    /// Cancels the pending check whose sequence number this frame carries.
    CancelRequest,
    CancelResponse,
    SimpleCheckRequest {
        key: PolicyKey,
    },
    SimpleCheckResponse {
        code: ResponseCode,
        result: PolicyResult,
    },
    MonitorEntryPut {
        entry: MonitorEntry,
    },
    InsertOrUpdateBucket {
        bucket: PolicyBucketId,
        default_result: PolicyResult,
    },
    RemoveBucket {
        bucket: PolicyBucketId,
        recursive: bool,
    },
    SetPolicies {
        insert_or_update: Vec<(PolicyBucketId, Vec<Policy>)>,
        remove: Vec<(PolicyBucketId, Vec<PolicyKey>)>,
    },
    CodeResponse {
        code: ResponseCode,
    },
    AdminCheckRequest {
        key: PolicyKey,
        start_bucket: PolicyBucketId,
        recursive: bool,
    },
    ListRequest {
        bucket: PolicyBucketId,
        filter: PolicyKey,
    },
    ListResponse {
        policies: Vec<Policy>,
        bucket_valid: bool,
        db_corrupted: bool,
    },
    AdminCheckPolicyResponse {
        result: PolicyResult,
        bucket_valid: bool,
        db_corrupted: bool,
    },
    EraseRequest {
        start_bucket: PolicyBucketId,
        recursive: bool,
        filter: PolicyKey,
    },
    DescriptionListRequest,
    DescriptionListResponse {
        descriptions: Vec<PolicyDescription>,
        db_corrupted: bool,
    },
    MonitorGetEntriesRequest {
        max_entries: u16,
    },
    MonitorGetEntriesResponse {
        entries: Vec<MonitorEntry>,
    },
    AgentRegisterRequest {
        agent_type: String,
    },
    AgentRegisterResponse {
        code: ResponseCode,
    },
    AgentActionRequest {
        msg_type: AgentMsgType,
        data: Vec<u8>,
    },
    AgentActionResponse {
        msg_type: AgentMsgType,
        data: Vec<u8>,
    },
}

fn put_key(w: &mut PayloadWriter, key: &PolicyKey) {
    w.put_str(&key.client);
    w.put_str(&key.user);
    w.put_str(&key.privilege);
}

fn take_key(r: &mut PayloadReader<'_>) -> Result<PolicyKey, WireError> {
    let client = r.take_string()?;
    let user = r.take_string()?;
    let privilege = r.take_string()?;
    Ok(PolicyKey { client, user, privilege })
}

fn put_result(w: &mut PayloadWriter, result: &PolicyResult) {
    w.put_u16(result.policy_type.0);
    w.put_str(&result.metadata);
}

fn take_result(r: &mut PayloadReader<'_>) -> Result<PolicyResult, WireError> {
    let policy_type = PolicyType(r.take_u16()?);
    let metadata = r.take_string()?;
    Ok(PolicyResult { policy_type, metadata })
}

fn put_entry(w: &mut PayloadWriter, entry: &MonitorEntry) {
    put_key(w, &entry.key);
    w.put_u16(entry.result_type.0);
    w.put_u64(entry.timestamp_ms);
}

fn take_entry(r: &mut PayloadReader<'_>) -> Result<MonitorEntry, WireError> {
    let key = take_key(r)?;
    let result_type = PolicyType(r.take_u16()?);
    let timestamp_ms = r.take_u64()?;
    Ok(MonitorEntry { key, result_type, timestamp_ms })
}

fn take_code(r: &mut PayloadReader<'_>) -> Result<ResponseCode, WireError> {
    ResponseCode::from_u16(r.take_u16()?).ok_or(WireError::Malformed)
}

fn take_agent_msg_type(r: &mut PayloadReader<'_>) -> Result<AgentMsgType, WireError> {
    AgentMsgType::from_u8(r.take_u8()?).ok_or(WireError::Malformed)
}

impl Message {
    pub fn opcode(&self) -> OpCode {
        use Message::*;
        match self {
            CheckPolicyRequest { .. } => OpCode::CheckPolicyRequest,
            CheckPolicyResponse { .. } => OpCode::CheckPolicyResponse,
            CancelRequest => OpCode::CancelRequest,
            CancelResponse => OpCode::CancelResponse,
            SimpleCheckRequest { .. } => OpCode::SimpleCheckRequest,
            SimpleCheckResponse { .. } => OpCode::SimpleCheckResponse,
            MonitorEntryPut { .. } => OpCode::MonitorEntryPut,
            InsertOrUpdateBucket { .. } => OpCode::InsertOrUpdateBucket,
            RemoveBucket { .. } => OpCode::RemoveBucket,
            SetPolicies { .. } => OpCode::SetPolicies,
            CodeResponse { .. } => OpCode::CodeResponse,
            AdminCheckRequest { .. } => OpCode::AdminCheckRequest,
            ListRequest { .. } => OpCode::ListRequest,
            ListResponse { .. } => OpCode::ListResponse,
            AdminCheckPolicyResponse { .. } => OpCode::AdminCheckPolicyResponse,
            EraseRequest { .. } => OpCode::EraseRequest,
            DescriptionListRequest => OpCode::DescriptionListRequest,
            DescriptionListResponse { .. } => OpCode::DescriptionListResponse,
            MonitorGetEntriesRequest { .. } => OpCode::MonitorGetEntriesRequest,
            MonitorGetEntriesResponse { .. } => OpCode::MonitorGetEntriesResponse,
            AgentRegisterRequest { .. } => OpCode::AgentRegisterRequest,
            AgentRegisterResponse { .. } => OpCode::AgentRegisterResponse,
            AgentActionRequest { .. } => OpCode::AgentActionRequest,
            AgentActionResponse { .. } => OpCode::AgentActionResponse,
        }
    }

    /// Encode into one complete frame carrying `sequence`.
    pub fn encode(&self, sequence: SequenceNumber) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        use Message::*;
        match self {
            CheckPolicyRequest { key } | SimpleCheckRequest { key } => put_key(&mut w, key),
            CheckPolicyResponse { result } => put_result(&mut w, result),
            CancelRequest | CancelResponse | DescriptionListRequest => {}
            SimpleCheckResponse { code, result } => {
                w.put_u16(*code as u16);
                put_result(&mut w, result);
            }
            MonitorEntryPut { entry } => put_entry(&mut w, entry),
            InsertOrUpdateBucket { bucket, default_result } => {
                w.put_str(bucket);
                put_result(&mut w, default_result);
            }
            RemoveBucket { bucket, recursive } => {
                w.put_str(bucket);
                w.put_bool(*recursive);
            }
            SetPolicies { insert_or_update, remove } => {
                w.put_count(insert_or_update.len());
                for (bucket, policies) in insert_or_update {
                    w.put_str(bucket);
                    w.put_count(policies.len());
                    for policy in policies {
                        put_key(&mut w, &policy.key);
                        put_result(&mut w, &policy.result);
                    }
                }
                w.put_count(remove.len());
                for (bucket, keys) in remove {
                    w.put_str(bucket);
                    w.put_count(keys.len());
                    for key in keys {
                        put_key(&mut w, key);
                    }
                }
            }
            CodeResponse { code } => w.put_u16(*code as u16),
            AdminCheckRequest { key, start_bucket, recursive } => {
                put_key(&mut w, key);
                w.put_str(start_bucket);
                w.put_bool(*recursive);
            }
            ListRequest { bucket, filter } => {
                w.put_str(bucket);
                put_key(&mut w, filter);
            }
            ListResponse { policies, bucket_valid, db_corrupted } => {
                w.put_count(policies.len());
                for policy in policies {
                    put_key(&mut w, &policy.key);
                    put_result(&mut w, &policy.result);
                }
                w.put_bool(*bucket_valid);
                w.put_bool(*db_corrupted);
            }
            AdminCheckPolicyResponse { result, bucket_valid, db_corrupted } => {
                put_result(&mut w, result);
                w.put_bool(*bucket_valid);
                w.put_bool(*db_corrupted);
            }
            EraseRequest { start_bucket, recursive, filter } => {
                w.put_str(start_bucket);
                w.put_bool(*recursive);
                put_key(&mut w, filter);
            }
            DescriptionListResponse { descriptions, db_corrupted } => {
                w.put_count(descriptions.len());
                for d in descriptions {
                    w.put_u16(d.policy_type.0);
                    w.put_str(&d.name);
                }
                w.put_bool(*db_corrupted);
            }
            MonitorGetEntriesRequest { max_entries } => w.put_u16(*max_entries),
            MonitorGetEntriesResponse { entries } => {
                w.put_count(entries.len());
                for entry in entries {
                    put_entry(&mut w, entry);
                }
            }
            AgentRegisterRequest { agent_type } => w.put_str(agent_type),
            AgentRegisterResponse { code } => w.put_u16(*code as u16),
            AgentActionRequest { msg_type, data } | AgentActionResponse { msg_type, data } => {
                w.put_u8(*msg_type as u8);
                w.put_bytes(data);
            }
        }
        encode_frame(self.opcode() as u8, sequence, &w.into_bytes())
    }

    /// Decode one message off the queue. `Ok(None)` means a partial frame is
    /// buffered and nothing was consumed.
    pub fn decode(
        queue: &mut BinaryQueue,
    ) -> Result<Option<(SequenceNumber, Message)>, WireError> {
        let (opcode, sequence, payload) = match decode_frame(queue)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        let opcode = OpCode::from_u8(opcode).ok_or(WireError::WrongOpCode)?;
        let mut r = PayloadReader::new(&payload);
        let message = match opcode {
            OpCode::CheckPolicyRequest => Message::CheckPolicyRequest { key: take_key(&mut r)? },
            OpCode::CheckPolicyResponse => {
                Message::CheckPolicyResponse { result: take_result(&mut r)? }
            }
            OpCode::CancelRequest => Message::CancelRequest,
            OpCode::CancelResponse => Message::CancelResponse,
            OpCode::SimpleCheckRequest => Message::SimpleCheckRequest { key: take_key(&mut r)? },
            OpCode::SimpleCheckResponse => {
                let code = take_code(&mut r)?;
                let result = take_result(&mut r)?;
                Message::SimpleCheckResponse { code, result }
            }
            OpCode::MonitorEntryPut => Message::MonitorEntryPut { entry: take_entry(&mut r)? },
            OpCode::InsertOrUpdateBucket => {
                let bucket = r.take_string()?;
                let default_result = take_result(&mut r)?;
                Message::InsertOrUpdateBucket { bucket, default_result }
            }
            OpCode::RemoveBucket => {
                let bucket = r.take_string()?;
                let recursive = r.take_bool()?;
                Message::RemoveBucket { bucket, recursive }
            }
            OpCode::SetPolicies => {
                let mut insert_or_update = Vec::new();
                for _ in 0..r.take_count()? {
                    let bucket = r.take_string()?;
                    let mut policies = Vec::new();
                    for _ in 0..r.take_count()? {
                        let key = take_key(&mut r)?;
                        let result = take_result(&mut r)?;
                        policies.push(Policy { key, result });
                    }
                    insert_or_update.push((bucket, policies));
                }
                let mut remove = Vec::new();
                for _ in 0..r.take_count()? {
                    let bucket = r.take_string()?;
                    let mut keys = Vec::new();
                    for _ in 0..r.take_count()? {
                        keys.push(take_key(&mut r)?);
                    }
                    remove.push((bucket, keys));
                }
                Message::SetPolicies { insert_or_update, remove }
            }
            OpCode::CodeResponse => Message::CodeResponse { code: take_code(&mut r)? },
            OpCode::AdminCheckRequest => {
                let key = take_key(&mut r)?;
                let start_bucket = r.take_string()?;
                let recursive = r.take_bool()?;
                Message::AdminCheckRequest { key, start_bucket, recursive }
            }
            OpCode::ListRequest => {
                let bucket = r.take_string()?;
                let filter = take_key(&mut r)?;
                Message::ListRequest { bucket, filter }
            }
            OpCode::ListResponse => {
                let mut policies = Vec::new();
                for _ in 0..r.take_count()? {
                    let key = take_key(&mut r)?;
                    let result = take_result(&mut r)?;
                    policies.push(Policy { key, result });
                }
                let bucket_valid = r.take_bool()?;
                let db_corrupted = r.take_bool()?;
                Message::ListResponse { policies, bucket_valid, db_corrupted }
            }
            OpCode::AdminCheckPolicyResponse => {
                let result = take_result(&mut r)?;
                let bucket_valid = r.take_bool()?;
                let db_corrupted = r.take_bool()?;
                Message::AdminCheckPolicyResponse { result, bucket_valid, db_corrupted }
            }
            OpCode::EraseRequest => {
                let start_bucket = r.take_string()?;
                let recursive = r.take_bool()?;
                let filter = take_key(&mut r)?;
                Message::EraseRequest { start_bucket, recursive, filter }
            }
            OpCode::DescriptionListRequest => Message::DescriptionListRequest,
            OpCode::DescriptionListResponse => {
                let mut descriptions = Vec::new();
                for _ in 0..r.take_count()? {
                    let policy_type = PolicyType(r.take_u16()?);
                    let name = r.take_string()?;
                    descriptions.push(PolicyDescription { policy_type, name });
                }
                let db_corrupted = r.take_bool()?;
                Message::DescriptionListResponse { descriptions, db_corrupted }
            }
            OpCode::MonitorGetEntriesRequest => {
                Message::MonitorGetEntriesRequest { max_entries: r.take_u16()? }
            }
            OpCode::MonitorGetEntriesResponse => {
                let mut entries = Vec::new();
                for _ in 0..r.take_count()? {
                    entries.push(take_entry(&mut r)?);
                }
                Message::MonitorGetEntriesResponse { entries }
            }
            OpCode::AgentRegisterRequest => {
                Message::AgentRegisterRequest { agent_type: r.take_string()? }
            }
            OpCode::AgentRegisterResponse => {
                Message::AgentRegisterResponse { code: take_code(&mut r)? }
            }
            OpCode::AgentActionRequest => {
                let msg_type = take_agent_msg_type(&mut r)?;
                let data = r.take_bytes()?;
                Message::AgentActionRequest { msg_type, data }
            }
            OpCode::AgentActionResponse => {
                let msg_type = take_agent_msg_type(&mut r)?;
                let data = r.take_bytes()?;
                Message::AgentActionResponse { msg_type, data }
            }
        };
        r.finish()?;
        Ok(Some((sequence, message)))
    }
}
