//! The privileged admin API mutating and inspecting the policy database.

use crate::connection::Connection;
use crate::ClientError;
use sentra_core::monitor::MonitorEntry;
use sentra_core::types::{
    Policy, PolicyBucketId, PolicyDescription, PolicyKey, PolicyResult,
};
use sentra_core::validation;
use std::path::Path;
use wire::{Message, ResponseCode};

/// Result of an admin-side check: the raw engine answer plus the database
/// health flags the daemon reports alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCheck {
    pub result: PolicyResult,
    pub bucket_valid: bool,
    pub db_corrupted: bool,
}

/// Handle over the privileged admin socket.
pub struct SentraAdmin {
    connection: Connection,
}

impl SentraAdmin {
    pub async fn connect() -> Result<Self, ClientError> {
        Self::connect_to(Path::new(sentra_core::paths::ADMIN_SOCKET)).await
    }

    pub async fn connect_to(path: &Path) -> Result<Self, ClientError> {
        Ok(Self { connection: Connection::connect(path).await? })
    }

    /// Create a bucket or update its default result.
    pub async fn insert_or_update_bucket(
        &mut self,
        bucket: &str,
        default_result: PolicyResult,
    ) -> Result<(), ClientError> {
        validation::validate_bucket_id(bucket)?;
        let message = Message::InsertOrUpdateBucket {
            bucket: bucket.to_owned(),
            default_result,
        };
        self.expect_code(message).await
    }

    /// Remove a bucket; `recursive` also erases its contents and every
    /// policy redirecting into it.
    pub async fn remove_bucket(
        &mut self,
        bucket: &str,
        recursive: bool,
    ) -> Result<(), ClientError> {
        validation::validate_bucket_id(bucket)?;
        let message = Message::RemoveBucket { bucket: bucket.to_owned(), recursive };
        self.expect_code(message).await
    }

    /// Apply a batch of policy insertions and removals atomically.
    pub async fn set_policies(
        &mut self,
        insert_or_update: Vec<(PolicyBucketId, Vec<Policy>)>,
        remove: Vec<(PolicyBucketId, Vec<PolicyKey>)>,
    ) -> Result<(), ClientError> {
        let message = Message::SetPolicies { insert_or_update, remove };
        self.expect_code(message).await
    }

    /// Evaluate `key` from `start_bucket`; `recursive` follows `BUCKET`
    /// redirects, otherwise the named bucket answers alone.
    pub async fn check(
        &mut self,
        key: PolicyKey,
        start_bucket: &str,
        recursive: bool,
    ) -> Result<AdminCheck, ClientError> {
        validation::validate_key(&key)?;
        let message = Message::AdminCheckRequest {
            key,
            start_bucket: start_bucket.to_owned(),
            recursive,
        };
        match self.connection.round_trip(&message).await? {
            Message::AdminCheckPolicyResponse { result, bucket_valid, db_corrupted } => {
                Ok(AdminCheck { result, bucket_valid, db_corrupted })
            }
            Message::CodeResponse { code } => Err(ClientError::Refused(code)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Policies in `bucket` whose keys match `filter`.
    pub async fn list(
        &mut self,
        bucket: &str,
        filter: PolicyKey,
    ) -> Result<Vec<Policy>, ClientError> {
        let message = Message::ListRequest { bucket: bucket.to_owned(), filter };
        match self.connection.round_trip(&message).await? {
            Message::ListResponse { db_corrupted: true, .. } => {
                Err(ClientError::Refused(ResponseCode::DbCorrupted))
            }
            Message::ListResponse { bucket_valid: false, .. } => {
                Err(ClientError::Refused(ResponseCode::NoBucket))
            }
            Message::ListResponse { policies, .. } => Ok(policies),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Erase every policy matching `filter`, depth-first through bucket
    /// redirects when `recursive`.
    pub async fn erase(
        &mut self,
        start_bucket: &str,
        recursive: bool,
        filter: PolicyKey,
    ) -> Result<(), ClientError> {
        let message = Message::EraseRequest {
            start_bucket: start_bucket.to_owned(),
            recursive,
            filter,
        };
        self.expect_code(message).await
    }

    /// Descriptions of every policy type the daemon can interpret.
    pub async fn descriptions(&mut self) -> Result<Vec<PolicyDescription>, ClientError> {
        match self.connection.round_trip(&Message::DescriptionListRequest).await? {
            Message::DescriptionListResponse { db_corrupted: true, .. } => {
                Err(ClientError::Refused(ResponseCode::DbCorrupted))
            }
            Message::DescriptionListResponse { descriptions, .. } => Ok(descriptions),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Drain up to `max_entries` buffered monitor entries.
    pub async fn monitor_entries(
        &mut self,
        max_entries: u16,
    ) -> Result<Vec<MonitorEntry>, ClientError> {
        let message = Message::MonitorGetEntriesRequest { max_entries };
        match self.connection.round_trip(&message).await? {
            Message::MonitorGetEntriesResponse { entries } => Ok(entries),
            Message::CodeResponse { code } => Err(ClientError::Refused(code)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    async fn expect_code(&mut self, message: Message) -> Result<(), ClientError> {
        match self.connection.round_trip(&message).await? {
            Message::CodeResponse { code: ResponseCode::Ok } => Ok(()),
            Message::CodeResponse { code } => Err(ClientError::Refused(code)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
