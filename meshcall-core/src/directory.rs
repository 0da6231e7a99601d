//! Call directory seam
//!
//! The directory creates calls, records who joined and left, and keeps the
//! history. The engine reads the roster once at start and reports leave/end
//! on user action.

use crate::identity::UserId;
use crate::types::{CallId, CallSession, GroupId};
use async_trait::async_trait;
use thiserror::Error;

/// Call directory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// No such call, or the call is no longer active
    #[error("Call not found: {0}")]
    NotFound(String),

    /// The directory could not be reached
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Authoritative record of calls per group
#[async_trait]
pub trait CallDirectory: Send + Sync {
    /// Start a call in a group
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] if the directory cannot be reached
    async fn initiate(
        &self,
        group_id: &GroupId,
        initiator: &UserId,
    ) -> Result<CallSession, DirectoryError>;

    /// Join an active call, returning the updated roster
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] if the call is unknown or ended
    async fn join(&self, call_id: &CallId, user: &UserId) -> Result<CallSession, DirectoryError>;

    /// Leave a call
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] if the call is unknown
    async fn leave(&self, call_id: &CallId, user: &UserId) -> Result<(), DirectoryError>;

    /// End a call for everyone
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] if the call is unknown
    async fn end(&self, call_id: &CallId) -> Result<(), DirectoryError>;

    /// Active call of a group, if any
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] if the directory cannot be reached
    async fn get_active(&self, group_id: &GroupId) -> Result<Option<CallSession>, DirectoryError>;

    /// Every call of a group, newest first
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] if the directory cannot be reached
    async fn get_history(&self, group_id: &GroupId) -> Result<Vec<CallSession>, DirectoryError>;
}
