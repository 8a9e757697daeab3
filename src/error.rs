// Copyright 2020 Joyent, Inc.

use std::io;

use serde_derive::{Deserialize, Serialize};

use crate::envelope::ConversationId;

pub type Result<T> = std::result::Result<T, ConversationError>;

/// Errors raised by services. These never tear down the conversation
/// machinery; they are delivered to the client as an ERROR envelope.
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

pub type ServiceResult = std::result::Result<(), ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("unknown service type '{0}'")]
    UnknownServiceType(String),
    #[error("service type '{0}' is already registered with a different factory")]
    DuplicateServiceType(String),
    #[error(
        "conversation {conversation_id}: expected message {expected}, got {actual}"
    )]
    ProtocolSequence {
        conversation_id: ConversationId,
        expected: u64,
        actual: u64,
    },
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),
    #[error("conversation {conversation_id}: no message within {timeout_millis} ms")]
    ConversationTimeout {
        conversation_id: ConversationId,
        timeout_millis: u64,
    },
    #[error("conversation {0} is closed")]
    ConversationClosed(ConversationId),
    #[error("conversation {conversation_id}: service failed: {description}")]
    ServiceExecution {
        conversation_id: ConversationId,
        description: String,
    },
    #[error("failed to create service of type '{service_type_id}': {description}")]
    ServiceCreation {
        service_type_id: String,
        description: String,
    },
    #[error("unknown client '{0}'")]
    UnknownClient(String),
    #[error("session rejected: {0}")]
    InvalidSession(String),
    #[error("server busy: {0} conversations in flight")]
    ServerBusy(usize),
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConversationError {
    /// Not-found and closed mean the peer has already seen the conversation
    /// end. Callers treat the conversation as terminated instead of escalating.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConversationError::ConversationNotFound(_)
                | ConversationError::ConversationClosed(_)
        )
    }

    pub fn to_wire(&self) -> WireError {
        let code = match self {
            ConversationError::UnknownServiceType(_) => WireErrorCode::UnknownServiceType,
            ConversationError::ServiceCreation { .. } => WireErrorCode::ServiceCreation,
            ConversationError::UnknownClient(_) => WireErrorCode::UnknownClient,
            ConversationError::InvalidSession(_) => WireErrorCode::InvalidSession,
            ConversationError::ServerBusy(_) => WireErrorCode::ServerBusy,
            _ => WireErrorCode::Other,
        };
        let detail = match self {
            ConversationError::UnknownServiceType(id)
            | ConversationError::UnknownClient(id)
            | ConversationError::InvalidSession(id) => id.clone(),
            ConversationError::ServiceCreation { service_type_id, description } => {
                format!("{}\n{}", service_type_id, description)
            }
            ConversationError::ServerBusy(n) => n.to_string(),
            other => other.to_string(),
        };
        WireError { code, detail }
    }
}

/// Open failures as they travel over a connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WireError {
    pub code: WireErrorCode,
    pub detail: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum WireErrorCode {
    UnknownServiceType,
    ServiceCreation,
    UnknownClient,
    InvalidSession,
    ServerBusy,
    Other,
}

impl From<WireError> for ConversationError {
    fn from(err: WireError) -> Self {
        match err.code {
            WireErrorCode::UnknownServiceType => {
                ConversationError::UnknownServiceType(err.detail)
            }
            WireErrorCode::ServiceCreation => {
                let mut parts = err.detail.splitn(2, '\n');
                let service_type_id = parts.next().unwrap_or_default().to_string();
                let description = parts.next().unwrap_or_default().to_string();
                ConversationError::ServiceCreation { service_type_id, description }
            }
            WireErrorCode::UnknownClient => ConversationError::UnknownClient(err.detail),
            WireErrorCode::InvalidSession => ConversationError::InvalidSession(err.detail),
            WireErrorCode::ServerBusy => {
                ConversationError::ServerBusy(err.detail.parse().unwrap_or_default())
            }
            WireErrorCode::Other => ConversationError::Transport(err.detail),
        }
    }
}
