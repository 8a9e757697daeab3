// Copyright 2020 Joyent, Inc.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::conversation::Conversation;
use crate::envelope::{ConversationId, EnvelopeKind};
use crate::error::Result;

/// What a running service sees of its conversation.
pub struct ServiceMessenger {
    conversation: Arc<Conversation>,
    interruption: CancellationToken,
}

impl ServiceMessenger {
    pub(crate) fn new(conversation: Arc<Conversation>) -> ServiceMessenger {
        let interruption = conversation.interruption();
        ServiceMessenger {
            conversation,
            interruption,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        self.conversation.id()
    }

    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        self.conversation
            .send(EnvelopeKind::Data, serde_json::to_value(message)?)
    }

    /// Waits for the next message, at most the service type's client timeout.
    pub async fn receive<T: DeserializeOwned>(&self) -> Result<T> {
        self.receive_with_timeout(self.conversation.client_timeout())
            .await
    }

    pub async fn receive_with_timeout<T: DeserializeOwned>(&self, timeout: Duration) -> Result<T> {
        let envelope = self.conversation.receive(timeout).await?;
        Ok(serde_json::from_value(envelope.into_payload())?)
    }

    /// `None` if nothing arrived within `timeout`.
    pub async fn try_receive<T: DeserializeOwned>(&self, timeout: Duration) -> Result<Option<T>> {
        match self.conversation.try_receive(timeout).await? {
            Some(envelope) => Ok(Some(serde_json::from_value(envelope.into_payload())?)),
            None => Ok(None),
        }
    }

    /// Sends a PROGRESS envelope, which also resets the timeout clock.
    pub fn progress<T: Serialize>(&self, progress: &T) -> Result<()> {
        self.conversation
            .report_progress(serde_json::to_value(progress)?)
    }

    pub fn is_cancelled(&self) -> bool {
        self.interruption.is_cancelled()
    }

    /// Resolves once the client has given up on this call.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.interruption.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.interruption.clone()
    }
}
