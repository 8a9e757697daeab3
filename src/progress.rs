// Copyright 2020 Joyent, Inc.

//! Progress reporting.
//!
//! A conversation is swept once it has been silent for longer than its client
//! timeout. Services that can tell how far along they are report progress
//! themselves (`ProgressMode::Manual`). Services that cannot, for instance
//! because they wait on an opaque external process, are given an automatic
//! ticker that sends a PROGRESS envelope every `cadence` until the
//! conversation closes.
//!
//! The ticker cannot tell a busy service from a hung one: as long as the
//! conversation is open it keeps the client waiting. That is the price of
//! automatic mode and it is intentional.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use slog::{debug, trace};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::conversation::Conversation;
use crate::envelope::ConversationId;
use crate::error::Result;
use crate::registry::ConversationRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressMode {
    Manual,
    Automatic { cadence: Duration },
}

impl fmt::Display for ProgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressMode::Manual => f.write_str("manual"),
            ProgressMode::Automatic { cadence } => {
                write!(f, "automatic every {} ms", cadence.as_millis())
            }
        }
    }
}

/// Entry point for services that report progress by conversation id.
#[derive(Clone)]
pub struct ProgressReporter {
    registry: Arc<ConversationRegistry>,
}

impl ProgressReporter {
    pub fn new(registry: Arc<ConversationRegistry>) -> ProgressReporter {
        ProgressReporter { registry }
    }

    /// Sends a PROGRESS envelope and resets the conversation's timeout clock.
    pub fn update<T: Serialize>(&self, conversation_id: &ConversationId, progress: &T) -> Result<()> {
        let conversation = self.registry.lookup(conversation_id)?;
        conversation.report_progress(serde_json::to_value(progress)?)
    }
}

/// Starts the automatic ticker of `conversation`. The returned task is owned
/// by the conversation, which aborts it when it closes.
pub(crate) fn spawn_ticker(conversation: &Arc<Conversation>, cadence: Duration) -> JoinHandle<()> {
    let weak: Weak<Conversation> = Arc::downgrade(conversation);
    let log = conversation.log().clone();
    let cadence = cadence.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + cadence, cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            let conversation = match weak.upgrade() {
                Some(c) => c,
                None => break,
            };
            tick += 1;
            trace!(log, "automatic progress"; "tick" => tick);
            if conversation
                .report_progress(json!({ "automatic": true, "tick": tick }))
                .is_err()
            {
                debug!(log, "conversation closed, stopping progress ticker");
                break;
            }
        }
    })
}
