// Copyright 2020 Joyent, Inc.

//! Delivery of envelopes between the two ends of a conversation.
//!
//! Transports are expected to deliver in order per conversation and to not
//! block the caller for long: conversations hand envelopes to them while
//! holding their sequencing lock.

use std::sync::Arc;

use futures::future::BoxFuture;
use slog::{debug, o, warn, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{ConversationClient, RemoteConversationServer};
use crate::config::ClientConfig;
use crate::envelope::{ConversationId, MessageEnvelope};
use crate::error::{ConversationError, Result};
use crate::protocol::{ConversationStart, OpenRequest};
use crate::server::ConversationServer;
use crate::utils::default_logger;

pub trait MessageTransport: Send + Sync {
    fn send(&self, envelope: MessageEnvelope) -> Result<()>;
}

pub type ChannelReceiver = mpsc::UnboundedReceiver<MessageEnvelope>;

#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<MessageEnvelope>,
}

impl MessageTransport for ChannelTransport {
    fn send(&self, envelope: MessageEnvelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| ConversationError::Transport(String::from("receiver dropped")))
    }
}

pub fn channel() -> (ChannelTransport, ChannelReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelTransport { tx }, rx)
}

/// Forwards everything arriving on `rx` to `target` until the channel
/// closes.
pub fn spawn_pump(
    mut rx: ChannelReceiver,
    target: Arc<dyn MessageTransport>,
    log: Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let id = envelope.conversation_id().clone();
            match target.send(envelope) {
                Ok(()) => (),
                Err(e) if e.is_recoverable() => {
                    debug!(log, "dropping envelope"; "conversation_id" => %id, "err" => %e);
                }
                Err(e) => {
                    warn!(log, "envelope delivery failed"; "conversation_id" => %id, "err" => %e);
                }
            }
        }
    })
}

/// A client living in the same process as the server.
pub struct LocalConnection {
    server: ConversationServer,
}

impl RemoteConversationServer for LocalConnection {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, Result<ConversationStart>> {
        Box::pin(async move { self.server.start_conversation(&request) })
    }
}

/// Wires a new client to `server` through in-process channels. Both
/// directions go through a pump task, so neither side ever calls into the
/// other while holding its own locks.
pub fn connect_local(
    server: &ConversationServer,
    mut config: ClientConfig,
    log: Option<&Logger>,
) -> ConversationClient {
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("local-{}", ConversationId::generate()));
    config.client_id = Some(client_id.clone());
    let log = default_logger(log).new(o!("client_id" => client_id.clone()));

    let (to_server, to_server_rx) = channel();
    spawn_pump(to_server_rx, server.incoming(), log.clone());

    let remote = LocalConnection {
        server: server.clone(),
    };
    let client = ConversationClient::new(Arc::new(remote), Arc::new(to_server), config, Some(&log));

    let (to_client, to_client_rx) = channel();
    spawn_pump(to_client_rx, client.incoming_response_transport(), log);
    server.add_client_response_transport(&client_id, Arc::new(to_client));

    client
}
