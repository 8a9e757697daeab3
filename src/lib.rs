// Copyright 2020 Joyent, Inc.

//! Service conversations: long-running, bidirectional calls between a client
//! and a server-side service.
//!
//! A client asks the server to open a conversation with a service type. The
//! server resolves the type's factory, creates a fresh service instance and
//! runs it on a worker. From then on both sides exchange message envelopes
//! until one of them ends the conversation.
//!
//! Envelope definition
//!
//! * CONVERSATION ID   opaque string naming the conversation. Chosen by the
//!                     opening side.
//!
//! * SEQUENCE          unsigned integer. Each direction of each conversation
//!                     counts from 0 up by exactly one. Any gap or repeat is a
//!                     protocol fault and closes the conversation.
//!
//! * KIND              one of:
//!
//!     * DATA      an application message
//!
//!     * PROGRESS  a heartbeat from the service, optionally carrying progress
//!                 details. Resets the inactivity clock on both sides.
//!
//!     * ERROR     a terminal failure. From the server it carries the
//!                 service's error description, from the client it cancels
//!                 the call.
//!
//!     * END       graceful terminal close
//!
//! * PAYLOAD           a JSON value
//!
//! Timeouts: every service type declares a client timeout. A conversation
//! that sees neither DATA nor PROGRESS for longer than that is closed by the
//! server with an ERROR whose description starts with "timeout:". Services
//! that compute for a long time either report progress themselves or declare
//! automatic progress, in which case the server sends PROGRESS on a fixed
//! cadence while the service runs.
//!
//! Over TCP, envelopes and the open handshake travel in the frames described
//! in [`protocol`]. In-process clients are wired up with
//! [`transport::connect_local`].

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod conversation;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod messenger;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
mod utils;

pub use crate::client::{ClientConversation, ConversationClient};
pub use crate::config::{ClientConfig, ServerConfig};
pub use crate::envelope::{ConversationId, EnvelopeKind, MessageEnvelope};
pub use crate::error::{ConversationError, Result, ServiceError, ServiceResult};
pub use crate::factory::{FnServiceFactory, Service, ServiceFactory};
pub use crate::messenger::ServiceMessenger;
pub use crate::progress::{ProgressMode, ProgressReporter};
pub use crate::server::ConversationServer;
