// Copyright 2020 Joyent, Inc.

//! Client side of service conversations.
//!
//! A [`ConversationClient`] multiplexes any number of conversations over one
//! outgoing transport and one incoming response transport. Each
//! [`ClientConversation`] looks like an ordinary sequence of calls: `send`,
//! then `receive` the typed answer. PROGRESS envelopes are consumed on the
//! way, pushing the receive deadline out. Whenever the client gives up,
//! because a deadline passed, a reply did not decode, or the conversation
//! handle was dropped mid-call, the server is told with an ERROR envelope so
//! it can release the service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use slog::{debug, info, o, trace, warn, Logger};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::codec::Framed;

use crate::config::ClientConfig;
use crate::envelope::{
    ConversationId, EnvelopeKind, MessageEnvelope, SequenceCounter, SequenceTracker,
};
use crate::error::{ConversationError, Result};
use crate::protocol::{ConversationCodec, ConversationStart, Frame, FrameTransport, OpenFrame, OpenRequest};
use crate::transport::MessageTransport;
use crate::utils::{default_logger, lock};

/// The open call of a server, as seen from a client.
pub trait RemoteConversationServer: Send + Sync {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, Result<ConversationStart>>;
}

#[derive(Clone, Debug)]
enum Failure {
    Service(String),
    Transport(String),
    Protocol { expected: u64, actual: u64 },
}

/// Per-conversation state shared between the handle and the response
/// dispatcher.
struct Link {
    outgoing: SequenceCounter,
    incoming: SequenceTracker,
    inbox: Option<mpsc::UnboundedSender<MessageEnvelope>>,
    failure: Option<Failure>,
    closed: bool,
}

impl Link {
    fn new(inbox: mpsc::UnboundedSender<MessageEnvelope>) -> Link {
        Link {
            outgoing: SequenceCounter::new(),
            incoming: SequenceTracker::new(),
            inbox: Some(inbox),
            failure: None,
            closed: false,
        }
    }

    fn failure_error(&self, id: &ConversationId) -> Option<ConversationError> {
        self.failure.as_ref().map(|failure| match failure {
            Failure::Service(description) => ConversationError::ServiceExecution {
                conversation_id: id.clone(),
                description: description.clone(),
            },
            Failure::Transport(description) => ConversationError::Transport(description.clone()),
            Failure::Protocol { expected, actual } => ConversationError::ProtocolSequence {
                conversation_id: id.clone(),
                expected: *expected,
                actual: *actual,
            },
        })
    }

    fn check_usable(&self, id: &ConversationId) -> Result<()> {
        if let Some(e) = self.failure_error(id) {
            return Err(e);
        }
        if self.closed {
            return Err(ConversationError::ConversationClosed(id.clone()));
        }
        Ok(())
    }
}

type SharedLink = Arc<Mutex<Link>>;

struct ClientShared {
    client_id: String,
    config: ClientConfig,
    remote: Arc<dyn RemoteConversationServer>,
    outgoing: Arc<dyn MessageTransport>,
    links: Mutex<HashMap<ConversationId, SharedLink>>,
    log: Logger,
}

impl ClientShared {
    fn link(&self, id: &ConversationId) -> Option<SharedLink> {
        lock(&self.links).get(id).cloned()
    }

    fn forget(&self, id: &ConversationId) {
        lock(&self.links).remove(id);
    }

    /// Ends the conversation from this side with `kind` (END or ERROR).
    /// Only the first call does anything.
    fn finish(&self, id: &ConversationId, link: &SharedLink, kind: EnvelopeKind, payload: Value) {
        let mut link = lock(link);
        if link.closed {
            return;
        }
        link.closed = true;
        link.inbox = None;
        let envelope = MessageEnvelope::new(id.clone(), link.outgoing.next(), kind, payload);
        if let Err(e) = self.outgoing.send(envelope) {
            debug!(self.log, "could not notify server"; "conversation_id" => %id, "err" => %e);
        }
        drop(link);
        self.forget(id);
        debug!(self.log, "conversation finished"; "conversation_id" => %id, "kind" => %kind);
    }

    fn cancel(&self, id: &ConversationId, link: &SharedLink, reason: &str) {
        self.finish(id, link, EnvelopeKind::Error, Value::String(reason.to_string()));
    }

    /// Response dispatch: routes a server envelope to its conversation.
    fn dispatch(&self, envelope: MessageEnvelope) -> Result<()> {
        let id = envelope.conversation_id().clone();
        let link = self
            .link(&id)
            .ok_or_else(|| ConversationError::ConversationNotFound(id.clone()))?;
        let mut guard = lock(&link);
        if guard.closed {
            return Err(ConversationError::ConversationClosed(id));
        }

        if let Err(e) = guard.incoming.accept(&envelope) {
            warn!(self.log, "protocol fault"; "conversation_id" => %id, "err" => %e);
            if let ConversationError::ProtocolSequence { expected, actual, .. } = e {
                guard.failure = Some(Failure::Protocol { expected, actual });
            }
            drop(guard);
            self.cancel(&id, &link, &e.to_string());
            return Err(e);
        }

        trace!(self.log, "received envelope";
            "conversation_id" => %id, "kind" => %envelope.kind(), "sequence" => envelope.sequence());
        let kind = envelope.kind();
        if kind == EnvelopeKind::Error {
            guard.failure = Some(Failure::Service(envelope.error_description()));
        }
        if let Some(inbox) = guard.inbox.as_ref() {
            let _ = inbox.send(envelope);
        }
        if kind.is_terminal() {
            guard.closed = true;
            guard.inbox = None;
            drop(guard);
            self.forget(&id);
        }
        Ok(())
    }

    /// Fails every open conversation with a transport error, e.g. because
    /// the connection dropped.
    fn fail_all(&self, description: &str) {
        let links: Vec<(ConversationId, SharedLink)> = lock(&self.links).drain().collect();
        for (_, link) in links {
            let mut link = lock(&link);
            if !link.closed {
                link.failure = Some(Failure::Transport(description.to_string()));
                link.closed = true;
                link.inbox = None;
            }
        }
    }
}

struct ResponseDispatch {
    shared: Arc<ClientShared>,
}

impl MessageTransport for ResponseDispatch {
    fn send(&self, envelope: MessageEnvelope) -> Result<()> {
        self.shared.dispatch(envelope)
    }
}

#[derive(Clone)]
pub struct ConversationClient {
    shared: Arc<ClientShared>,
}

impl ConversationClient {
    pub fn new(
        remote: Arc<dyn RemoteConversationServer>,
        outgoing: Arc<dyn MessageTransport>,
        config: ClientConfig,
        log: Option<&Logger>,
    ) -> ConversationClient {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("client-{}", ConversationId::generate()));
        let log = default_logger(log);
        ConversationClient {
            shared: Arc::new(ClientShared {
                client_id,
                config,
                remote,
                outgoing,
                links: Mutex::new(HashMap::new()),
                log,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Where the server's envelopes for this client must be delivered.
    pub fn incoming_response_transport(&self) -> Arc<dyn MessageTransport> {
        Arc::new(ResponseDispatch {
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn open_conversations(&self) -> usize {
        lock(&self.shared.links).len()
    }

    pub fn fail_all(&self, description: &str) {
        self.shared.fail_all(description)
    }

    pub async fn start_conversation(&self, service_type_id: &str) -> Result<ClientConversation> {
        let shared = &self.shared;
        let id = ConversationId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(Link::new(tx)));
        // Registered before the open so that nothing the service sends right
        // away is lost.
        lock(&shared.links).insert(id.clone(), Arc::clone(&link));

        let request = OpenRequest {
            service_type_id: service_type_id.to_string(),
            client_id: shared.client_id.clone(),
            conversation_id: Some(id.clone()),
            session_token: shared.config.session_token.clone(),
        };
        let start = match shared.remote.open(request).await {
            Ok(start) => start,
            Err(e) => {
                shared.forget(&id);
                return Err(e);
            }
        };
        if start.conversation_id != id {
            let mut links = lock(&shared.links);
            links.remove(&id);
            links.insert(start.conversation_id.clone(), Arc::clone(&link));
        }

        let receive_timeout = Duration::from_millis(
            shared
                .config
                .receive_timeout_millis
                .unwrap_or(start.client_timeout_millis),
        );
        let log = shared
            .log
            .new(o!("conversation_id" => start.conversation_id.to_string()));
        info!(log, "conversation opened";
            "service_type" => service_type_id,
            "receive_timeout_ms" => receive_timeout.as_millis() as u64,
            "queued" => start.work_queue_size_at_startup);

        Ok(ClientConversation {
            id: start.conversation_id,
            link,
            inbox: rx,
            shared: Arc::clone(shared),
            receive_timeout,
            work_queue_size_at_startup: start.work_queue_size_at_startup,
            progress_listener: None,
            log,
        })
    }

    /// One request, one typed reply. Opens a conversation, sends `args`,
    /// waits for the answer and closes the conversation again.
    pub async fn call<A, R>(&self, service_type_id: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let mut conversation = self.start_conversation(service_type_id).await?;
        if let Err(e) = conversation.send(args) {
            conversation.cancel();
            return Err(e);
        }
        let result = conversation.receive().await?;
        conversation.close();
        Ok(result)
    }
}

type ProgressListener = Box<dyn FnMut(&Value) + Send>;

/// Calls `cancel` on the conversation if the waiting future is dropped
/// before it finished.
struct CancelOnDrop {
    shared: Arc<ClientShared>,
    id: ConversationId,
    link: SharedLink,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.shared
                .cancel(&self.id, &self.link, "client abandoned receive");
        }
    }
}

pub struct ClientConversation {
    id: ConversationId,
    link: SharedLink,
    inbox: mpsc::UnboundedReceiver<MessageEnvelope>,
    shared: Arc<ClientShared>,
    receive_timeout: Duration,
    work_queue_size_at_startup: usize,
    progress_listener: Option<ProgressListener>,
    log: Logger,
}

impl ClientConversation {
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub fn server_work_queue_size_at_startup(&self) -> usize {
        self.work_queue_size_at_startup
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.link).closed
    }

    /// Called with the payload of every PROGRESS envelope.
    pub fn set_progress_listener<F: FnMut(&Value) + Send + 'static>(&mut self, listener: F) {
        self.progress_listener = Some(Box::new(listener));
    }

    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut link = lock(&self.link);
        link.check_usable(&self.id)?;
        let envelope = link.outgoing.stamp(&self.id, EnvelopeKind::Data, message)?;
        trace!(self.log, "sending envelope"; "sequence" => envelope.sequence());
        if let Err(e) = self.shared.outgoing.send(envelope) {
            drop(link);
            self.cancel();
            return Err(e);
        }
        Ok(())
    }

    /// Waits for the next DATA message and decodes it. An END instead is
    /// `ConversationClosed`.
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T> {
        let envelope = self.receive_envelope().await?;
        match envelope.kind() {
            EnvelopeKind::Data => match serde_json::from_value(envelope.into_payload()) {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.cancel_with("client could not decode message");
                    Err(e.into())
                }
            },
            _ => Err(ConversationError::ConversationClosed(self.id.clone())),
        }
    }

    /// Next DATA or END envelope. PROGRESS envelopes are handed to the
    /// progress listener and restart the deadline. Running out of time
    /// cancels the conversation.
    pub async fn receive_envelope(&mut self) -> Result<MessageEnvelope> {
        lock(&self.link).failure_error(&self.id).map_or(Ok(()), Err)?;

        let guard = CancelOnDrop {
            shared: Arc::clone(&self.shared),
            id: self.id.clone(),
            link: Arc::clone(&self.link),
            armed: true,
        };
        let result = self.wait_for_message(self.receive_timeout, true).await;
        guard.disarm();

        match result {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => {
                warn!(self.log, "no message from server in time";
                    "timeout_ms" => self.receive_timeout.as_millis() as u64);
                self.cancel_with("client timed out");
                Err(ConversationError::ConversationTimeout {
                    conversation_id: self.id.clone(),
                    timeout_millis: self.receive_timeout.as_millis() as u64,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// `None` if no message arrived within `timeout`. Unlike `receive`, this
    /// does not give up on the conversation, and neither does dropping the
    /// returned future before it completes. Use it for polling.
    pub async fn try_receive<T: DeserializeOwned>(&mut self, timeout: Duration) -> Result<Option<T>> {
        lock(&self.link).failure_error(&self.id).map_or(Ok(()), Err)?;
        match self.wait_for_message(timeout, false).await? {
            Some(envelope) if envelope.kind() == EnvelopeKind::Data => {
                match serde_json::from_value(envelope.into_payload()) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        self.cancel_with("client could not decode message");
                        Err(e.into())
                    }
                }
            }
            Some(_) => Err(ConversationError::ConversationClosed(self.id.clone())),
            None => Ok(None),
        }
    }

    async fn wait_for_message(
        &mut self,
        timeout: Duration,
        progress_extends: bool,
    ) -> Result<Option<MessageEnvelope>> {
        let mut deadline = Instant::now() + timeout;
        loop {
            let envelope = match time::timeout_at(deadline, self.inbox.recv()).await {
                Err(_elapsed) => return Ok(None),
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Err(self.terminal_error()),
            };
            match envelope.kind() {
                EnvelopeKind::Progress => {
                    if progress_extends {
                        deadline = Instant::now() + timeout;
                    }
                    if let Some(listener) = self.progress_listener.as_mut() {
                        listener(envelope.payload());
                    }
                }
                EnvelopeKind::Data | EnvelopeKind::End => return Ok(Some(envelope)),
                EnvelopeKind::Error => return Err(self.terminal_error()),
            }
        }
    }

    fn terminal_error(&self) -> ConversationError {
        lock(&self.link)
            .failure_error(&self.id)
            .unwrap_or_else(|| ConversationError::ConversationClosed(self.id.clone()))
    }

    /// Graceful end: sends END. Idempotent.
    pub fn close(&self) {
        self.shared
            .finish(&self.id, &self.link, EnvelopeKind::End, Value::Null);
    }

    /// Gives up on the conversation and tells the server, which interrupts
    /// the service if its type asks for it. Idempotent.
    pub fn cancel(&self) {
        self.cancel_with("cancelled by client");
    }

    /// Same as `cancel`.
    pub fn terminate(&self) {
        self.cancel();
    }

    fn cancel_with(&self, reason: &str) {
        self.shared.cancel(&self.id, &self.link, reason);
    }
}

impl Drop for ClientConversation {
    fn drop(&mut self) {
        self.cancel_with("conversation dropped by client");
    }
}

type OpenReply = oneshot::Sender<Result<ConversationStart>>;

/// Opens waiting for their reply. `None` once the connection is gone.
type PendingOpens = Arc<Mutex<Option<HashMap<u32, OpenReply>>>>;

fn connection_closed() -> ConversationError {
    ConversationError::Transport(String::from("connection closed"))
}

/// Opens conversations on a remote server through a TCP connection.
struct TcpRemote {
    tx: mpsc::UnboundedSender<Frame>,
    pending: PendingOpens,
    next_request: AtomicU32,
}

impl RemoteConversationServer for TcpRemote {
    fn open(&self, request: OpenRequest) -> BoxFuture<'_, Result<ConversationStart>> {
        Box::pin(async move {
            let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
            let (reply_tx, reply_rx) = oneshot::channel();
            {
                // Inserted and sent under the lock so the reader either
                // answers this open or drops it when the connection ends.
                let mut pending = lock(&self.pending);
                let waiting = pending.as_mut().ok_or_else(connection_closed)?;
                if self
                    .tx
                    .send(Frame::Open(OpenFrame { request_id, request }))
                    .is_err()
                {
                    return Err(connection_closed());
                }
                waiting.insert(request_id, reply_tx);
            }
            reply_rx.await.map_err(|_| connection_closed())?
        })
    }
}

/// Connects to a conversation server. All conversations of the returned
/// client share this one connection.
pub async fn connect(
    addr: &SocketAddr,
    config: ClientConfig,
    log: Option<&Logger>,
) -> Result<ConversationClient> {
    let log = default_logger(log).new(o!("server" => addr.to_string()));
    let socket = TcpStream::connect(addr).await?;
    let framed = Framed::new(socket, ConversationCodec::default());
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer_log = log.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(writer_log, "failed to write frame"; "err" => %e);
                break;
            }
        }
    });

    let pending: PendingOpens = Arc::new(Mutex::new(Some(HashMap::new())));
    let remote = TcpRemote {
        tx: tx.clone(),
        pending: Arc::clone(&pending),
        next_request: AtomicU32::new(1),
    };
    let client = ConversationClient::new(
        Arc::new(remote),
        FrameTransport::new(tx).into_shared(),
        config,
        Some(&log),
    );

    let responses = client.incoming_response_transport();
    let reader_client = client.clone();
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Frame::Opened(opened)) => {
                    let reply = lock(&pending)
                        .as_mut()
                        .and_then(|waiting| waiting.remove(&opened.request_id));
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(opened.start));
                    }
                }
                Ok(Frame::OpenFailed(failed)) => {
                    let reply = lock(&pending)
                        .as_mut()
                        .and_then(|waiting| waiting.remove(&failed.request_id));
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(failed.error.into()));
                    }
                }
                Ok(Frame::Envelope(envelope)) => {
                    let id = envelope.conversation_id().clone();
                    if let Err(e) = responses.send(envelope) {
                        debug!(log, "response not delivered"; "conversation_id" => %id, "err" => %e);
                    }
                }
                Ok(Frame::Open(_)) => warn!(log, "server sent an open request"),
                Err(e) => {
                    warn!(log, "failed to read frame"; "err" => %e);
                    break;
                }
            }
        }
        info!(log, "connection to server closed");
        // Dropping the senders fails every open still waiting.
        lock(&pending).take();
        reader_client.fail_all("connection to server closed");
    });

    Ok(client)
}
