// Copyright 2020 Joyent, Inc.

//! Server side: service type dispatch, the worker pool running services,
//! and the task that serves one TCP connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use futures::{SinkExt, StreamExt};
use slog::{debug, error, info, o, warn, Logger};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::config::ServerConfig;
use crate::conversation::{Conversation, ConversationInfo};
use crate::envelope::{ConversationId, MessageEnvelope};
use crate::error::{ConversationError, Result};
use crate::factory::{FactoryTable, Service, ServiceFactory, ServiceFactoryDescriptor};
use crate::messenger::ServiceMessenger;
use crate::progress::{self, ProgressMode, ProgressReporter};
use crate::protocol::{
    ConversationCodec, ConversationStart, Frame, FrameTransport, OpenFailedFrame, OpenRequest,
    OpenedFrame,
};
use crate::registry::{self, ConversationRegistry};
use crate::transport::MessageTransport;
use crate::utils::{default_logger, read_lock, write_lock};

/// Checks the session token of an open request. Authorization itself lives
/// outside this crate.
pub trait SessionValidator: Send + Sync {
    fn validate(&self, client_id: &str, session_token: Option<&str>) -> std::result::Result<(), String>;
}

struct ServerInner {
    config: ServerConfig,
    factories: Arc<FactoryTable>,
    registry: Arc<ConversationRegistry>,
    clients: RwLock<HashMap<String, Arc<dyn MessageTransport>>>,
    session_validator: RwLock<Option<Arc<dyn SessionValidator>>>,
    workers: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    sweeper: JoinHandle<()>,
    log: Logger,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Decrements the in-flight count when a conversation's worker is done, or
/// when an admitted open fails.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cheap to clone; all clones share one server. Must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct ConversationServer {
    inner: Arc<ServerInner>,
}

impl ConversationServer {
    pub fn new(config: ServerConfig, log: Option<&Logger>) -> ConversationServer {
        let log = default_logger(log);
        let factories = Arc::new(FactoryTable::new(Some(&log)));
        let registry = Arc::new(ConversationRegistry::new(Some(&log)));
        let sweeper = registry::spawn_sweeper(
            Arc::downgrade(&registry),
            Arc::clone(&factories),
            config.sweep_interval_duration(),
            log.clone(),
        );
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        info!(log, "conversation server started";
            "max_workers" => config.max_workers,
            "work_queue_size" => config.work_queue_size);

        ConversationServer {
            inner: Arc::new(ServerInner {
                config,
                factories,
                registry,
                clients: RwLock::new(HashMap::new()),
                session_validator: RwLock::new(None),
                workers,
                in_flight: Arc::new(AtomicUsize::new(0)),
                sweeper,
                log,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn add_service_type<F: ServiceFactory>(&self, factory: F) -> Result<()> {
        self.register_factory(ServiceFactoryDescriptor::new(Arc::new(factory)))
    }

    pub fn register_factory(&self, descriptor: ServiceFactoryDescriptor) -> Result<()> {
        self.inner.factories.register(descriptor)
    }

    pub fn service_type_ids(&self) -> Vec<String> {
        self.inner.factories.service_type_ids()
    }

    pub fn set_session_validator(&self, validator: Arc<dyn SessionValidator>) {
        *write_lock(&self.inner.session_validator) = Some(validator);
    }

    pub fn add_client_response_transport(&self, client_id: &str, transport: Arc<dyn MessageTransport>) {
        debug!(self.inner.log, "client attached"; "client_id" => client_id);
        write_lock(&self.inner.clients).insert(client_id.to_string(), transport);
    }

    /// Detaches a client and cancels whatever conversations it still had.
    pub fn remove_client(&self, client_id: &str) {
        write_lock(&self.inner.clients).remove(client_id);
        let orphans: Vec<Arc<Conversation>> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|c| c.client_id() == client_id)
            .collect();
        debug!(self.inner.log, "client detached";
            "client_id" => client_id, "orphaned_conversations" => orphans.len());
        for conversation in orphans {
            conversation.disconnect();
        }
    }

    /// Resolves the service type, instantiates the service and binds it to a
    /// new, registered conversation. Nothing is registered if any step fails.
    pub fn start_conversation(&self, request: &OpenRequest) -> Result<ConversationStart> {
        let inner = &self.inner;

        let validator = read_lock(&inner.session_validator).clone();
        if let Some(validator) = validator {
            validator
                .validate(&request.client_id, request.session_token.as_deref())
                .map_err(ConversationError::InvalidSession)?;
        }

        let descriptor = inner.factories.resolve(&request.service_type_id)?;
        let response = read_lock(&inner.clients)
            .get(&request.client_id)
            .cloned()
            .ok_or_else(|| ConversationError::UnknownClient(request.client_id.clone()))?;

        let in_flight_before = inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = InFlight(Arc::clone(&inner.in_flight));
        if in_flight_before >= inner.config.capacity() {
            warn!(inner.log, "rejecting conversation";
                "service_type" => &request.service_type_id, "in_flight" => in_flight_before);
            return Err(ConversationError::ServerBusy(in_flight_before));
        }

        let service = inner.factories.instantiate(&descriptor)?;
        let id = request
            .conversation_id
            .clone()
            .unwrap_or_else(ConversationId::generate);
        let conversation = Arc::new(Conversation::new(
            id.clone(),
            &descriptor,
            &request.client_id,
            response,
            &inner.registry,
            &inner.log,
        ));
        inner.registry.register(Arc::clone(&conversation))?;

        if let ProgressMode::Automatic { cadence } = descriptor.progress_mode() {
            conversation.attach_ticker(progress::spawn_ticker(&conversation, cadence));
        }

        let queued = (in_flight_before + 1).saturating_sub(inner.config.max_workers.max(1));
        info!(conversation.log(), "conversation started"; "queued" => queued);
        self.spawn_worker(conversation, service, in_flight);

        Ok(ConversationStart {
            conversation_id: id,
            client_timeout_millis: descriptor.client_timeout().as_millis() as u64,
            work_queue_size_at_startup: queued,
        })
    }

    fn spawn_worker(&self, conversation: Arc<Conversation>, service: Box<dyn Service>, in_flight: InFlight) {
        let workers = Arc::clone(&self.inner.workers);
        tokio::spawn(async move {
            let _in_flight = in_flight;
            let closed = conversation.closed_token();
            let _permit = tokio::select! {
                permit = workers.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        conversation.cancel();
                        return;
                    }
                },
                // Closed before a worker became free; the service never runs.
                _ = closed.cancelled() => return,
            };

            debug!(conversation.log(), "service running");
            let messenger = ServiceMessenger::new(Arc::clone(&conversation));
            match tokio::spawn(service.run(messenger)).await {
                Ok(Ok(())) => conversation.close(),
                Ok(Err(e)) => {
                    debug!(conversation.log(), "service failed"; "err" => %e);
                    conversation.fail(&e.to_string());
                }
                Err(e) => {
                    error!(conversation.log(), "service panicked"; "err" => %e);
                    conversation.fail(&format!("service panicked: {}", e));
                }
            }
        });
    }

    /// Hands an envelope from a client to its conversation. Unknown ids are
    /// `ConversationNotFound`, which the transport should treat as benign.
    pub fn deliver(&self, envelope: MessageEnvelope) -> Result<()> {
        let conversation = self.inner.registry.lookup(envelope.conversation_id())?;
        conversation.deliver(envelope)
    }

    /// Like `deliver`, for a caller that speaks for `client_id` only. A
    /// conversation of another client is reported as not found.
    pub fn deliver_from(&self, client_id: &str, envelope: MessageEnvelope) -> Result<()> {
        let conversation = self.inner.registry.lookup(envelope.conversation_id())?;
        if conversation.client_id() != client_id {
            warn!(self.inner.log, "envelope for another client's conversation";
                "client_id" => client_id,
                "conversation_id" => %conversation.id(),
                "owner" => conversation.client_id());
            return Err(ConversationError::ConversationNotFound(conversation.id().clone()));
        }
        conversation.deliver(envelope)
    }

    /// The transport clients send their envelopes to.
    pub fn incoming(&self) -> Arc<dyn MessageTransport> {
        Arc::new(IncomingTransport {
            server: self.clone(),
        })
    }

    pub fn has_conversation(&self, id: &ConversationId) -> bool {
        self.inner.registry.contains(id)
    }

    pub fn conversations(&self) -> Vec<ConversationInfo> {
        self.inner.registry.infos()
    }

    /// Idempotent; an id that is already gone is not an error.
    pub fn cancel(&self, id: &ConversationId) {
        if let Ok(conversation) = self.inner.registry.lookup(id) {
            conversation.cancel();
        }
    }

    /// Idempotent; an id that is already gone is not an error.
    pub fn close(&self, id: &ConversationId) {
        if let Ok(conversation) = self.inner.registry.lookup(id) {
            conversation.close();
        }
    }

    pub fn progress_reporter(&self) -> ProgressReporter {
        ProgressReporter::new(Arc::clone(&self.inner.registry))
    }

    pub fn registry(&self) -> &Arc<ConversationRegistry> {
        &self.inner.registry
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

struct IncomingTransport {
    server: ConversationServer,
}

impl MessageTransport for IncomingTransport {
    fn send(&self, envelope: MessageEnvelope) -> Result<()> {
        self.server.deliver(envelope)
    }
}

/// Serves one TCP connection. Every conversation opened over it shares the
/// connection; they are cancelled when it goes away.
pub async fn make_task(socket: TcpStream, server: ConversationServer, log: Option<&Logger>) {
    let peer = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| String::from("unknown"));
    let client_id = format!("tcp-{}-{}", peer, ConversationId::generate());
    let log = default_logger(log).new(o!("client_id" => client_id.clone()));

    let framed = Framed::new(socket, ConversationCodec::new(server.config().max_frame_len));
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer_log = log.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(writer_log, "failed to write frame"; "err" => %e);
                break;
            }
        }
    });

    server.add_client_response_transport(&client_id, FrameTransport::new(tx.clone()).into_shared());
    info!(log, "connection accepted"; "peer" => &peer);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Frame::Open(open)) => {
                let mut request = open.request;
                request.client_id = client_id.clone();
                let reply = match server.start_conversation(&request) {
                    Ok(start) => Frame::Opened(OpenedFrame {
                        request_id: open.request_id,
                        start,
                    }),
                    Err(e) => {
                        debug!(log, "open failed";
                            "service_type" => &request.service_type_id, "err" => %e);
                        Frame::OpenFailed(OpenFailedFrame {
                            request_id: open.request_id,
                            error: e.to_wire(),
                        })
                    }
                };
                if tx.send(reply).is_err() {
                    break;
                }
            }
            Ok(Frame::Envelope(envelope)) => {
                let id = envelope.conversation_id().clone();
                if let Err(e) = server.deliver_from(&client_id, envelope) {
                    debug!(log, "envelope not delivered"; "conversation_id" => %id, "err" => %e);
                }
            }
            Ok(other) => {
                warn!(log, "unexpected frame from client"; "type" => ?other.frame_type());
            }
            Err(e) => {
                warn!(log, "failed to read frame"; "err" => %e);
                break;
            }
        }
    }

    info!(log, "connection closed");
    server.remove_client(&client_id);
    drop(tx);
    let _ = writer.await;
}
