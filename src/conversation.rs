// Copyright 2020 Joyent, Inc.

//! Server side of one conversation.
//!
//! The transport dispatch task feeds incoming envelopes in through
//! [`Conversation::deliver`], the service task consumes them through its
//! messenger. Outgoing envelopes are numbered and handed to the client's
//! response transport under one lock, so the client sees them in order and
//! nothing follows the terminal envelope.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use serde_json::Value;
use slog::{debug, info, o, trace, warn, Logger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::envelope::{
    ConversationId, EnvelopeKind, MessageEnvelope, SequenceCounter, SequenceTracker,
};
use crate::error::{ConversationError, Result};
use crate::factory::ServiceFactoryDescriptor;
use crate::registry::ConversationRegistry;
use crate::transport::MessageTransport;
use crate::utils::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// The service returned normally.
    Completed,
    /// The service returned an error or panicked.
    ServiceFailed,
    /// The client sent END.
    ClientClosed,
    /// Cancelled by the client or on the server's behalf.
    Cancelled,
    /// No activity for longer than the client timeout.
    TimedOut,
    ProtocolFault,
    /// The connection carrying the conversation went away.
    Disconnected,
}

impl CloseReason {
    fn interrupts_service(self) -> bool {
        matches!(
            self,
            CloseReason::Cancelled
                | CloseReason::TimedOut
                | CloseReason::ProtocolFault
                | CloseReason::Disconnected
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConversationState {
    Open,
    Exchanging,
    Closed(CloseReason),
}

/// Point-in-time view of a conversation, for listings and logs.
#[derive(Clone, Debug, Serialize)]
pub struct ConversationInfo {
    pub id: ConversationId,
    pub service_type_id: String,
    pub client_id: String,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub idle_millis: u64,
    pub client_timeout_millis: u64,
}

pub struct Conversation {
    id: ConversationId,
    service_type_id: String,
    client_id: String,
    created_at: DateTime<Utc>,
    client_timeout: Duration,
    interrupt_on_client_exception: bool,
    state: Mutex<ConversationState>,
    last_activity: Mutex<Instant>,
    outgoing: Mutex<SequenceCounter>,
    incoming: Mutex<SequenceTracker>,
    inbox_tx: mpsc::UnboundedSender<MessageEnvelope>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageEnvelope>>,
    closed: CancellationToken,
    interrupt: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
    response: Arc<dyn MessageTransport>,
    registry: Weak<ConversationRegistry>,
    log: Logger,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        descriptor: &ServiceFactoryDescriptor,
        client_id: &str,
        response: Arc<dyn MessageTransport>,
        registry: &Arc<ConversationRegistry>,
        log: &Logger,
    ) -> Conversation {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let log = log.new(o!(
            "conversation_id" => id.to_string(),
            "service_type" => descriptor.service_type_id().to_string(),
            "client_id" => client_id.to_string(),
        ));
        Conversation {
            id,
            service_type_id: descriptor.service_type_id().to_string(),
            client_id: client_id.to_string(),
            created_at: Utc::now(),
            client_timeout: descriptor.client_timeout(),
            interrupt_on_client_exception: descriptor.interrupt_service_on_client_exception(),
            state: Mutex::new(ConversationState::Open),
            last_activity: Mutex::new(Instant::now()),
            outgoing: Mutex::new(SequenceCounter::new()),
            incoming: Mutex::new(SequenceTracker::new()),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            closed: CancellationToken::new(),
            interrupt: CancellationToken::new(),
            ticker: Mutex::new(None),
            response,
            registry: Arc::downgrade(registry),
            log,
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn service_type_id(&self) -> &str {
        &self.service_type_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    pub fn state(&self) -> ConversationState {
        *lock(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ConversationState::Closed(_))
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state() {
            ConversationState::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    /// Token that fires when the running service call should abort. Services
    /// check it at their own suspension points; nothing is preempted.
    pub fn interruption(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Token that fires whenever the conversation closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Silent for longer than the client timeout as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.last_activity() + self.client_timeout < now
    }

    pub fn info(&self) -> ConversationInfo {
        ConversationInfo {
            id: self.id.clone(),
            service_type_id: self.service_type_id.clone(),
            client_id: self.client_id.clone(),
            state: self.state(),
            created_at: self.created_at,
            idle_millis: Instant::now()
                .saturating_duration_since(self.last_activity())
                .as_millis() as u64,
            client_timeout_millis: self.client_timeout.as_millis() as u64,
        }
    }

    fn check_open(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            ConversationState::Closed(_) => {
                Err(ConversationError::ConversationClosed(self.id.clone()))
            }
            ConversationState::Open => {
                *state = ConversationState::Exchanging;
                Ok(())
            }
            ConversationState::Exchanging => Ok(()),
        }
    }

    /// Numbers `payload` with the next outgoing sequence number and hands it
    /// to the client's response transport.
    pub fn send(&self, kind: EnvelopeKind, payload: Value) -> Result<()> {
        if kind.is_terminal() {
            return Err(ConversationError::Protocol(format!(
                "{} envelopes are sent by closing the conversation",
                kind
            )));
        }
        let mut outgoing = lock(&self.outgoing);
        self.check_open()?;
        let envelope = MessageEnvelope::new(self.id.clone(), outgoing.next(), kind, payload);
        trace!(self.log, "sending envelope";
            "kind" => %kind, "sequence" => envelope.sequence());
        self.touch();
        self.response.send(envelope)
    }

    pub fn report_progress(&self, progress: Value) -> Result<()> {
        self.send(EnvelopeKind::Progress, progress)
    }

    /// Transport side: accepts the next envelope from the client.
    ///
    /// A gap or a repeated number closes the conversation with an ERROR
    /// envelope. END closes it gracefully, ERROR means the client gave up and
    /// cancels it.
    pub fn deliver(&self, envelope: MessageEnvelope) -> Result<()> {
        self.check_open()?;
        let accepted = lock(&self.incoming).accept(&envelope);
        if let Err(e) = accepted {
            warn!(self.log, "protocol fault"; "err" => %e);
            self.finish(CloseReason::ProtocolFault, Some(e.to_string()));
            return Err(e);
        }
        trace!(self.log, "received envelope";
            "kind" => %envelope.kind(), "sequence" => envelope.sequence());
        self.touch();

        match envelope.kind() {
            EnvelopeKind::Data => self
                .inbox_tx
                .send(envelope)
                .map_err(|_| ConversationError::ConversationClosed(self.id.clone())),
            EnvelopeKind::Progress => Ok(()),
            EnvelopeKind::End => {
                self.finish(CloseReason::ClientClosed, None);
                Ok(())
            }
            EnvelopeKind::Error => {
                debug!(self.log, "client reported failure";
                    "description" => envelope.error_description());
                self.finish(CloseReason::Cancelled, None);
                Ok(())
            }
        }
    }

    /// Waits up to `timeout` for the next DATA envelope from the client.
    pub async fn receive(&self, timeout: Duration) -> Result<MessageEnvelope> {
        match self.try_receive(timeout).await? {
            Some(envelope) => Ok(envelope),
            None => Err(ConversationError::ConversationTimeout {
                conversation_id: self.id.clone(),
                timeout_millis: timeout.as_millis() as u64,
            }),
        }
    }

    /// Like `receive`, but a timeout is `Ok(None)`.
    pub async fn try_receive(&self, timeout: Duration) -> Result<Option<MessageEnvelope>> {
        self.check_open()?;
        let mut inbox = self.inbox_rx.lock().await;
        let received = tokio::select! {
            biased;
            envelope = inbox.recv() => envelope,
            _ = self.closed.cancelled() => None,
            _ = time::sleep(timeout) => return Ok(None),
        };
        match received {
            Some(envelope) => {
                self.touch();
                Ok(Some(envelope))
            }
            None => Err(ConversationError::ConversationClosed(self.id.clone())),
        }
    }

    pub(crate) fn attach_ticker(&self, ticker: JoinHandle<()>) {
        let state = lock(&self.state);
        if let ConversationState::Closed(_) = *state {
            ticker.abort();
            return;
        }
        *lock(&self.ticker) = Some(ticker);
    }

    /// Graceful end: END to the client. No-op once closed.
    pub fn close(&self) {
        self.finish(CloseReason::Completed, None);
    }

    /// Closes the conversation and tells the client with an ERROR envelope.
    /// Returns at once; the running service call, if any, is only asked to
    /// stop. No-op once closed.
    pub fn cancel(&self) {
        self.finish(CloseReason::Cancelled, Some(String::from("cancelled")));
    }

    /// Closes the conversation because the service failed.
    pub fn fail(&self, description: &str) {
        self.finish(CloseReason::ServiceFailed, Some(description.to_string()));
    }

    /// Timeout path, used by the sweeper.
    pub fn expire(&self) -> bool {
        let description = format!(
            "timeout: no activity for more than {} ms",
            self.client_timeout.as_millis()
        );
        self.finish(CloseReason::TimedOut, Some(description))
    }

    pub(crate) fn disconnect(&self) {
        self.finish(CloseReason::Disconnected, None);
    }

    /// The single way into CLOSED. Exactly one caller wins and does the
    /// cleanup; everybody else gets `false`.
    ///
    /// `failure` selects the terminal envelope: `Some` sends ERROR with that
    /// description, `None` sends END for `Completed` and nothing for the
    /// reasons the client already knows about.
    fn finish(&self, reason: CloseReason, failure: Option<String>) -> bool {
        let mut outgoing = lock(&self.outgoing);
        {
            let mut state = lock(&self.state);
            if let ConversationState::Closed(_) = *state {
                return false;
            }
            *state = ConversationState::Closed(reason);
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.id);
        }
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
        self.closed.cancel();
        if reason.interrupts_service() && self.interrupt_on_client_exception {
            self.interrupt.cancel();
        }

        let terminal = match (failure, reason) {
            (Some(description), _) => {
                Some(MessageEnvelope::error(self.id.clone(), outgoing.next(), &description))
            }
            (None, CloseReason::Completed) => {
                Some(MessageEnvelope::end(self.id.clone(), outgoing.next()))
            }
            (None, _) => None,
        };
        if let Some(envelope) = terminal {
            if let Err(e) = self.response.send(envelope) {
                debug!(self.log, "could not deliver terminal envelope"; "err" => %e);
            }
        }

        info!(self.log, "conversation closed"; "reason" => %reason);
        true
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("service_type_id", &self.service_type_id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::future::BoxFuture;
    use serde_json::json;

    use crate::error::ServiceResult;
    use crate::factory::{FnServiceFactory, Service, ServiceFactory};
    use crate::messenger::ServiceMessenger;
    use crate::transport::{self, ChannelReceiver};

    struct Idle;

    impl Service for Idle {
        fn run(self: Box<Self>, _m: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
            Box::pin(async { Ok(()) })
        }
    }

    fn conversation(interrupt: bool) -> (Arc<ConversationRegistry>, Arc<Conversation>, ChannelReceiver) {
        let factory: Arc<dyn ServiceFactory> = Arc::new(
            FnServiceFactory::new("idle", || Ok(Box::new(Idle) as Box<dyn Service>))
                .with_client_timeout(Duration::from_millis(100))
                .with_interrupt_on_client_exception(interrupt),
        );
        let descriptor = ServiceFactoryDescriptor::new(factory);
        let registry = Arc::new(ConversationRegistry::new(None));
        let (tx, rx) = transport::channel();
        let log = crate::utils::default_logger(None);
        let conversation = Arc::new(Conversation::new(
            ConversationId::generate(),
            &descriptor,
            "client",
            Arc::new(tx),
            &registry,
            &log,
        ));
        registry.register(Arc::clone(&conversation)).unwrap();
        (registry, conversation, rx)
    }

    fn data(c: &Conversation, seq: u64, v: Value) -> MessageEnvelope {
        MessageEnvelope::data(c.id().clone(), seq, v)
    }

    #[tokio::test]
    async fn outgoing_numbers_increase_by_one() {
        let (_registry, c, mut rx) = conversation(true);
        assert_eq!(c.state(), ConversationState::Open);
        c.send(EnvelopeKind::Data, json!("a")).unwrap();
        c.report_progress(json!({"done": 1})).unwrap();
        c.send(EnvelopeKind::Data, json!("b")).unwrap();
        assert_eq!(c.state(), ConversationState::Exchanging);
        c.close();

        let mut seen = Vec::new();
        while let Ok(env) = rx.try_recv() {
            seen.push((env.sequence(), env.kind()));
        }
        assert_eq!(
            seen,
            vec![
                (0, EnvelopeKind::Data),
                (1, EnvelopeKind::Progress),
                (2, EnvelopeKind::Data),
                (3, EnvelopeKind::End),
            ]
        );
    }

    #[tokio::test]
    async fn terminal_kinds_cannot_be_sent_directly() {
        let (_registry, c, _rx) = conversation(true);
        assert!(matches!(
            c.send(EnvelopeKind::End, Value::Null),
            Err(ConversationError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn delivered_data_is_received_in_order() {
        let (_registry, c, _rx) = conversation(true);
        c.deliver(data(&c, 0, json!("one"))).unwrap();
        c.deliver(data(&c, 1, json!("two"))).unwrap();
        let timeout = Duration::from_millis(50);
        assert_eq!(c.receive(timeout).await.unwrap().payload(), &json!("one"));
        assert_eq!(c.receive(timeout).await.unwrap().payload(), &json!("two"));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out() {
        let (_registry, c, _rx) = conversation(true);
        assert!(c.try_receive(Duration::from_millis(10)).await.unwrap().is_none());
        match c.receive(Duration::from_millis(10)).await {
            Err(ConversationError::ConversationTimeout { timeout_millis, .. }) => {
                assert_eq!(timeout_millis, 10)
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!c.is_closed());
    }

    #[tokio::test]
    async fn repeated_sequence_number_closes_with_error() {
        let (registry, c, mut rx) = conversation(true);
        c.deliver(data(&c, 0, json!("one"))).unwrap();
        let repeat = c.deliver(data(&c, 0, json!("one")));
        assert!(matches!(
            repeat,
            Err(ConversationError::ProtocolSequence { expected: 1, actual: 0, .. })
        ));
        assert_eq!(c.close_reason(), Some(CloseReason::ProtocolFault));
        assert!(!registry.contains(c.id()));
        assert!(c.interruption().is_cancelled());

        let terminal = rx.try_recv().unwrap();
        assert_eq!(terminal.kind(), EnvelopeKind::Error);
        assert!(terminal.error_description().contains("expected message 1"));
    }

    #[tokio::test]
    async fn gap_is_a_protocol_fault() {
        let (_registry, c, _rx) = conversation(true);
        assert!(matches!(
            c.deliver(data(&c, 2, json!("skip"))),
            Err(ConversationError::ProtocolSequence { expected: 0, actual: 2, .. })
        ));
        assert!(c.is_closed());
    }

    #[tokio::test]
    async fn closed_conversation_rejects_operations() {
        let (_registry, c, _rx) = conversation(true);
        c.cancel();
        assert!(matches!(
            c.send(EnvelopeKind::Data, json!(1)),
            Err(ConversationError::ConversationClosed(_))
        ));
        assert!(matches!(
            c.receive(Duration::from_millis(5)).await,
            Err(ConversationError::ConversationClosed(_))
        ));
        assert!(matches!(
            c.deliver(data(&c, 0, json!(1))),
            Err(ConversationError::ConversationClosed(_))
        ));
    }

    #[tokio::test]
    async fn close_paths_race_to_one_removal() {
        let (registry, c, mut rx) = conversation(true);
        let closers: Vec<_> = (0..8)
            .map(|i| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        c.cancel()
                    } else {
                        c.close()
                    }
                })
            })
            .collect();
        for closer in closers {
            closer.join().unwrap();
        }
        assert!(c.is_closed());
        assert_eq!(registry.stats().removed, 1);

        let mut terminals = 0;
        while let Ok(env) = rx.try_recv() {
            assert!(env.kind().is_terminal());
            terminals += 1;
        }
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn interruption_follows_factory_policy() {
        let (_registry, c, _rx) = conversation(false);
        c.cancel();
        assert!(c.closed_token().is_cancelled());
        assert!(!c.interruption().is_cancelled());

        let (_registry, c, _rx) = conversation(true);
        c.close();
        assert!(!c.interruption().is_cancelled());
    }

    #[tokio::test]
    async fn client_end_and_error() {
        let (_registry, c, mut rx) = conversation(true);
        c.deliver(MessageEnvelope::end(c.id().clone(), 0)).unwrap();
        assert_eq!(c.close_reason(), Some(CloseReason::ClientClosed));
        assert!(rx.try_recv().is_err());

        let (_registry, c, _rx) = conversation(true);
        c.deliver(MessageEnvelope::error(c.id().clone(), 0, "client blew up"))
            .unwrap();
        assert_eq!(c.close_reason(), Some(CloseReason::Cancelled));
        assert!(c.interruption().is_cancelled());
    }
}
