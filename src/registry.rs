// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use slog::{debug, warn, Logger};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::conversation::{Conversation, ConversationInfo};
use crate::envelope::ConversationId;
use crate::error::{ConversationError, Result};
use crate::factory::FactoryTable;
use crate::utils::{default_logger, lock};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: u64,
    pub removed: u64,
}

/// Process-wide table of live conversations.
///
/// The map lock is only ever held for map operations; closing a conversation
/// (which talks to its transport) happens after it has been released.
pub struct ConversationRegistry {
    conversations: Mutex<HashMap<ConversationId, Arc<Conversation>>>,
    registered: AtomicU64,
    removed: AtomicU64,
    log: Logger,
}

impl ConversationRegistry {
    pub fn new(log: Option<&Logger>) -> ConversationRegistry {
        ConversationRegistry {
            conversations: Mutex::new(HashMap::new()),
            registered: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            log: default_logger(log),
        }
    }

    pub fn register(&self, conversation: Arc<Conversation>) -> Result<()> {
        let mut conversations = lock(&self.conversations);
        if conversations.contains_key(conversation.id()) {
            return Err(ConversationError::Protocol(format!(
                "conversation id {} is already registered",
                conversation.id()
            )));
        }
        conversations.insert(conversation.id().clone(), conversation);
        self.registered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes `id` if present. Safe to race: exactly one caller gets the
    /// conversation back.
    pub fn unregister(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        let removed = lock(&self.conversations).remove(id);
        if removed.is_some() {
            self.removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Unknown and closed ids are both `ConversationNotFound`; callers treat
    /// that as "already terminated".
    pub fn lookup(&self, id: &ConversationId) -> Result<Arc<Conversation>> {
        match lock(&self.conversations).get(id) {
            Some(c) if !c.is_closed() => Ok(Arc::clone(c)),
            _ => Err(ConversationError::ConversationNotFound(id.clone())),
        }
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        lock(&self.conversations).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.conversations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Conversation>> {
        lock(&self.conversations).values().cloned().collect()
    }

    pub fn infos(&self) -> Vec<ConversationInfo> {
        self.snapshot().iter().map(|c| c.info()).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.registered.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
        }
    }

    /// Expires every conversation that has been silent for longer than its
    /// client timeout as of `now`. Returns how many this sweep closed;
    /// conversations closed concurrently by someone else are skipped.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut expired = 0;
        for conversation in self.snapshot() {
            if conversation.is_expired(now) && conversation.expire() {
                warn!(self.log, "conversation timed out";
                    "conversation_id" => %conversation.id(),
                    "service_type" => conversation.service_type_id(),
                    "client_timeout_ms" => conversation.client_timeout().as_millis() as u64);
                expired += 1;
            }
        }
        expired
    }
}

/// Pause between sweeps: the configured bound, shortened to a quarter of
/// the smallest client timeout registered so far.
pub(crate) fn sweep_interval(max: Duration, factories: &FactoryTable) -> Duration {
    let interval = match factories.smallest_client_timeout() {
        Some(timeout) => max.min(timeout / 4),
        None => max,
    };
    interval.max(MIN_SWEEP_INTERVAL)
}

/// Runs `sweep` until the registry is dropped. The interval is recomputed
/// whenever a service type is registered.
pub(crate) fn spawn_sweeper(
    registry: Weak<ConversationRegistry>,
    factories: Arc<FactoryTable>,
    max_interval: Duration,
    log: Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let registered = factories.registered();
            let interval = sweep_interval(max_interval, &factories);
            tokio::select! {
                _ = time::sleep(interval) => (),
                // A new service type may need a shorter interval.
                _ = registered => continue,
            }
            let registry = match registry.upgrade() {
                Some(r) => r,
                None => break,
            };
            let expired = registry.sweep(Instant::now());
            if expired > 0 {
                debug!(log, "sweep finished"; "expired" => expired, "live" => registry.len());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::future::BoxFuture;

    use crate::envelope::EnvelopeKind;
    use crate::error::ServiceResult;
    use crate::factory::{FnServiceFactory, Service, ServiceFactory, ServiceFactoryDescriptor};
    use crate::messenger::ServiceMessenger;
    use crate::transport::{self, ChannelReceiver};

    struct Idle;

    impl Service for Idle {
        fn run(self: Box<Self>, _m: ServiceMessenger) -> BoxFuture<'static, ServiceResult> {
            Box::pin(async { Ok(()) })
        }
    }

    fn descriptor(timeout_ms: u64) -> ServiceFactoryDescriptor {
        let factory: Arc<dyn ServiceFactory> = Arc::new(
            FnServiceFactory::new("idle", || Ok(Box::new(Idle) as Box<dyn Service>))
                .with_client_timeout(Duration::from_millis(timeout_ms)),
        );
        ServiceFactoryDescriptor::new(factory)
    }

    fn open(
        registry: &Arc<ConversationRegistry>,
        timeout_ms: u64,
    ) -> (Arc<Conversation>, ChannelReceiver) {
        let (tx, rx) = transport::channel();
        let conversation = Arc::new(Conversation::new(
            ConversationId::generate(),
            &descriptor(timeout_ms),
            "client",
            Arc::new(tx),
            registry,
            &default_logger(None),
        ));
        registry.register(Arc::clone(&conversation)).unwrap();
        (conversation, rx)
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let registry = Arc::new(ConversationRegistry::new(None));
        let (c, _rx) = open(&registry, 100);
        assert!(registry.lookup(c.id()).is_ok());
        assert!(registry.register(Arc::clone(&c)).is_err());

        assert!(registry.unregister(c.id()).is_some());
        assert!(registry.unregister(c.id()).is_none());
        assert!(matches!(
            registry.lookup(c.id()),
            Err(ConversationError::ConversationNotFound(_))
        ));
        assert_eq!(registry.stats(), RegistryStats { registered: 1, removed: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_silent_conversations() {
        let registry = Arc::new(ConversationRegistry::new(None));
        let (quiet, mut quiet_rx) = open(&registry, 100);
        let (busy, _busy_rx) = open(&registry, 100);

        time::advance(Duration::from_millis(90)).await;
        busy.send(EnvelopeKind::Data, serde_json::json!("still here")).unwrap();
        time::advance(Duration::from_millis(60)).await;

        assert_eq!(registry.sweep(Instant::now()), 1);
        assert!(!registry.contains(quiet.id()));
        assert!(registry.contains(busy.id()));
        assert!(matches!(
            registry.lookup(quiet.id()),
            Err(ConversationError::ConversationNotFound(_))
        ));

        let terminal = quiet_rx.try_recv().unwrap();
        assert_eq!(terminal.kind(), EnvelopeKind::Error);
        assert!(terminal.error_description().starts_with("timeout:"));

        // Nothing left to do for an already expired conversation.
        assert_eq!(registry.sweep(Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn boundary_is_exclusive() {
        let registry = Arc::new(ConversationRegistry::new(None));
        let (c, _rx) = open(&registry, 100);
        let deadline = c.last_activity() + Duration::from_millis(100);
        assert_eq!(registry.sweep(deadline), 0);
        assert_eq!(registry.sweep(deadline + Duration::from_millis(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper() {
        let registry = Arc::new(ConversationRegistry::new(None));
        let factories = Arc::new(FactoryTable::new(None));
        factories.register(descriptor(100)).unwrap();
        let sweeper = spawn_sweeper(
            Arc::downgrade(&registry),
            Arc::clone(&factories),
            Duration::from_secs(1),
            default_logger(None),
        );

        let (c, _rx) = open(&registry, 100);
        time::sleep(Duration::from_millis(150)).await;
        assert!(!registry.contains(c.id()));
        sweeper.abort();
    }

    #[test]
    fn interval_tracks_smallest_timeout() {
        let factories = FactoryTable::new(None);
        let max = Duration::from_secs(1);
        assert_eq!(sweep_interval(max, &factories), max);
        factories.register(descriptor(100)).unwrap();
        assert_eq!(sweep_interval(max, &factories), Duration::from_millis(25));
    }
}
