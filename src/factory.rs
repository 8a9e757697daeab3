// Copyright 2020 Joyent, Inc.

//! Service types and the table that turns a conversation-open request into a
//! running service instance.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use slog::{info, Logger};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::{ConversationError, Result, ServiceError, ServiceResult};
use crate::messenger::ServiceMessenger;
use crate::progress::ProgressMode;
use crate::utils::{default_logger, read_lock, write_lock};

/// Server side of a conversation. One instance per conversation, owned by
/// it exclusively and dropped when it ends.
///
/// Returning `Ok` ends the conversation with an END envelope, returning an
/// error ends it with an ERROR envelope carrying the error's description.
pub trait Service: Send + 'static {
    fn run(self: Box<Self>, messenger: ServiceMessenger) -> BoxFuture<'static, ServiceResult>;
}

pub trait ServiceFactory: Send + Sync + 'static {
    fn service_type_id(&self) -> &str;

    fn create(&self) -> std::result::Result<Box<dyn Service>, ServiceError>;

    /// How long the conversation may stay silent before it is swept. Also
    /// suggested to clients as their receive deadline.
    fn client_timeout(&self) -> Duration;

    fn interrupt_service_on_client_exception(&self) -> bool;

    fn progress_mode(&self) -> ProgressMode {
        ProgressMode::Manual
    }
}

#[derive(Clone)]
pub struct ServiceFactoryDescriptor {
    service_type_id: String,
    factory: Arc<dyn ServiceFactory>,
    client_timeout: Duration,
    interrupt_service_on_client_exception: bool,
    progress_mode: ProgressMode,
}

impl ServiceFactoryDescriptor {
    pub fn new(factory: Arc<dyn ServiceFactory>) -> ServiceFactoryDescriptor {
        ServiceFactoryDescriptor {
            service_type_id: factory.service_type_id().to_string(),
            client_timeout: factory.client_timeout(),
            interrupt_service_on_client_exception: factory
                .interrupt_service_on_client_exception(),
            progress_mode: factory.progress_mode(),
            factory,
        }
    }

    pub fn service_type_id(&self) -> &str {
        &self.service_type_id
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    pub fn interrupt_service_on_client_exception(&self) -> bool {
        self.interrupt_service_on_client_exception
    }

    pub fn progress_mode(&self) -> ProgressMode {
        self.progress_mode
    }

    fn same_factory(&self, other: &ServiceFactoryDescriptor) -> bool {
        Arc::as_ptr(&self.factory) as *const () == Arc::as_ptr(&other.factory) as *const ()
    }
}

impl fmt::Debug for ServiceFactoryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceFactoryDescriptor")
            .field("service_type_id", &self.service_type_id)
            .field("client_timeout", &self.client_timeout)
            .field(
                "interrupt_service_on_client_exception",
                &self.interrupt_service_on_client_exception,
            )
            .field("progress_mode", &self.progress_mode)
            .finish()
    }
}

/// Write-once table of service types, read on every conversation open.
pub struct FactoryTable {
    factories: RwLock<HashMap<String, ServiceFactoryDescriptor>>,
    registered: Notify,
    log: Logger,
}

impl FactoryTable {
    pub fn new(log: Option<&Logger>) -> FactoryTable {
        FactoryTable {
            factories: RwLock::new(HashMap::new()),
            registered: Notify::new(),
            log: default_logger(log),
        }
    }

    pub fn register(&self, descriptor: ServiceFactoryDescriptor) -> Result<()> {
        let mut factories = write_lock(&self.factories);
        if let Some(existing) = factories.get(descriptor.service_type_id()) {
            if existing.same_factory(&descriptor) {
                return Ok(());
            }
            return Err(ConversationError::DuplicateServiceType(
                descriptor.service_type_id().to_string(),
            ));
        }
        info!(self.log, "registered service type";
            "service_type" => descriptor.service_type_id(),
            "client_timeout_ms" => descriptor.client_timeout().as_millis() as u64,
            "progress" => %descriptor.progress_mode());
        factories.insert(descriptor.service_type_id().to_string(), descriptor);
        drop(factories);
        self.registered.notify_waiters();
        Ok(())
    }

    pub fn resolve(&self, service_type_id: &str) -> Result<ServiceFactoryDescriptor> {
        read_lock(&self.factories)
            .get(service_type_id)
            .cloned()
            .ok_or_else(|| ConversationError::UnknownServiceType(service_type_id.to_string()))
    }

    /// Errors and panics from the factory become `ServiceCreation`.
    pub fn instantiate(&self, descriptor: &ServiceFactoryDescriptor) -> Result<Box<dyn Service>> {
        let creation_error = |description: String| ConversationError::ServiceCreation {
            service_type_id: descriptor.service_type_id().to_string(),
            description,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| descriptor.factory.create())) {
            Ok(Ok(service)) => Ok(service),
            Ok(Err(e)) => Err(creation_error(e.to_string())),
            Err(_) => Err(creation_error(String::from("factory panicked"))),
        }
    }

    pub fn service_type_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_lock(&self.factories).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves on the next registration of a new service type.
    pub(crate) fn registered(&self) -> Notified<'_> {
        self.registered.notified()
    }

    pub fn smallest_client_timeout(&self) -> Option<Duration> {
        read_lock(&self.factories)
            .values()
            .map(|d| d.client_timeout())
            .min()
    }
}

type Constructor =
    dyn Fn() -> std::result::Result<Box<dyn Service>, ServiceError> + Send + Sync;

/// A factory assembled from a type id and a constructor function.
///
/// ```ignore
/// let factory = FnServiceFactory::new("echo", || Ok(Box::new(Echo) as Box<dyn Service>))
///     .with_client_timeout(Duration::from_secs(5));
/// server.add_service_type(factory)?;
/// ```
pub struct FnServiceFactory {
    service_type_id: String,
    constructor: Box<Constructor>,
    client_timeout: Duration,
    interrupt: bool,
    progress_mode: ProgressMode,
}

impl FnServiceFactory {
    pub fn new<S, F>(service_type_id: S, constructor: F) -> FnServiceFactory
    where
        S: Into<String>,
        F: Fn() -> std::result::Result<Box<dyn Service>, ServiceError> + Send + Sync + 'static,
    {
        FnServiceFactory {
            service_type_id: service_type_id.into(),
            constructor: Box::new(constructor),
            client_timeout: Duration::from_secs(30),
            interrupt: true,
            progress_mode: ProgressMode::Manual,
        }
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_interrupt_on_client_exception(mut self, interrupt: bool) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_progress_mode(mut self, mode: ProgressMode) -> Self {
        self.progress_mode = mode;
        self
    }
}

impl ServiceFactory for FnServiceFactory {
    fn service_type_id(&self) -> &str {
        &self.service_type_id
    }

    fn create(&self) -> std::result::Result<Box<dyn Service>, ServiceError> {
        (self.constructor)()
    }

    fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    fn interrupt_service_on_client_exception(&self) -> bool {
        self.interrupt
    }

    fn progress_mode(&self) -> ProgressMode {
        self.progress_mode
    }
}
