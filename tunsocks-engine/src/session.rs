//! Session controller
//!
//! Owns the proxy endpoint, the interface and the reader task of at most
//! one session, and enforces the order in which they are acquired and
//! released:
//!
//! ```text
//! start:  proxy endpoint → interface → stack (+ sink) → reader → notify(true)
//! stop:   close interface + join reader → stack → release interface → proxy → notify(false)
//! ```
//!
//! Every lifecycle operation serializes on a single async mutex. A `start`
//! issued while a teardown is in progress therefore waits until the
//! controller is idle and then starts a fresh session; a `revoke` issued
//! while a start is in flight waits for it and then tears it down.
//!
//! Operations run on their own task, so a caller that stops waiting (for
//! example through a timeout) cannot leave a half-built session behind.
//! Events are queued while the mutex is held and handed to the
//! [`EventHandler`] only after it is released.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::sync::{oneshot, watch, Mutex};
use tunsocks_tun::{PacketInterface, RoutingConfig};

use crate::config::{ProxyConfig, SessionSettings};
use crate::control::ControlAction;
use crate::error::{Error, Result};
use crate::event::{
    EventHandler, LoggingEventHandler, SessionEvent, SessionState, SessionStats, SessionStatsRef,
    StatsSnapshot, StopReason,
};
use crate::platform::{Platform, PlatformProtector};
use crate::proxy::{EndpointContext, ProxyEndpoint};
use crate::reader::{InterfaceReader, ReaderExit, ReaderHandle};
use crate::sink::InterfaceSink;
use crate::stack::{PacketStack, StackConfig};

tokio::task_local! {
    /// Set while an event handler runs, and in operations it issues
    static IN_HANDLER: ();
}

fn in_handler() -> bool {
    IN_HANDLER.try_with(|_| ()).is_ok()
}

/// Resources acquired so far by one session
#[derive(Default)]
struct Acquired {
    proxy: bool,
    interface: Option<Arc<dyn PacketInterface>>,
    stack: bool,
    reader: Option<ReaderHandle>,
    notified: bool,
}

struct ActiveSession {
    generation: u64,
    routing: RoutingConfig,
    resources: Acquired,
}

struct Shared {
    platform: Arc<dyn Platform>,
    proxy: Arc<dyn ProxyEndpoint>,
    stack: Arc<dyn PacketStack>,
    settings: SessionSettings,
    event_handler: Arc<dyn EventHandler>,
    stats: SessionStatsRef,

    /// The single logical lock: held for the whole of start and stop
    slot: Mutex<Option<ActiveSession>>,
    state_tx: watch::Sender<SessionState>,
    generation: AtomicU64,
    revoked: AtomicBool,

    /// Events waiting for delivery, in emission order
    pending: std::sync::Mutex<VecDeque<SessionEvent>>,
    /// Held while events are handed to the handler
    dispatch: Mutex<()>,
}

/// Controls the lifecycle of the session
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

/// Builder for [`SessionController`]
pub struct SessionControllerBuilder {
    platform: Arc<dyn Platform>,
    proxy: Arc<dyn ProxyEndpoint>,
    stack: Arc<dyn PacketStack>,
    settings: SessionSettings,
    event_handler: Arc<dyn EventHandler>,
    stats: SessionStatsRef,
}

impl SessionControllerBuilder {
    /// Set session tuning
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set a custom event handler
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Share existing counters with the controller
    pub fn stats(mut self, stats: SessionStatsRef) -> Self {
        self.stats = stats;
        self
    }

    pub fn build(self) -> SessionController {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        SessionController {
            shared: Arc::new(Shared {
                platform: self.platform,
                proxy: self.proxy,
                stack: self.stack,
                settings: self.settings,
                event_handler: self.event_handler,
                stats: self.stats,
                slot: Mutex::new(None),
                state_tx,
                generation: AtomicU64::new(0),
                revoked: AtomicBool::new(false),
                pending: std::sync::Mutex::new(VecDeque::new()),
                dispatch: Mutex::new(()),
            }),
        }
    }
}

impl SessionController {
    /// Create a controller with default settings
    pub fn new(
        platform: Arc<dyn Platform>,
        proxy: Arc<dyn ProxyEndpoint>,
        stack: Arc<dyn PacketStack>,
    ) -> Self {
        Self::builder(platform, proxy, stack).build()
    }

    pub fn builder(
        platform: Arc<dyn Platform>,
        proxy: Arc<dyn ProxyEndpoint>,
        stack: Arc<dyn PacketStack>,
    ) -> SessionControllerBuilder {
        SessionControllerBuilder {
            platform,
            proxy,
            stack,
            settings: SessionSettings::default(),
            event_handler: Arc::new(LoggingEventHandler),
            stats: Arc::new(SessionStats::new()),
        }
    }

    /// Start a session; succeeds without doing anything if one is running
    ///
    /// Dropping the returned future does not cancel the start: the session
    /// still comes up, or unwinds on failure, and a later `stop` releases it.
    pub async fn start(&self, config: &ProxyConfig) -> Result<()> {
        let shared = self.shared.clone();
        let config = config.clone();
        detached(async move { shared.start_session(&config).await })
            .await
            .map_err(|e| Error::EstablishFailed(format!("start task failed: {}", e)))?
    }

    /// Tear the session down; does nothing when idle
    pub async fn stop(&self) {
        self.stop_with(StopReason::Requested).await;
    }

    /// The OS revoked the interface permission
    pub async fn revoke(&self) {
        log::info!("Interface permission revoked");
        self.stop_with(StopReason::Revoked).await;
    }

    async fn stop_with(&self, reason: StopReason) {
        let shared = self.shared.clone();
        let task = detached(async move { shared.stop_session(reason, None).await });
        if let Err(e) = task.await {
            log::error!("Stop task failed: {}", e);
        }
    }

    /// Dispatch a control action from the host
    pub async fn handle(&self, action: ControlAction, config: &ProxyConfig) -> Result<()> {
        log::debug!("Control action: {}", action);
        match action {
            ControlAction::Connect => self.start(config).await,
            ControlAction::Disconnect => {
                self.stop().await;
                Ok(())
            }
        }
    }

    /// Get the current state
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Get the current statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Local address of the proxy endpoint while a session is up
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.shared.proxy.local_addr()
    }

    /// Routing parameters of the current session
    pub async fn routing(&self) -> Option<RoutingConfig> {
        self.shared
            .slot
            .lock()
            .await
            .as_ref()
            .map(|session| session.routing.clone())
    }

    /// Whether the last session ended because the permission was revoked
    pub fn is_revoked(&self) -> bool {
        self.shared.revoked.load(Ordering::SeqCst)
    }
}

impl Shared {
    async fn start_session(self: &Arc<Self>, config: &ProxyConfig) -> Result<()> {
        let result = {
            let mut slot = self.slot.lock().await;
            if slot.is_some() {
                log::debug!("Session already running, ignoring start");
                Ok(())
            } else {
                log::info!("Starting session");
                match self.establish(config).await {
                    Ok(session) => {
                        *slot = Some(session);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        self.flush_events().await;
        result
    }

    async fn establish(self: &Arc<Self>, config: &ProxyConfig) -> Result<ActiveSession> {
        self.set_state(SessionState::Establishing);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut resources = Acquired::default();

        let context = EndpointContext {
            protector: Arc::new(PlatformProtector::new(self.platform.clone())),
            stats: self.stats.clone(),
        };
        let proxy_addr = match self.proxy.start(config, context).await {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Failed to start proxy endpoint: {}", e);
                self.emit_error(&e);
                self.set_state(SessionState::Idle);
                return Err(e);
            }
        };
        resources.proxy = true;
        log::info!("Proxy endpoint listening on {}", proxy_addr);

        let routing = RoutingConfig::session_defaults(self.settings.session_name.as_str());
        let interface = match self.platform.establish(&routing).await {
            Ok(interface) => interface,
            Err(e) => {
                let e = establish_error(e);
                log::warn!("Failed to establish interface: {}", e);
                return Err(self.abort(resources, e).await);
            }
        };
        resources.interface = Some(interface.clone());
        log::info!("Start interface: {} (MTU: {})", interface.name(), routing.mtu);

        let sink = Arc::new(InterfaceSink::new(interface.clone(), self.stats.clone()));
        self.stack.set_log_level(self.settings.stack_log_level());
        if let Err(e) = self
            .stack
            .start(sink, StackConfig::new(proxy_addr, &routing))
            .await
        {
            let e = match e {
                Error::Stack(_) => e,
                other => Error::Stack(other.to_string()),
            };
            log::warn!("Failed to start packet stack: {}", e);
            return Err(self.abort(resources, e).await);
        }
        resources.stack = true;

        let mut reader = InterfaceReader::new(
            interface.clone(),
            self.stack.clone(),
            self.stats.clone(),
            self.settings.reader_buffer_size,
        )
        .spawn();
        if let Some(exited) = reader.take_exit_notification() {
            self.supervise(generation, exited);
        }
        resources.reader = Some(reader);

        self.revoked.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Running);
        self.platform.notify(true);
        resources.notified = true;
        self.emit(SessionEvent::Started {
            interface: interface.name().to_string(),
            proxy_addr,
        });

        Ok(ActiveSession {
            generation,
            routing,
            resources,
        })
    }

    /// Release what a failed start acquired and hand back its error
    async fn abort(&self, resources: Acquired, error: Error) -> Error {
        self.emit_error(&error);
        self.teardown(resources, StopReason::Aborted(error.to_string()))
            .await;
        error
    }

    /// Stop the current session, or only `generation` when given
    async fn stop_session(&self, reason: StopReason, generation: Option<u64>) {
        self.take_and_teardown(reason, generation).await;
        self.flush_events().await;
    }

    async fn take_and_teardown(&self, reason: StopReason, generation: Option<u64>) {
        let mut slot = self.slot.lock().await;
        if reason == StopReason::Revoked {
            self.revoked.store(true, Ordering::SeqCst);
        }

        let matches = match (slot.as_ref(), generation) {
            (None, _) => false,
            (Some(session), Some(generation)) => session.generation == generation,
            (Some(_), None) => true,
        };
        if !matches {
            log::debug!("No session to stop ({})", reason);
            return;
        }

        if let Some(session) = slot.take() {
            log::info!("Stopping session: {}", reason);
            self.teardown(session.resources, reason).await;
        }
    }

    /// Release resources in order; every step runs even if earlier ones fail
    async fn teardown(&self, mut resources: Acquired, reason: StopReason) {
        self.set_state(SessionState::Stopping);

        if let Some(reader) = resources.reader.take() {
            if let Some(ref interface) = resources.interface {
                close_interface(interface.as_ref());
            }
            reader.join(self.settings.reader_join_timeout()).await;
        }

        if resources.stack {
            guarded("stop packet stack", self.stack.stop()).await;
        }

        if let Some(interface) = resources.interface.take() {
            if !interface.is_closed() {
                close_interface(interface.as_ref());
            }
            log::info!("Released interface {}", interface.name());
        }

        if resources.proxy {
            match guarded("stop proxy endpoint", self.proxy.stop()).await {
                Some(Err(e)) => log::warn!("Failed to stop proxy endpoint: {}", e),
                Some(Ok(())) => log::info!("Released proxy endpoint"),
                None => {}
            }
        }

        if resources.notified {
            let platform = self.platform.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| platform.notify(false))).is_err() {
                log::error!("Platform panicked while presenting the inactive session");
            }
        }

        self.emit(SessionEvent::Stopped { reason });
        self.set_state(SessionState::Idle);
    }

    /// Turn an unexpected reader exit into a stop of that session only
    fn supervise(self: &Arc<Self>, generation: u64, exited: oneshot::Receiver<ReaderExit>) {
        let shared: Weak<Shared> = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = match exited.await {
                Ok(ReaderExit::EndOfStream) => StopReason::EndOfStream,
                Ok(ReaderExit::Fault(e)) => StopReason::Fault(e),
                Ok(ReaderExit::Cancelled) | Err(_) => return,
            };

            let Some(shared) = shared.upgrade() else {
                return;
            };
            if let StopReason::Fault(ref message) = reason {
                shared.emit(SessionEvent::Error {
                    message: message.clone(),
                    recoverable: false,
                });
            }
            shared.stop_session(reason, Some(generation)).await;
        });
    }

    fn set_state(&self, new: SessionState) {
        let old = self.state_tx.send_replace(new);
        if old != new {
            self.emit(SessionEvent::StateChanged { old, new });
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(event);
    }

    fn emit_error(&self, error: &Error) {
        self.emit(SessionEvent::Error {
            message: error.to_string(),
            recoverable: false,
        });
    }

    fn next_event(&self) -> Option<SessionEvent> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    /// Deliver queued events; never call with `slot` held
    ///
    /// Inside a handler this returns at once and the dispatch that invoked
    /// the handler delivers what was queued.
    async fn flush_events(&self) {
        if in_handler() {
            return;
        }

        let _dispatch = self.dispatch.lock().await;
        while let Some(event) = self.next_event() {
            let delivery = IN_HANDLER.scope((), self.event_handler.on_event(event));
            if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
                log::error!("Event handler panicked");
            }
        }
    }
}

/// Run a lifecycle operation on its own task so it completes even if the
/// caller stops waiting
///
/// Operations issued from an event handler keep that marker.
fn detached<F>(operation: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let nested = in_handler();
    tokio::spawn(async move {
        if nested {
            IN_HANDLER.scope((), operation).await
        } else {
            operation.await
        }
    })
}

/// Permission problems stay distinguishable; everything else is a failed establish
fn establish_error(error: Error) -> Error {
    match error {
        Error::PermissionDenied(_) | Error::EstablishFailed(_) => error,
        Error::Tun(e) if e.is_permission_denied() => Error::PermissionDenied(e.to_string()),
        other => Error::EstablishFailed(other.to_string()),
    }
}

fn close_interface(interface: &dyn PacketInterface) {
    match std::panic::catch_unwind(AssertUnwindSafe(|| interface.close())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Failed to close {}: {}", interface.name(), e),
        Err(_) => log::error!("Closing {} panicked", interface.name()),
    }
}

/// Run a collaborator's teardown step, surviving its panics
async fn guarded<F: Future>(what: &str, step: F) -> Option<F::Output> {
    match AssertUnwindSafe(step).catch_unwind().await {
        Ok(output) => Some(output),
        Err(_) => {
            log::error!("Failed to {}: panicked", what);
            None
        }
    }
}
