//! Hand-written doubles for the session collaborators
//!
//! Every double appends to a shared [`CallLog`] so tests can assert the
//! order in which the controller acquires and releases resources.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tunsocks_engine::tunsocks_tun::{self, MemoryInterface, MemoryPeer, PacketInterface, RoutingConfig};
use tunsocks_engine::{
    ConnectionDescriptor, EndpointContext, Error, EventHandler, PacketSink, PacketStack, Platform,
    ProxyConfig, ProxyEndpoint, Result, SessionController, SessionEvent, SessionSettings,
    SessionState, SocketHandle, StackConfig,
};

/// Ordered record of collaborator calls
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Index of the `nth` (0-based) occurrence of `entry`
    pub fn position(&self, entry: &str, nth: usize) -> usize {
        self.entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| *e == entry)
            .nth(nth)
            .map(|(i, _)| i)
            .unwrap_or_else(|| panic!("{:?} not logged {} times: {:?}", entry, nth + 1, self.entries()))
    }

    /// Assert that the first occurrences of `entries` appear in order
    pub fn assert_order(&self, entries: &[&str]) {
        let positions: Vec<usize> = entries.iter().map(|e| self.position(e, 0)).collect();
        assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "expected order {:?}, got {:?}",
            entries,
            self.entries()
        );
    }
}

/// How [`TestInterface::read`] behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Normal,
    /// Never returns, even after close
    Stall,
    /// Fails while the interface is open
    Fail,
}

/// Memory interface that counts closes and can misbehave on read
#[derive(Debug)]
pub struct TestInterface {
    inner: MemoryInterface,
    mode: ReadMode,
    closes: AtomicUsize,
    log: CallLog,
}

#[async_trait]
impl PacketInterface for TestInterface {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mtu(&self) -> u16 {
        self.inner.mtu()
    }

    async fn read(&self, buf: &mut [u8]) -> tunsocks_tun::Result<usize> {
        match self.mode {
            ReadMode::Normal => self.inner.read(buf).await,
            ReadMode::Stall => std::future::pending().await,
            ReadMode::Fail => Err(tunsocks_tun::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "device vanished",
            ))),
        }
    }

    async fn write(&self, packet: &[u8]) -> tunsocks_tun::Result<usize> {
        self.inner.write(packet).await
    }

    fn close(&self) -> tunsocks_tun::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.log.push("interface.close");
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl TestInterface {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Why [`FakePlatform::establish`] fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishFailure {
    PermissionDenied,
    NoHandle,
}

/// Platform that hands out memory interfaces
pub struct FakePlatform {
    pub log: CallLog,
    failure: Mutex<Option<EstablishFailure>>,
    read_mode: Mutex<ReadMode>,
    establish_delay: Mutex<Option<Duration>>,
    protect_result: AtomicBool,
    interfaces: Mutex<Vec<Arc<TestInterface>>>,
    peers: Mutex<VecDeque<MemoryPeer>>,
    routings: Mutex<Vec<RoutingConfig>>,
    protected: Mutex<Vec<(SocketHandle, ConnectionDescriptor)>>,
    notifications: Mutex<Vec<bool>>,
    max_open: AtomicUsize,
}

impl FakePlatform {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            failure: Mutex::new(None),
            read_mode: Mutex::new(ReadMode::Normal),
            establish_delay: Mutex::new(None),
            protect_result: AtomicBool::new(true),
            interfaces: Mutex::new(Vec::new()),
            peers: Mutex::new(VecDeque::new()),
            routings: Mutex::new(Vec::new()),
            protected: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            max_open: AtomicUsize::new(0),
        })
    }

    pub fn fail_establish(&self, failure: Option<EstablishFailure>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub fn set_read_mode(&self, mode: ReadMode) {
        *self.read_mode.lock().unwrap() = mode;
    }

    pub fn delay_establish(&self, delay: Duration) {
        *self.establish_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_protect_result(&self, result: bool) {
        self.protect_result.store(result, Ordering::SeqCst);
    }

    pub fn establishes(&self) -> usize {
        self.interfaces.lock().unwrap().len()
    }

    pub fn interface(&self, index: usize) -> Arc<TestInterface> {
        self.interfaces.lock().unwrap()[index].clone()
    }

    pub fn interfaces(&self) -> Vec<Arc<TestInterface>> {
        self.interfaces.lock().unwrap().clone()
    }

    /// Kernel side of the oldest interface not yet taken
    pub fn take_peer(&self) -> MemoryPeer {
        self.peers
            .lock()
            .unwrap()
            .pop_front()
            .expect("no interface was established")
    }

    pub fn routings(&self) -> Vec<RoutingConfig> {
        self.routings.lock().unwrap().clone()
    }

    pub fn protected(&self) -> Vec<(SocketHandle, ConnectionDescriptor)> {
        self.protected.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<bool> {
        self.notifications.lock().unwrap().clone()
    }

    /// Most interfaces ever open at the same time
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn establish(&self, routing: &RoutingConfig) -> Result<Arc<dyn PacketInterface>> {
        self.log.push("platform.establish");

        let delay = *self.establish_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = *self.failure.lock().unwrap();
        match failure {
            Some(EstablishFailure::PermissionDenied) => {
                return Err(Error::PermissionDenied("VPN permission not granted".into()))
            }
            Some(EstablishFailure::NoHandle) => {
                return Err(Error::EstablishFailed("no interface handle returned".into()))
            }
            None => {}
        }

        let mut interfaces = self.interfaces.lock().unwrap();
        let (inner, peer) = MemoryInterface::pair(format!("mem{}", interfaces.len()), routing.mtu);
        let interface = Arc::new(TestInterface {
            inner,
            mode: *self.read_mode.lock().unwrap(),
            closes: AtomicUsize::new(0),
            log: self.log.clone(),
        });

        interfaces.push(interface.clone());
        let open = interfaces.iter().filter(|i| !i.is_closed()).count();
        self.max_open.fetch_max(open, Ordering::SeqCst);

        self.peers.lock().unwrap().push_back(peer);
        self.routings.lock().unwrap().push(routing.clone());
        Ok(interface)
    }

    fn protect(&self, socket: SocketHandle, target: &ConnectionDescriptor) -> bool {
        self.log.push("platform.protect");
        self.protected.lock().unwrap().push((socket, *target));
        self.protect_result.load(Ordering::SeqCst)
    }

    fn notify(&self, active: bool) {
        self.log.push(format!("platform.notify({})", active));
        self.notifications.lock().unwrap().push(active);
    }
}

/// Stack that records inputs and optionally echoes them back
pub struct RecordingStack {
    log: CallLog,
    echo: bool,
    fail_start: AtomicBool,
    stop_delay: Mutex<Option<Duration>>,
    sink: Mutex<Option<Arc<dyn PacketSink>>>,
    configs: Mutex<Vec<StackConfig>>,
    levels: Mutex<Vec<log::LevelFilter>>,
    inputs: Mutex<Vec<Vec<u8>>>,
}

impl RecordingStack {
    pub fn new(log: CallLog) -> Arc<Self> {
        Self::build(log, false)
    }

    /// Writes every input packet back through the sink
    pub fn echo(log: CallLog) -> Arc<Self> {
        Self::build(log, true)
    }

    fn build(log: CallLog, echo: bool) -> Arc<Self> {
        Arc::new(Self {
            log,
            echo,
            fail_start: AtomicBool::new(false),
            stop_delay: Mutex::new(None),
            sink: Mutex::new(None),
            configs: Mutex::new(Vec::new()),
            levels: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn delay_stop(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = Some(delay);
    }

    pub fn configs(&self) -> Vec<StackConfig> {
        self.configs.lock().unwrap().clone()
    }

    pub fn levels(&self) -> Vec<log::LevelFilter> {
        self.levels.lock().unwrap().clone()
    }

    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl PacketStack for RecordingStack {
    fn set_log_level(&self, level: log::LevelFilter) {
        self.log.push("stack.set_log_level");
        self.levels.lock().unwrap().push(level);
    }

    async fn start(&self, sink: Arc<dyn PacketSink>, config: StackConfig) -> Result<()> {
        self.log.push("stack.start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Stack("stack refused to start".into()));
        }
        self.configs.lock().unwrap().push(config);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn input_packet(&self, packet: &[u8]) {
        self.inputs.lock().unwrap().push(packet.to_vec());
        if !self.echo {
            return;
        }
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.write_packet(packet).await;
        }
    }

    async fn stop(&self) {
        self.log.push("stack.stop");
        let delay = *self.stop_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.sink.lock().unwrap().take();
    }
}

/// Proxy endpoint that only counts starts and stops
pub struct CountingProxy {
    log: CallLog,
    addr: SocketAddr,
    fail_start: AtomicBool,
    running: AtomicBool,
    upstreams: Mutex<Vec<ProxyConfig>>,
    context: Mutex<Option<EndpointContext>>,
}

impl CountingProxy {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            addr: "127.0.0.1:41080".parse().unwrap(),
            fail_start: AtomicBool::new(false),
            running: AtomicBool::new(false),
            upstreams: Mutex::new(Vec::new()),
            context: Mutex::new(None),
        })
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn upstreams(&self) -> Vec<ProxyConfig> {
        self.upstreams.lock().unwrap().clone()
    }

    /// Context handed over by the last start
    pub fn context(&self) -> Option<EndpointContext> {
        self.context.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyEndpoint for CountingProxy {
    async fn start(&self, upstream: &ProxyConfig, context: EndpointContext) -> Result<SocketAddr> {
        self.log.push("proxy.start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Proxy("address in use".into()));
        }
        self.upstreams.lock().unwrap().push(upstream.clone());
        *self.context.lock().unwrap() = Some(context);
        self.running.store(true, Ordering::SeqCst);
        Ok(self.addr)
    }

    async fn stop(&self) -> Result<()> {
        self.log.push("proxy.stop");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.load(Ordering::SeqCst).then_some(self.addr)
    }
}

/// Event handler that keeps every event
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until a `Stopped` event has been delivered
    pub async fn wait_for_stopped(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self
                .events()
                .iter()
                .any(|event| matches!(event, SessionEvent::Stopped { .. }))
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no Stopped event was delivered"));
    }

    pub fn transitions(&self) -> Vec<(SessionState, SessionState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged { old, new } => Some((old, new)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingEvents {
    async fn on_event(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Settings with a short reader join bound
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        reader_join_timeout_ms: 200,
        ..Default::default()
    }
}

/// Wait until the controller reaches `state`
pub async fn wait_for_state(controller: &SessionController, state: SessionState) {
    let mut rx = controller.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() != state {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("controller never reached {}", state));
}
