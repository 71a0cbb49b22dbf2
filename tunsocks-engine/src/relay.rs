//! In-process SOCKS5 relay
//!
//! [`LocalRelay`] is the [`ProxyEndpoint`] sessions use by default. For each
//! connection from the stack it:
//!
//! 1. reads the client's method selection and insists on "no auth",
//! 2. dials the upstream over a protected socket,
//! 3. performs the upstream method selection, including RFC 1929
//!    username/password authentication when credentials are configured,
//! 4. confirms "no auth" to the client and splices both streams, so the
//!    client's request and the upstream's reply pass through verbatim.
//!
//! The upstream host is resolved once when the relay starts, before the
//! interface exists; connections only dial the cached addresses.
//!
//! A connection whose socket cannot be protected is abandoned on its own;
//! the relay keeps serving every other connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{Credentials, ProxyConfig};
use crate::error::{Error, Result};
use crate::protect::{connect_protected, ConnectionDescriptor};
use crate::proxy::{EndpointContext, ProxyEndpoint};

pub const VER_SOCKS5: u8 = 0x05;
pub const VER_AUTH: u8 = 0x01;

pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_USERNAME: u8 = 0x02;
pub const METHOD_INVALID: u8 = 0xff;

pub const RESULT_SUCCESS: u8 = 0x00;

struct RunningRelay {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct RelayShared {
    upstream: ProxyConfig,
    /// Resolved at start; empty when no upstream host is configured
    upstream_addrs: Vec<SocketAddr>,
    credentials: Option<Credentials>,
    context: EndpointContext,
}

/// SOCKS5 relay bound to a loopback port
pub struct LocalRelay {
    listen: IpAddr,
    running: Mutex<Option<RunningRelay>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl LocalRelay {
    /// Create a relay that binds an ephemeral port on `listen`
    pub fn new(listen: IpAddr) -> Self {
        Self {
            listen,
            running: Mutex::new(None),
            local_addr: std::sync::Mutex::new(None),
        }
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = addr;
    }
}

#[async_trait]
impl ProxyEndpoint for LocalRelay {
    async fn start(&self, upstream: &ProxyConfig, context: EndpointContext) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(ref relay) = *running {
            return Ok(relay.local_addr);
        }

        upstream.validate()?;
        let upstream_addrs = resolve_upstream(upstream).await?;

        let bind_addr = SocketAddr::new(self.listen, 0);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Proxy(format!("failed to bind relay on {}: {}", bind_addr, e)))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(RelayShared {
            upstream: upstream.clone(),
            upstream_addrs,
            credentials: upstream.credentials(),
            context,
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, shared, shutdown.clone()));

        log::info!(
            "Relay listening on {}, upstream {}:{}",
            local_addr,
            upstream.address,
            upstream.port
        );

        *running = Some(RunningRelay {
            local_addr,
            shutdown,
            task,
        });
        self.set_local_addr(Some(local_addr));
        Ok(local_addr)
    }

    async fn stop(&self) -> Result<()> {
        let Some(relay) = self.running.lock().await.take() else {
            return Ok(());
        };
        self.set_local_addr(None);

        relay.shutdown.cancel();
        relay
            .task
            .await
            .map_err(|e| Error::Proxy(format!("relay task failed: {}", e)))?;

        log::info!("Relay on {} stopped", relay.local_addr);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<RelayShared>, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, &shared).await {
                            if e.is_connection_scoped() {
                                log::warn!("Relay connection from {} abandoned: {}", peer, e);
                            } else {
                                log::debug!("Relay connection from {} failed: {}", peer, e);
                            }
                        }
                    });
                }
                Err(e) => log::warn!("Relay accept failed: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
}

async fn handle_connection(mut client: TcpStream, shared: &RelayShared) -> Result<()> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    if head[0] != VER_SOCKS5 {
        return Err(Error::Socks(format!("unsupported SOCKS version: {}", head[0])));
    }

    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NONE) {
        client.write_all(&[VER_SOCKS5, METHOD_INVALID]).await?;
        return Err(Error::Socks("client did not offer the no-auth method".into()));
    }

    let mut upstream = match dial_upstream(shared).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = client.write_all(&[VER_SOCKS5, METHOD_INVALID]).await;
            return Err(e);
        }
    };

    if let Err(e) = negotiate_upstream(&mut upstream, shared.credentials.as_ref()).await {
        let _ = client.write_all(&[VER_SOCKS5, METHOD_INVALID]).await;
        return Err(e);
    }

    client.write_all(&[VER_SOCKS5, METHOD_NONE]).await?;
    shared.context.stats.record_connection();

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    log::debug!("Relay connection closed: sent={} received={}", sent, received);
    Ok(())
}

/// Resolve the upstream host; an unset host yields no addresses
async fn resolve_upstream(upstream: &ProxyConfig) -> Result<Vec<SocketAddr>> {
    let host = upstream.address.as_str();
    if host.is_empty() {
        log::warn!("No upstream address configured, relay connections will be refused");
        return Ok(Vec::new());
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, upstream.port))
        .await
        .map_err(|e| Error::Proxy(format!("failed to resolve {}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Proxy(format!("{} resolved to no addresses", host)));
    }

    log::debug!("Upstream {} resolved to {:?}", host, addrs);
    Ok(addrs)
}

async fn dial_upstream(shared: &RelayShared) -> Result<TcpStream> {
    if shared.upstream_addrs.is_empty() {
        return Err(Error::Proxy("upstream address is not configured".into()));
    }

    let mut last_error = Error::Proxy("no upstream address could be dialed".into());
    for &addr in &shared.upstream_addrs {
        match connect_protected(shared.context.protector.as_ref(), ConnectionDescriptor::tcp(addr)).await {
            Ok(stream) => return Ok(stream),
            Err(e @ Error::ProtectionFailed { .. }) => {
                shared.context.stats.record_protect_failure();
                return Err(e);
            }
            Err(e) => {
                log::debug!("Failed to connect to upstream {}: {}", addr, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Run the SOCKS5 method selection against the upstream
pub async fn negotiate_upstream(stream: &mut TcpStream, credentials: Option<&Credentials>) -> Result<()> {
    match credentials {
        Some(_) => {
            stream
                .write_all(&[VER_SOCKS5, 2, METHOD_NONE, METHOD_USERNAME])
                .await?
        }
        None => stream.write_all(&[VER_SOCKS5, 1, METHOD_NONE]).await?,
    }

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VER_SOCKS5 {
        return Err(Error::Socks(format!("unsupported SOCKS version: {}", reply[0])));
    }

    match (reply[1], credentials) {
        (METHOD_NONE, _) => Ok(()),
        (METHOD_USERNAME, Some(credentials)) => authenticate(stream, credentials).await,
        (method, _) => Err(Error::Socks(format!(
            "upstream rejected the offered auth methods (selected {:#04x})",
            method
        ))),
    }
}

async fn authenticate(stream: &mut TcpStream, credentials: &Credentials) -> Result<()> {
    let username = credentials.username.as_bytes();
    let password = credentials.password.as_slice();

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(VER_AUTH);
    request.push(username.len() as u8);
    request.extend_from_slice(username);
    request.push(password.len() as u8);
    request.extend_from_slice(password);
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VER_AUTH {
        return Err(Error::Socks("unsupported SOCKS auth version".into()));
    }
    if reply[1] != RESULT_SUCCESS {
        return Err(Error::Socks(format!(
            "upstream authentication failed: error {}",
            reply[1]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SessionStats;
    use crate::protect::NoopProtector;

    fn shared(upstream: ProxyConfig, upstream_addrs: Vec<SocketAddr>) -> RelayShared {
        RelayShared {
            credentials: upstream.credentials(),
            upstream,
            upstream_addrs,
            context: EndpointContext {
                protector: Arc::new(NoopProtector),
                stats: Arc::new(SessionStats::new()),
            },
        }
    }

    #[tokio::test]
    async fn test_dial_uses_cached_addresses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // The host itself cannot be resolved; only the cached address can be dialed
        let shared = shared(ProxyConfig::new("upstream.invalid", addr.port()), vec![addr]);
        let stream = dial_upstream(&shared).await.unwrap();

        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_without_upstream_is_refused() {
        let shared = shared(ProxyConfig::new("", 1080), Vec::new());
        assert!(matches!(dial_upstream(&shared).await, Err(Error::Proxy(_))));
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let addrs = resolve_upstream(&ProxyConfig::new("127.0.0.1", 1080)).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:1080".parse::<SocketAddr>().unwrap()]);

        assert!(resolve_upstream(&ProxyConfig::new("", 1080)).await.unwrap().is_empty());
    }
}
