//! Round-robin name resolution.
//!
//! A plain address cache pins every connection for a host to one IP. This
//! resolver looks up all addresses on each call and rotates through them with
//! a per-host counter, so new connections spread across every backing address.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use dashmap::DashMap;
use hyper_util::client::legacy::connect::dns::Name;

/// Source of every address currently bound to a host name.
pub trait AddressLookup: Send + Sync {
    fn lookup_all(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

impl AddressLookup for SystemLookup {
    fn lookup_all(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        for addr in (host, 0u16).to_socket_addrs()? {
            if !addresses.contains(&addr.ip()) {
                addresses.push(addr.ip());
            }
        }
        Ok(addresses)
    }
}

/// Fixed host → addresses table.
#[derive(Debug, Default, Clone)]
pub struct StaticLookup {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.into().to_ascii_lowercase(), addresses);
        self
    }
}

impl AddressLookup for StaticLookup {
    fn lookup_all(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host: {host}")))
    }
}

struct ResolverInner {
    lookup: Box<dyn AddressLookup>,
    counters: DashMap<String, AtomicI32>,
}

/// Name resolver that rotates through all addresses of a host.
///
/// Cheap to clone; clones share the lookup and the counters.
#[derive(Clone)]
pub struct RoundRobinResolver {
    inner: Arc<ResolverInner>,
}

impl RoundRobinResolver {
    pub fn new(lookup: impl AddressLookup + 'static) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                lookup: Box::new(lookup),
                counters: DashMap::new(),
            }),
        }
    }

    pub fn system() -> Self {
        Self::new(SystemLookup)
    }

    /// Process-wide resolver backed by the operating system.
    pub fn shared_default() -> Self {
        static SHARED: OnceLock<RoundRobinResolver> = OnceLock::new();
        SHARED.get_or_init(RoundRobinResolver::system).clone()
    }

    /// Resolve `host` to the next address in its rotation.
    ///
    /// Lookup failures are returned unchanged.
    pub fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let addresses = self.inner.lookup.lookup_all(host)?;
        if addresses.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for host: {host}"),
            ));
        }

        let counter = self
            .inner
            .counters
            .entry(host.to_string())
            .or_insert_with(|| AtomicI32::new(0));
        let previous = counter.fetch_add(1, Ordering::SeqCst);

        let mut index = previous as i64 % addresses.len() as i64;
        if index < 0 {
            // Counter overflowed; recover this call and restart the rotation.
            index = index.abs();
            counter.store(0, Ordering::SeqCst);
        }

        Ok(addresses[index as usize])
    }

    /// Current counter value for `host`, if it has been resolved before.
    pub fn counter_for(&self, host: &str) -> Option<i32> {
        self.inner
            .counters
            .get(host)
            .map(|counter| counter.load(Ordering::SeqCst))
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&self, host: &str, value: i32) {
        self.inner
            .counters
            .entry(host.to_string())
            .or_insert_with(|| AtomicI32::new(0))
            .store(value, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RoundRobinResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRobinResolver")
            .field("hosts", &self.inner.counters.len())
            .finish()
    }
}

/// Hook for hyper-util's `HttpConnector`; the connector fills in the port.
impl tower::Service<Name> for RoundRobinResolver {
    type Response = std::iter::Once<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            let ip = tokio::task::spawn_blocking(move || resolver.resolve(&host))
                .await
                .map_err(io::Error::other)??;
            tracing::trace!(host = %name, %ip, "Resolved downstream host");
            Ok(std::iter::once(SocketAddr::new(ip, 0)))
        })
    }
}
