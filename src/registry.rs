//! The runner registry: a set of runner descriptors, keyed
//! by `(host, port)`, guarded by its own lock ("registry-lock" in
//! its own lock) which is never held across an `.await`.

use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerDescriptor {
    pub host: String,
    pub port: u16,
}

impl RunnerDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Best-effort resolution to a socket address for the transport
    /// primitive. `host` is whatever string the runner registered with
    /// (normally `localhost` or an IP literal).
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        use std::net::ToSocketAddrs;
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("couldn't resolve {}:{}", self.host, self.port),
                )
            })
    }
}

struct Entry {
    descriptor: RunnerDescriptor,
    last_seen: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    AlreadyRegistered,
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRegistered => write!(f, "Runner already registered"),
        }
    }
}

/// The dispatcher's view of the live runner pool.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `descriptor` with `last_seen = now`. Fails if the
    /// `(host, port)` pair is already registered.
    pub fn register(&self, descriptor: RunnerDescriptor) -> Result<(), RegisterError> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.descriptor == descriptor) {
            return Err(RegisterError::AlreadyRegistered);
        }
        entries.push(Entry {
            descriptor,
            last_seen: Instant::now(),
        });
        Ok(())
    }

    /// A consistent snapshot of the registry, in registration order, to
    /// drive decisions without holding the lock across network calls.
    pub fn snapshot(&self) -> Vec<RunnerDescriptor> {
        self.entries.lock().iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn touch(&self, descriptor: &RunnerDescriptor) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.iter_mut().find(|e| &e.descriptor == descriptor) {
            e.last_seen = Instant::now();
        }
    }

    /// Removes `descriptor` from the registry. Returns whether it was
    /// present.
    pub fn evict(&self, descriptor: &RunnerDescriptor) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| &e.descriptor != descriptor);
        entries.len() != before
    }

    #[cfg(test)]
    pub fn last_seen(&self, descriptor: &RunnerDescriptor) -> Option<Instant> {
        self.entries
            .lock()
            .iter()
            .find(|e| &e.descriptor == descriptor)
            .map(|e| e.last_seen)
    }
}
