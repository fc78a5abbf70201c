//! Listener registry.
//!
//! Owns every named listening socket of a generation. A socket is either
//! bound fresh or adopted from the predecessor; either way the registry
//! keeps its own handle for the life of the process so the kernel socket
//! stays open while accept loops come and go, and so it can be exported to
//! a successor.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::errors::HandoffError;

/// Pending connection queue length for freshly bound listeners
pub const LISTEN_BACKLOG: i32 = 1024;

/// Where a listener came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOrigin {
    /// Bound by this generation
    Created,
    /// Handed down by the predecessor
    Inherited,
}

impl fmt::Display for ListenerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerOrigin::Created => f.write_str("created"),
            ListenerOrigin::Inherited => f.write_str("inherited"),
        }
    }
}

/// A registered listening socket
#[derive(Debug)]
struct ListenerDescriptor {
    name: String,
    local_addr: SocketAddr,
    listener: TcpListener,
    origin: ListenerOrigin,
}

/// Summary of one registered listener
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ListenerInfo {
    pub name: String,
    pub address: SocketAddr,
    pub origin: String,
}

/// Duplicated listener handle ready to be passed to a successor
#[derive(Debug)]
pub struct ExportedHandle {
    pub name: String,
    pub fd: OwnedFd,
}

impl ExportedHandle {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Every listener of a generation, duplicated for export.
///
/// Dropping the set closes the duplicates, never the registry's own handles.
#[derive(Debug, Default)]
pub struct HandleSet {
    handles: Vec<ExportedHandle>,
}

impl HandleSet {
    pub fn iter(&self) -> impl Iterator<Item = &ExportedHandle> {
        self.handles.iter()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Registry of the named listening sockets of one generation
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    /// Handles received from the predecessor that nothing adopted yet
    inherited: Mutex<HashMap<String, OwnedFd>>,
    listeners: Mutex<BTreeMap<String, ListenerDescriptor>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with handles handed down by a predecessor
    pub fn from_inherited(handles: impl IntoIterator<Item = (String, OwnedFd)>) -> Self {
        let inherited: HashMap<_, _> = handles.into_iter().collect();
        debug!(
            inherited = inherited.len(),
            "Creating listener registry from inherited handles"
        );
        Self {
            inherited: Mutex::new(inherited),
            listeners: Mutex::new(BTreeMap::new()),
        }
    }

    /// Adopt the inherited listener for `name` when its address matches,
    /// otherwise bind a fresh one.
    ///
    /// A mismatching inherited handle stays parked until
    /// [`close_unused_inherited`](Self::close_unused_inherited).
    pub fn listen(&self, name: &str, address: &str) -> Result<TcpListener, HandoffError> {
        let wanted = resolve(name, address)?;

        let candidate = self.inherited.lock().remove(name);
        if let Some(fd) = candidate {
            match check_address(name, fd.as_fd(), wanted) {
                Ok(()) => return self.adopt(name, fd),
                Err(e) => {
                    warn!(listener = %name, error = %e, "Not adopting inherited listener, binding a new one");
                    self.inherited.lock().insert(name.to_string(), fd);
                }
            }
        }

        self.bind(name, address)
    }

    /// Bind a new listening socket for `name`.
    ///
    /// When `name` is already registered a duplicate handle of the existing
    /// socket is returned instead.
    pub fn bind(&self, name: &str, address: &str) -> Result<TcpListener, HandoffError> {
        if let Some(existing) = self.listeners.lock().get(name) {
            debug!(listener = %name, "Listener already registered, reusing it");
            return Ok(existing.listener.try_clone()?);
        }

        let addr = resolve(name, address)?;
        let bind_err = |source| HandoffError::Bind {
            name: name.to_string(),
            address: address.to_string(),
            source,
        };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;
        info!(listener = %name, address = %local_addr, "Bound new listener");

        self.register(name, listener, local_addr, ListenerOrigin::Created)
    }

    /// Register a listening socket handed down by the predecessor.
    ///
    /// The handle must be an internet stream socket that is already
    /// listening; anything else is rejected and closed.
    pub fn adopt(&self, name: &str, fd: OwnedFd) -> Result<TcpListener, HandoffError> {
        let local_addr = validate_listening(name, fd.as_fd())?;

        let socket = Socket::from(fd);
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();

        info!(listener = %name, address = %local_addr, "Adopted inherited listener");
        self.register(name, listener, local_addr, ListenerOrigin::Inherited)
    }

    fn register(
        &self,
        name: &str,
        listener: TcpListener,
        local_addr: SocketAddr,
        origin: ListenerOrigin,
    ) -> Result<TcpListener, HandoffError> {
        let handle = listener.try_clone()?;
        self.listeners.lock().insert(
            name.to_string(),
            ListenerDescriptor {
                name: name.to_string(),
                local_addr,
                listener,
                origin,
            },
        );
        Ok(handle)
    }

    /// Duplicate every registered listener for a successor
    pub fn export(&self) -> Result<HandleSet, HandoffError> {
        let listeners = self.listeners.lock();
        if listeners.is_empty() {
            return Err(HandoffError::NothingToExport);
        }

        let mut handles = Vec::with_capacity(listeners.len());
        for descriptor in listeners.values() {
            let dup = descriptor.listener.try_clone()?;
            trace!(listener = %descriptor.name, fd = dup.as_raw_fd(), "Exporting listener");
            handles.push(ExportedHandle {
                name: descriptor.name.clone(),
                fd: OwnedFd::from(dup),
            });
        }

        debug!(count = handles.len(), "Exported listener handles");
        Ok(HandleSet { handles })
    }

    /// Close inherited handles that no configured listener adopted.
    ///
    /// Only valid once the generation is ready; returns how many were closed.
    pub fn close_unused_inherited(&self) -> usize {
        let unused: Vec<_> = self.inherited.lock().drain().collect();
        for (name, _fd) in &unused {
            info!(listener = %name, "Closing unused inherited listener");
        }
        unused.len()
    }

    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners.lock().get(name).map(|d| d.local_addr)
    }

    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.listeners
            .lock()
            .values()
            .map(|d| ListenerInfo {
                name: d.name.clone(),
                address: d.local_addr,
                origin: d.origin.to_string(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    pub fn pending_inherited(&self) -> usize {
        self.inherited.lock().len()
    }
}

fn resolve(name: &str, address: &str) -> Result<SocketAddr, HandoffError> {
    let bind_err = |source| HandoffError::Bind {
        name: name.to_string(),
        address: address.to_string(),
        source,
    };
    address
        .to_socket_addrs()
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            ))
        })
}

fn validate_listening(name: &str, fd: BorrowedFd<'_>) -> Result<SocketAddr, HandoffError> {
    let adopt_err = |reason: String| HandoffError::Adopt {
        name: name.to_string(),
        reason,
    };
    let sock = SockRef::from(&fd);

    let ty = sock.r#type().map_err(|e| adopt_err(e.to_string()))?;
    if ty != Type::STREAM {
        return Err(adopt_err("not a stream socket".to_string()));
    }

    let addr = sock
        .local_addr()
        .map_err(|e| adopt_err(e.to_string()))?
        .as_socket()
        .ok_or_else(|| adopt_err("not an internet socket".to_string()))?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if !sock.is_listener().map_err(|e| adopt_err(e.to_string()))? {
        return Err(adopt_err("socket is not listening".to_string()));
    }

    Ok(addr)
}

fn check_address(name: &str, fd: BorrowedFd<'_>, wanted: SocketAddr) -> Result<(), HandoffError> {
    let inherited = validate_listening(name, fd)?;
    let port_matches = wanted.port() == 0 || wanted.port() == inherited.port();
    if port_matches && wanted.ip() == inherited.ip() {
        Ok(())
    } else {
        Err(HandoffError::AddressMismatch {
            name: name.to_string(),
            inherited,
            wanted,
        })
    }
}
