//! Base listener resolution
//!
//! The master either adopts a socket handed over by systemd socket
//! activation or binds the configured port itself. An inherited socket's
//! port is read back from the kernel TCP tables so the rest of the master
//! knows which port it is actually serving on.

use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

use crate::error::ListenerError;

/// First descriptor number used by systemd socket activation
pub const LISTEN_FDS_START: i32 = 3;

/// Descriptors passed to this process by systemd
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    fds: Vec<i32>,
}

impl Activation {
    /// No inherited descriptors
    pub fn none() -> Self {
        Self::default()
    }

    /// Use an explicit descriptor list
    pub fn from_fds(fds: Vec<i32>) -> Self {
        Self { fds }
    }

    /// Read `LISTEN_PID`/`LISTEN_FDS` and remove them from the environment
    ///
    /// The variables are cleared so that child processes do not try to
    /// claim the same descriptors. Editing the environment races with other
    /// threads, so call this before the async runtime starts.
    pub fn from_env() -> Result<Self, ListenerError> {
        let listen_pid = std::env::var("LISTEN_PID").ok();
        let listen_fds = std::env::var("LISTEN_FDS").ok();

        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_FDNAMES");

        Self::parse(listen_pid.as_deref(), listen_fds.as_deref(), std::process::id())
    }

    /// Interpret activation variables for the process `own_pid`
    pub fn parse(
        listen_pid: Option<&str>,
        listen_fds: Option<&str>,
        own_pid: u32,
    ) -> Result<Self, ListenerError> {
        let (Some(pid), Some(fds)) = (listen_pid, listen_fds) else {
            return Ok(Self::none());
        };

        let pid: u32 = pid
            .trim()
            .parse()
            .map_err(|_| ListenerError::Activation(format!("LISTEN_PID={:?} is not a pid", pid)))?;
        if pid != own_pid {
            tracing::debug!(
                "Ignoring socket activation meant for pid {} (we are {})",
                pid,
                own_pid
            );
            return Ok(Self::none());
        }

        let count: i32 = fds
            .trim()
            .parse()
            .map_err(|_| ListenerError::Activation(format!("LISTEN_FDS={:?} is not a count", fds)))?;
        if count < 0 {
            return Err(ListenerError::Activation(format!(
                "LISTEN_FDS={} is negative",
                count
            )));
        }

        Ok(Self {
            fds: (LISTEN_FDS_START..LISTEN_FDS_START + count).collect(),
        })
    }

    /// Inherited descriptor numbers
    pub fn fds(&self) -> &[i32] {
        &self.fds
    }
}

/// How the base listener was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOrigin {
    /// Adopted from systemd
    Inherited,
    /// Bound by this process
    Bound,
}

impl std::fmt::Display for ListenerOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inherited => write!(f, "systemd"),
            Self::Bound => write!(f, "bound"),
        }
    }
}

/// The one TCP listener every protocol is served from
#[derive(Debug)]
pub struct BaseListener {
    inner: TcpListener,
    port: u16,
    origin: ListenerOrigin,
}

impl BaseListener {
    fn from_std(
        listener: std::net::TcpListener,
        port: u16,
        origin: ListenerOrigin,
    ) -> Result<Self, ListenerError> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            inner: TcpListener::from_std(listener)?,
            port,
            origin,
        })
    }

    /// Accept the next TCP connection
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    /// Effective port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Where the listener came from
    pub fn origin(&self) -> ListenerOrigin {
        self.origin
    }

    /// Local socket address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Produce the base listener
///
/// With no inherited descriptors the configured port is bound. Exactly one
/// inherited descriptor is adopted and its port discovered. More than one is
/// an error; the configured port is not bound as a fallback.
pub async fn resolve_listener(
    activation: &Activation,
    port: u16,
) -> Result<BaseListener, ListenerError> {
    match activation.fds() {
        [] => bind(port).await,
        [fd] => {
            let listener = adopt_inherited(*fd)?;
            tracing::info!("Found port {} for systemd listener", listener.port());
            Ok(listener)
        }
        fds => Err(ListenerError::TooManyInherited(fds.len())),
    }
}

async fn bind(port: u16) -> Result<BaseListener, ListenerError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind { port, source })?;
    let port = listener.local_addr()?.port();

    Ok(BaseListener {
        inner: listener,
        port,
        origin: ListenerOrigin::Bound,
    })
}

/// Take ownership of an inherited descriptor
#[cfg(unix)]
pub fn adopt_inherited(fd: i32) -> Result<BaseListener, ListenerError> {
    use std::os::fd::FromRawFd;

    set_cloexec(fd)?;
    ensure_tcp_listener(fd)?;
    let port = discover_port(fd)?;

    // SAFETY: the descriptor was handed to this process, is open and is a
    // TCP socket; nothing else in the process owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    BaseListener::from_std(listener, port, ListenerOrigin::Inherited)
}

#[cfg(not(unix))]
pub fn adopt_inherited(_fd: i32) -> Result<BaseListener, ListenerError> {
    Err(ListenerError::Unsupported)
}

#[cfg(unix)]
fn set_cloexec(fd: i32) -> io::Result<()> {
    // SAFETY: fcntl on an arbitrary descriptor number only reads/updates its flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn ensure_tcp_listener(fd: i32) -> Result<(), ListenerError> {
    let mut sock_type: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: the out pointers are valid for the sizes passed.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut sock_type as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 || sock_type != libc::SOCK_STREAM {
        return Err(ListenerError::NotTcp(fd));
    }

    // SAFETY: sockaddr_storage is plain data and valid when zeroed.
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }

    match addr.ss_family as libc::c_int {
        libc::AF_INET | libc::AF_INET6 => Ok(()),
        _ => Err(ListenerError::NotTcp(fd)),
    }
}

/// Kernel TCP tables scanned for an inode, IPv4 first
pub const TCP_TABLES: [&str; 2] = ["/proc/self/net/tcp", "/proc/self/net/tcp6"];

/// Find the local port of a listening socket through procfs
#[cfg(target_os = "linux")]
pub fn discover_port(fd: i32) -> Result<u16, ListenerError> {
    let link = std::fs::read_link(format!("/proc/self/fd/{}", fd))?;
    let link = link.to_string_lossy();
    let inode = socket_inode(&link).ok_or(ListenerError::NotTcp(fd))?;

    for table in TCP_TABLES {
        let contents = match std::fs::read_to_string(table) {
            Ok(contents) => contents,
            // tcp6 is absent on kernels without IPv6
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some(port) = port_for_inode(&contents, inode)? {
            return Ok(port);
        }
    }

    Err(ListenerError::InodeNotFound(inode.to_string()))
}

#[cfg(not(target_os = "linux"))]
pub fn discover_port(_fd: i32) -> Result<u16, ListenerError> {
    Err(ListenerError::Unsupported)
}

/// Extract the inode from a `socket:[12345]` descriptor link
pub fn socket_inode(link: &str) -> Option<&str> {
    link.strip_prefix("socket:[")?.strip_suffix(']')
}

/// Look up the local port for `inode` in the text of a `/proc/net/tcp*` table
///
/// Field 1 is `local_address` as `ADDR:PORT` in hex and field 9 is the inode.
pub fn port_for_inode(table: &str, inode: &str) -> Result<Option<u16>, ListenerError> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.get(9) != Some(&inode) {
            continue;
        }

        let port = fields
            .get(1)
            .and_then(|local| local.rsplit_once(':'))
            .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok())
            .ok_or_else(|| ListenerError::MalformedTable(line.trim().to_string()))?;
        return Ok(Some(port));
    }

    Ok(None)
}
