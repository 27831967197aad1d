//! Outbound connections used by the sender

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ErrorCode;

/// One outbound connection. Not shared: each sender connection owns one.
///
/// `read`/`write` follow the usual partial I/O rules. `Ok(0)` from either,
/// or any error, means the connection is unusable and must be closed.
pub trait ClientSocket: Send {
    /// Establish the connection. Fails with `ConnError` (give up) or
    /// `ConnErrorRetryable` (worth another attempt).
    fn connect(&mut self) -> Result<(), ErrorCode>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Drop the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Creates a fresh, unconnected socket for a destination.
pub trait SocketFactory: Send + Sync {
    fn make_socket(&self, host: &str, port: u16) -> Box<dyn ClientSocket>;
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// SO_SNDBUF; `None` keeps the OS default
    pub send_buffer_size: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(30),
            send_buffer_size: None,
        }
    }
}

pub struct TcpClientSocket {
    host: String,
    port: u16,
    config: SocketConfig,
    stream: Option<TcpStream>,
}

impl TcpClientSocket {
    pub fn new(host: &str, port: u16, config: SocketConfig) -> Self {
        Self {
            host: host.to_string(),
            port,
            config,
            stream: None,
        }
    }

    fn connect_addr(&self, addr: &SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        if let Some(sz) = self.config.send_buffer_size {
            // Best effort: the kernel may clamp or refuse large buffers.
            if let Err(e) = socket.set_send_buffer_size(sz) {
                debug!(error = %e, size = sz, "SO_SNDBUF not applied");
            }
        }
        socket.connect_timeout(&(*addr).into(), self.config.connect_timeout)?;
        let stream: TcpStream = socket.into();
        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        Ok(stream)
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

fn is_retryable(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | TimedOut
            | WouldBlock
            | Interrupted
            | AddrInUse
            | AddrNotAvailable
    )
}

impl ClientSocket for TcpClientSocket {
    fn connect(&mut self) -> Result<(), ErrorCode> {
        self.close();
        let addrs: Vec<SocketAddr> = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(a) => a.collect(),
            Err(e) => {
                warn!(host = %self.host, error = %e, "cannot resolve destination");
                return Err(ErrorCode::ConnError);
            }
        };
        if addrs.is_empty() {
            warn!(host = %self.host, "destination resolved to no addresses");
            return Err(ErrorCode::ConnError);
        }

        let mut code = ErrorCode::ConnError;
        for addr in &addrs {
            match self.connect_addr(addr) {
                Ok(stream) => {
                    debug!(%addr, "connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect failed");
                    if is_retryable(&e) {
                        code = ErrorCode::ConnErrorRetryable;
                    }
                }
            }
        }
        Err(code)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        loop {
            match stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        loop {
            match stream.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpClientSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for real TCP sockets.
#[derive(Debug, Clone, Default)]
pub struct TcpSocketFactory {
    config: SocketConfig,
}

impl TcpSocketFactory {
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }
}

impl SocketFactory for TcpSocketFactory {
    fn make_socket(&self, host: &str, port: u16) -> Box<dyn ClientSocket> {
        Box::new(TcpClientSocket::new(host, port, self.config.clone()))
    }
}
