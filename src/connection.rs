//! Blocking Modbus-TCP connection with bounded reconnects.
//!
//! A [`Connection`] owns at most one `TcpStream` to the target. The socket is
//! opened lazily, reused across probes and only replaced after a socket level
//! failure. Every failed attempt, be it the connect itself or the send/receive
//! that follows, counts against the retry budget of the probe in flight.
//! Once the budget is exceeded the connection enters
//! [`ConnectionState::Failed`] and the scan has to stop.
//!
//! ## Example
//!
//! ```no_run
//! use sunspec_scan_lib::connection::{Connection, ConnectionConfig, Reply, Transport};
//! use sunspec_scan_lib::protocol::{DeviceId, RequestFrame};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = Connection::connect(ConnectionConfig::new("192.168.1.20"))?;
//!     let request = RequestFrame::new(DeviceId::try_from(1u8)?, 1);
//!     match connection.exchange(&request, Duration::from_secs(3))? {
//!         Reply::Response(bytes) => println!("Received {} bytes", bytes.len()),
//!         Reply::Timeout => println!("Timed out"),
//!     }
//!     connection.close();
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::protocol::RequestFrame;
use log::*;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default Modbus-TCP port of SolarEdge inverters.
pub const DEFAULT_PORT: u16 = 1502;
pub const PORT_MIN: u16 = 1024;
pub const PORT_MAX: u16 = 49151;

pub const DEFAULT_RETRIES: u8 = 3;
pub const RETRIES_MAX: u8 = 10;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Upper bound accepted for every timeout option.
pub const TIMEOUT_MAX: Duration = Duration::from_secs(60);

/// Size of the single read that makes up a response.
const RECEIVE_BUFFER_LEN: usize = 1024;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Host name or IP address of the Modbus-TCP server.
    pub host: String,
    pub port: u16,
    /// Zero means the operating system's blocking connect.
    pub connect_timeout: Duration,
    /// Failed attempts tolerated per probe before the scan is aborted.
    pub retries: u8,
    /// Pause after a failed attempt.
    pub retry_delay: Duration,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted. Terminal.
    Failed,
}

/// The outcome of one request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The bytes of a single read.
    Response(Vec<u8>),
    /// Nothing arrived within the allotted time. The connection stays open.
    Timeout,
}

/// Sends request frames and waits for the reply.
///
/// Implementations handle reconnects themselves; an `Err` is always fatal
/// for the scan.
pub trait Transport {
    fn exchange(&mut self, request: &RequestFrame, timeout: Duration) -> Result<Reply>;

    /// Releases the underlying connection, if any.
    fn close(&mut self) {}
}

/// Single TCP connection to a Modbus-TCP server.
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    stream: Option<TcpStream>,
    state: ConnectionState,
}

impl Connection {
    /// Creates a disconnected connection. The socket is opened by the first
    /// exchange.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            stream: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Creates a connection and opens the socket right away, honouring the
    /// retry budget.
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        let mut connection = Self::new(config);
        connection.with_retries(|conn| conn.stream().map(|_| ()))?;
        Ok(connection)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Shuts the socket down. A failed connection stays failed.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            info!(
                "Closing connection to {}:{}",
                self.config.host, self.config.port
            );
            if let Err(error) = stream.shutdown(Shutdown::Both) {
                warn!("Closing connection failed: {error}");
            }
        }
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Runs `attempt` until it succeeds or the retry budget is exceeded.
    /// The socket is dropped after every failure so the next attempt
    /// reconnects.
    fn with_retries<T, F>(&mut self, mut attempt: F) -> Result<T>
    where
        F: FnMut(&mut Self) -> io::Result<T>,
    {
        if self.state == ConnectionState::Failed {
            return Err(self.exhausted(
                0,
                io::Error::new(io::ErrorKind::NotConnected, "connection already failed"),
            ));
        }
        let mut failures: u32 = 0;
        loop {
            match attempt(self) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    self.stream = None;
                    self.state = ConnectionState::Disconnected;
                    failures += 1;
                    if failures > u32::from(self.config.retries) {
                        self.state = ConnectionState::Failed;
                        error!(
                            "Aborting due to {failures} connection attempt failures to {}:{}",
                            self.config.host, self.config.port
                        );
                        return Err(self.exhausted(failures, error));
                    }
                    warn!(
                        "Communication with {}:{} failed (attempt {failures} of {}): {error}",
                        self.config.host,
                        self.config.port,
                        u32::from(self.config.retries) + 1
                    );
                    std::thread::sleep(self.config.retry_delay);
                }
            }
        }
    }

    fn exhausted(&self, failures: u32, source: io::Error) -> Error {
        Error::RetryBudgetExhausted {
            host: self.config.host.clone(),
            port: self.config.port,
            failures,
            source,
        }
    }

    /// The open socket, connecting first if there is none.
    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            let stream = self.open()?;
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// One connect attempt against every address the host resolves to.
    fn open(&mut self) -> io::Result<TcpStream> {
        self.state = ConnectionState::Connecting;
        info!("Connecting to {}:{} ...", self.config.host, self.config.port);

        let addresses: Vec<SocketAddr> =
            (self.config.host.as_str(), self.config.port).to_socket_addrs()?.collect();
        let mut last_error = io::Error::new(
            io::ErrorKind::NotFound,
            format!("'{}' did not resolve to any address", self.config.host),
        );
        for address in addresses {
            let connected = if self.config.connect_timeout.is_zero() {
                TcpStream::connect(address)
            } else {
                TcpStream::connect_timeout(&address, self.config.connect_timeout)
            };
            match connected {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.state = ConnectionState::Connected;
                    info!("Connected to {address}");
                    return Ok(stream);
                }
                Err(error) => {
                    debug!("Connect to {address} failed: {error}");
                    last_error = error;
                }
            }
        }
        self.state = ConnectionState::Disconnected;
        Err(last_error)
    }

    /// Drops bytes that are already waiting on the socket, typically a late
    /// reply to a probe that timed out.
    fn discard_stale(stream: &mut TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let mut buffer = [0u8; RECEIVE_BUFFER_LEN];
        let result = loop {
            match stream.read(&mut buffer) {
                Ok(0) => break Err(closed_by_peer()),
                Ok(len) => debug!("Discarding {len} stale bytes: {:02x?}", &buffer[..len]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => break Err(error),
            }
        };
        stream.set_nonblocking(false)?;
        result
    }

    /// Waits up to `timeout` for the socket to become readable and performs
    /// a single read.
    fn receive(stream: &mut TcpStream, timeout: Duration) -> io::Result<Reply> {
        let mut buffer = [0u8; RECEIVE_BUFFER_LEN];
        let read = if timeout.is_zero() {
            stream.set_nonblocking(true)?;
            let read = stream.read(&mut buffer);
            stream.set_nonblocking(false)?;
            read
        } else {
            stream.set_read_timeout(Some(timeout))?;
            stream.read(&mut buffer)
        };
        match read {
            Ok(0) => Err(closed_by_peer()),
            Ok(len) => Ok(Reply::Response(buffer[..len].to_vec())),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(Reply::Timeout)
            }
            Err(error) => Err(error),
        }
    }
}

fn closed_by_peer() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}

impl Transport for Connection {
    fn exchange(&mut self, request: &RequestFrame, timeout: Duration) -> Result<Reply> {
        self.with_retries(|conn| {
            let stream = conn.stream()?;
            Self::discard_stale(stream)?;
            trace!("Sending {:02x?}", request.as_bytes());
            stream.write_all(request.as_bytes())?;
            let reply = Self::receive(stream, timeout)?;
            if let Reply::Response(bytes) = &reply {
                trace!("Received {:02x?}", bytes);
            }
            Ok(reply)
        })
    }

    fn close(&mut self) {
        Connection::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_server::{Action, MockServer};
    use crate::protocol::{DeviceId, ExpectedSignature};
    use assert_matches::assert_matches;
    use std::net::TcpListener;

    fn config(port: u16, retries: u8) -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(1),
            retries,
            retry_delay: Duration::ZERO,
        }
    }

    fn request(transaction_id: u16) -> RequestFrame {
        RequestFrame::new(DeviceId::try_from(3u8).unwrap(), transaction_id)
    }

    fn signature(request: &[u8]) -> Vec<u8> {
        ExpectedSignature::for_request(request).as_bytes().to_vec()
    }

    /// A port nobody listens on.
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn exchange_returns_reply_bytes() {
        let server = MockServer::start(|request| Action::Reply(signature(request)));
        let mut connection = Connection::new(config(server.port(), 0));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let frame = request(1);
        let reply = connection
            .exchange(&frame, Duration::from_secs(1))
            .unwrap();
        assert_eq!(reply, Reply::Response(signature(frame.as_bytes())));
        assert!(connection.is_connected());
        assert_eq!(server.requests(), vec![frame.as_bytes().to_vec()]);
    }

    #[test]
    fn timeout_keeps_connection_open() {
        let server = MockServer::start(|_| Action::Silence);
        let mut connection = Connection::new(config(server.port(), 0));

        for transaction_id in 1..=2 {
            let reply = connection
                .exchange(&request(transaction_id), Duration::from_millis(20))
                .unwrap();
            assert_eq!(reply, Reply::Timeout);
        }
        assert!(connection.is_connected());
        assert_eq!(server.connections(), 1);
    }

    #[test]
    fn zero_timeout_polls_once() {
        let server = MockServer::start(|_| Action::Silence);
        let mut connection = Connection::new(config(server.port(), 0));
        let reply = connection.exchange(&request(1), Duration::ZERO).unwrap();
        assert_eq!(reply, Reply::Timeout);
    }

    #[test]
    fn reconnects_after_peer_closes() {
        let mut first = true;
        let server = MockServer::start(move |request| {
            if std::mem::take(&mut first) {
                Action::Close
            } else {
                Action::Reply(signature(request))
            }
        });
        let mut connection = Connection::new(config(server.port(), 1));

        let frame = request(7);
        let reply = connection
            .exchange(&frame, Duration::from_secs(1))
            .unwrap();
        assert_eq!(reply, Reply::Response(signature(frame.as_bytes())));
        assert_eq!(server.connections(), 2);
        // The same frame is sent again on the new connection.
        assert_eq!(server.requests().len(), 2);
    }

    #[test]
    fn peer_close_without_budget_is_fatal() {
        let server = MockServer::start(|_| Action::Close);
        let mut connection = Connection::new(config(server.port(), 0));
        assert_matches!(
            connection.exchange(&request(1), Duration::from_secs(1)),
            Err(Error::RetryBudgetExhausted { failures: 1, .. })
        );
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[test]
    fn connect_gives_up_after_budget() {
        let result = Connection::connect(config(closed_port(), 2));
        assert_matches!(
            result,
            Err(Error::RetryBudgetExhausted { failures: 3, port, .. }) if port != 0
        );
    }

    #[test]
    fn failed_connection_stays_failed() {
        let mut connection = Connection::new(config(closed_port(), 0));
        assert_matches!(
            connection.exchange(&request(1), Duration::from_millis(10)),
            Err(Error::RetryBudgetExhausted { failures: 1, .. })
        );
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_matches!(
            connection.exchange(&request(2), Duration::from_millis(10)),
            Err(Error::RetryBudgetExhausted { failures: 0, .. })
        );
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[test]
    fn stale_bytes_are_discarded() {
        let server = MockServer::start(|request| {
            if request[1] == 1 {
                Action::Replies(vec![signature(request), b"late".to_vec()])
            } else {
                Action::Reply(signature(request))
            }
        });
        let mut connection = Connection::new(config(server.port(), 0));

        let first = request(1);
        connection
            .exchange(&first, Duration::from_secs(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let second = request(2);
        let reply = connection
            .exchange(&second, Duration::from_secs(1))
            .unwrap();
        assert_eq!(reply, Reply::Response(signature(second.as_bytes())));
    }

    #[test]
    fn close_disconnects() {
        let server = MockServer::start(|request| Action::Reply(signature(request)));
        let mut connection = Connection::connect(config(server.port(), 0)).unwrap();
        assert!(connection.is_connected());
        Transport::close(&mut connection);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
