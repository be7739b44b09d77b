//! Mock Modbus-TCP server for connection and scan tests.
//!
//! Binds to `127.0.0.1:0` and answers every 12 byte request frame with the
//! [`Action`] chosen by a handler closure. Connections are served one at a
//! time, which is all a scanner ever opens.

use crate::protocol::RequestFrame;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How the server reacts to one request.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    Reply(Vec<u8>),
    /// Several writes with a short pause in between.
    Replies(Vec<Vec<u8>>),
    /// Read the request, never answer.
    Silence,
    /// Drop the connection without answering.
    Close,
}

pub(crate) struct MockServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    pub(crate) fn start<F>(handler: F) -> Self
    where
        F: FnMut(&[u8]) -> Action + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let handle = {
            let stop = stop.clone();
            let requests = requests.clone();
            let connections = connections.clone();
            thread::spawn(move || {
                let mut handler = handler;
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            connections.fetch_add(1, Ordering::SeqCst);
                            let _ = Self::serve(stream, &stop, &requests, &mut handler);
                        }
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(POLL_INTERVAL)
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Self {
            local_addr,
            stop,
            requests,
            connections,
            handle: Some(handle),
        }
    }

    fn serve<F>(
        mut stream: TcpStream,
        stop: &AtomicBool,
        requests: &Mutex<Vec<Vec<u8>>>,
        handler: &mut F,
    ) -> io::Result<()>
    where
        F: FnMut(&[u8]) -> Action,
    {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut frame = [0u8; RequestFrame::LEN];
        let mut filled = 0;
        while !stop.load(Ordering::SeqCst) {
            match stream.read(&mut frame[filled..]) {
                Ok(0) => return Ok(()),
                Ok(len) => filled += len,
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(error) => return Err(error),
            }
            if filled < frame.len() {
                continue;
            }
            filled = 0;
            requests.lock().unwrap().push(frame.to_vec());
            match handler(&frame[..]) {
                Action::Reply(bytes) => stream.write_all(&bytes)?,
                Action::Replies(replies) => {
                    for bytes in replies {
                        stream.write_all(&bytes)?;
                        thread::sleep(POLL_INTERVAL);
                    }
                }
                Action::Silence => {}
                Action::Close => return Ok(()),
            }
        }
        Ok(())
    }

    pub(crate) fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Every request frame received so far, in order.
    pub(crate) fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    /// Unit ids of every request received so far, in order.
    pub(crate) fn probed_ids(&self) -> Vec<u8> {
        self.requests().iter().map(|frame| frame[6]).collect()
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
