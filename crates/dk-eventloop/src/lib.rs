#![forbid(unsafe_code)]

//! Single-threaded, non-blocking server loop.
//!
//! One `Poll` drives the listener and every connection. Connections are
//! registered once with both interests; edge-triggered readiness works
//! because every wakeup reads to `WouldBlock` and flushes eagerly. All
//! request processing happens inline on this thread; the only other
//! threads in the process are the lazyfree workers behind the store.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use dk_command::dispatch;
use dk_protocol::{encode_reply, parse_request};
use dk_store::Store;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN_TOKEN: usize = 2;

const READ_CHUNK: usize = 64 * 1024;
/// Upper bound on the poll timeout even with no pending TTL deadline.
const MAX_POLL_TIMEOUT_MS: u64 = 5_000;
/// Per-iteration cap on active expiration work.
const EXPIRE_BUDGET: usize = 2_000;

/// Milliseconds since the Unix epoch. The loop samples this once per
/// wakeup and threads it through every store call.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

#[derive(Debug)]
struct Conn {
    stream: TcpStream,
    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    want_close: bool,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            want_close: false,
        }
    }
}

/// Cross-thread stop switch for a running loop.
#[derive(Debug, Clone)]
pub struct Handle {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl Handle {
    /// Ask the loop to exit after its current iteration.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(error) = self.waker.wake() {
            warn!(%error, "failed to wake event loop for shutdown");
        }
    }
}

pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    conns: HashMap<usize, Conn>,
    next_token: usize,
    store: Store,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl EventLoop {
    /// Bind the listening socket and set up the poller. The loop does not
    /// run until [`EventLoop::run`] is called, but the socket accepts
    /// backlog connections from this point on.
    pub fn bind(addr: SocketAddr, store: Store) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            listener,
            conns: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
            store,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle {
            waker: Arc::clone(&self.waker),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Run until [`Handle::shutdown`] fires. Consumes the loop; open
    /// connections are dropped on exit.
    pub fn run(mut self) -> io::Result<()> {
        debug!(addr = %self.local_addr()?, "event loop running");
        let mut events = Events::with_capacity(256);
        while !self.shutdown.load(Ordering::SeqCst) {
            let timeout = self.poll_timeout();
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(),
                    WAKER => {}
                    Token(id) => self.conn_ready(id, event.is_readable(), event.is_writable()),
                }
            }
            let now = now_ms();
            let evicted = self.store.active_expire_cycle(now, EXPIRE_BUDGET);
            if evicted > 0 {
                debug!(evicted, "swept expired keys");
            }
        }
        debug!("event loop stopped");
        Ok(())
    }

    /// Sleep until the next TTL deadline, capped so the active sweep still
    /// runs on an idle server. A stale heap slot only causes an early
    /// wakeup, never a missed one.
    fn poll_timeout(&self) -> Duration {
        let now = now_ms();
        let millis = self
            .store
            .next_deadline()
            .map_or(MAX_POLL_TIMEOUT_MS, |deadline| {
                deadline.saturating_sub(now).min(MAX_POLL_TIMEOUT_MS)
            });
        Duration::from_millis(millis)
    }

    /// Accept failures are scoped to the connection that caused them, never
    /// to the server: a peer aborting mid-handshake or a burst of fd
    /// exhaustion must leave every established connection serving.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = self.next_token;
                    self.next_token += 1;
                    if let Err(error) = self.poll.registry().register(
                        &mut stream,
                        Token(token),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(%error, %peer, "failed to register connection");
                        continue;
                    }
                    trace!(%peer, token, "accepted connection");
                    self.conns.insert(token, Conn::new(stream));
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    warn!(%error, "accept failed");
                    return;
                }
            }
        }
    }

    fn conn_ready(&mut self, id: usize, readable: bool, writable: bool) {
        let now = now_ms();
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if readable {
            fill_incoming(conn);
            serve_frames(conn, &mut self.store, now);
        }
        if readable || writable {
            flush_outgoing(conn);
        }
        // Queued replies still drain before a close takes effect; write
        // failures clear the buffer so a dead peer cannot pin the slot.
        if conn.want_close && conn.outgoing.is_empty() {
            self.close(id);
        }
    }

    fn close(&mut self, id: usize) {
        if let Some(mut conn) = self.conns.remove(&id) {
            if let Err(error) = self.poll.registry().deregister(&mut conn.stream) {
                warn!(%error, token = id, "failed to deregister connection");
            }
            trace!(token = id, "closed connection");
        }
    }
}

fn fill_incoming(conn: &mut Conn) {
    let mut chunk = [0_u8; READ_CHUNK];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => {
                conn.want_close = true;
                return;
            }
            Ok(n) => conn.incoming.extend_from_slice(&chunk[..n]),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                debug!(%error, "read failed");
                conn.want_close = true;
                return;
            }
        }
    }
}

/// Process every complete frame buffered on the connection. Pipelined
/// requests are answered in arrival order within one pass.
fn serve_frames(conn: &mut Conn, store: &mut Store, now_ms: u64) {
    let mut consumed = 0_usize;
    loop {
        match parse_request(&conn.incoming[consumed..]) {
            Ok(Some((argv, used))) => {
                let reply = dispatch(&argv, store, now_ms);
                encode_reply(&reply, &mut conn.outgoing);
                consumed += used;
            }
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "dropping connection on protocol error");
                conn.want_close = true;
                break;
            }
        }
    }
    if consumed > 0 {
        conn.incoming.drain(..consumed);
    }
}

fn flush_outgoing(conn: &mut Conn) {
    while !conn.outgoing.is_empty() {
        match conn.stream.write(&conn.outgoing) {
            Ok(0) => {
                conn.want_close = true;
                conn.outgoing.clear();
                return;
            }
            Ok(n) => {
                conn.outgoing.drain(..n);
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                debug!(%error, "write failed");
                conn.want_close = true;
                conn.outgoing.clear();
                return;
            }
        }
    }
}
