//! The reactor: one thread multiplexing the listening socket and every
//! accepted connection, dispatching ready events to the worker pool.
//!
//! Connection entries live in a slab keyed by token. An entry whose event has
//! been handed to a worker is marked in-flight and receives no further
//! dispatches; the worker reports back over a channel (waking the poll with a
//! [`Waker`]), and the reactor then re-arms the socket with exactly one of
//! read or write interest — or closes it. Entries carry a generation counter
//! so a completion that raced with a close (or a reused token) is a no-op.
//! Idle connections are closed by the timer heap, which also bounds the poll
//! timeout.

use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::config::Config;
use crate::db::LazyPool;
use crate::error::Result;
use crate::http::connection::HttpConnection;
use crate::site::Site;
use crate::timer::TimerHeap;
use crate::workers::WorkerPool;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Hard cap on concurrent connections; above it new clients get a short
/// error string and are dropped.
pub const MAX_CONNECTIONS: usize = 65536;

const SERVER_BUSY: &[u8] = b"Server error!";

/// State shared between the reactor and the worker tasks.
pub struct ServerContext {
    site: Site,
    db: LazyPool,
    connection_count: AtomicUsize,
}

impl ServerContext {
    pub fn new(site: Site, db: LazyPool) -> Self {
        Self {
            site,
            db,
            connection_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn site(&self) -> &Site {
        &self.site
    }

    #[inline]
    pub fn db(&self) -> &LazyPool {
        &self.db
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    fn connection_opened(&self) -> usize {
        self.connection_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn connection_closed(&self) -> usize {
        self.connection_count.fetch_sub(1, Ordering::Relaxed) - 1
    }
}

/// What a worker decided should happen to the connection next.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    RearmRead,
    RearmWrite,
    Close,
}

struct Completion {
    token: Token,
    generation: u64,
    outcome: Outcome,
}

struct ConnEntry {
    generation: u64,
    in_flight: bool,
    conn: Arc<Mutex<HttpConnection>>,
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
    }
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    idle_timeout: Option<Duration>,
    connections: Slab<ConnEntry>,
    timer: TimerHeap,
    workers: WorkerPool,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    waker: Arc<Waker>,
    ctx: Arc<ServerContext>,
    next_generation: u64,
    stop: Arc<AtomicBool>,
}

impl Server {
    /// Binds the listening socket (non-blocking, close-on-exec, reuse-addr,
    /// keep-alive, system-max backlog) and sets up the reactor.
    pub fn bind(
        addr: SocketAddr,
        idle_timeout: Option<Duration>,
        ctx: Arc<ServerContext>,
    ) -> Result<Self> {
        let mut listener = listen(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (completion_tx, completion_rx) = unbounded();

        Ok(Self {
            poll,
            listener,
            idle_timeout,
            connections: Slab::new(),
            timer: TimerHeap::new(),
            workers: WorkerPool::new(),
            completion_tx,
            completion_rx,
            waker,
            ctx,
            next_generation: 0,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Convenience constructor from the loaded configuration.
    pub fn from_config(config: &Config, ctx: Arc<ServerContext>) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let idle_timeout = match config.server.timeout {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Self::bind(addr, idle_timeout, ctx)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// The reactor loop. Returns after [`ShutdownHandle::shutdown`].
    pub fn run(&mut self) -> Result<()> {
        info!("server listening on {}", self.listener.local_addr()?);
        let mut events = Events::with_capacity(1024);
        while !self.stop.load(Ordering::Relaxed) {
            let timeout = match self.idle_timeout {
                Some(_) => self.timer.peek(),
                None => None,
            };
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept_ready(),
                    WAKE_TOKEN => {}
                    token => self.dispatch(token, event),
                }
            }
            self.drain_completions();
            for id in self.timer.tick() {
                debug!("client[{id}] idle timeout");
                self.close_connection(Token(id as usize));
            }
        }
        self.close_all();
        Ok(())
    }

    /// Accept until the kernel runs dry. `EMFILE` is logged and the accept
    /// dropped; existing connections are untouched.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    if err.raw_os_error() == Some(libc::EMFILE) {
                        error!("accept: too many open files");
                    } else {
                        error!("accept failed: {err}");
                    }
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.ctx.connection_count() >= MAX_CONNECTIONS {
            warn!("connection cap reached, rejecting {peer}");
            let _ = stream.write(SERVER_BUSY);
            return;
        }
        let borrowed_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(stream.as_raw_fd()) };
        if let Err(err) = SockRef::from(&borrowed_fd).set_keepalive(true) {
            warn!("keep-alive on {peer} failed: {err}");
            return;
        }
        if let Err(err) = stream.set_nodelay(true) {
            warn!("nodelay on {peer} failed: {err}");
            return;
        }

        let token = Token(self.connections.vacant_key());
        if let Err(err) =
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
        {
            error!("registering {peer} failed: {err}");
            return;
        }
        self.next_generation += 1;
        self.connections.insert(ConnEntry {
            generation: self.next_generation,
            in_flight: false,
            conn: Arc::new(Mutex::new(HttpConnection::new(stream, peer))),
        });
        if let Some(timeout) = self.idle_timeout {
            self.timer.add(token.0 as u64, timeout);
        }
        let count = self.ctx.connection_opened();
        info!("client[{}] {peer} connected, connection count: {count}", token.0);
    }

    /// Hands a ready event to the worker pool. Entries already in flight are
    /// skipped: the one-shot discipline means at most one task per
    /// connection, re-armed only from its completion.
    fn dispatch(&mut self, token: Token, event: &Event) {
        let Some(entry) = self.connections.get_mut(token.0) else {
            return;
        };
        if entry.in_flight {
            return;
        }
        if event.is_error() {
            warn!("client[{}] socket error", token.0);
            self.close_connection(token);
            return;
        }
        let readable = event.is_readable() || event.is_read_closed() || event.is_priority();
        let writable = event.is_writable();
        if !readable && !writable {
            return;
        }

        entry.in_flight = true;
        let generation = entry.generation;
        let conn = Arc::clone(&entry.conn);
        let ctx = Arc::clone(&self.ctx);
        let tx = self.completion_tx.clone();
        let waker = Arc::clone(&self.waker);

        if let Some(timeout) = self.idle_timeout {
            self.timer.reset(token.0 as u64, timeout);
        }

        drop(self.workers.submit(move || {
            let outcome = if readable {
                read_task(&conn, &ctx)
            } else {
                write_task(&conn)
            };
            let _ = tx.send(Completion {
                token,
                generation,
                outcome,
            });
            let _ = waker.wake();
        }));
    }

    fn drain_completions(&mut self) {
        while let Ok(done) = self.completion_rx.try_recv() {
            let Some(entry) = self.connections.get_mut(done.token.0) else {
                continue;
            };
            if entry.generation != done.generation {
                continue;
            }
            entry.in_flight = false;
            match done.outcome {
                Outcome::Close => self.close_connection(done.token),
                Outcome::RearmRead => self.rearm(done.token, Interest::READABLE),
                Outcome::RearmWrite => self.rearm(done.token, Interest::WRITABLE),
            }
        }
    }

    fn rearm(&mut self, token: Token, interest: Interest) {
        let Some(entry) = self.connections.get(token.0) else {
            return;
        };
        let result = {
            let mut conn = entry.conn.lock().unwrap();
            self.poll
                .registry()
                .reregister(conn.stream_mut(), token, interest)
        };
        if let Err(err) = result {
            warn!("client[{}] rearm failed: {err}", token.0);
            self.close_connection(token);
        }
    }

    /// Deregisters, releases the response mapping, and drops the entry (and
    /// with it the socket, once no worker still holds the Arc). Safe to call
    /// twice; the second call finds no entry.
    fn close_connection(&mut self, token: Token) {
        if self.connections.get(token.0).is_none() {
            return;
        }
        let entry = self.connections.remove(token.0);
        self.timer.cancel(token.0 as u64);
        let mut conn = entry.conn.lock().unwrap();
        let _ = self.poll.registry().deregister(conn.stream_mut());
        conn.close();
        let count = self.ctx.connection_closed();
        info!(
            "client[{}] {} quit, connection count: {count}",
            token.0,
            conn.peer()
        );
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.connections.iter().map(|(key, _)| Token(key)).collect();
        for token in tokens {
            self.close_connection(token);
        }
        self.timer.clear();
        self.workers.shutdown();
        info!("server stopped");
    }
}

fn read_task(conn: &Arc<Mutex<HttpConnection>>, ctx: &ServerContext) -> Outcome {
    let mut conn = conn.lock().unwrap();
    match conn.read() {
        Err(err) => {
            debug!("{} read error: {err}", conn.peer());
            Outcome::Close
        }
        Ok(_) if conn.peer_closed() => Outcome::Close,
        Ok(_) => {
            if conn.process(ctx) {
                Outcome::RearmWrite
            } else {
                Outcome::RearmRead
            }
        }
    }
}

fn write_task(conn: &Arc<Mutex<HttpConnection>>) -> Outcome {
    let mut conn = conn.lock().unwrap();
    match conn.write() {
        Err(err) => {
            // EPIPE / ECONNRESET: peer went away mid-response.
            debug!("{} write error: {err}", conn.peer());
            Outcome::Close
        }
        Ok(_) => {
            if conn.to_write_bytes() > 0 {
                Outcome::RearmWrite
            } else if conn.is_keep_alive() {
                Outcome::RearmRead
            } else {
                Outcome::Close
            }
        }
    }
}

/// socket2-built listener: reuse-addr, keep-alive, non-blocking,
/// close-on-exec, backlog at the system maximum.
fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
pub mod test_support {
    use super::ServerContext;
    use crate::config::MysqlConfig;
    use crate::db::LazyPool;
    use crate::site::Site;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_dir(tag: &str) -> PathBuf {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "hearth-ctx-{tag}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn dummy_mysql_config() -> MysqlConfig {
        MysqlConfig {
            host: "127.0.0.1".into(),
            port: 3306,
            user: "root".into(),
            password: String::new(),
            db: "hearth_test".into(),
            pool_size: 1,
            pool_min_size: 1,
            pool_max_size: 2,
        }
    }

    /// Context over a fresh, initially empty site directory. The caller may
    /// add files afterwards; they are served without a reload (only the
    /// `.html` rewrite set is fixed at load time).
    pub fn context_with_site(tag: &str) -> (ServerContext, PathBuf) {
        let dir = unique_dir(tag);
        let site = Site::load(&dir).unwrap();
        (
            ServerContext::new(site, LazyPool::new(dummy_mysql_config())),
            dir,
        )
    }

    /// Context whose site contains one `.html` page per given name.
    pub fn context_with_pages(pages: &[&str]) -> ServerContext {
        let dir = unique_dir("pages");
        for page in pages {
            fs::write(dir.join(format!("{page}.html")), "<html></html>").unwrap();
        }
        let site = Site::load(&dir).unwrap();
        ServerContext::new(site, LazyPool::new(dummy_mysql_config()))
    }
}
