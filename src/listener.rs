//! Listening sockets, worker threads and how accepted sockets reach a worker.

use crate::config::ServerConfig;
use crate::handler::Handler;
use crate::reactor::{Counters, Incoming, Intake, ThreadState, ThreadStats, LISTENER, WAKER};
use crate::Error;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// How accepted connections are distributed over worker threads.
///
/// Connections behave the same whichever strategy delivered them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStrategy {
    /// Every worker binds its own socket with `SO_REUSEPORT` and accepts straight into
    /// its own reactor. The kernel balances connections between the sockets.
    Direct,
    /// One acceptor thread owns the socket and hands each connection to a worker chosen
    /// by its descriptor modulo the worker count.
    Central,
}

impl AcceptStrategy {
    /// The strategy suited to this platform.
    ///
    /// `Direct` where the kernel load balances `SO_REUSEPORT` sockets, `Central` elsewhere.
    pub fn detect() -> Self {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            AcceptStrategy::Direct
        } else {
            AcceptStrategy::Central
        }
    }
}

/// A bound listener and its worker threads.
///
/// ```no_run
/// use h1_reactor::{HandlerError, Listener, ServerConfig};
///
/// let config = ServerConfig::new().host("127.0.0.1").port(3000);
///
/// let listener = Listener::bind(config, |_req: http::Request<Vec<u8>>| {
///     Ok::<_, HandlerError>(http::Response::new(b"Hello world!".to_vec()))
/// })?;
///
/// println!("listening on {}", listener.local_addr());
/// listener.join();
/// # Ok::<_, h1_reactor::Error>(())
/// ```
///
/// Dropping the listener shuts it down and waits for the workers to drain.
pub struct Listener {
    local_addr: SocketAddr,
    strategy: AcceptStrategy,
    terminate: Arc<AtomicBool>,
    workers: Vec<Worker>,
    acceptor: Option<Acceptor>,
}

struct Worker {
    index: usize,
    waker: Arc<Waker>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

struct Acceptor {
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind according to `config` and start the worker threads.
    pub fn bind<H: Handler>(config: ServerConfig, handler: H) -> Result<Listener, Error> {
        config.validate()?;

        let strategy = config.accept_strategy.unwrap_or_else(AcceptStrategy::detect);
        let addrs = resolve(&config)?;

        let config = Arc::new(config);
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let listener = match strategy {
            AcceptStrategy::Direct => Listener::start_direct(&config, &handler, &addrs)?,
            AcceptStrategy::Central => Listener::start_central(&config, &handler, &addrs)?,
        };

        info!(
            "listening on {} ({:?}, {} workers, tls: {})",
            listener.local_addr,
            strategy,
            config.num_worker_threads,
            config.tls_enabled()
        );

        Ok(listener)
    }

    fn empty(local_addr: SocketAddr, strategy: AcceptStrategy) -> Listener {
        Listener {
            local_addr,
            strategy,
            terminate: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            acceptor: None,
        }
    }

    fn start_direct(
        config: &Arc<ServerConfig>,
        handler: &Arc<dyn Handler>,
        addrs: &[SocketAddr],
    ) -> Result<Listener, Error> {
        let first = bind_socket(addrs, config.backlog, true)?;
        // port 0 resolves here, the rest share it.
        let local_addr = first.local_addr()?;

        let mut sockets = vec![first];
        for _ in 1..config.num_worker_threads {
            sockets.push(bind_socket(&[local_addr], config.backlog, true)?);
        }

        let mut listener = Listener::empty(local_addr, AcceptStrategy::Direct);

        for (index, sock) in sockets.into_iter().enumerate() {
            let intake = Intake::Direct(Some(TcpListener::from_std(sock)));
            listener.spawn_worker(index, config, handler, intake)?;
        }

        Ok(listener)
    }

    fn start_central(
        config: &Arc<ServerConfig>,
        handler: &Arc<dyn Handler>,
        addrs: &[SocketAddr],
    ) -> Result<Listener, Error> {
        let sock = bind_socket(addrs, config.backlog, false)?;
        let local_addr = sock.local_addr()?;

        let mut listener = Listener::empty(local_addr, AcceptStrategy::Central);

        let mut targets = Vec::with_capacity(config.num_worker_threads);

        for index in 0..config.num_worker_threads {
            let (tx, rx) = mpsc::channel();
            let waker = listener.spawn_worker(index, config, handler, Intake::Central(rx))?;
            targets.push(Target { tx, waker });
        }

        let mut sock = TcpListener::from_std(sock);

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        poll.registry()
            .register(&mut sock, LISTENER, Interest::READABLE)?;

        let central = CentralAcceptor {
            poll,
            sock,
            targets,
            terminate: listener.terminate.clone(),
            next: 0,
        };

        let handle = spawn("h1-acceptor".into(), config.thread_stack_size, move || {
            central.run()
        })?;

        listener.acceptor = Some(Acceptor {
            waker,
            handle: Some(handle),
        });

        Ok(listener)
    }

    fn spawn_worker(
        &mut self,
        index: usize,
        config: &Arc<ServerConfig>,
        handler: &Arc<dyn Handler>,
        intake: Intake,
    ) -> Result<Arc<Waker>, Error> {
        let counters = Arc::new(Counters::default());

        let (state, waker) = ThreadState::new(
            index,
            config.clone(),
            handler.clone(),
            intake,
            self.terminate.clone(),
            counters.clone(),
        )?;

        let handle = spawn(
            format!("h1-worker-{}", index),
            config.thread_stack_size,
            move || state.run(),
        )?;

        self.workers.push(Worker {
            index,
            waker: waker.clone(),
            counters,
            handle: Some(handle),
        });

        Ok(waker)
    }

    /// The bound address. With port 0 this holds the port picked by the OS.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The accept strategy in use.
    pub fn strategy(&self) -> AcceptStrategy {
        self.strategy
    }

    /// Live connections and handled requests per worker thread.
    pub fn stats(&self) -> Vec<ThreadStats> {
        self.workers
            .iter()
            .map(|w| w.counters.snapshot(w.index))
            .collect()
    }

    /// Stop accepting and let the workers drain.
    ///
    /// Requests in flight are finished, idle keepalive connections are closed. Returns
    /// immediately, use [`join`](Listener::join) to wait for the workers.
    pub fn shutdown(&self) {
        if self.terminate.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("shutting down {}", self.local_addr);

        if let Some(acceptor) = &self.acceptor {
            if let Err(e) = acceptor.waker.wake() {
                warn!("wake acceptor: {}", e);
            }
        }

        for w in &self.workers {
            if let Err(e) = w.waker.wake() {
                warn!("wake worker {}: {}", w.index, e);
            }
        }
    }

    /// Wait for all threads to exit. Blocks forever unless something calls
    /// [`shutdown`](Listener::shutdown).
    pub fn join(mut self) {
        self.join_threads();
    }

    fn join_threads(&mut self) {
        if let Some(acceptor) = &mut self.acceptor {
            if let Some(handle) = acceptor.handle.take() {
                if handle.join().is_err() {
                    warn!("acceptor thread panicked");
                }
            }
        }

        for w in &mut self.workers {
            if let Some(handle) = w.handle.take() {
                if handle.join().is_err() {
                    warn!("worker {} panicked", w.index);
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
        self.join_threads();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("strategy", &self.strategy)
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// A worker as seen by the acceptor.
struct Target {
    tx: Sender<Incoming>,
    waker: Arc<Waker>,
}

struct CentralAcceptor {
    poll: Poll,
    sock: TcpListener,
    targets: Vec<Target>,
    terminate: Arc<AtomicBool>,
    next: usize,
}

impl CentralAcceptor {
    fn run(mut self) {
        let mut events = Events::with_capacity(128);

        loop {
            if self.terminate.load(Ordering::Acquire) {
                break;
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!("acceptor poll: {}", e);
                }
                continue;
            }

            if events.iter().any(|e| e.token() == LISTENER) {
                self.accept();
            }
        }

        // the listening socket closes here, before any worker finishes draining.
        info!("acceptor stopped");
    }

    fn accept(&mut self) {
        loop {
            match self.sock.accept() {
                Ok((sock, peer_addr)) => {
                    let index = assign(&sock, self.targets.len(), &mut self.next);
                    let target = &self.targets[index];

                    trace!("assign {} to worker {}", peer_addr, index);

                    if target.tx.send(Incoming { sock, peer_addr }).is_err() {
                        debug!("worker {} gone, dropping {}", index, peer_addr);
                        continue;
                    }
                    if let Err(e) = target.waker.wake() {
                        warn!("wake worker {}: {}", index, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("acceptor accept: {}", e);
                    return;
                }
            }
        }
    }
}

#[cfg(unix)]
fn assign(sock: &TcpStream, workers: usize, _next: &mut usize) -> usize {
    use std::os::unix::io::AsRawFd;
    sock.as_raw_fd() as usize % workers
}

#[cfg(not(unix))]
fn assign(_sock: &TcpStream, workers: usize, next: &mut usize) -> usize {
    *next = (*next + 1) % workers;
    *next
}

/// Addresses to try binding, in order.
fn resolve(config: &ServerConfig) -> Result<Vec<SocketAddr>, Error> {
    let port = config.port;

    let addrs: Vec<SocketAddr> = match &config.host {
        Some(host) => (host.as_str(), port).to_socket_addrs()?.collect(),
        // dual stack, falling back to v4 only
        None => vec![
            (Ipv6Addr::UNSPECIFIED, port).into(),
            (Ipv4Addr::UNSPECIFIED, port).into(),
        ],
    };

    if addrs.is_empty() {
        return Err(Error::Config(format!(
            "host resolves to no address: {:?}",
            config.host
        )));
    }

    Ok(addrs)
}

fn bind_socket(
    addrs: &[SocketAddr],
    backlog: i32,
    reuse_port: bool,
) -> io::Result<std::net::TcpListener> {
    let mut last_err = None;

    for addr in addrs {
        match try_bind(*addr, backlog, reuse_port) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                debug!("bind {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to bind")))
}

fn try_bind(addr: SocketAddr, backlog: i32, reuse_port: bool) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    {
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
    }
    #[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
    {
        let _ = reuse_port;
    }

    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }

    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

fn spawn<F>(name: String, stack_size: Option<usize>, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let mut builder = thread::Builder::new().name(name);

    if let Some(size) = stack_size {
        builder = builder.stack_size(size);
    }

    builder.spawn(f)
}
