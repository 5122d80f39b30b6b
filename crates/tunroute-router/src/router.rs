use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::RouterContext;
use crate::device::{DeviceReader, DeviceWriter, Tunnel};
use crate::session::SessionTable;
use crate::{tcp, udp, Buffer, BufferPool, Metrics, Packet, RouterConfig, RouterError};

/// Relays every TCP and UDP flow read from a tun device over real sockets.
///
/// ```no_run
/// # async fn demo(tun: std::fs::File) -> Result<(), tunroute_router::RouterError> {
/// use tunroute_router::{PacketRouter, RouterConfig};
///
/// let router = PacketRouter::new(RouterConfig::default())?;
/// router.start(tun)?;
/// // ... until the VPN is torn down:
/// router.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct PacketRouter {
    cfg: Arc<RouterConfig>,
    pool: BufferPool,
    table: Arc<SessionTable>,
    metrics: Metrics,
    state: Mutex<RunState>,
    failure: Arc<Mutex<Option<RouterError>>>,
}

enum RunState {
    Idle,
    Running(Running),
    /// A `stop` is in progress; the token fires once it completes.
    Stopping(CancellationToken),
}

struct Running {
    ctx: Arc<RouterContext>,
    /// Device reader and writer threads.
    io: CancellationToken,
    /// Flow managers; parent of every session token.
    flows: CancellationToken,
    sweep: CancellationToken,
    /// Fires when the run ends, through `stop` or a fatal tunnel error.
    finished: CancellationToken,
    stopped: CancellationToken,
    reader: thread::JoinHandle<()>,
    writer: thread::JoinHandle<mpsc::Receiver<Buffer>>,
    tcp_manager: JoinHandle<mpsc::Receiver<Packet>>,
    udp_manager: JoinHandle<mpsc::Receiver<Packet>>,
    sweeper: JoinHandle<()>,
}

enum StopAction {
    Nothing,
    Wait(CancellationToken),
    Stop(Running),
}

/// Records the first fatal tunnel error and halts device I/O.
#[derive(Clone)]
struct FailureSignal {
    slot: Arc<Mutex<Option<RouterError>>>,
    io: CancellationToken,
    finished: CancellationToken,
}

impl FailureSignal {
    fn raise(&self, err: RouterError) {
        error!(%err, "tunnel failed, device I/O halted");
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.io.cancel();
        self.finished.cancel();
    }
}

fn spawn_thread<F, T>(name: &'static str, f: F) -> Result<thread::JoinHandle<T>, RouterError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .map_err(|source| RouterError::Spawn { name, source })
}

impl PacketRouter {
    pub fn new(cfg: RouterConfig) -> Result<Self, RouterError> {
        cfg.validate()?;
        let pool = BufferPool::new(cfg.mtu, cfg.pool_max_free, cfg.pool_max_outstanding);
        Ok(Self {
            cfg: Arc::new(cfg),
            pool,
            table: Arc::new(SessionTable::new()),
            metrics: Metrics::new(),
            state: Mutex::new(RunState::Idle),
            failure: Arc::new(Mutex::new(None)),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> Result<(), RouterError> {
        match self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.cfg
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Number of live TCP and UDP sessions.
    pub fn active_sessions(&self) -> usize {
        self.table.len()
    }

    /// True between a successful [`PacketRouter::start`] and the end of the run (a `stop` or a
    /// fatal tunnel error).
    pub fn is_running(&self) -> bool {
        match &*self.lock_state() {
            RunState::Running(run) => !run.finished.is_cancelled(),
            RunState::Idle | RunState::Stopping(_) => false,
        }
    }

    /// Starts relaying packets from `tunnel`. Must be called from within a tokio runtime, whose
    /// handle drives the flow managers and sessions.
    pub fn start<T: Tunnel>(&self, tunnel: T) -> Result<(), RouterError> {
        let runtime = Handle::try_current().map_err(|_| RouterError::NoRuntime)?;
        let mut state = self.lock_state();
        if !matches!(*state, RunState::Idle) {
            return Err(RouterError::AlreadyRunning);
        }
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let cfg = &self.cfg;
        let io = CancellationToken::new();
        let flows = CancellationToken::new();
        let sweep = CancellationToken::new();
        let finished = CancellationToken::new();

        let (tcp_tx, tcp_rx) = mpsc::channel(cfg.device_queue_capacity);
        let (udp_tx, udp_rx) = mpsc::channel(cfg.device_queue_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(cfg.outbound_queue_capacity);

        let ctx = Arc::new(RouterContext::new(
            Arc::clone(cfg),
            self.pool.clone(),
            Arc::clone(&self.table),
            self.metrics.clone(),
            outbound_tx,
            flows.clone(),
        ));
        let failure = FailureSignal {
            slot: Arc::clone(&self.failure),
            io: io.clone(),
            finished: finished.clone(),
        };

        let tunnel = Arc::new(tunnel);
        let reader = DeviceReader {
            tunnel: Arc::clone(&tunnel),
            ctx: Arc::clone(&ctx),
            tcp: tcp_tx,
            udp: udp_tx,
            cancel: io.clone(),
        };
        let writer = DeviceWriter {
            tunnel,
            rx: outbound_rx,
            metrics: self.metrics.clone(),
            runtime: runtime.clone(),
            cancel: io.clone(),
        };

        let reader = spawn_thread("tunroute-reader", {
            let failure = failure.clone();
            move || {
                if let Err(err) = reader.run() {
                    failure.raise(err);
                }
            }
        })?;
        let writer = spawn_thread("tunroute-writer", move || {
            let (rx, res) = writer.run();
            if let Err(err) = res {
                failure.raise(err);
            }
            rx
        })
        .map_err(|err| {
            io.cancel();
            err
        })?;

        let tcp_manager = runtime.spawn(tcp::run_manager(Arc::clone(&ctx), tcp_rx, flows.clone()));
        let udp_manager = runtime.spawn(udp::run_manager(Arc::clone(&ctx), udp_rx, flows.clone()));
        let sweeper = runtime.spawn(run_sweeper(Arc::clone(&ctx), sweep.clone()));

        *state = RunState::Running(Running {
            ctx,
            io,
            flows,
            sweep,
            finished,
            stopped: CancellationToken::new(),
            reader,
            writer,
            tcp_manager,
            udp_manager,
            sweeper,
        });
        info!(mtu = cfg.mtu, "packet router started");
        Ok(())
    }

    fn begin_stop(&self) -> StopAction {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, RunState::Idle) {
            RunState::Idle => StopAction::Nothing,
            RunState::Stopping(done) => {
                *state = RunState::Stopping(done.clone());
                StopAction::Wait(done)
            }
            RunState::Running(run) => {
                *state = RunState::Stopping(run.stopped.clone());
                StopAction::Stop(run)
            }
        }
    }

    /// Stops the router and releases everything it holds: device I/O first, then every session
    /// socket, then queued packets. Idempotent; concurrent callers all return once teardown is
    /// complete.
    pub async fn stop(&self) {
        let run = match self.begin_stop() {
            StopAction::Nothing => return,
            StopAction::Wait(done) => {
                done.cancelled().await;
                return;
            }
            StopAction::Stop(run) => run,
        };
        info!("stopping packet router");

        run.io.cancel();
        let (reader, writer) = (run.reader, run.writer);
        let outbound_rx = tokio::task::spawn_blocking(move || {
            if reader.join().is_err() {
                warn!("device reader panicked");
            }
            writer.join().ok()
        })
        .await
        .ok()
        .flatten();

        let sessions_closed = self.table.close_all();
        run.flows.cancel();
        let tcp_rx = run.tcp_manager.await.ok();
        let udp_rx = run.udp_manager.await.ok();
        run.ctx.tasks.close();
        run.ctx.tasks.wait().await;

        let mut released = 0;
        for mut rx in [tcp_rx, udp_rx].into_iter().flatten() {
            rx.close();
            while rx.try_recv().is_ok() {
                released += 1;
            }
        }
        if let Some(mut rx) = outbound_rx {
            rx.close();
            while rx.try_recv().is_ok() {
                released += 1;
            }
        }

        run.sweep.cancel();
        let _ = run.sweeper.await;
        self.pool.clear();
        run.finished.cancel();

        *self.lock_state() = RunState::Idle;
        run.stopped.cancel();
        info!(
            sessions_closed,
            packets_released = released,
            buffers_outstanding = self.pool.outstanding(),
            "packet router stopped"
        );
    }

    /// Waits for the current run to end. Returns the tunnel error that ended it, if any; the error
    /// is reported once.
    ///
    /// A failed router still holds its sessions until [`PacketRouter::stop`] is called.
    pub async fn wait(&self) -> Result<(), RouterError> {
        let finished = match &*self.lock_state() {
            RunState::Running(run) => Some(run.finished.clone()),
            RunState::Idle | RunState::Stopping(_) => None,
        };
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
        self.take_failure()
    }
}

impl Drop for PacketRouter {
    fn drop(&mut self) {
        if let RunState::Running(run) = &*self.lock_state() {
            run.io.cancel();
            run.flows.cancel();
            run.sweep.cancel();
            run.finished.cancel();
        }
    }
}

async fn run_sweeper(ctx: Arc<RouterContext>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.cfg.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let evicted = ctx.table.evict_idle(Instant::now(), &ctx.cfg);
        if !evicted.is_empty() {
            ctx.metrics.sessions_evicted(evicted.len());
            debug!(
                evicted = evicted.len(),
                remaining = ctx.table.len(),
                "evicted idle sessions"
            );
        }
    }
}
