//! The interception engine.
//!
//! [`Engine`] owns the stopped/running state machine. Starting it asks the
//! host for a tunnel, then spawns two tasks for the session: the read loop,
//! sole reader of the tunnel, which hands every DNS query to its own
//! [`QueryHandler`] task, and a timer reporting traffic counters. Stopping
//! cancels the session token, which ends both tasks; queries still waiting
//! on an upstream are logged as dropped and never answered. The tunnel
//! closes once the last of them lets go of it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::dns::{DnsResolver, UpstreamResolver};
use crate::error::Result;
use crate::events::{Command, EngineEvent, TrafficCounters};
use crate::handler::QueryHandler;
use crate::network::{Tunnel, TunnelConfig, TunnelReader, extract_dns_query};
use crate::platform::HostPlatform;
use crate::policy::{PolicyEvaluator, PolicyStore};

/// Reason logged for queries refused because too many are in flight.
pub const SATURATED: &str = "dropped: too many in-flight queries";

#[derive(Debug)]
enum State {
    Stopped,
    Starting,
    Running { session: u64, cancel: CancellationToken },
}

/// State shared between the engine handle and its session tasks.
struct Shared {
    state: parking_lot::Mutex<State>,
    sessions: AtomicU64,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Shared {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Move to stopped. With a session id, only that session is stopped.
    ///
    /// Returns whether a transition happened.
    fn shutdown(&self, session: Option<u64>) -> bool {
        let previous = {
            let mut state = self.state.lock();
            let stale = match (&*state, session) {
                (State::Stopped, _) | (State::Starting, Some(_)) => true,
                (State::Running { session: current, .. }, Some(id)) => *current != id,
                _ => false,
            };
            if stale {
                return false;
            }
            std::mem::replace(&mut *state, State::Stopped)
        };

        if let State::Running { cancel, .. } = previous {
            cancel.cancel();
        }
        info!("engine stopped");
        self.emit(EngineEvent::Status { running: false });
        true
    }
}

/// DNS interception engine.
pub struct Engine<H, R = UpstreamResolver<H>> {
    config: Arc<Config>,
    host: Arc<H>,
    resolver: R,
    store: Arc<PolicyStore>,
    shared: Arc<Shared>,
}

impl<H: HostPlatform> Engine<H> {
    /// Create an engine resolving through the host's bypass capability.
    ///
    /// Events are delivered on the returned receiver.
    pub fn new(config: Config, host: H) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let host = Arc::new(host);
        let resolver = UpstreamResolver::new(Arc::clone(&host), &config.upstream);
        Self::with_resolver(config, host, resolver)
    }
}

impl<H, R> Engine<H, R>
where
    H: HostPlatform,
    R: DnsResolver,
{
    /// Create an engine with a custom resolver.
    pub fn with_resolver(
        config: Config,
        host: Arc<H>,
        resolver: R,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let store = Arc::new(PolicyStore::from_settings(&config.policy));
        let engine = Self {
            config: Arc::new(config),
            host,
            resolver,
            store,
            shared: Arc::new(Shared {
                state: parking_lot::Mutex::new(State::Stopped),
                sessions: AtomicU64::new(0),
                events,
            }),
        };
        (engine, rx)
    }

    /// Rules consulted by every query.
    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Running { .. })
    }

    /// Establish the tunnel and start intercepting.
    ///
    /// A no-op when already started. On failure the engine stays stopped,
    /// emits `status=false` and returns the error.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if !matches!(*state, State::Stopped) {
                debug!("start ignored, engine not stopped");
                return Ok(());
            }
            *state = State::Starting;
        }

        let config = TunnelConfig::from(&self.config.tunnel);
        let tunnel = match self.host.establish(&config).await {
            Ok(tunnel) => tunnel,
            Err(err) => {
                error!("failed to establish tunnel: {err}");
                self.shared.shutdown(None);
                return Err(err);
            }
        };

        let session = self.shared.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        {
            let mut state = self.shared.state.lock();
            if !matches!(*state, State::Starting) {
                // Stopped while the tunnel was being set up.
                debug!("start abandoned");
                return Ok(());
            }
            *state = State::Running {
                session,
                cancel: cancel.clone(),
            };
        }

        self.spawn_session(session, tunnel, &cancel);
        info!(tunnel = %config.name, "engine running");
        self.shared.emit(EngineEvent::Status { running: true });
        Ok(())
    }

    /// Stop intercepting. Stopping a stopped engine does nothing.
    pub fn stop(&self) {
        self.shared.shutdown(None);
    }

    /// The host withdrew the interception privilege.
    pub fn revoke(&self) {
        warn!("interception revoked by host");
        self.shared.shutdown(None);
    }

    /// Apply one command.
    pub async fn handle(&self, command: Command) -> Result<()> {
        match command {
            Command::Start => self.start().await,
            Command::Stop => {
                self.stop();
                Ok(())
            }
            Command::SetAppRule { package, blocked } => {
                Ok(self.store.set_app_rule(&package, blocked)?)
            }
            Command::SetDomainRule { domain, blocked } => {
                Ok(self.store.set_domain_rule(&domain, blocked)?)
            }
            Command::SetIpRule { address, blocked } => {
                Ok(self.store.set_ip_rule(&address, blocked)?)
            }
        }
    }

    fn spawn_session(
        &self,
        session: u64,
        tunnel: Tunnel<H::Reader, H::Writer>,
        cancel: &CancellationToken,
    ) {
        let counters = Arc::new(TrafficCounters::new());
        let evaluator = PolicyEvaluator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.host),
            self.config.policy.domain_match,
        );
        let handler = QueryHandler::new(
            evaluator,
            self.resolver.clone(),
            self.config.policy.block_action,
            Arc::new(Mutex::new(tunnel.writer)),
            Arc::clone(&counters),
            self.shared.events.clone(),
            cancel.clone(),
        );

        tokio::spawn(read_loop(ReadLoop {
            session,
            reader: tunnel.reader,
            handler,
            in_flight: Arc::new(Semaphore::new(self.config.max_in_flight)),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            shared: Arc::clone(&self.shared),
        }));

        tokio::spawn(report_stats(
            counters,
            self.config.stats_interval(),
            cancel.clone(),
            Arc::clone(&self.shared),
        ));
    }
}

struct ReadLoop<T, H, R, W> {
    session: u64,
    reader: T,
    handler: QueryHandler<H, R, W>,
    in_flight: Arc<Semaphore>,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

async fn read_loop<T, H, R, W>(mut ctx: ReadLoop<T, H, R, W>)
where
    T: TunnelReader,
    H: crate::platform::AppResolver,
    R: DnsResolver,
    W: crate::network::TunnelWriter,
{
    loop {
        let frame = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            frame = ctx.reader.read_frame() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("tunnel closed");
                ctx.shared.shutdown(Some(ctx.session));
                break;
            }
            Err(err) => {
                error!("tunnel read failed: {err}");
                ctx.shared.shutdown(Some(ctx.session));
                break;
            }
        };

        ctx.counters.record_in(frame.len());
        let Some(query) = extract_dns_query(&frame) else {
            trace!(len = frame.len(), "discarding non-DNS frame");
            metrics::counter!("sentinel_frames_dropped_total").increment(1);
            continue;
        };

        let Ok(permit) = Arc::clone(&ctx.in_flight).try_acquire_owned() else {
            debug!("too many queries in flight, dropping");
            ctx.handler.log_dropped(&query, SATURATED);
            metrics::counter!("sentinel_queries_total", "outcome" => "saturated").increment(1);
            continue;
        };

        let handler = ctx.handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handler.handle(query).await;
        });
    }
    debug!(session = ctx.session, "read loop finished");
}

async fn report_stats(
    counters: Arc<TrafficCounters>,
    period: std::time::Duration,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (bytes_in, bytes_out) = counters.take();
                shared.emit(EngineEvent::Stats { bytes_in, bytes_out });
            }
        }
    }
}
