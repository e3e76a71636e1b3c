//! Per-query processing.
//!
//! A [`QueryHandler`] takes one intercepted DNS query through policy
//! evaluation, upstream resolution and reply synthesis. It is cheap to clone
//! and every clone shares the tunnel writer, counters and event channel.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::BlockAction;
use crate::dns::{DnsResolver, extract_qname, nxdomain_response, resolved_addresses};
use crate::error::Result;
use crate::events::{ALLOWED, EngineEvent, LogEvent, TrafficCounters};
use crate::network::{PacketBuilder, TunnelWriter, UdpDatagram};
use crate::platform::AppResolver;
use crate::policy::{BlockReason, PolicyEvaluator, Verdict};

/// Reason logged for queries no upstream answered.
pub const UPSTREAM_FAILED: &str = "dropped: no upstream answered";
/// Reason logged for queries still waiting on an upstream when the engine
/// stops.
pub const ENGINE_STOPPED: &str = "dropped: engine stopped";

/// What became of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// An upstream answer was written back to the tunnel.
    Answered,
    /// A rule matched; depending on the block action a refusal may have
    /// been written.
    Blocked(BlockReason),
    /// Nothing was written: every upstream failed or the reply could not be
    /// delivered.
    Unanswered,
    /// The session ended before an upstream answered.
    Abandoned,
}

impl QueryOutcome {
    const fn label(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::Blocked(_) => "blocked",
            Self::Unanswered => "unanswered",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Handles DNS queries using the provided dependencies.
pub struct QueryHandler<A, R, W> {
    evaluator: PolicyEvaluator<A>,
    resolver: R,
    builder: PacketBuilder,
    block_action: BlockAction,
    writer: Arc<Mutex<W>>,
    counters: Arc<TrafficCounters>,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
}

impl<A, R: Clone, W> Clone for QueryHandler<A, R, W> {
    fn clone(&self) -> Self {
        Self {
            evaluator: self.evaluator.clone(),
            resolver: self.resolver.clone(),
            builder: self.builder,
            block_action: self.block_action,
            writer: Arc::clone(&self.writer),
            counters: Arc::clone(&self.counters),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<A, R, W> QueryHandler<A, R, W>
where
    A: AppResolver,
    R: DnsResolver,
    W: TunnelWriter,
{
    /// Queries still waiting on an upstream when `cancel` fires are logged
    /// as dropped and never answered.
    pub fn new(
        evaluator: PolicyEvaluator<A>,
        resolver: R,
        block_action: BlockAction,
        writer: Arc<Mutex<W>>,
        counters: Arc<TrafficCounters>,
        events: mpsc::UnboundedSender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            evaluator,
            resolver,
            builder: PacketBuilder::default(),
            block_action,
            writer,
            counters,
            events,
            cancel,
        }
    }

    /// Process one query end to end. Emits exactly one log event.
    #[instrument(skip_all, fields(domain))]
    pub async fn handle(&self, query: UdpDatagram) -> QueryOutcome {
        let domain = extract_qname(&query.payload);
        if let Some(domain) = &domain {
            tracing::Span::current().record("domain", domain.as_str());
        }

        let evaluation = self.evaluator.evaluate(&query, domain.as_deref());
        let outcome = match evaluation.verdict {
            Verdict::Block(reason) => self.block(&query, domain, reason).await,
            Verdict::Allow => {
                let app = evaluation.app.unwrap_or_else(|| ALLOWED.to_string());
                self.forward(&query, domain, app).await
            }
        };

        metrics::counter!("sentinel_queries_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn forward(&self, query: &UdpDatagram, domain: Option<String>, app: String) -> QueryOutcome {
        let resolved = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!("session ended before an upstream answered");
                self.log(query, domain, false, ENGINE_STOPPED.to_string());
                return QueryOutcome::Abandoned;
            }
            resolved = self.resolver.resolve(&query.payload) => resolved,
        };
        let response = match resolved {
            Ok(response) => response,
            Err(err) => {
                warn!("dropping query: {err}");
                self.log(query, domain, false, UPSTREAM_FAILED.to_string());
                return QueryOutcome::Unanswered;
            }
        };

        if self.evaluator.inspects_responses()
            && let Some(addresses) = resolved_addresses(&response)
            && let Verdict::Block(reason) = self.evaluator.check_response(&addresses)
        {
            return self.block(query, domain, reason).await;
        }

        self.log(query, domain, false, app);
        match self.reply(query, &response).await {
            Ok(()) => QueryOutcome::Answered,
            Err(err) => {
                warn!("failed to deliver response: {err}");
                QueryOutcome::Unanswered
            }
        }
    }

    async fn block(
        &self,
        query: &UdpDatagram,
        domain: Option<String>,
        reason: BlockReason,
    ) -> QueryOutcome {
        debug!(%reason, "blocking query");
        self.log(query, domain, true, reason.to_string());

        if self.block_action == BlockAction::Nxdomain {
            let refusal = match nxdomain_response(&query.payload) {
                Ok(refusal) => refusal,
                Err(err) => {
                    debug!("cannot refuse undecodable query: {err}");
                    return QueryOutcome::Blocked(reason);
                }
            };
            if let Err(err) = self.reply(query, &refusal).await {
                warn!("failed to deliver refusal: {err}");
            }
        }
        QueryOutcome::Blocked(reason)
    }

    /// Log a query the engine refused to take on.
    pub fn log_dropped(&self, query: &UdpDatagram, reason: &str) {
        let domain = extract_qname(&query.payload);
        self.log(query, domain, false, reason.to_string());
    }

    fn log(&self, query: &UdpDatagram, domain: Option<String>, blocked: bool, reason: String) {
        let event = LogEvent::new(query, domain, blocked, reason);
        // The receiver only goes away when the engine is dropped.
        let _ = self.events.send(EngineEvent::Log(event));
    }

    /// Synthesize the reply frame and write it in one piece.
    async fn reply(&self, query: &UdpDatagram, dns_response: &[u8]) -> Result<()> {
        let frame = self.builder.build_response(query, dns_response)?;
        {
            let mut writer = self.writer.lock().await;
            writer.write_frame(&frame).await?;
        }
        self.counters.record_out(frame.len());
        Ok(())
    }
}
