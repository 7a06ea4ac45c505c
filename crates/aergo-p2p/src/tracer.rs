//! Delivery tracking of outgoing transaction notices.
//!
//! Every broadcast registers its hashes with the number of peers it was
//! fanned out to. Peer sessions report back whether each notice reached
//! the wire. Hashes that no peer received are announced again later.

use crate::service::P2PCommand;
use crate::types::TxId;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the per-hash stat cache.
pub const TRACER_CACHE_SIZE: usize = 200_000;

/// Interval of re-announcing undelivered hashes.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Interval of evicting stale stats.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Stats not touched for this long are stale.
pub const STALE_AGE: Duration = Duration::from_secs(600);

/// Upper bound of stats examined by one cleanup.
pub const CLEANUP_SCAN_LIMIT: usize = 1000;

/// Outcome of one notice for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeReport {
    /// Written to the wire.
    Send,
    /// Not written because the remote already knows the hashes.
    Skip,
    /// Dropped before reaching the wire.
    Fail,
}

#[derive(Debug)]
enum TraceEvent {
    Register { hashes: Vec<TxId>, expect: usize },
    Report { kind: NoticeReport, hashes: Vec<TxId> },
}

#[derive(Debug)]
struct SendStat {
    accessed: Instant,
    remain: usize,
    sent: usize,
}

/// Cloneable reporting handle.
#[derive(Clone, Debug)]
pub struct TxNoticeTracer {
    events: mpsc::UnboundedSender<TraceEvent>,
}

impl TxNoticeTracer {
    /// Create the handle and the task that owns the stats.
    pub fn new(commands: mpsc::Sender<P2PCommand>) -> (Self, TracerTask) {
        let (events, rx) = mpsc::unbounded_channel();
        let task = TracerTask {
            events: rx,
            stats: LruCache::new(
                NonZeroUsize::new(TRACER_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
            retry: Vec::new(),
            commands,
        };
        (Self { events }, task)
    }

    /// Start tracing `hashes` announced to `peer_cnt` peers.
    pub fn register_tx_notice(&self, hashes: &[TxId], peer_cnt: usize) {
        self.emit(TraceEvent::Register {
            hashes: hashes.to_vec(),
            expect: peer_cnt,
        });
    }

    pub fn report(&self, kind: NoticeReport, hashes: &[TxId]) {
        if hashes.is_empty() {
            return;
        }
        self.emit(TraceEvent::Report {
            kind,
            hashes: hashes.to_vec(),
        });
    }

    fn emit(&self, event: TraceEvent) {
        if self.events.send(event).is_err() {
            debug!("Tx notice tracer is stopped");
        }
    }
}

/// Event loop of the tracer.
pub struct TracerTask {
    events: mpsc::UnboundedReceiver<TraceEvent>,
    stats: LruCache<TxId, SendStat>,
    retry: Vec<TxId>,
    commands: mpsc::Sender<P2PCommand>,
}

impl TracerTask {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Tx notice tracer started");
        let mut retry_tick = tokio::time::interval_at(Instant::now() + RETRY_INTERVAL, RETRY_INTERVAL);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick =
            tokio::time::interval_at(Instant::now() + CLEANUP_INTERVAL, CLEANUP_INTERVAL);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = self.events.recv() => self.handle(event, Instant::now()),
                _ = retry_tick.tick() => self.retry_notice(),
                _ = cleanup_tick.tick() => self.cleanup_stales(Instant::now()),
            }
        }
        info!("Tx notice tracer stopped");
    }

    fn handle(&mut self, event: TraceEvent, now: Instant) {
        match event {
            TraceEvent::Register { hashes, expect } => {
                if expect == 0 {
                    debug!(count = hashes.len(), "No peer to notice txs, retry later");
                    self.retry.extend(hashes);
                    return;
                }
                for hash in hashes {
                    self.stats.put(
                        hash,
                        SendStat {
                            accessed: now,
                            remain: expect,
                            sent: 0,
                        },
                    );
                }
            }
            TraceEvent::Report { kind, hashes } => {
                for hash in hashes {
                    let done = match self.stats.get_mut(&hash) {
                        Some(stat) => {
                            stat.remain = stat.remain.saturating_sub(1);
                            if kind != NoticeReport::Fail {
                                stat.sent += 1;
                            }
                            stat.accessed = now;
                            (stat.remain == 0).then_some(stat.sent)
                        }
                        // evicted
                        None => None,
                    };
                    if let Some(sent) = done {
                        self.stats.pop(&hash);
                        if sent == 0 {
                            self.retry.push(hash);
                        }
                    }
                }
            }
        }
    }

    fn retry_notice(&mut self) {
        if self.retry.is_empty() {
            return;
        }
        let mut seen = HashSet::with_capacity(self.retry.len());
        let hashes: Vec<TxId> = self
            .retry
            .drain(..)
            .filter(|h| seen.insert(*h))
            .collect();
        debug!(count = hashes.len(), "Retrying tx notices");
        match self.commands.try_send(P2PCommand::RetryTxNotice { hashes }) {
            Ok(()) => {}
            Err(TrySendError::Full(cmd)) => {
                warn!("Command queue is full, tx notice retry postponed");
                if let P2PCommand::RetryTxNotice { hashes } = cmd {
                    self.retry = hashes;
                }
            }
            Err(TrySendError::Closed(_)) => debug!("P2P service is stopped, tx notice retry dropped"),
        }
    }

    fn cleanup_stales(&mut self, now: Instant) {
        let mut stale = Vec::new();
        for (hash, stat) in self.stats.iter().rev().take(CLEANUP_SCAN_LIMIT) {
            if now.saturating_duration_since(stat.accessed) < STALE_AGE {
                break;
            }
            stale.push((*hash, stat.sent));
        }
        let mut unsent = 0;
        for (hash, sent) in stale {
            self.stats.pop(&hash);
            if sent == 0 {
                self.retry.push(hash);
                unsent += 1;
            }
        }
        if unsent > 0 {
            info!(count = unsent, "Found unsent tx notices");
        }
    }
}
