//! The single cooperative loop driving all background work.
//!
//! One tick runs every adapter's payout pass, then every adapter's deposit
//! poll, in registration order, and flushes the accumulated events into the
//! outbox in one atomic unit. Latching errors disable the offending adapter
//! only; an unhandled error (the outbox flush failing) halts the loop for
//! operator intervention. No two adapters ever run concurrently.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterRegistry, EventSink};
use crate::error::ProxyResult;
use crate::store::outbox::{Outbox, OutboxEvent, OutboxKind};

pub struct Reconciler {
    registry: Arc<AdapterRegistry>,
    outbox: Outbox,
    tick: Duration,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        outbox: Outbox,
        tick: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Reconciler {
            registry,
            outbox,
            tick,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        info!(tick = ?self.tick, "reconciler started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.tick_once().await {
                error!(error = %e, "tick failed; reconciliation halted until operator intervention");
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
        info!("reconciler stopped");
    }

    /// One full pass: payouts for every coin, then deposits for every coin,
    /// then the outbox flush.
    pub async fn tick_once(&self) -> ProxyResult<()> {
        let mut deposits: Vec<OutboxEvent> = Vec::new();
        let mut withdrawals: Vec<OutboxEvent> = Vec::new();
        let mut rejections: Vec<OutboxEvent> = Vec::new();

        for (name, adapter) in self.registry.iter() {
            if self.shutdown.is_cancelled() {
                break;
            }
            if adapter.latch().is_set() {
                debug!(coin = name, "skipping latched adapter");
                continue;
            }
            let mut processed = EventSink::new();
            let mut rejected = EventSink::new();
            if let Err(e) = adapter
                .process_pending(&mut processed, &mut rejected, &self.shutdown)
                .await
            {
                if e.is_latching() {
                    adapter.latch().set(name, &e);
                } else {
                    warn!(coin = name, error = %e, "payout pass error");
                }
            }
            withdrawals.extend(processed.drain());
            rejections.extend(rejected.drain());
        }

        for (name, adapter) in self.registry.iter() {
            if self.shutdown.is_cancelled() {
                break;
            }
            if adapter.latch().is_set() {
                debug!(coin = name, "skipping latched adapter");
                continue;
            }
            let mut processed = EventSink::new();
            if let Err(e) = adapter.poll_deposits(&mut processed).await {
                if e.is_latching() {
                    adapter.latch().set(name, &e);
                } else {
                    warn!(coin = name, error = %e, "deposit poll error");
                }
            }
            deposits.extend(processed.drain());
        }

        if deposits.is_empty() && withdrawals.is_empty() && rejections.is_empty() {
            return Ok(());
        }
        let mut tx = self.outbox.begin().await?;
        for event in &deposits {
            self.outbox
                .push(&mut tx, OutboxKind::ProcessedDeposits, event)
                .await?;
        }
        for event in &withdrawals {
            self.outbox
                .push(&mut tx, OutboxKind::ProcessedWithdrawals, event)
                .await?;
        }
        for event in &rejections {
            self.outbox
                .push(&mut tx, OutboxKind::RejectedWithdrawals, event)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
