//! Periodic tick driver for embedders running on tokio.
//!
//! The protocol state machine is synchronous and tick-driven; something
//! has to call [`TransferManager::tick`] regularly for retransmits,
//! timeouts, and deferred completions to happen. [`spawn_ticker`] runs
//! that loop as a background tokio task. Drop or [`stop`](TickerHandle::stop)
//! the returned handle to end it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{TransferManager, Wire};

/// Stops the ticker task when dropped or told to.
pub struct TickerHandle {
    stop: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TickerHandle {
    /// Stops the background tick loop.
    pub fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns a tokio task calling `manager.tick(wire)` every `period`.
///
/// Both locks are taken per tick and released before the next await, so
/// callers are free to use the manager between ticks.
pub fn spawn_ticker<W>(
    manager: Arc<Mutex<TransferManager>>,
    wire: Arc<Mutex<W>>,
    period: Duration,
) -> TickerHandle
where
    W: Wire + Send + 'static,
{
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut wire = wire.lock().unwrap();
                    manager.lock().unwrap().tick(&mut *wire);
                }
                _ = &mut rx => break,
            }
        }
    });
    TickerHandle { stop: Some(tx) }
}
