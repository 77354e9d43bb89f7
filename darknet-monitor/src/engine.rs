//! Periodic sweep over every monitored index.
//!
//! Each tick polls the activity flag of every index, feeds it through the
//! credit table and mirrors classification changes back into the data plane,
//! then clears saturated dark-traffic counters.
//!
//! Locking is per index: the flag is read without the state lock, and the
//! credit update plus any marker write happen under it. Queries that land
//! mid-sweep therefore see some indices already advanced to this tick and
//! others not yet, but never a credit whose marker write is still pending.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dataplane::{DataPlane, bounded},
    decay::{Signal, Transition},
    store::StateStore,
};

#[derive(Clone, Debug)]
pub struct DecaySettings {
    pub interval: Duration,
    pub dark_table_size: u32,
    /// Dark-table slots above this packet count are reset.
    pub dark_count_threshold: u64,
    /// Upper bound for any single data-plane call.
    pub call_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct SweepReport {
    /// Ordinal of the sweep; an interrupted sweep reuses the next number.
    pub sweep: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub polled: usize,
    pub became_active: usize,
    pub became_inactive: usize,
    pub held_over: usize,
    pub marker_failures: usize,
    pub dark_resets: usize,
    pub inactive: usize,
    pub interrupted: bool,
}

impl SweepReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            sweep: 0,
            started_at,
            elapsed: Duration::ZERO,
            polled: 0,
            became_active: 0,
            became_inactive: 0,
            held_over: 0,
            marker_failures: 0,
            dark_resets: 0,
            inactive: 0,
            interrupted: false,
        }
    }

    fn log(&self) {
        let started = self.started_at.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        info!(
            sweep = self.sweep,
            %started,
            elapsed_ms = self.elapsed.as_millis() as u64,
            polled = self.polled,
            became_active = self.became_active,
            became_inactive = self.became_inactive,
            inactive = self.inactive,
            dark_resets = self.dark_resets,
            interrupted = self.interrupted,
            "sweep finished"
        );
        if self.held_over > 0 || self.marker_failures > 0 {
            warn!(
                held_over = self.held_over,
                marker_failures = self.marker_failures,
                "data plane calls failed during sweep"
            );
        }
    }
}

pub struct DecayEngine {
    store: Arc<StateStore>,
    data_plane: Arc<dyn DataPlane>,
    settings: DecaySettings,
}

impl DecayEngine {
    pub fn new(
        store: Arc<StateStore>,
        data_plane: Arc<dyn DataPlane>,
        settings: DecaySettings,
    ) -> Self {
        Self {
            store,
            data_plane,
            settings,
        }
    }

    /// Sweep, sleep, repeat until `shutdown` fires. Cancellation is noticed
    /// between indices and during the sleep.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            info!(indices = self.store.index_count(), "starting sweep");
            let report = self.sweep(&shutdown).await;
            report.log();
            if shutdown.is_cancelled() {
                break;
            }

            info!(
                seconds = self.settings.interval.as_secs(),
                "waiting for next sweep"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(self.settings.interval) => {}
            }
        }
        info!("sweep loop stopped");
    }

    pub async fn sweep(&self, shutdown: &CancellationToken) -> SweepReport {
        let clock = Instant::now();
        let mut report = SweepReport::new(Utc::now());

        for index in 0..self.store.index_count() as u32 {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let signal = self.poll(index).await;
            self.commit(index, signal, &mut report).await;
            report.polled += 1;
        }

        if !report.interrupted {
            self.clear_dark_table(shutdown, &mut report).await;
        }

        let mut state = self.store.lock().await;
        report.sweep = if report.interrupted {
            state.completed_sweeps() + 1
        } else {
            state.finish_sweep()
        };
        report.inactive = state.credits().inactive_count();
        drop(state);

        report.elapsed = clock.elapsed();
        report
    }

    async fn poll(&self, index: u32) -> Signal {
        let read = self.data_plane.read_activity_signal(index);
        match bounded(self.settings.call_timeout, read).await {
            Ok(active) => Signal::from(active),
            Err(err) => {
                debug!(index, error = %err, "activity signal unavailable, holding credit");
                Signal::Unknown
            }
        }
    }

    async fn commit(&self, index: u32, signal: Signal, report: &mut SweepReport) {
        let mut state = self.store.lock().await;
        let transition = state.apply(index, signal);
        if let Some(active) = transition.marker() {
            let write = self.data_plane.write_active_marker(index, active);
            if let Err(err) = bounded(self.settings.call_timeout, write).await {
                report.marker_failures += 1;
                warn!(index, active, error = %err, "failed to write active marker");
            }
        }
        let address = state.registry().address(index);
        drop(state);

        match transition {
            Transition::BecameActive => {
                report.became_active += 1;
                if let Some(address) = address {
                    warn!(%address, index, "prefix became active");
                }
            }
            Transition::BecameInactive => {
                report.became_inactive += 1;
                if let Some(address) = address {
                    debug!(%address, index, "prefix became inactive");
                }
            }
            Transition::HeldOver => report.held_over += 1,
            Transition::Refreshed | Transition::Coasting | Transition::StillInactive => {}
        }
    }

    async fn clear_dark_table(&self, shutdown: &CancellationToken, report: &mut SweepReport) {
        let limit = self.settings.call_timeout;
        for slot in 0..self.settings.dark_table_size {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                return;
            }
            let count = match bounded(limit, self.data_plane.read_dark_count(slot)).await {
                Ok(count) => count,
                Err(err) => {
                    debug!(slot, error = %err, "failed to read dark counter");
                    continue;
                }
            };
            if count <= self.settings.dark_count_threshold {
                continue;
            }
            match bounded(limit, self.data_plane.reset_dark_count(slot)).await {
                Ok(()) => report.dark_resets += 1,
                Err(err) => warn!(slot, count, error = %err, "failed to reset dark counter"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ipnet::Ipv4Net;

    use super::*;
    use crate::{dataplane::MemoryDataPlane, query::QueryService, registry::PrefixRegistry};

    const DARK_SLOTS: u32 = 4;

    async fn setup(prefixes: &[&str], alpha: u32) -> (DecayEngine, Arc<StateStore>, Arc<MemoryDataPlane>) {
        setup_with_timeout(prefixes, alpha, Duration::from_millis(500)).await
    }

    async fn setup_with_timeout(
        prefixes: &[&str],
        alpha: u32,
        call_timeout: Duration,
    ) -> (DecayEngine, Arc<StateStore>, Arc<MemoryDataPlane>) {
        let prefixes: Vec<Ipv4Net> = prefixes.iter().map(|p| p.parse().unwrap()).collect();
        let registry = PrefixRegistry::build(&prefixes, 256).unwrap();
        let plane = Arc::new(MemoryDataPlane::new(256, DARK_SLOTS));
        plane.reset_registers(registry.len() as u32).await.unwrap();
        let store = Arc::new(StateStore::new(registry, alpha));
        let settings = DecaySettings {
            interval: Duration::from_secs(180),
            dark_table_size: DARK_SLOTS,
            dark_count_threshold: 1024,
            call_timeout,
        };
        let engine = DecayEngine::new(store.clone(), plane.clone(), settings);
        (engine, store, plane)
    }

    async fn inactive(store: &StateStore) -> Vec<String> {
        store
            .lock()
            .await
            .inactive_addresses(None)
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    #[tokio::test]
    async fn silent_indices_expire_after_alpha_sweeps() {
        let (engine, store, plane) = setup(&["10.0.0.0/31"], 2).await;
        let token = CancellationToken::new();

        plane.raise_activity(1);
        let first = engine.sweep(&token).await;
        assert_eq!(first.polled, 2);
        assert_eq!(first.became_inactive, 0);
        assert!(inactive(&store).await.is_empty());

        let second = engine.sweep(&token).await;
        assert_eq!(second.sweep, 2);
        assert_eq!(second.became_inactive, 1);
        assert_eq!(inactive(&store).await, vec!["10.0.0.0"]);
        assert_eq!(plane.active_marker(0), Some(false));
        assert_eq!(plane.active_marker(1), Some(true));

        // Index 1 was refilled to alpha + 1 and needs two more silent ticks.
        engine.sweep(&token).await;
        assert_eq!(inactive(&store).await, vec!["10.0.0.0"]);
        engine.sweep(&token).await;
        assert_eq!(inactive(&store).await, vec!["10.0.0.0", "10.0.0.1"]);
        assert_eq!(store.lock().await.completed_sweeps(), 4);
    }

    #[tokio::test]
    async fn activity_reactivates_once() {
        let (engine, store, plane) = setup(&["192.0.2.8/32"], 1).await;
        let token = CancellationToken::new();

        engine.sweep(&token).await;
        assert_eq!(inactive(&store).await, vec!["192.0.2.8"]);

        plane.raise_activity(0);
        let report = engine.sweep(&token).await;
        assert_eq!(report.became_active, 1);
        assert!(inactive(&store).await.is_empty());
        assert_eq!(plane.active_marker(0), Some(true));
        assert_eq!(store.lock().await.credits().credit(0), Some(2));

        plane.raise_activity(0);
        let report = engine.sweep(&token).await;
        assert_eq!(report.became_active, 0);
    }

    #[tokio::test]
    async fn failed_reads_hold_credit() {
        let (engine, store, plane) = setup(&["10.0.0.0/30"], 1).await;
        let token = CancellationToken::new();
        plane.fail_index(2);

        let report = engine.sweep(&token).await;
        assert_eq!(report.polled, 4);
        assert_eq!(report.held_over, 1);
        assert_eq!(report.became_inactive, 3);
        assert_eq!(inactive(&store).await, vec!["10.0.0.0", "10.0.0.1", "10.0.0.3"]);

        plane.clear_faults();
        engine.sweep(&token).await;
        assert_eq!(inactive(&store).await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_reads_time_out_without_blocking_the_sweep() {
        let (engine, store, plane) = setup(&["10.0.0.0/31"], 1).await;
        plane.stall_index(0);

        let report = engine.sweep(&CancellationToken::new()).await;
        assert_eq!(report.held_over, 1);
        assert_eq!(inactive(&store).await, vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn saturated_dark_slots_are_reset() {
        let (engine, _store, plane) = setup(&["10.0.0.0/32"], 1).await;
        plane.add_dark_packets(0, 1024);
        plane.add_dark_packets(2, 1025);

        let report = engine.sweep(&CancellationToken::new()).await;
        assert_eq!(report.dark_resets, 1);
        assert_eq!(plane.dark_count(0), Some(1024));
        assert_eq!(plane.dark_count(2), Some(0));
    }

    #[tokio::test]
    async fn cancelled_sweep_touches_nothing() {
        let (engine, store, plane) = setup(&["10.0.0.0/30"], 0).await;
        plane.add_dark_packets(1, 5000);
        let token = CancellationToken::new();
        token.cancel();

        let report = engine.sweep(&token).await;
        assert!(report.interrupted);
        assert_eq!(report.polled, 0);
        assert!(inactive(&store).await.is_empty());
        assert_eq!(plane.dark_count(1), Some(5000));
        assert_eq!(store.lock().await.completed_sweeps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_during_sleep() {
        let (engine, store, _plane) = setup(&["10.0.0.0/30"], 1).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(engine.run(token.clone()));

        time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(store.lock().await.completed_sweeps(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_repeats_on_interval() {
        let (engine, store, _plane) = setup(&["10.0.0.0/30"], 1).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(engine.run(token.clone()));

        time::sleep(Duration::from_secs(181)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(store.lock().await.completed_sweeps(), 2);
    }

    #[tokio::test]
    async fn queries_are_answered_while_a_read_is_stalled() {
        let (engine, store, plane) =
            setup_with_timeout(&["10.0.0.0/31"], 0, Duration::from_secs(30)).await;
        plane.stall_index(1);
        let service = QueryService::new(store.clone(), plane.clone(), Duration::from_secs(1));

        let engine = Arc::new(engine);
        let token = CancellationToken::new();
        let sweep = tokio::spawn({
            let engine = engine.clone();
            let token = token.clone();
            async move { engine.sweep(&token).await }
        });

        // Index 0 commits first; index 1 then blocks on its read for 30s.
        let answer = time::timeout(Duration::from_secs(2), async {
            loop {
                let prefixes = service.inactive_prefixes(None).await;
                if !prefixes.is_empty() {
                    return prefixes;
                }
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("query blocked behind the stalled read");

        assert_eq!(answer, vec!["10.0.0.0/32".parse::<Ipv4Net>().unwrap()]);
        assert!(!sweep.is_finished());
        assert_eq!(store.lock().await.completed_sweeps(), 0);
        sweep.abort();
    }
}
