use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::hub::Hub;
use super::ConnectionId;

/// Evict every connection that has not sent a frame within `timeout`.
///
/// Connections that disconnected on their own since the last sweep are simply
/// not found; that race is harmless.
pub fn sweep(hub: &Hub, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
    let evicted = hub.evict_stale(now, timeout);
    for id in &evicted {
        tracing::warn!(
            connection_id = %id,
            timeout_secs = timeout.as_secs_f64(),
            "Evicted connection after heartbeat timeout"
        );
    }
    evicted
}

/// Sweep loop. Runs until the task is aborted.
pub async fn run(hub: Arc<Hub>, every: Duration, timeout: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let evicted = sweep(&hub, Instant::now(), timeout);
        tracing::debug!(
            evicted = evicted.len(),
            remaining = hub.connection_count(),
            "Heartbeat sweep complete"
        );
    }
}

pub fn spawn(hub: Arc<Hub>, every: Duration, timeout: Duration) -> JoinHandle<()> {
    tracing::info!(
        interval_secs = every.as_secs_f64(),
        timeout_secs = timeout.as_secs_f64(),
        "Heartbeat monitor started"
    );
    tokio::spawn(run(hub, every, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_secs(30);
    const TIMEOUT: Duration = Duration::from_secs(60);

    #[test]
    fn test_sweep_evicts_only_silent_connections() {
        let hub = Hub::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (quiet, token) = hub.register(tx_a);
        let (chatty, _) = hub.register(tx_b);
        hub.subscribe(&quiet, "week-5").unwrap();

        let start = Instant::now();
        hub.touch_at(&chatty, start + Duration::from_secs(50));

        let evicted = sweep(&hub, start + Duration::from_secs(61), TIMEOUT);
        assert_eq!(evicted, vec![quiet]);
        assert!(token.is_cancelled());
        assert!(hub.contains(&chatty));
        assert!(hub.members_of("week-5").is_empty());
    }

    #[test]
    fn test_frequent_heartbeats_are_never_evicted() {
        let hub = Hub::new();
        let start = Instant::now();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let (alive, _) = hub.register(tx_a);
        let (silent, _) = hub.register(tx_b);

        let mut silent_evicted_at = None;
        // Ten minutes of sweeps; the live client heartbeats every 45 seconds.
        for tick in 1..=20u64 {
            let now = start + INTERVAL * tick as u32;
            let last_beat = (now - start).as_secs() / 45 * 45;
            hub.touch_at(&alive, start + Duration::from_secs(last_beat));

            let evicted = sweep(&hub, now, TIMEOUT);
            assert!(!evicted.contains(&alive), "live connection evicted at tick {tick}");
            if evicted.contains(&silent) {
                silent_evicted_at = Some(tick);
            }
        }

        // Silent for 90s at the third sweep, the first one past the timeout
        assert_eq!(silent_evicted_at, Some(3));
        assert!(hub.contains(&alive));
    }

    #[test]
    fn test_sweep_on_empty_hub() {
        let hub = Hub::new();
        assert!(sweep(&hub, Instant::now(), TIMEOUT).is_empty());
    }

    #[tokio::test]
    async fn test_monitor_task_evicts_in_background() {
        let hub = Arc::new(Hub::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, token) = hub.register(tx);

        let handle = spawn(
            hub.clone(),
            Duration::from_millis(25),
            Duration::from_millis(50),
        );

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("connection should be evicted");
        assert!(!hub.contains(&id));
        handle.abort();
    }
}
