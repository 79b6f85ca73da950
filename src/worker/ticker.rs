use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Call `on_tick` every `interval`, until `shutdown` turns true.
///
/// A new interval restarts the wait from the moment of the change; a
/// shortened interval never has to sit out the remainder of the old one.
/// A zero interval pauses ticking until a non-zero one arrives.
pub(crate) async fn run_ticker<F, Fut>(
    mut interval: watch::Receiver<Duration>,
    mut shutdown: watch::Receiver<bool>,
    mut on_tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let period = *interval.borrow_and_update();

        if period.is_zero() {
            tokio::select! {
                changed = interval.changed() => if changed.is_err() { break },
                changed = shutdown.changed() => if changed.is_err() { break },
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => on_tick().await,
            changed = interval.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::debug!(secs = interval.borrow().as_secs(), "Tick timer reset");
            }
            changed = shutdown.changed() => if changed.is_err() { break },
        }
    }
    tracing::debug!("Ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn spawn_counting(
        initial: Duration,
    ) -> (
        watch::Sender<Duration>,
        watch::Sender<bool>,
        Arc<AtomicUsize>,
        tokio::task::JoinHandle<()>,
    ) {
        let (interval_tx, interval_rx) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = tokio::spawn(run_ticker(interval_rx, shutdown_rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        (interval_tx, shutdown_tx, ticks, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval() {
        let (_interval, _shutdown, ticks, _handle) = spawn_counting(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_interval_resets_timer() {
        let (interval, _shutdown, ticks, _handle) = spawn_counting(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;

        interval.send_replace(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_pauses() {
        let (interval, _shutdown, ticks, _handle) = spawn_counting(Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        interval.send_replace(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticking() {
        let (_interval, shutdown, ticks, handle) = spawn_counting(Duration::from_secs(5));
        shutdown.send_replace(true);
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
