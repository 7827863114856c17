//! Periodic background jobs
//!
//! Each job runs in its own task on a fixed interval. A run is awaited before
//! the next tick is taken, so one job never overlaps itself. Errors are logged
//! with the job name and the loop keeps going.

use crate::error::PipelineError;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Shortest period a job can run at
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Spawn `job` every `period`, starting immediately
///
/// Runs until the returned handle is aborted or the runtime shuts down.
/// Periods shorter than [`MIN_PERIOD`] are raised to it.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    let period = if period < MIN_PERIOD {
        log::warn!(
            "{} job period {:?} is below {:?}, using the minimum",
            name,
            period,
            MIN_PERIOD
        );
        MIN_PERIOD
    } else {
        period
    };

    tokio::spawn(async move {
        log::info!("⏰ Starting {} job (interval: {}s)", name, period.as_secs());

        let mut timer = interval(period);
        // A run longer than the period delays the next one instead of bursting
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            watch(name, job()).await;
        }
    })
}

/// Await one run and log how it ended
async fn watch<Fut>(name: &'static str, run: Fut)
where
    Fut: Future<Output = Result<(), PipelineError>>,
{
    let started = std::time::Instant::now();
    match run.await {
        Ok(()) => log::debug!("{} job finished in {:?}", name, started.elapsed()),
        Err(e) => log::error!("❌ {} job failed after {:?}: {}", name, started.elapsed(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_keeps_running() {
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = spawn_periodic("flaky", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    Err(PipelineError::Overflow("test"))
                } else {
                    Ok(())
                }
            }
        });

        // Ticks at 0s, 10s, 20s
        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.abort();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_raised_to_minimum() {
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = spawn_periodic("eager", Duration::ZERO, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // Ticks at 0s, 1s, 2s
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(!handle.is_finished());
        handle.abort();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
