//! Periodic fan-out of the session's refresh jobs.
//!
//! Every tick spawns one task per job; a tick never waits for the
//! previous tick's tasks. Job outcomes are funneled into a report channel
//! whose consumer decides what to log. Stopping is a close-once watch
//! signal: it prevents future ticks but lets in-flight jobs finish, and
//! the report channel closes by itself once the loop and every spawned
//! job have dropped their senders.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;

/// Deadline handed to each spawned job.
pub const JOB_DEADLINE: Duration = Duration::from_secs(15);

pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type JobFn = Arc<dyn Fn(Duration) -> JobFuture + Send + Sync>;

/// A named unit of work run on every tick.
#[derive(Clone)]
pub struct PollJob {
    pub name: &'static str,
    run: JobFn,
}

impl PollJob {
    pub fn new<F>(name: &'static str, run: F) -> Self
    where
        F: Fn(Duration) -> JobFuture + Send + Sync + 'static,
    {
        Self {
            name,
            run: Arc::new(run),
        }
    }
}

/// Outcome of one job execution.
#[derive(Debug)]
pub struct JobReport {
    pub job: &'static str,
    pub result: Result<()>,
}

/// Start the polling loop. The returned handle resolves once a stop has
/// been observed; reports keep arriving until the last in-flight job is
/// done, after which the report channel closes.
pub fn spawn_poller(
    interval: Duration,
    jobs: Vec<PollJob>,
    reports: mpsc::Sender<JobReport>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval fires immediately; the caller already ran the
        // initial convergence pass, so swallow that first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for job in &jobs {
                        let tx = reports.clone();
                        let name = job.name;
                        let fut = (job.run)(JOB_DEADLINE);
                        tokio::spawn(async move {
                            let result = fut.await;
                            let _ = tx.send(JobReport { job: name, result }).await;
                        });
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(name: &'static str, counter: Arc<AtomicUsize>) -> PollJob {
        PollJob::new(name, move |_deadline| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn every_tick_runs_every_job() {
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (report_tx, mut report_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn_poller(
            Duration::from_secs(10),
            vec![
                counting_job("a", Arc::clone(&a)),
                counting_job("b", Arc::clone(&b)),
            ],
            report_tx,
            stop_rx,
        );

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(10)).await;
            // Two reports per tick, one per job.
            assert!(report_rx.recv().await.unwrap().result.is_ok());
            assert!(report_rx.recv().await.unwrap().result.is_ok());
        }
        assert_eq!(a.load(Ordering::SeqCst), 3);
        assert_eq!(b.load(Ordering::SeqCst), 3);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reach_the_report_channel() {
        let (report_tx, mut report_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let failing = PollJob::new("flaky", |_deadline| {
            Box::pin(async { Err(CoreError::Transport("boom".to_string())) })
        });
        let handle = spawn_poller(Duration::from_secs(10), vec![failing], report_tx, stop_rx);

        tokio::time::advance(Duration::from_secs(10)).await;
        let report = report_rx.recv().await.unwrap();
        assert_eq!(report.job, "flaky");
        assert!(report.result.is_err());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_the_report_channel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (report_tx, mut report_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn_poller(
            Duration::from_secs(10),
            vec![counting_job("only", Arc::clone(&counter))],
            report_tx,
            stop_rx,
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(report_rx.recv().await.is_some());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        // All senders are gone once the loop and its jobs are done, so
        // the drain side observes the channel closing.
        assert!(report_rx.recv().await.is_none());
        let ticks = counter.load(Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), ticks);
    }
}
