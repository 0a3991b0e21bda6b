use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytesize::ByteSize;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::client::RepositoryClient;
use crate::workload::{Action, Workload};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Report {
    name: &'static str,
    concurrency: usize,
    p50_size: u64,
    p99_size: u64,
    stats: Stats,
}

#[derive(Default)]
struct Stats {
    task_durations: DDSketch,
    committed: u64,
    cancelled: u64,
    deleted: u64,
    failed: u64,
}

pub async fn perform_stresstest(
    remote: RepositoryClient,
    workloads: Vec<Workload>,
    duration: Duration,
) -> Result<()> {
    let remote = Arc::new(remote);
    remote.prepare().await?;

    // run the workloads concurrently
    let tasks: Vec<_> = workloads
        .into_iter()
        .map(|workload| {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move {
                let concurrency = workload.concurrency;
                let semaphore = Arc::new(Semaphore::new(concurrency));
                let deadline = tokio::time::Instant::now() + duration;

                let workload = Arc::new(Mutex::new(workload));
                let stats = Arc::new(Mutex::new(Stats::default()));

                // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
                let sleep = tokio::time::sleep_until(deadline);
                tokio::pin!(sleep);

                loop {
                    tokio::select! {
                        permit = semaphore.clone().acquire_owned() => {
                            let Ok(permit) = permit else { break };
                            let workload = Arc::clone(&workload);
                            let remote = Arc::clone(&remote);
                            let stats = Arc::clone(&stats);
                            let task_start = Instant::now();

                            tokio::spawn(async move {
                                let action = lock(&workload).next_action();
                                let result = run_action(&remote, &workload, action).await;

                                let mut stats = lock(&stats);
                                match result {
                                    Ok(Outcome::Committed) => stats.committed += 1,
                                    Ok(Outcome::Cancelled) => stats.cancelled += 1,
                                    Ok(Outcome::Deleted) => stats.deleted += 1,
                                    Err(err) => {
                                        stats.failed += 1;
                                        eprintln!("{err:#}");
                                    }
                                }
                                stats.task_durations.add(task_start.elapsed().as_secs_f64());

                                drop(permit);
                            });
                        }
                        _ = &mut sleep => {
                            break;
                        }
                    }
                }

                // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
                let _permits = semaphore.acquire_many(concurrency as u32).await;

                // finished tasks may still hold their clones of `workload` for a moment
                let workload = lock(&workload);
                let report = Report {
                    name: workload.name,
                    concurrency,
                    p50_size: workload.p50_size,
                    p99_size: workload.p99_size,
                    stats: std::mem::take(&mut *lock(&stats)),
                };
                report
            })
        })
        .collect();

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        task?.print(i, duration);
    }

    Ok(())
}

enum Outcome {
    Committed,
    Cancelled,
    Deleted,
}

async fn run_action(
    remote: &RepositoryClient,
    workload: &Mutex<Workload>,
    action: Action,
) -> Result<Outcome> {
    match action {
        Action::Upload(file, payload) => {
            remote.upload(&file.file_name(), payload).await?;
            lock(workload).push_file(file);
            Ok(Outcome::Committed)
        }
        Action::CancelMidway(file, payload) => {
            remote.upload_and_cancel(&file.file_name(), payload).await?;
            Ok(Outcome::Cancelled)
        }
        Action::Delete(file) => {
            remote.delete(&file.file_name()).await?;
            Ok(Outcome::Deleted)
        }
    }
}

impl Report {
    fn print(&self, i: usize, duration: Duration) {
        let Self {
            name,
            concurrency,
            stats,
            ..
        } = self;
        let durations = &stats.task_durations;
        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();

        println!("# Workload {i} `{name}` (concurrency: {concurrency})");
        println!(
            "  file sizes {}-{}",
            ByteSize::b(self.p50_size),
            ByteSize::b(self.p99_size)
        );
        println!("=> {ops} operations, {ops_ps:.2} ops/s");
        println!(
            "  committed: {}; cancelled: {}; deleted: {}; failed: {}",
            stats.committed, stats.cancelled, stats.deleted, stats.failed
        );

        if ops == 0 {
            return;
        }
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }
}
