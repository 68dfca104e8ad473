use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use coalescer_cache::AsyncMruCache;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::workloads::{FetchStats, SimulatedFetcher, Workload, WorkloadsConfig, process_request};

struct PreparedWorkload {
    workload: Workload,
    cache: AsyncMruCache<SimulatedFetcher>,
    stats: Arc<FetchStats>,
}

struct WorkloadReport {
    concurrency: usize,
    task_durations: DDSketch,
    failed_requests: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();

    // initialize workloads, each with its own cache
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| -> Result<Arc<PreparedWorkload>> {
            let stats = Arc::new(FetchStats::default());
            let fetcher = SimulatedFetcher::new(&workload, Arc::clone(&stats));
            let name = format!("workload-{i}");
            let cache = AsyncMruCache::new(&name, fetcher, &config.cache, runtime.clone())
                .with_context(|| format!("failed to create cache for workload {i}"))?;
            Ok(Arc::new(PreparedWorkload {
                workload,
                cache,
                stats,
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure computations are spawned
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|prepared| {
            let prepared = Arc::clone(prepared);
            tokio::spawn(async move {
                process_request(&prepared.cache, &prepared.workload).await.ok();
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for prepared in &workloads {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let prepared = Arc::clone(prepared);
        let concurrency = prepared.workload.concurrency;

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failed_requests = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let prepared = Arc::clone(&prepared);
                        let task_durations = Arc::clone(&task_durations);
                        let failed_requests = Arc::clone(&failed_requests);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            let result = process_request(&prepared.cache, &prepared.workload).await;
                            if result.is_err() {
                                failed_requests.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

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

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            WorkloadReport {
                concurrency,
                task_durations,
                failed_requests: failed_requests.load(Ordering::Relaxed),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, prepared)) in finished_tasks.into_iter().zip(&workloads).enumerate() {
        let WorkloadReport {
            concurrency,
            task_durations,
            failed_requests,
        } = task.context("workload panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        let fetches = prepared.stats.fetches.load(Ordering::Relaxed);
        let failures = prepared.stats.failures.load(Ordering::Relaxed);
        let cached = prepared.cache.len();
        println!(
            "  fetches: {fetches}; failed fetches: {failures}; failed requests: {failed_requests}; cached keys: {cached}"
        );

        if ops == 0 {
            continue;
        }
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
