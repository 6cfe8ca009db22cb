//! Data-parallel workers with a blocking all-reduce.
//!
//! ```text
//!            batch
//!     ┌────────┼────────┐
//!  shard 0  shard 1  shard 2      each worker: forward/backward
//!     │        │        │         under a shared read lock
//!     └──── AllReduce ──┘         sum in rank order, average
//!              │
//!         rank 0 reports
//! ```
//!
//! A worker that errors or panics aborts the collective, and so does a
//! barrier wait longer than the timeout. Every waiting peer then returns
//! `WorkerFailure` instead of hanging, and the pool stays failed.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mcquic_core::ImageTensor;
use mcquic_neural::{accumulate, CompressorModel, ForwardOutput, Gradients, LossBreakdown, StraightThrough};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Result, TrainError};

/// One rank's share of a step
#[derive(Debug, Clone, Default)]
pub struct Contribution {
    /// Loss terms
    pub terms: LossBreakdown,
    /// Parameter gradients
    pub gradients: Gradients,
    /// Code counts `[level][m][k]`
    pub counts: Vec<Vec<Vec<f64>>>,
    /// Images behind this contribution
    pub images: usize,
}

impl From<ForwardOutput> for Contribution {
    fn from(out: ForwardOutput) -> Self {
        Self {
            terms: out.terms,
            gradients: out.gradients,
            counts: out.counts,
            images: out.images,
        }
    }
}

/// Sum in the given order, then average terms and gradients.
/// Counts and image totals stay summed.
fn reduce(parts: Vec<Contribution>) -> Contribution {
    let n = parts.len().max(1) as f64;
    let mut out = Contribution::default();
    for part in parts {
        out.terms.distortion += part.terms.distortion;
        out.terms.rate += part.terms.rate;
        out.terms.quantization += part.terms.quantization;
        accumulate(&mut out.gradients, &part.gradients);
        if out.counts.is_empty() {
            out.counts = part.counts;
        } else {
            for (acc, level) in out.counts.iter_mut().zip(&part.counts) {
                for (a, g) in acc.iter_mut().zip(level) {
                    for (x, y) in a.iter_mut().zip(g) {
                        *x += y;
                    }
                }
            }
        }
        out.images += part.images;
    }
    out.terms.distortion /= n;
    out.terms.rate /= n;
    out.terms.quantization /= n;
    let scale = (1.0 / n) as f32;
    for grad in out.gradients.values_mut() {
        for g in grad.iter_mut() {
            *g *= scale;
        }
    }
    out
}

struct ReduceState {
    generation: u64,
    slots: Vec<Option<Contribution>>,
    arrived: usize,
    result: Option<Arc<Contribution>>,
    failure: Option<(usize, String)>,
}

/// Blocking all-reduce over `world_size` ranks
pub struct AllReduce {
    world_size: usize,
    timeout: Duration,
    state: Mutex<ReduceState>,
    cond: Condvar,
}

impl AllReduce {
    /// Collective for `world_size` ranks with a barrier timeout.
    pub fn new(world_size: usize, timeout: Duration) -> Self {
        Self {
            world_size,
            timeout,
            state: Mutex::new(ReduceState {
                generation: 0,
                slots: (0..world_size).map(|_| None).collect(),
                arrived: 0,
                result: None,
                failure: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Number of ranks.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Contribute `value` for `rank` and wait for the reduced result.
    pub fn all_reduce(&self, rank: usize, value: Contribution) -> Result<Arc<Contribution>> {
        let mut state = self.state.lock();
        if let Some((r, reason)) = &state.failure {
            return Err(worker_failure(*r, reason));
        }
        if rank >= self.world_size || state.slots[rank].is_some() {
            return Err(worker_failure(rank, "invalid or duplicate rank"));
        }

        let generation = state.generation;
        state.slots[rank] = Some(value);
        state.arrived += 1;

        if state.arrived == self.world_size {
            let parts: Vec<Contribution> = state.slots.iter_mut().filter_map(Option::take).collect();
            let reduced = Arc::new(reduce(parts));
            state.result = Some(Arc::clone(&reduced));
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            return Ok(reduced);
        }

        let deadline = Instant::now() + self.timeout;
        while state.generation == generation && state.failure.is_none() {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
                && state.failure.is_none()
            {
                let missing = state.slots.iter().position(Option::is_none).unwrap_or(rank);
                let reason = format!("barrier timed out after {} ms", self.timeout.as_millis());
                warn!(rank = missing, "{}", reason);
                state.failure = Some((missing, reason));
                self.cond.notify_all();
            }
        }

        if state.generation != generation {
            if let Some(result) = &state.result {
                return Ok(Arc::clone(result));
            }
        }
        match &state.failure {
            Some((r, reason)) => Err(worker_failure(*r, reason)),
            None => Err(worker_failure(rank, "collective finished without a result")),
        }
    }

    /// Fail the collective on behalf of `rank`, waking every waiter.
    pub fn abort(&self, rank: usize, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some((rank, reason.into()));
        }
        self.cond.notify_all();
    }

    /// The failure that aborted the collective, if any.
    pub fn failure(&self) -> Option<TrainError> {
        self.state
            .lock()
            .failure
            .as_ref()
            .map(|(r, reason)| worker_failure(*r, reason))
    }
}

fn worker_failure(rank: usize, reason: &str) -> TrainError {
    TrainError::WorkerFailure {
        rank,
        reason: reason.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Job {
    shard: Vec<ImageTensor>,
    ste: StraightThrough,
}

type Report = Result<Arc<Contribution>>;

/// Data-parallel replicas sharing one model
pub struct WorkerPool {
    reducer: Arc<AllReduce>,
    jobs: Vec<Sender<Job>>,
    reports: Receiver<Report>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `world_size` workers reading `model`.
    pub fn spawn(
        world_size: usize,
        model: Arc<RwLock<CompressorModel>>,
        barrier_timeout: Duration,
    ) -> Result<Self> {
        if world_size == 0 {
            return Err(TrainError::config("workers must be positive"));
        }
        let reducer = Arc::new(AllReduce::new(world_size, barrier_timeout));
        let (report_tx, reports) = unbounded();
        let mut jobs = Vec::with_capacity(world_size);
        let mut handles = Vec::with_capacity(world_size);

        for rank in 0..world_size {
            let (job_tx, job_rx) = unbounded::<Job>();
            let worker = Worker {
                rank,
                model: Arc::clone(&model),
                reducer: Arc::clone(&reducer),
                jobs: job_rx,
                reports: report_tx.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("mcquic-worker-{}", rank))
                .spawn(move || worker.run())?;
            jobs.push(job_tx);
            handles.push(handle);
        }
        debug!(world_size, "worker pool started");

        Ok(Self {
            reducer,
            jobs,
            reports,
            handles,
        })
    }

    /// Number of workers.
    pub fn world_size(&self) -> usize {
        self.jobs.len()
    }

    /// Split `batch` evenly across workers and return the reduced result.
    pub fn step(&self, batch: Vec<ImageTensor>, ste: StraightThrough) -> Result<Arc<Contribution>> {
        if let Some(err) = self.reducer.failure() {
            return Err(err);
        }
        let world = self.world_size();
        if batch.is_empty() || batch.len() % world != 0 {
            return Err(TrainError::config(format!(
                "batch of {} cannot be split across {} workers",
                batch.len(),
                world
            )));
        }

        let shard_len = batch.len() / world;
        let mut images = batch.into_iter();
        for (rank, tx) in self.jobs.iter().enumerate() {
            let shard: Vec<ImageTensor> = images.by_ref().take(shard_len).collect();
            tx.send(Job { shard, ste }).map_err(|_| worker_failure(rank, "worker exited"))?;
        }

        match self.reports.recv() {
            Ok(report) => report,
            Err(_) => Err(worker_failure(0, "all workers exited")),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.jobs.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked outside a step");
            }
        }
    }
}

struct Worker {
    rank: usize,
    model: Arc<RwLock<CompressorModel>>,
    reducer: Arc<AllReduce>,
    jobs: Receiver<Job>,
    reports: Sender<Report>,
}

impl Worker {
    fn run(self) {
        while let Ok(job) = self.jobs.recv() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.model.read().forward_backward(&job.shard, &job.ste)
            }));
            let reason = match outcome {
                Ok(Ok(out)) => {
                    match self.reducer.all_reduce(self.rank, out.into()) {
                        Ok(result) if self.rank == 0 => {
                            let _ = self.reports.send(Ok(result));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = self.reports.send(Err(e));
                        }
                    }
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(rank = self.rank, "worker failed: {}", reason);
            self.reducer.abort(self.rank, reason.clone());
            let _ = self.reports.send(Err(worker_failure(self.rank, &reason)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcquic_neural::ModelConfig;

    fn contribution(value: f32, images: usize) -> Contribution {
        let mut gradients = Gradients::new();
        gradients.insert("w".into(), vec![value, 2.0 * value]);
        Contribution {
            terms: LossBreakdown {
                distortion: value as f64,
                rate: 1.0,
                quantization: 0.0,
            },
            gradients,
            counts: vec![vec![vec![value as f64; 2]]],
            images,
        }
    }

    #[test]
    fn test_all_reduce_averages() {
        let reducer = Arc::new(AllReduce::new(3, Duration::from_secs(10)));
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let reducer = Arc::clone(&reducer);
                thread::spawn(move || reducer.all_reduce(rank, contribution(rank as f32, 1)).unwrap())
            })
            .collect();
        for handle in handles {
            let out = handle.join().unwrap();
            assert_eq!(out.gradients["w"], vec![1.0, 2.0]);
            assert_eq!(out.terms.distortion, 1.0);
            assert_eq!(out.counts[0][0], vec![3.0, 3.0]);
            assert_eq!(out.images, 3);
        }

        // Reusable for the next step
        let out = thread::scope(|s| {
            let a = s.spawn(|| reducer.all_reduce(0, contribution(1.0, 1)));
            let b = s.spawn(|| reducer.all_reduce(1, contribution(1.0, 1)));
            let c = s.spawn(|| reducer.all_reduce(2, contribution(4.0, 1)));
            let _ = a.join().unwrap().unwrap();
            let _ = b.join().unwrap().unwrap();
            c.join().unwrap().unwrap()
        });
        assert_eq!(out.gradients["w"], vec![2.0, 4.0]);
    }

    #[test]
    fn test_barrier_timeout() {
        let reducer = AllReduce::new(2, Duration::from_millis(50));
        let start = Instant::now();
        match reducer.all_reduce(0, contribution(1.0, 1)) {
            Err(TrainError::WorkerFailure { rank, reason }) => {
                assert_eq!(rank, 1);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        // A late peer sees the failure instead of waiting
        assert!(matches!(
            reducer.all_reduce(1, contribution(1.0, 1)),
            Err(TrainError::WorkerFailure { rank: 1, .. })
        ));
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let reducer = Arc::new(AllReduce::new(2, Duration::from_secs(30)));
        let waiter = {
            let reducer = Arc::clone(&reducer);
            thread::spawn(move || reducer.all_reduce(0, contribution(1.0, 1)))
        };
        thread::sleep(Duration::from_millis(20));
        reducer.abort(1, "boom");
        match waiter.join().unwrap() {
            Err(TrainError::WorkerFailure { rank, reason }) => {
                assert_eq!(rank, 1);
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    fn model() -> Arc<RwLock<CompressorModel>> {
        let config = ModelConfig {
            k: vec![27, 8],
            ..Default::default()
        };
        Arc::new(RwLock::new(CompressorModel::new(config).unwrap()))
    }

    fn batch(n: usize) -> Vec<ImageTensor> {
        (0..n)
            .map(|i| {
                let data = (0..8 * 8 * 3)
                    .map(|j| ((i * 31 + j * 7) % 97) as f32 / 97.0)
                    .collect();
                ImageTensor::from_vec(8, 8, 3, data).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_data_parallel_matches_single_worker() {
        let model = model();
        let single = WorkerPool::spawn(1, Arc::clone(&model), Duration::from_secs(10)).unwrap();
        let double = WorkerPool::spawn(2, Arc::clone(&model), Duration::from_secs(10)).unwrap();
        let ste = StraightThrough::default();

        let a = single.step(batch(4), ste).unwrap();
        let b = double.step(batch(4), ste).unwrap();
        assert_eq!(a.images, 4);
        assert_eq!(b.images, 4);
        assert!((a.terms.distortion - b.terms.distortion).abs() < 1e-9);
        assert_eq!(a.counts, b.counts);
        for (name, ga) in &a.gradients {
            let gb = &b.gradients[name];
            for (x, y) in ga.iter().zip(gb) {
                assert!((x - y).abs() <= 1e-5 + 1e-4 * x.abs(), "{}: {} vs {}", name, x, y);
            }
        }
    }

    #[test]
    fn test_worker_error_fails_pool() {
        let pool = WorkerPool::spawn(2, model(), Duration::from_secs(10)).unwrap();
        let mut images = batch(4);
        // Not a multiple of the alignment
        images[3] = ImageTensor::zeros(6, 6, 3);
        match pool.step(images, StraightThrough::default()) {
            Err(TrainError::WorkerFailure { rank, .. }) => assert_eq!(rank, 1),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(pool.step(batch(4), StraightThrough::default()).is_err());
        assert!(pool.step(batch(3), StraightThrough::default()).is_err());
    }
}
