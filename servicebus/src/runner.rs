//! Per-service worker threads.
//!
//! Each registered service gets one [`ServiceRunner`]: a bounded job queue
//! drained by a dedicated worker thread.  Foreground services run their
//! jobs inline on the worker, one at a time in enqueue order.  Background
//! services get a fresh thread per job; the worker keeps the handles, prunes
//! finished ones whenever it spawns another, and joins whatever is still
//! running when it stops.

use {
    crate::{
        error::{Result, ServiceBusError},
        request::{Request, RpcResponse},
        service::{ConcurrencyPolicy, Handler, ServiceEntry, ServiceKind},
    },
    crossbeam_channel::{bounded, Receiver, Sender},
    log::{debug, error, info},
    std::{
        any::Any,
        collections::HashMap,
        panic::{self, AssertUnwindSafe},
        thread::{Builder, JoinHandle},
    },
};

/// Work item for a runner.
#[derive(Debug)]
pub enum Job {
    Message(Request),
    Call(Request, RpcResponse),
    Stop,
}

// ── ServiceRunner ───────────────────────────────────────────────────────────

pub struct ServiceRunner {
    key: String,
    jobs: Sender<Job>,
    worker: Option<JoinHandle<()>>,
}

impl ServiceRunner {
    /// Spawn the worker for `entry` with a queue of `capacity` jobs.
    pub fn start(key: &str, entry: &ServiceEntry, capacity: usize) -> Self {
        let (jobs, queue) = bounded(capacity.max(1));
        let handler = entry.handler.clone();
        let policy = entry.policy;
        let worker_key = key.to_string();
        let worker = Builder::new()
            .name("trv1SvcRunner".to_string())
            .spawn(move || run_worker(&worker_key, &handler, policy, &queue))
            .expect("failed to spawn service runner thread");
        Self {
            key: key.to_string(),
            jobs,
            worker: Some(worker),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Queue a job, blocking while the queue is full.
    pub fn dispatch(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| ServiceBusError::ChannelClosed)
    }

    /// Ask the worker to finish after the jobs already queued.
    pub fn stop(&self) {
        let _ = self.jobs.send(Job::Stop);
    }

    /// Wait for the worker and its background jobs to finish.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("service runner {} panicked", self.key);
            }
        }
    }
}

impl Drop for ServiceRunner {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
            self.join();
        }
    }
}

fn run_worker(key: &str, handler: &Handler, policy: ConcurrencyPolicy, queue: &Receiver<Job>) {
    debug!("service runner {key} started ({policy:?})");
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    while let Ok(job) = queue.recv() {
        if matches!(job, Job::Stop) {
            break;
        }
        match policy {
            ConcurrencyPolicy::Foreground => run_job(key, handler, job),
            ConcurrencyPolicy::Background => {
                background.retain(|worker| !worker.is_finished());
                let job_key = key.to_string();
                let job_handler = handler.clone();
                match Builder::new()
                    .name("trv1SvcBackground".to_string())
                    .spawn(move || run_job(&job_key, &job_handler, job))
                {
                    Ok(worker) => background.push(worker),
                    Err(e) => error!("cannot spawn background job for {key}: {e}"),
                }
            }
        }
    }

    if !background.is_empty() {
        info!("waiting for {} background job(s) of {key}", background.len());
    }
    for worker in background {
        let _ = worker.join();
    }
    debug!("service runner {key} stopped");
}

/// Run one job on a fresh handler instance.  Errors and panics stop here;
/// the request's sender is closed either way.
fn run_job(key: &str, handler: &Handler, job: Job) {
    let (mut request, response) = match job {
        Job::Message(request) => (request, None),
        Job::Call(request, response) => (request, Some(response)),
        Job::Stop => return,
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match (handler, response) {
        (Handler::OneWay(factory), None) => factory().on_message(&mut request),
        (Handler::Rpc(factory), Some(response)) => factory().on_call(&mut request, response),
        _ => Err(anyhow::anyhow!("job kind does not match the handler of {key}")),
    }));

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("service {key} failed: {e:#}"),
        Err(panic) => error!("service {key} panicked: {}", panic_message(panic.as_ref())),
    }
    request.close();
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

// ── RunnerSet ───────────────────────────────────────────────────────────────

/// The runners of one host loop iteration, keyed like the service registry.
#[derive(Default)]
pub struct RunnerSet {
    runners: HashMap<(ServiceKind, String), ServiceRunner>,
}

impl RunnerSet {
    /// Start one runner per registry entry.
    pub fn start_all(
        services: &HashMap<(ServiceKind, String), ServiceEntry>,
        capacity: usize,
    ) -> Self {
        let runners = services
            .iter()
            .map(|((kind, key), entry)| {
                ((*kind, key.clone()), ServiceRunner::start(key, entry, capacity))
            })
            .collect();
        Self { runners }
    }

    pub fn get(&self, kind: ServiceKind, key: &str) -> Option<&ServiceRunner> {
        self.runners.get(&(kind, key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Stop every runner, then wait for all of them.
    pub fn stop_all(mut self) {
        info!("stopping {} service runner(s)", self.runners.len());
        for runner in self.runners.values() {
            runner.stop();
        }
        for runner in self.runners.values_mut() {
            runner.join();
        }
    }
}
