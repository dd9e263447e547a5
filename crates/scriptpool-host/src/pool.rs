//! Fixed pool of worker threads, each pinned to one engine
//!
//! Engines are `!Send`, so tasks travel to them instead. Every worker pulls
//! from one shared queue, creates its engine on the first task, applies
//! pending invalidations before each task and drops the engine as the last
//! thing it does.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use scriptpool_types::{ScriptError, ScriptResult};

use crate::bridge::{catalog, CatalogLease};
use crate::engine::ScriptEngine;
use crate::notifier::{ChangeNotifier, Invalidation, InvalidationQueue};

/// Builds the engine of one worker; the flag is raised to cancel running scripts
pub type EngineFactory = Arc<dyn Fn(Arc<AtomicBool>) -> ScriptResult<ScriptEngine> + Send + Sync>;

type Job = Box<dyn FnOnce(ScriptResult<&mut ScriptEngine>) + Send>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads (default: 10)
    pub size: usize,
    /// How long shutdown waits for queued and running tasks (default: 10s)
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct EnginePool {
    sender: RwLock<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: Arc<AtomicBool>,
    notifier: Arc<ChangeNotifier>,
    config: PoolConfig,
    lease: Mutex<Option<CatalogLease>>,
}

impl EnginePool {
    pub fn new(
        config: PoolConfig,
        factory: EngineFactory,
        notifier: Arc<ChangeNotifier>,
    ) -> ScriptResult<Self> {
        if config.size == 0 {
            return Err(ScriptError::Config(
                "pool size must be at least 1".to_string(),
            ));
        }

        let lease = catalog::acquire();
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let cancel = Arc::new(AtomicBool::new(false));

        tracing::info!(
            target: "scripting",
            "Starting script pool with {} worker(s)",
            config.size
        );

        let mut workers = Vec::with_capacity(config.size);
        for index in 0..config.size {
            let receiver = Arc::clone(&receiver);
            let factory = Arc::clone(&factory);
            let cancel = Arc::clone(&cancel);
            let queue = notifier.register();

            let spawned = thread::Builder::new()
                .name(format!("script-worker-{index}"))
                .spawn(move || worker_loop(index, receiver, factory, cancel, queue));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Let the workers already running wind down
                    drop(sender);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(ScriptError::Config(format!(
                        "failed to spawn script worker {index}: {e}"
                    )));
                }
            }
        }

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            cancel,
            notifier,
            config,
            lease: Mutex::new(Some(lease)),
        })
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Run `task` on a free worker's engine and wait for its result
    ///
    /// Blocks the calling thread, so it must not be called from inside an
    /// async runtime; use [`EnginePool::submit_async`] there. A panicking
    /// task fails with [`ScriptError::Script`].
    pub fn submit<R, F>(&self, task: F) -> ScriptResult<R>
    where
        F: FnOnce(&mut ScriptEngine) -> ScriptResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let result = self.enqueue(task)?;
        result.blocking_recv().map_err(|_| ScriptError::PoolClosed)?
    }

    pub async fn submit_async<R, F>(&self, task: F) -> ScriptResult<R>
    where
        F: FnOnce(&mut ScriptEngine) -> ScriptResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let result = self.enqueue(task)?;
        result.await.map_err(|_| ScriptError::PoolClosed)?
    }

    /// Stop accepting tasks and wind the workers down
    ///
    /// Queued and running tasks get `shutdown_grace` to finish. After that
    /// queued tasks fail with [`ScriptError::PoolClosed`] and running scripts
    /// are interrupted. Calling it again does nothing.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.write().take() else {
            return;
        };
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock());
        tracing::info!(
            target: "scripting",
            "Shutting down script pool ({} worker(s))",
            workers.len()
        );

        let deadline = Instant::now() + self.config.shutdown_grace;
        while workers.iter().any(|worker| !worker.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        if workers.iter().any(|worker| !worker.is_finished()) {
            tracing::warn!(
                target: "scripting",
                "Script pool still busy after {:?}, cancelling remaining tasks",
                self.config.shutdown_grace
            );
            self.cancel.store(true, Ordering::SeqCst);
        }

        for worker in workers {
            let name = worker.thread().name().unwrap_or("script-worker").to_string();
            if worker.join().is_err() {
                tracing::error!(target: "scripting", "Worker {} panicked during shutdown", name);
            }
        }

        self.lease.lock().take();
        tracing::info!(target: "scripting", "Script pool shut down");
    }

    fn enqueue<R, F>(&self, task: F) -> ScriptResult<oneshot::Receiver<ScriptResult<R>>>
    where
        F: FnOnce(&mut ScriptEngine) -> ScriptResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let job: Job = Box::new(move |engine| {
            let result = match engine {
                Ok(engine) => panic::catch_unwind(AssertUnwindSafe(|| task(engine)))
                    .unwrap_or_else(|payload| {
                        Err(ScriptError::script("<task>", panic_message(payload.as_ref())))
                    }),
                Err(err) => Err(err),
            };
            // The submitter may have given up waiting
            let _ = result_tx.send(result);
        });

        let sender = self.sender.read();
        let Some(sender) = sender.as_ref() else {
            return Err(ScriptError::PoolClosed);
        };
        sender.send(job).map_err(|_| ScriptError::PoolClosed)?;
        Ok(result_rx)
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    index: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    factory: EngineFactory,
    cancel: Arc<AtomicBool>,
    queue: Arc<InvalidationQueue>,
) {
    tracing::debug!(target: "scripting", "Worker {} started", index);
    let mut engine: Option<ScriptEngine> = None;

    loop {
        let job = receiver.lock().blocking_recv();
        let Some(job) = job else {
            break;
        };

        if cancel.load(Ordering::SeqCst) {
            job(Err(ScriptError::PoolClosed));
            continue;
        }

        if engine.is_none() {
            match factory(Arc::clone(&cancel)) {
                Ok(created) => {
                    tracing::debug!(
                        target: "scripting",
                        "Worker {} created engine {}",
                        index,
                        created.instance_id()
                    );
                    engine = Some(created);
                }
                Err(e) => {
                    tracing::error!(target: "scripting", "Worker {} could not create its engine: {}", index, e);
                    job(Err(e));
                    continue;
                }
            }
        }

        if let Some(engine) = engine.as_mut() {
            for invalidation in queue.drain() {
                match invalidation {
                    Invalidation::Script(id) => engine.invalidate(&id),
                    Invalidation::All => engine.invalidate_all(),
                }
            }
            job(Ok(engine));
        }
    }

    drop(engine);
    tracing::debug!(target: "scripting", "Worker {} stopped", index);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}
