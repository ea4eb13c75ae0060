use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use common::TaskId;
use tokio::sync::Semaphore;
use tracing::debug;

type InFlight = Arc<Mutex<HashSet<TaskId>>>;

fn lock(set: &InFlight) -> MutexGuard<'_, HashSet<TaskId>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Libera la marca de "en vuelo" aunque el submit entre en pánico.
struct InFlightGuard {
    set: InFlight,
    task_id: TaskId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.task_id);
    }
}

/// Pool acotado para los submits (bloquean en red). Como mucho un submit
/// en vuelo por tarea.
#[derive(Clone)]
pub struct SubmissionPool {
    permits: Arc<Semaphore>,
    in_flight: InFlight,
    concurrency: usize,
}

impl SubmissionPool {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Encola el submit de `task_id`. Devuelve `false` si ya había uno en vuelo
    /// o si el pool está cerrado.
    pub fn dispatch<F>(&self, task_id: &str, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.permits.is_closed() {
            return false;
        }
        if !lock(&self.in_flight).insert(task_id.to_string()) {
            debug!("submit de {} ya en vuelo", task_id);
            return false;
        }

        let guard = InFlightGuard {
            set: self.in_flight.clone(),
            task_id: task_id.to_string(),
        };
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!("pool de submit cerrado, se descarta {}", guard.task_id);
                return;
            };
            job.await;
            drop(guard);
        });
        true
    }

    /// Los submits que todavía esperan permiso no arrancan.
    pub fn close(&self) {
        self.permits.close();
    }
}
