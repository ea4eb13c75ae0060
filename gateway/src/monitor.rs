use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use common::TaskId;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        OwnedSemaphorePermit, Semaphore,
    },
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Volver a encolar después del intervalo mínimo
    Continue,
    /// La tarea sale del monitor
    Finished,
}

/// Lo que hace un worker del monitor con cada tarea que saca de la cola.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    async fn poll(&self, task_id: &str) -> PollOutcome;
}

type Members = Arc<Mutex<HashSet<TaskId>>>;

fn lock(members: &Members) -> MutexGuard<'_, HashSet<TaskId>> {
    members.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lugar ocupado en el monitor. Mientras exista, la tarea cuenta contra la
/// capacidad (esté en la cola o dentro de un poll); al soltarse libera
/// el permiso y la membresía.
struct Slot {
    task_id: TaskId,
    members: Members,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        lock(&self.members).remove(&self.task_id);
    }
}

struct Entry {
    slot: Slot,
    not_before: Instant,
}

/// Cola acotada de tareas SCHEDULED/RUNNING que se consultan periódicamente.
///
/// Una tarea está a lo sumo una vez. Encolar nunca bloquea: con la cola
/// llena devuelve `QueueFull`. Re-encolar desde un worker no puede fallar
/// porque el lugar ya es de la tarea.
pub struct MonitorQueue {
    tx: mpsc::Sender<Entry>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Entry>>>,
    slots: Arc<Semaphore>,
    members: Members,
    capacity: usize,
    min_interval: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: Mutex<usize>,
    shutdown: CancellationToken,
}

impl MonitorQueue {
    pub fn new(capacity: usize, min_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            slots: Arc::new(Semaphore::new(capacity)),
            members: Arc::new(Mutex::new(HashSet::new())),
            capacity,
            min_interval,
            workers: Mutex::new(Vec::new()),
            worker_count: Mutex::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Tareas que ocupan lugar (en cola o en un poll activo).
    pub fn owned(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        lock(&self.members).contains(task_id)
    }

    pub fn workers(&self) -> usize {
        *self.worker_count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Ok(false)` si la tarea ya estaba en el monitor.
    pub fn try_enqueue(&self, task_id: &str) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::ShuttingDown);
        }

        let slot = {
            let mut members = lock(&self.members);
            if members.contains(task_id) {
                return Ok(false);
            }
            let permit = self
                .slots
                .clone()
                .try_acquire_owned()
                .map_err(|_| GatewayError::QueueFull {
                    capacity: self.capacity,
                })?;
            members.insert(task_id.to_string());
            Slot {
                task_id: task_id.to_string(),
                members: self.members.clone(),
                _permit: permit,
            }
        };

        let entry = Entry {
            slot,
            not_before: Instant::now(),
        };
        match self.tx.try_send(entry) {
            Ok(()) => {
                debug!("tarea {} en el monitor ({}/{})", task_id, self.owned(), self.capacity);
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Err(GatewayError::QueueFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(GatewayError::ShuttingDown),
        }
    }

    /// Arranca `workers` tareas tokio que consumen la cola.
    pub fn start(&self, workers: usize, poller: Arc<dyn Poller>) {
        let workers = workers.max(1);
        let mut handles = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for n in 0..workers {
            handles.push(tokio::spawn(worker_loop(
                n,
                self.rx.clone(),
                self.tx.clone(),
                poller.clone(),
                self.min_interval,
                self.shutdown.clone(),
            )));
        }
        *self.worker_count.lock().unwrap_or_else(PoisonError::into_inner) += workers;
        info!(
            "monitor con {} workers, capacidad {}, intervalo mínimo {:?}",
            workers, self.capacity, self.min_interval
        );
    }

    /// Deja de aceptar tareas, espera a los polls en curso hasta `grace` y
    /// aborta lo que quede.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let mut handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        let drained = tokio::time::timeout(grace, async {
            for h in handles.iter_mut() {
                let _ = h.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "el monitor no terminó en {:?}; abortando {} workers",
                grace,
                handles.len()
            );
            for h in &handles {
                h.abort();
            }
        }
        info!("monitor detenido ({} tareas sin terminar)", self.owned());
    }
}

async fn worker_loop(
    n: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Entry>>>,
    tx: mpsc::Sender<Entry>,
    poller: Arc<dyn Poller>,
    min_interval: Duration,
    shutdown: CancellationToken,
) {
    debug!("worker {} del monitor arrancado", n);
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                entry = rx.recv() => entry,
            }
        };
        let Some(mut entry) = next else { break };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(entry.not_before) => {}
        }

        let task_id = entry.slot.task_id.clone();
        match poller.poll(&task_id).await {
            PollOutcome::Finished => {
                debug!("worker {}: tarea {} sale del monitor", n, task_id);
                drop(entry);
            }
            PollOutcome::Continue => {
                entry.not_before = Instant::now() + min_interval;
                if let Err(e) = tx.try_send(entry) {
                    // no debería pasar: el permiso garantiza el lugar
                    error!("worker {}: no se pudo re-encolar {}: {}", n, task_id, e);
                }
            }
        }
    }
    debug!("worker {} del monitor terminado", n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Devuelve Continue `rounds` veces por tarea y después Finished.
    struct CountingPoller {
        rounds: usize,
        polls: Mutex<HashMap<String, Vec<Instant>>>,
        delay: Duration,
        total: AtomicUsize,
    }

    impl CountingPoller {
        fn new(rounds: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                rounds,
                polls: Mutex::new(HashMap::new()),
                delay,
                total: AtomicUsize::new(0),
            })
        }

        fn polls_of(&self, id: &str) -> Vec<Instant> {
            self.polls.lock().unwrap().get(id).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Poller for CountingPoller {
        async fn poll(&self, task_id: &str) -> PollOutcome {
            tokio::time::sleep(self.delay).await;
            self.total.fetch_add(1, Ordering::SeqCst);
            let mut polls = self.polls.lock().unwrap();
            let seen = polls.entry(task_id.to_string()).or_default();
            seen.push(Instant::now());
            if seen.len() > self.rounds {
                PollOutcome::Finished
            } else {
                PollOutcome::Continue
            }
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condición no alcanzada a tiempo");
    }

    #[tokio::test]
    async fn cola_llena_devuelve_queue_full_sin_bloquear() {
        let q = MonitorQueue::new(2, Duration::from_millis(10));

        assert!(q.try_enqueue("a").unwrap());
        assert!(q.try_enqueue("b").unwrap());
        let err = q.try_enqueue("c").unwrap_err();

        assert!(matches!(err, GatewayError::QueueFull { capacity: 2 }));
        assert_eq!(q.owned(), 2);
        assert!(!q.contains("c"));
    }

    #[tokio::test]
    async fn la_misma_tarea_no_se_encola_dos_veces() {
        let q = MonitorQueue::new(4, Duration::from_millis(10));

        assert!(q.try_enqueue("a").unwrap());
        assert!(!q.try_enqueue("a").unwrap());
        assert_eq!(q.owned(), 1);
    }

    #[tokio::test]
    async fn re_encola_hasta_finished_respetando_intervalo() {
        let q = MonitorQueue::new(4, Duration::from_millis(30));
        let poller = CountingPoller::new(2, Duration::ZERO);
        q.start(2, poller.clone());

        q.try_enqueue("t1").unwrap();
        wait_until(|| q.owned() == 0).await;

        let polls = poller.polls_of("t1");
        assert_eq!(polls.len(), 3);
        for w in polls.windows(2) {
            assert!(w[1] - w[0] >= Duration::from_millis(30));
        }
        assert!(!q.contains("t1"));

        // después de salir puede volver a entrar
        assert!(q.try_enqueue("t1").unwrap());
        q.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn capacidad_cuenta_tareas_dentro_del_poll() {
        let q = MonitorQueue::new(1, Duration::from_millis(10));
        let poller = CountingPoller::new(0, Duration::from_millis(200));
        q.start(1, poller.clone());

        q.try_enqueue("lenta").unwrap();
        // el worker la sacó de la cola pero sigue ocupando el lugar
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            q.try_enqueue("otra"),
            Err(GatewayError::QueueFull { .. })
        ));

        wait_until(|| q.owned() == 0).await;
        assert!(q.try_enqueue("otra").unwrap());
        q.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_acotado_aborta_polls_colgados() {
        let q = MonitorQueue::new(2, Duration::from_millis(10));
        let poller = CountingPoller::new(0, Duration::from_secs(60));
        q.start(1, poller.clone());
        q.try_enqueue("colgada").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        q.shutdown(Duration::from_millis(100)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            q.try_enqueue("nueva"),
            Err(GatewayError::ShuttingDown)
        ));
        assert_eq!(poller.total.load(Ordering::SeqCst), 0);
    }
}
