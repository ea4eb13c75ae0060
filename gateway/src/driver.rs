use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{Task, TaskChanged, TaskState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::{GatewayError, Result};
use crate::storage::{ResourceKind, Storage};

pub const TASK_FILE: &str = "task.json";

/// Persistencia durable de las tareas.
#[async_trait]
pub trait TaskPersistence: Send + Sync {
    async fn persist(&self, task: &Task) -> Result<()>;
}

/// Guarda cada tarea como `task.json` en su directorio del storage.
pub struct StoragePersistence {
    storage: Arc<dyn Storage>,
}

impl StoragePersistence {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TaskPersistence for StoragePersistence {
    async fn persist(&self, task: &Task) -> Result<()> {
        let json = serde_json::to_vec_pretty(task)
            .map_err(|e| GatewayError::Contract(format!("serializando {}: {e}", task.id)))?;
        self.storage.store_file(
            ResourceKind::Tasks,
            &task.id,
            &mut json.as_slice(),
            TASK_FILE,
            None,
        )?;
        Ok(())
    }
}

/// RUNNING es del monitor y los terminales no tienen acción. Un evento sin
/// cambio de estado sólo reactiva WAITING (llegó una entrada); en los demás
/// estados sólo se persiste (infraestructura elegida, salidas traídas).
fn should_activate(ev: &TaskChanged) -> bool {
    match ev.new_state {
        TaskState::Running | TaskState::Aborted | TaskState::Cancelled => false,
        TaskState::Waiting => true,
        state => ev.old_state != Some(state),
    }
}

/// Consume los eventos de cambio: primero persiste la tarea y después
/// vuelve a invocar la acción del estado nuevo.
pub async fn run(
    engine: Engine,
    mut events: mpsc::UnboundedReceiver<TaskChanged>,
    persistence: Arc<dyn TaskPersistence>,
    shutdown: CancellationToken,
    retry_after: Duration,
) {
    info!("driver de eventos arrancado");
    loop {
        let ev = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        handle(&engine, persistence.as_ref(), ev, retry_after, &shutdown).await;
    }
    info!("driver de eventos detenido");
}

async fn handle(
    engine: &Engine,
    persistence: &dyn TaskPersistence,
    ev: TaskChanged,
    retry_after: Duration,
    shutdown: &CancellationToken,
) {
    debug!("evento {:?}", ev);
    let task = match engine.task(&ev.id) {
        Ok(task) => task,
        Err(e) => {
            warn!("evento de una tarea inexistente: {}", e);
            return;
        }
    };
    if let Err(e) = persistence.persist(&task).await {
        warn!("no se pudo persistir la tarea {}: {}", ev.id, e);
    }

    if !should_activate(&ev) {
        return;
    }
    // evento viejo: la acción del estado actual ya la disparó su propio evento
    if task.state != ev.new_state {
        debug!(
            "evento {} de {} vencido, la tarea ya está en {}",
            ev.new_state, ev.id, task.state
        );
        return;
    }

    match engine.activate(&ev.id).await {
        Ok(()) => {}
        Err(e @ (GatewayError::QueueFull { .. } | GatewayError::NoResourceAvailable(_))) => {
            warn!(
                "tarea {} en {} se reintenta en {:?}: {}",
                ev.id, task.state, retry_after, e
            );
            tokio::spawn(retry_activation(
                engine.clone(),
                ev.id,
                task.state,
                retry_after,
                shutdown.clone(),
            ));
        }
        Err(GatewayError::TaskTerminal(_)) => {
            debug!("tarea {} terminó antes de su acción", ev.id)
        }
        Err(e) => error!("acción de la tarea {} falló: {}", ev.id, e),
    }
}

/// Reintenta la acción mientras la tarea siga en `expected`. Si cambió de
/// estado, ese cambio ya trajo su propio evento.
async fn retry_activation(
    engine: Engine,
    id: String,
    expected: TaskState,
    delay: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        match engine.task(&id) {
            Ok(task) if task.state == expected => {}
            Ok(task) => {
                debug!("tarea {} pasó a {}, se deja de reintentar", id, task.state);
                return;
            }
            Err(e) => {
                warn!("reintento: {}", e);
                return;
            }
        }
        match engine.activate(&id).await {
            Err(GatewayError::QueueFull { .. } | GatewayError::NoResourceAvailable(_)) => {
                debug!("tarea {} todavía sin lugar", id)
            }
            Err(e) => {
                error!("reintento de la tarea {} falló: {}", id, e);
                return;
            }
            Ok(()) => return,
        }
    }
}
