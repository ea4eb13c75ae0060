use std::{
    collections::HashMap,
    io::Read,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use common::{
    Application, CreateTaskRequest, EffectiveParams, Infrastructure, MonitorMetrics, Task,
    TaskChanged, TaskId, TaskOutputs, TaskState,
};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::InfrastructureType;
use crate::dispatcher::Dispatcher;
use crate::error::{GatewayError, Result};
use crate::monitor::MonitorQueue;
use crate::session::{CachedSession, SessionContext};
use crate::state::{Catalog, TaskStore};
use crate::storage::{check_component, ResourceKind, Storage};
use crate::submission::SubmissionPool;

type SessionCell = Arc<tokio::sync::Mutex<CachedSession>>;

pub(crate) struct Inner {
    pub(crate) tasks: TaskStore,
    pub(crate) catalog: Catalog,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) submissions: SubmissionPool,
    pub(crate) monitor: Arc<MonitorQueue>,
    events: mpsc::UnboundedSender<TaskChanged>,
    sessions: Mutex<HashMap<TaskId, SessionCell>>,
}

/// Núcleo del gateway. Barato de clonar; lo comparten los handlers HTTP,
/// el driver de eventos, el pool de submit y los workers del monitor.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

impl Engine {
    /// Devuelve también el receptor de eventos que consume el driver.
    pub fn new(
        catalog: Catalog,
        dispatcher: Dispatcher,
        storage: Arc<dyn Storage>,
        submissions: SubmissionPool,
        monitor: Arc<MonitorQueue>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskChanged>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Arc::new(Inner {
                tasks: TaskStore::new(),
                catalog,
                dispatcher,
                storage,
                submissions,
                monitor,
                events,
                sessions: Mutex::new(HashMap::new()),
            }),
        };
        (engine, rx)
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.inner.tasks
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn monitor(&self) -> &MonitorQueue {
        &self.inner.monitor
    }

    pub fn task(&self, id: &str) -> Result<Task> {
        self.inner.tasks.get(id)
    }

    pub(crate) fn emit(&self, ev: TaskChanged) {
        if self.inner.events.send(ev).is_err() {
            debug!("driver de eventos cerrado, se descarta el evento");
        }
    }

    /// Transición validada + evento.
    pub(crate) fn transition<F>(&self, id: &str, to: TaskState, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let (task, ev) = self.inner.tasks.transition(id, to, mutate)?;
        info!("tarea {}: {:?} -> {}", id, ev.old_state, ev.new_state);
        self.emit(ev);
        Ok(task)
    }

    /// Evento sin cambio de estado: la tarea cambió otros campos y hay que
    /// volver a persistirla.
    pub(crate) fn emit_unchanged(&self, task: &Task) {
        self.emit(TaskChanged {
            id: task.id.clone(),
            old_state: Some(task.state),
            new_state: task.state,
        });
    }

    /// Crea la tarea en WAITING y la pone en marcha.
    pub fn create_task(&self, req: CreateTaskRequest) -> Result<Task> {
        if req.user.trim().is_empty() {
            return Err(GatewayError::BadParameter("la tarea necesita un usuario".into()));
        }
        let app = self.inner.catalog.application(&req.application_id)?;
        if app.infrastructures.is_empty() {
            return Err(GatewayError::BadParameter(format!(
                "la aplicación {} no tiene infraestructuras",
                app.id
            )));
        }
        // los nombres terminan como archivos dentro del directorio de la tarea
        for name in req.input_files.iter().chain(&req.output_files) {
            check_component(name).map_err(|e| GatewayError::BadParameter(e.to_string()))?;
        }

        let task = Task::new(
            req.user,
            req.application_id,
            req.arguments,
            req.input_files,
            req.output_files,
        );
        let id = task.id.clone();
        self.inner.storage.cache_path(ResourceKind::Tasks, &id, None)?;
        self.inner.tasks.insert(task.clone());

        info!("tarea {} creada para la aplicación {}", id, task.application_id);
        self.emit(TaskChanged {
            id,
            old_state: None,
            new_state: TaskState::Waiting,
        });
        Ok(task)
    }

    /// Guarda el archivo en el directorio de la tarea y lo marca READY.
    pub fn upload_input(&self, id: &str, name: &str, data: &mut dyn Read) -> Result<Task> {
        let task = self.task(id)?;
        if task.state.is_terminal() {
            return Err(GatewayError::TaskTerminal(id.to_string()));
        }
        if !task.input_files.iter().any(|f| f.name == name) {
            return Err(GatewayError::BadParameter(format!(
                "la tarea {id} no declara la entrada {name}"
            )));
        }

        let path = self
            .inner
            .storage
            .store_file(ResourceKind::Tasks, id, data, name, None)?;
        debug!("entrada {} de {} guardada en {}", name, id, path.display());
        self.mark_input_ready(id, name)
    }

    /// Marca la entrada y emite un evento sin cambio de estado para que
    /// WAITING se reevalúe.
    pub fn mark_input_ready(&self, id: &str, name: &str) -> Result<Task> {
        let task = self.inner.tasks.mark_input_ready(id, name)?;
        self.emit_unchanged(&task);
        Ok(task)
    }

    /// Cancela la tarea. Si ya hay un job nativo se intenta cancelarlo en el
    /// backend sin esperar la respuesta.
    pub fn cancel(&self, id: &str) -> Result<Task> {
        let task = self.transition(id, TaskState::Cancelled, |_| {})?;

        if task.has_native_id() {
            let engine = self.clone();
            let task = task.clone();
            tokio::spawn(async move {
                engine.cancel_backend_job(&task).await;
            });
        } else {
            self.forget_session(id);
        }
        Ok(task)
    }

    pub(crate) async fn cancel_backend_job(&self, task: &Task) {
        let Some(native_id) = task.native_id() else {
            return;
        };
        let result = async {
            let ctx = self.backend_context(task)?;
            let session = self.session(task, ctx.family, &ctx.params, false).await?;
            self.inner
                .dispatcher
                .backend(ctx.family)?
                .cancel(&session, native_id)
                .await
        }
        .await;

        match result {
            Ok(()) => info!("job {} de la tarea {} cancelado en el backend", native_id, task.id),
            Err(e) => warn!(
                "no se pudo cancelar el job {} de la tarea {}: {}",
                native_id, task.id, e
            ),
        }
        self.forget_session(&task.id);
    }

    pub fn outputs(&self, id: &str) -> Result<TaskOutputs> {
        let task = self.task(id)?;
        let dir = self.output_dir(id)?;
        Ok(TaskOutputs {
            id: task.id,
            output_dir: dir.display().to_string(),
            files: task.output_files,
        })
    }

    pub fn output_dir(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .inner
            .storage
            .cache_path(ResourceKind::Tasks, id, None)?)
    }

    pub fn metrics(&self) -> MonitorMetrics {
        let monitor = &self.inner.monitor;
        MonitorMetrics {
            capacity: monitor.capacity(),
            owned: monitor.owned(),
            workers: monitor.workers(),
            min_interval_secs: monitor.min_interval().as_secs(),
            submissions_in_flight: self.inner.submissions.in_flight(),
        }
    }

    /// Aplicación e infraestructura ya resueltas de la tarea.
    pub(crate) fn records(&self, task: &Task) -> Result<(&Infrastructure, &Application)> {
        let app = self.inner.catalog.application(&task.application_id)?;
        let infra_id = task.infrastructure_id.as_deref().ok_or_else(|| {
            GatewayError::Contract(format!("la tarea {} no tiene infraestructura", task.id))
        })?;
        let infra = self.inner.catalog.infrastructure(infra_id)?;
        Ok((infra, app))
    }

    pub(crate) fn backend_context(&self, task: &Task) -> Result<BackendContext> {
        let (infra, app) = self.records(task)?;
        let params = Dispatcher::effective_params(infra, app);
        let family = self.inner.dispatcher.supported_family(&params, infra)?;
        Ok(BackendContext {
            family,
            params,
            outcome: app.outcome,
        })
    }

    /// Infraestructura de la tarea. Se elige una sola vez, al azar entre las
    /// habilitadas. `None` si no hay ninguna habilitada por ahora.
    pub(crate) fn pick_infrastructure(&self, task: &Task) -> Result<Option<Infrastructure>> {
        let catalog = &self.inner.catalog;

        if let Some(ref id) = task.infrastructure_id {
            let infra = catalog.infrastructure(id)?;
            return Ok(infra.enabled.then(|| infra.clone()));
        }

        let app = catalog.application(&task.application_id)?;
        if app.infrastructures.is_empty() {
            return Err(GatewayError::BadParameter(format!(
                "la aplicación {} no tiene infraestructuras",
                app.id
            )));
        }
        let candidates = catalog.enabled_infrastructures(app);
        let Some(chosen) = candidates.choose(&mut rand::thread_rng()) else {
            return Ok(None);
        };
        let chosen_id = chosen.id.clone();

        let mut assigned = false;
        let updated = self.inner.tasks.update(&task.id, |t| {
            if t.infrastructure_id.is_none() {
                t.infrastructure_id = Some(chosen_id);
                assigned = true;
            }
            Ok(())
        })?;
        if assigned {
            self.emit_unchanged(&updated);
        }
        let id = updated
            .infrastructure_id
            .ok_or_else(|| GatewayError::Contract("infraestructura no asignada".into()))?;
        debug!("tarea {} asignada a la infraestructura {}", task.id, id);
        Ok(Some(catalog.infrastructure(&id)?.clone()))
    }

    /// Sesión de la tarea, cacheada por tarea.
    pub(crate) async fn session(
        &self,
        task: &Task,
        family: InfrastructureType,
        params: &EffectiveParams,
        renew: bool,
    ) -> Result<Arc<SessionContext>> {
        let cell = {
            let mut sessions = self.sessions();
            match sessions.get(&task.id) {
                Some(cell) => cell.clone(),
                None => {
                    let cell = Arc::new(tokio::sync::Mutex::new(
                        self.inner.dispatcher.session_for(family)?,
                    ));
                    sessions.insert(task.id.clone(), cell.clone());
                    cell
                }
            }
        };
        let mut cached = cell.lock().await;
        cached.get(params, &task.user, renew).await
    }

    /// La próxima consulta reconstruye la sesión.
    pub(crate) async fn invalidate_session(&self, id: &str) {
        let cell = self.sessions().get(id).cloned();
        if let Some(cell) = cell {
            cell.lock().await.invalidate();
        }
    }

    pub(crate) fn forget_session(&self, id: &str) {
        self.sessions().remove(id);
    }

    #[cfg(test)]
    pub(crate) fn has_session(&self, id: &str) -> bool {
        self.sessions().contains_key(id)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<TaskId, SessionCell>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Cierra el pool de submit y drena el monitor.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.submissions.close();
        self.inner.monitor.shutdown(grace).await;
    }
}

/// Lo que hace falta para hablar con el backend de una tarea ya asignada.
pub(crate) struct BackendContext {
    pub(crate) family: InfrastructureType,
    pub(crate) params: EffectiveParams,
    pub(crate) outcome: common::Outcome,
}
