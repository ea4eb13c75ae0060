//! Acciones por estado. Cada cambio de estado vuelve a invocar la acción
//! del estado nuevo (ver `driver`); RUNNING lo atiende el monitor.

use async_trait::async_trait;
use common::{FileStatus, Outcome, Task, TaskState};
use tracing::{debug, error, info, warn};

use crate::backend::BackendStatus;
use crate::engine::Engine;
use crate::error::{GatewayError, Result};
use crate::jobdesc::build_job_description;
use crate::monitor::{PollOutcome, Poller};
use crate::storage::ResourceKind;

impl Engine {
    /// Ejecuta la acción del estado actual de la tarea. Nunca bloquea en red:
    /// submit y staging de salidas corren en tareas aparte.
    pub async fn activate(&self, id: &str) -> Result<()> {
        let task = self.task(id)?;
        match task.state {
            TaskState::Waiting => self.on_waiting(&task),
            TaskState::Ready => self.on_ready(&task),
            TaskState::Scheduled => self.on_scheduled(&task),
            TaskState::Running => {
                debug!("tarea {} en RUNNING: la atiende el monitor", id);
                Ok(())
            }
            TaskState::Done => {
                self.on_done(&task);
                Ok(())
            }
            TaskState::Aborted | TaskState::Cancelled => {
                debug!("tarea {} terminal ({}), nada que hacer", id, task.state);
                Ok(())
            }
        }
    }

    fn on_waiting(&self, task: &Task) -> Result<()> {
        if !task.inputs_ready() {
            let pending = task
                .input_files
                .iter()
                .filter(|f| f.status != FileStatus::Ready)
                .count();
            debug!("tarea {} espera {} entradas", task.id, pending);
            return Ok(());
        }
        self.transition(&task.id, TaskState::Ready, |_| {})?;
        Ok(())
    }

    fn on_ready(&self, task: &Task) -> Result<()> {
        // ya se lanzó: no se vuelve a lanzar
        if task.has_native_id() {
            self.transition(&task.id, TaskState::Scheduled, |_| {})?;
            return Ok(());
        }

        // sin infraestructura habilitada la tarea espera en READY y el driver
        // la reintenta
        match self.pick_infrastructure(task) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(GatewayError::NoResourceAvailable(format!(
                    "ninguna infraestructura habilitada para la tarea {}",
                    task.id
                )))
            }
            Err(e) => {
                error!("tarea {} sin infraestructura posible: {}", task.id, e);
                self.abort(&task.id, &e);
                return Ok(());
            }
        }

        let engine = self.clone();
        let id = task.id.clone();
        let queued = self.inner.submissions.dispatch(&task.id, async move {
            engine.submit(&id).await;
        });
        if !queued {
            debug!("submit de la tarea {} no encolado (en vuelo o pool cerrado)", task.id);
        }
        Ok(())
    }

    fn on_scheduled(&self, task: &Task) -> Result<()> {
        if self.inner.monitor.try_enqueue(&task.id)? {
            debug!("tarea {} bajo monitoreo", task.id);
        }
        Ok(())
    }

    fn on_done(&self, task: &Task) {
        let engine = self.clone();
        let task = task.clone();
        tokio::spawn(async move {
            match engine.stage_outputs(&task).await {
                Ok(()) => info!("salidas de la tarea {} listas", task.id),
                Err(e) => {
                    warn!("no se pudieron traer las salidas de {}: {}", task.id, e);
                    engine.abort(&task.id, &e);
                }
            }
            engine.forget_session(&task.id);
        });
    }

    /// Corre dentro del pool de submit.
    pub(crate) async fn submit(&self, id: &str) {
        match self.try_submit(id).await {
            Ok(true) => {}
            Ok(false) => debug!("submit de {} omitido", id),
            Err(e) => {
                if e.is_configuration() {
                    error!("tarea {} mal configurada: {}", id, e);
                } else {
                    warn!("falló el submit de {}: {}", id, e);
                }
                self.abort(id, &e);
            }
        }
    }

    async fn try_submit(&self, id: &str) -> Result<bool> {
        let task = self.task(id)?;
        if task.state != TaskState::Ready || task.has_native_id() {
            return Ok(false);
        }

        let Some(infra) = self.pick_infrastructure(&task)? else {
            warn!("tarea {} sin infraestructura habilitada, queda en READY", id);
            return Ok(false);
        };
        let task = self.task(id)?;
        let app = self.inner.catalog.application(&task.application_id)?;
        let cache_dir = self
            .inner
            .storage
            .cache_path(ResourceKind::Tasks, id, None)?;

        let plan = self.inner.dispatcher.plan(&task, &infra, app, &cache_dir)?;
        let session = self.session(&task, plan.family, &plan.params, false).await?;
        let native_id = self.inner.dispatcher.launch(&plan, &session).await?;

        let recorded = native_id.clone();
        match self.transition(id, TaskState::Scheduled, |t| t.native_id = Some(recorded)) {
            Ok(_) => Ok(true),
            Err(GatewayError::TaskTerminal(_)) => {
                // se canceló mientras se lanzaba: el job quedó huérfano
                warn!("tarea {} terminó durante el submit; cancelando {}", id, native_id);
                let mut orphan = self.task(id)?;
                orphan.native_id = Some(native_id);
                self.cancel_backend_job(&orphan).await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Pasa a ABORTED salvo que la tarea ya sea terminal.
    pub(crate) fn abort(&self, id: &str, cause: &GatewayError) {
        match self.transition(id, TaskState::Aborted, |_| {}) {
            Ok(_) => info!("tarea {} abortada: {}", id, cause),
            Err(GatewayError::TaskTerminal(_)) => {
                debug!("tarea {} ya terminal, no se aborta", id)
            }
            Err(e) => error!("no se pudo abortar {}: {}", id, e),
        }
        self.forget_session(id);
    }

    /// Una consulta al backend. La hacen los workers del monitor.
    pub(crate) async fn poll_task(&self, id: &str) -> PollOutcome {
        let task = match self.task(id) {
            Ok(t) => t,
            Err(e) => {
                warn!("monitor: {}", e);
                return PollOutcome::Finished;
            }
        };
        if task.state.is_terminal() {
            debug!("monitor: tarea {} terminal ({}), sale", id, task.state);
            return PollOutcome::Finished;
        }
        let Some(native_id) = task.native_id().filter(|_| task.state.requires_native_id()) else {
            error!("monitor: tarea {} en {} sin job nativo", id, task.state);
            return PollOutcome::Finished;
        };

        let status = async {
            let ctx = self.backend_context(&task)?;
            let session = self.session(&task, ctx.family, &ctx.params, false).await?;
            self.inner
                .dispatcher
                .backend(ctx.family)?
                .status(&session, native_id)
                .await
        }
        .await;

        match status {
            Ok(status) => self.apply_status(&task, status),
            Err(e) => {
                warn!("monitor: no se pudo consultar {} ({}), se reintenta", id, e);
                self.invalidate_session(id).await;
                PollOutcome::Continue
            }
        }
    }

    fn apply_status(&self, task: &Task, status: BackendStatus) -> PollOutcome {
        let id = task.id.as_str();
        let result = match status {
            BackendStatus::Pending => return PollOutcome::Continue,
            BackendStatus::Running if task.state == TaskState::Running => {
                return PollOutcome::Continue
            }
            BackendStatus::Running => self
                .transition(id, TaskState::Running, |_| {})
                .map(|_| PollOutcome::Continue),
            BackendStatus::Done => self
                .transition(id, TaskState::Done, |_| {})
                .map(|_| PollOutcome::Finished),
            BackendStatus::Failed(msg) => {
                warn!("job de la tarea {} falló: {}", id, msg);
                self.transition(id, TaskState::Aborted, |_| {})
                    .map(|_| PollOutcome::Finished)
            }
            BackendStatus::Cancelled => {
                warn!("job de la tarea {} cancelado en el backend", id);
                self.transition(id, TaskState::Aborted, |_| {})
                    .map(|_| PollOutcome::Finished)
            }
            BackendStatus::Unknown(raw) => {
                warn!("estado desconocido {:?} para la tarea {}", raw, id);
                self.transition(id, TaskState::Aborted, |_| {})
                    .map(|_| PollOutcome::Finished)
            }
        };

        match result {
            Ok(outcome) => {
                if outcome == PollOutcome::Finished {
                    self.forget_session_unless_done(id);
                }
                outcome
            }
            Err(GatewayError::TaskTerminal(_)) => {
                debug!("tarea {} terminó mientras se consultaba", id);
                PollOutcome::Finished
            }
            Err(e) => {
                error!("monitor: {}", e);
                PollOutcome::Finished
            }
        }
    }

    /// DONE todavía necesita la sesión para traer las salidas.
    fn forget_session_unless_done(&self, id: &str) {
        match self.task(id) {
            Ok(t) if t.state == TaskState::Done => {}
            _ => self.forget_session(id),
        }
    }

    async fn stage_outputs(&self, task: &Task) -> Result<()> {
        let ctx = self.backend_context(task)?;
        if ctx.outcome == Outcome::Resource {
            debug!("tarea {} produce un recurso, sin salidas que traer", task.id);
            return Ok(());
        }
        let native_id = task.native_id().ok_or_else(|| {
            GatewayError::Contract(format!("tarea {} en DONE sin id nativo", task.id))
        })?;

        let cache_dir = self
            .inner
            .storage
            .cache_path(ResourceKind::Tasks, &task.id, None)?;
        let job = build_job_description(task, &ctx.params, &cache_dir)?;
        let session = self.session(task, ctx.family, &ctx.params, false).await?;

        self.inner
            .dispatcher
            .backend(ctx.family)?
            .fetch_outputs(&session, native_id, &job, &cache_dir)
            .await?;
        let staged = self.inner.tasks.mark_outputs_ready(&task.id)?;
        self.emit_unchanged(&staged);
        Ok(())
    }
}

#[async_trait]
impl Poller for Engine {
    async fn poll(&self, task_id: &str) -> PollOutcome {
        self.poll_task(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Catalog;
    use crate::test_support::{harness, ssh_catalog, wait_for, Harness};
    use common::{CreateTaskRequest, Infrastructure, Param};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn create(h: &Harness, inputs: &[&str]) -> Task {
        h.engine
            .create_task(CreateTaskRequest {
                user: "ana".into(),
                application_id: "app-1".into(),
                arguments: vec![],
                input_files: inputs.iter().map(|s| s.to_string()).collect(),
                output_files: vec![],
            })
            .unwrap()
    }

    /// Tarea ya lanzada, directo en el estado pedido.
    fn seeded(h: &Harness, state: TaskState) -> Task {
        let mut t = Task::new("ana", "app-1", vec![], vec![], vec![]);
        t.state = state;
        t.native_id = Some("job-123".into());
        t.infrastructure_id = Some("ssh-1".into());
        h.engine.tasks().insert(t.clone());
        t
    }

    #[tokio::test]
    async fn ciclo_completo_con_backend_de_prueba() {
        let h = harness("ciclo", ssh_catalog(true), 10);
        let t = create(&h, &["data.txt"]);

        h.engine.activate(&t.id).await.unwrap();
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Waiting);

        h.engine.mark_input_ready(&t.id, "data.txt").unwrap();
        h.engine.activate(&t.id).await.unwrap();
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Ready);

        h.engine.activate(&t.id).await.unwrap();
        wait_for(&h.engine, &t.id, TaskState::Scheduled).await;
        let scheduled = h.engine.task(&t.id).unwrap();
        assert_eq!(scheduled.native_id(), Some("job-123"));
        assert_eq!(h.backend.submit_count(), 1);
        assert_eq!(
            h.backend.submitted.lock().unwrap()[0].0,
            "ssh://cluster.example.org"
        );

        h.engine.activate(&t.id).await.unwrap();
        assert!(h.engine.monitor().contains(&t.id));

        h.backend.push_status(BackendStatus::Running);
        assert_eq!(h.engine.poll_task(&t.id).await, PollOutcome::Continue);
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Running);

        h.backend.push_status(BackendStatus::Done);
        assert_eq!(h.engine.poll_task(&t.id).await, PollOutcome::Finished);
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Done);

        h.engine.activate(&t.id).await.unwrap();
        for _ in 0..200 {
            if h.backend.fetches.load(Ordering::SeqCst) == 1 && !h.engine.has_session(&t.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.backend.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Done);
        assert!(!h.engine.has_session(&t.id));
    }

    #[tokio::test]
    async fn ready_con_native_id_no_relanza() {
        let h = harness("idempotente", ssh_catalog(true), 10);
        let t = seeded(&h, TaskState::Ready);

        h.engine.activate(&t.id).await.unwrap();

        let after = h.engine.task(&t.id).unwrap();
        assert_eq!(after.state, TaskState::Scheduled);
        assert_eq!(after.native_id(), Some("job-123"));
        assert_eq!(h.backend.submit_count(), 0);
    }

    #[tokio::test]
    async fn activar_ready_dos_veces_lanza_una_sola_vez() {
        let h = harness("doble", ssh_catalog(true), 10);
        let t = create(&h, &[]);
        h.engine.activate(&t.id).await.unwrap();

        h.engine.activate(&t.id).await.unwrap();
        h.engine.activate(&t.id).await.unwrap();
        wait_for(&h.engine, &t.id, TaskState::Scheduled).await;
        // un tercer intento ya ve SCHEDULED
        h.engine.submit(&t.id).await;

        assert_eq!(h.backend.submit_count(), 1);
    }

    #[tokio::test]
    async fn ssh_sin_credenciales_aborta() {
        let infra = Infrastructure {
            id: "ssh-1".into(),
            name: "sin credenciales".into(),
            kind: Some("ssh".into()),
            parameters: vec![Param::new("jobservice", "ssh://h")],
            enabled: true,
            is_virtual: false,
        };
        let app = ssh_catalog(true).application("app-1").unwrap().clone();
        let h = harness("ssh_mal", Catalog::new(vec![infra], vec![app]), 10);
        let t = create(&h, &[]);

        h.engine.activate(&t.id).await.unwrap();
        h.engine.activate(&t.id).await.unwrap();

        wait_for(&h.engine, &t.id, TaskState::Aborted).await;
        assert_eq!(h.backend.submit_count(), 0);
        assert!(h.engine.task(&t.id).unwrap().native_id.is_none());
    }

    #[tokio::test]
    async fn falla_del_submit_aborta() {
        let h = harness("submit_falla", ssh_catalog(true), 10);
        h.backend.fail_submit("middleware caído");
        let t = create(&h, &[]);

        h.engine.activate(&t.id).await.unwrap();
        h.engine.activate(&t.id).await.unwrap();

        wait_for(&h.engine, &t.id, TaskState::Aborted).await;
    }

    #[tokio::test]
    async fn infraestructura_deshabilitada_deja_la_tarea_en_ready() {
        let h = harness("deshabilitada", ssh_catalog(false), 10);
        let t = create(&h, &[]);
        h.engine.activate(&t.id).await.unwrap();

        let err = h.engine.activate(&t.id).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(err, GatewayError::NoResourceAvailable(_)));
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Ready);
        assert_eq!(h.backend.submit_count(), 0);
        assert_eq!(h.engine.inner.submissions.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelada_antes_del_poll_no_revive() {
        let h = harness("cancel_poll", ssh_catalog(true), 10);
        let t = seeded(&h, TaskState::Running);

        h.engine.cancel(&t.id).unwrap();
        h.backend.push_status(BackendStatus::Done);

        assert_eq!(h.engine.poll_task(&t.id).await, PollOutcome::Finished);
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Cancelled);
        // el cancel al backend es best-effort y asíncrono
        for _ in 0..100 {
            if h.backend.cancels.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.backend.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_de_poll_es_pasajero() {
        let h = harness("poll_error", ssh_catalog(true), 10);
        let t = seeded(&h, TaskState::Scheduled);

        h.backend.push_poll_error("timeout");
        assert_eq!(h.engine.poll_task(&t.id).await, PollOutcome::Continue);
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Scheduled);

        h.backend.push_status(BackendStatus::Pending);
        assert_eq!(h.engine.poll_task(&t.id).await, PollOutcome::Continue);
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Scheduled);
    }

    #[tokio::test]
    async fn job_fallido_aborta() {
        let h = harness("fallido", ssh_catalog(true), 10);
        let t = seeded(&h, TaskState::Running);

        h.backend.push_status(BackendStatus::Failed("exit 1".into()));

        assert_eq!(h.engine.poll_task(&t.id).await, PollOutcome::Finished);
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Aborted);
        assert!(!h.engine.has_session(&t.id));
    }

    #[tokio::test]
    async fn scheduled_directo_a_done() {
        let h = harness("directo", ssh_catalog(true), 10);
        let t = seeded(&h, TaskState::Scheduled);

        h.backend.push_status(BackendStatus::Done);

        assert_eq!(h.engine.poll_task(&t.id).await, PollOutcome::Finished);
        assert_eq!(h.engine.task(&t.id).unwrap().state, TaskState::Done);
    }

    #[tokio::test]
    async fn falla_al_traer_salidas_aborta() {
        let h = harness("salidas", ssh_catalog(true), 10);
        h.backend.fail_fetch("sin permiso");
        let t = seeded(&h, TaskState::Done);

        h.engine.activate(&t.id).await.unwrap();

        wait_for(&h.engine, &t.id, TaskState::Aborted).await;
    }

    #[tokio::test]
    async fn salidas_traidas_quedan_ready_y_se_notifican() {
        let mut h = harness("salidas_ok", ssh_catalog(true), 10);
        let mut t = Task::new("ana", "app-1", vec![], vec![], vec!["result.txt".into()]);
        t.state = TaskState::Done;
        t.native_id = Some("job-123".into());
        t.infrastructure_id = Some("ssh-1".into());
        h.engine.tasks().insert(t.clone());

        h.engine.activate(&t.id).await.unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(2), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.id, t.id);
        assert_eq!(ev.old_state, Some(TaskState::Done));
        assert_eq!(ev.new_state, TaskState::Done);
        let staged = h.engine.task(&t.id).unwrap();
        assert_eq!(staged.output_files[0].status, FileStatus::Ready);
    }

    #[tokio::test]
    async fn monitor_lleno_devuelve_queue_full() {
        let h = harness("lleno", ssh_catalog(true), 1);
        let a = seeded(&h, TaskState::Scheduled);
        let b = seeded(&h, TaskState::Scheduled);

        h.engine.activate(&a.id).await.unwrap();
        let err = h.engine.activate(&b.id).await.unwrap_err();

        assert!(matches!(err, GatewayError::QueueFull { capacity: 1 }));
        // reintentar la misma no duplica
        h.engine.activate(&a.id).await.unwrap();
        assert_eq!(h.engine.monitor().owned(), 1);
    }
}
