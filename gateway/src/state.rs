use common::{
    Application, ApplicationId, FileStatus, Infrastructure, InfrastructureId, Task, TaskChanged,
    TaskId, TaskState,
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::error::{GatewayError, Result};

/// Tareas en memoria. Toda mutación de estado pasa por `transition`, que
/// valida la tabla de transiciones y el invariante del id nativo.
#[derive(Clone, Default)]
pub struct TaskStore {
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, task: Task) {
        self.lock().insert(task.id.clone(), task);
    }

    /// Copia del estado actual de la tarea.
    pub fn get(&self, id: &str) -> Result<Task> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::TaskNotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cambia el estado aplicando `mutate` sobre una copia; si el resultado
    /// viola algún invariante la tarea queda intacta.
    pub fn transition<F>(&self, id: &str, to: TaskState, mutate: F) -> Result<(Task, TaskChanged)>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| GatewayError::TaskNotFound(id.to_string()))?;
        let from = task.state;

        if !from.can_transition_to(to) {
            if from.is_terminal() {
                return Err(GatewayError::TaskTerminal(id.to_string()));
            }
            return Err(GatewayError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        let mut next = task.clone();
        mutate(&mut next);
        next.state = to;

        if task.has_native_id() && next.native_id != task.native_id {
            return Err(GatewayError::Contract(format!(
                "la tarea {id} ya tiene id nativo {:?}",
                task.native_id
            )));
        }
        if to.requires_native_id() && !next.has_native_id() {
            return Err(GatewayError::Contract(format!(
                "la tarea {id} no puede pasar a {to} sin id nativo"
            )));
        }

        next.touch();
        *task = next.clone();

        Ok((
            next,
            TaskChanged {
                id: id.to_string(),
                old_state: Some(from),
                new_state: to,
            },
        ))
    }

    /// Mutación sin cambio de estado (infraestructura elegida, archivos...).
    /// Las tareas terminales no se tocan.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| GatewayError::TaskNotFound(id.to_string()))?;
        if task.state.is_terminal() {
            return Err(GatewayError::TaskTerminal(id.to_string()));
        }

        let mut next = task.clone();
        mutate(&mut next)?;
        if next.state != task.state || next.native_id != task.native_id {
            return Err(GatewayError::Contract(format!(
                "update de la tarea {id} no puede cambiar estado ni id nativo"
            )));
        }

        next.touch();
        *task = next.clone();
        Ok(next)
    }

    pub fn mark_input_ready(&self, id: &str, name: &str) -> Result<Task> {
        self.update(id, |task| {
            let file = task
                .input_files
                .iter_mut()
                .find(|f| f.name == name)
                .ok_or_else(|| {
                    GatewayError::BadParameter(format!("la tarea {id} no declara la entrada {name}"))
                })?;
            file.status = FileStatus::Ready;
            Ok(())
        })
    }

    /// Sólo válido en DONE, una vez traídas las salidas.
    pub fn mark_outputs_ready(&self, id: &str) -> Result<Task> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| GatewayError::TaskNotFound(id.to_string()))?;
        if task.state != TaskState::Done {
            return Err(GatewayError::Contract(format!(
                "salidas de la tarea {id} marcadas en {}",
                task.state
            )));
        }

        for f in task.output_files.iter_mut() {
            f.status = FileStatus::Ready;
        }
        task.touch();
        Ok(task.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    infrastructures: Vec<Infrastructure>,
    #[serde(default)]
    applications: Vec<Application>,
}

/// Aplicaciones e infraestructuras conocidas. Se carga una vez al arrancar.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    infrastructures: HashMap<InfrastructureId, Infrastructure>,
    applications: HashMap<ApplicationId, Application>,
}

impl Catalog {
    pub fn new(infrastructures: Vec<Infrastructure>, applications: Vec<Application>) -> Self {
        Self {
            infrastructures: infrastructures
                .into_iter()
                .map(|i| (i.id.clone(), i))
                .collect(),
            applications: applications
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw)
            .map_err(|e| GatewayError::BadParameter(format!("catálogo inválido: {e}")))?;
        Ok(Self::new(file.infrastructures, file.applications))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn infrastructure(&self, id: &str) -> Result<&Infrastructure> {
        self.infrastructures
            .get(id)
            .ok_or_else(|| GatewayError::InfrastructureNotFound(id.to_string()))
    }

    pub fn application(&self, id: &str) -> Result<&Application> {
        self.applications
            .get(id)
            .ok_or_else(|| GatewayError::ApplicationNotFound(id.to_string()))
    }

    /// Infraestructuras habilitadas de la aplicación. Las que no existen en
    /// el catálogo se ignoran.
    pub fn enabled_infrastructures(&self, app: &Application) -> Vec<&Infrastructure> {
        app.infrastructures
            .iter()
            .filter_map(|id| self.infrastructures.get(id))
            .filter(|i| i.enabled)
            .collect()
    }

    /// (infraestructuras, aplicaciones)
    pub fn counts(&self) -> (usize, usize) {
        (self.infrastructures.len(), self.applications.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(state: TaskState, native_id: Option<&str>) -> (TaskStore, TaskId) {
        let store = TaskStore::new();
        let mut t = Task::new("ana", "app-1", vec![], vec!["data.txt".into()], vec![]);
        t.state = state;
        t.native_id = native_id.map(str::to_string);
        let id = t.id.clone();
        store.insert(t);
        (store, id)
    }

    #[test]
    fn transicion_valida_devuelve_evento() {
        let (store, id) = store_with(TaskState::Waiting, None);

        let (task, ev) = store.transition(&id, TaskState::Ready, |_| {}).unwrap();

        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(ev.old_state, Some(TaskState::Waiting));
        assert_eq!(ev.new_state, TaskState::Ready);
    }

    #[test]
    fn scheduled_sin_native_id_se_rechaza_y_no_cambia_nada() {
        let (store, id) = store_with(TaskState::Ready, None);

        let err = store
            .transition(&id, TaskState::Scheduled, |_| {})
            .unwrap_err();

        assert!(matches!(err, GatewayError::Contract(_)));
        assert_eq!(store.get(&id).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn native_id_no_se_reemplaza() {
        let (store, id) = store_with(TaskState::Scheduled, Some("job-1"));

        let err = store
            .transition(&id, TaskState::Running, |t| {
                t.native_id = Some("job-2".into())
            })
            .unwrap_err();

        assert!(matches!(err, GatewayError::Contract(_)));
        assert_eq!(store.get(&id).unwrap().native_id(), Some("job-1"));
    }

    #[test]
    fn terminal_no_revive() {
        let (store, id) = store_with(TaskState::Cancelled, Some("job-1"));

        let err = store.transition(&id, TaskState::Running, |_| {}).unwrap_err();
        assert!(matches!(err, GatewayError::TaskTerminal(_)));

        let err = store.mark_input_ready(&id, "data.txt").unwrap_err();
        assert!(matches!(err, GatewayError::TaskTerminal(_)));
    }

    #[test]
    fn transicion_invalida_entre_no_terminales() {
        let (store, id) = store_with(TaskState::Waiting, None);

        let err = store.transition(&id, TaskState::Running, |_| {}).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTransition { .. }));
    }

    #[test]
    fn marcar_entradas_y_salidas() {
        let (store, id) = store_with(TaskState::Waiting, None);

        let t = store.mark_input_ready(&id, "data.txt").unwrap();
        assert!(t.inputs_ready());
        assert!(store.mark_input_ready(&id, "otro.txt").is_err());

        // salidas sólo en DONE
        assert!(store.mark_outputs_ready(&id).is_err());
    }

    #[test]
    fn catalogo_desde_json() {
        let raw = r#"{
            "infrastructures": [
                {"id": "ssh-1", "name": "cluster", "type": "ssh",
                 "parameters": [{"name": "jobservice", "value": "ssh://h"}]},
                {"id": "off", "name": "apagada", "enabled": false}
            ],
            "applications": [
                {"id": "app-1", "name": "hostname", "infrastructures": ["ssh-1", "off", "fantasma"]}
            ]
        }"#;

        let catalog = Catalog::from_json(raw).unwrap();
        let app = catalog.application("app-1").unwrap();

        let enabled: Vec<&str> = catalog
            .enabled_infrastructures(app)
            .iter()
            .map(|i| i.id.as_str())
            .collect();
        assert_eq!(enabled, vec!["ssh-1"]);
        assert!(matches!(
            catalog.application("nope"),
            Err(GatewayError::ApplicationNotFound(_))
        ));
    }

    #[test]
    fn catalogo_mal_formado_es_bad_parameter() {
        assert!(matches!(
            Catalog::from_json("{ no es json"),
            Err(GatewayError::BadParameter(_))
        ));
    }
}
