use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::infrastructure::{ApplicationId, InfrastructureId};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Waiting,
    Ready,
    Scheduled,
    Running,
    Done,
    Aborted,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Aborted | TaskState::Cancelled)
    }

    /// Estados que sólo tienen sentido con un job nativo ya creado.
    pub fn requires_native_id(self) -> bool {
        matches!(self, TaskState::Scheduled | TaskState::Running)
    }

    /// Tabla de transiciones permitidas.
    /// DONE -> ABORTED existe sólo para cuando falla el staging de salidas.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match self {
            Waiting => matches!(next, Ready | Cancelled | Aborted),
            Ready => matches!(next, Scheduled | Cancelled | Aborted),
            Scheduled => matches!(next, Running | Done | Cancelled | Aborted),
            Running => matches!(next, Done | Cancelled | Aborted),
            Done => matches!(next, Aborted),
            Aborted | Cancelled => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Waiting => "WAITING",
            TaskState::Ready => "READY",
            TaskState::Scheduled => "SCHEDULED",
            TaskState::Running => "RUNNING",
            TaskState::Done => "DONE",
            TaskState::Aborted => "ABORTED",
            TaskState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Needed,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFile {
    pub name: String,
    pub status: FileStatus,
}

impl TaskFile {
    pub fn needed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: FileStatus::Needed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,

    /// Identificador del job en el backend. Vacío hasta que el submit funciona.
    #[serde(default)]
    pub native_id: Option<String>,

    pub application_id: ApplicationId,
    /// Se elige una sola vez (al primer submit) entre las infraestructuras habilitadas.
    #[serde(default)]
    pub infrastructure_id: Option<InfrastructureId>,

    /// Usuario en cuyo nombre se construyen las sesiones
    pub user: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub input_files: Vec<TaskFile>,
    #[serde(default)]
    pub output_files: Vec<TaskFile>,

    pub date_created: DateTime<Utc>,
    pub last_change: DateTime<Utc>,
}

impl Task {
    pub fn new(
        user: impl Into<String>,
        application_id: impl Into<ApplicationId>,
        arguments: Vec<String>,
        input_files: Vec<String>,
        output_files: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: TaskState::Waiting,
            native_id: None,
            application_id: application_id.into(),
            infrastructure_id: None,
            user: user.into(),
            arguments,
            input_files: input_files.into_iter().map(TaskFile::needed).collect(),
            output_files: output_files.into_iter().map(TaskFile::needed).collect(),
            date_created: now,
            last_change: now,
        }
    }

    pub fn native_id(&self) -> Option<&str> {
        self.native_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn has_native_id(&self) -> bool {
        self.native_id().is_some()
    }

    /// true si no hay entradas o si todas están READY
    pub fn inputs_ready(&self) -> bool {
        self.input_files
            .iter()
            .all(|f| f.status == FileStatus::Ready)
    }

    pub fn touch(&mut self) {
        self.last_change = Utc::now();
    }
}

/// Evento emitido en cada cambio observable de una tarea.
/// `old_state` es `None` cuando la tarea recién se crea.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskChanged {
    pub id: TaskId,
    pub old_state: Option<TaskState>,
    pub new_state: TaskState,
}
