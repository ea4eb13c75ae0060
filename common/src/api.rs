use serde::{Deserialize, Serialize};

use crate::task::{TaskFile, TaskId, TaskState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub user: String,
    pub application_id: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub output_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTaskResponse {
    pub id: TaskId,
    pub state: TaskState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub id: TaskId,
    pub file: String,
    pub state: TaskState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputs {
    pub id: TaskId,
    /// Directorio donde quedaron las salidas de la tarea
    pub output_dir: String,
    pub files: Vec<TaskFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorMetrics {
    pub capacity: usize,
    /// Tareas en cola o dentro de un poll activo
    pub owned: usize,
    pub workers: usize,
    pub min_interval_secs: u64,
    pub submissions_in_flight: usize,
}
