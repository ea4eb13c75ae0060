pub mod api;
pub mod infrastructure;
pub mod params;
pub mod task;

pub use api::{CancelTaskResponse, CreateTaskRequest, MonitorMetrics, TaskOutputs, UploadResponse};
pub use infrastructure::{Application, ApplicationId, Infrastructure, InfrastructureId, Outcome};
pub use params::{merge, EffectiveParams, Param, MULTI_VALUED};
pub use task::{FileStatus, Task, TaskChanged, TaskFile, TaskId, TaskState};
