use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    process::Stdio,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{fs, process::Child, process::Command};
use tracing::{info, warn};

use super::{BackendStatus, JobService};
use crate::error::{GatewayError, Result};
use crate::jobdesc::{JobDescription, DEFAULT_OUTPUT_FILE};
use crate::session::SessionContext;

const DEFAULT_ERROR_FILE: &str = "error.txt";
const WORK_DIR: &str = "work";

struct LocalJob {
    child: Child,
    work_dir: PathBuf,
    finished: Option<BackendStatus>,
}

/// Adaptador de desarrollo: corre el job como proceso local dentro del
/// directorio de la tarea. Los ids nativos sólo valen mientras viva el proceso
/// del gateway.
#[derive(Default)]
pub struct LocalJobService {
    jobs: Mutex<HashMap<String, LocalJob>>,
}

impl LocalJobService {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unknown(native_id: &str) -> GatewayError {
    GatewayError::Backend(format!("job local desconocido: {native_id}"))
}

/// `path` dentro de `base`: relativo sin `..`, o absoluto bajo `base`.
fn inside(base: &Path, path: &Path) -> Result<PathBuf> {
    let rel = if path.is_absolute() {
        path.strip_prefix(base).map_err(|_| outside(base, path))?
    } else {
        path
    };
    let plain = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !plain || rel.as_os_str().is_empty() {
        return Err(outside(base, path));
    }
    Ok(base.join(rel))
}

fn outside(base: &Path, path: &Path) -> GatewayError {
    GatewayError::BadParameter(format!(
        "{} queda fuera de {}",
        path.display(),
        base.display()
    ))
}

#[async_trait]
impl JobService for LocalJobService {
    async fn submit(
        &self,
        _session: &SessionContext,
        _endpoint: &str,
        job: &JobDescription,
    ) -> Result<String> {
        let work_dir = job.staging_dir.join(WORK_DIR);
        fs::create_dir_all(&work_dir).await?;

        for input in job.inputs() {
            let src = inside(&job.staging_dir, &input.local)?;
            let dst = inside(&work_dir, Path::new(&input.remote))?;
            fs::copy(&src, &dst)
                .await
                .map_err(|e| {
                    GatewayError::Submission(format!(
                        "no se pudo copiar {}: {e}",
                        input.local.display()
                    ))
                })?;
        }

        let stdout_name = job.output.as_deref().unwrap_or(DEFAULT_OUTPUT_FILE);
        let stderr_name = job.error.as_deref().unwrap_or(DEFAULT_ERROR_FILE);
        let stdout = std::fs::File::create(inside(&work_dir, Path::new(stdout_name))?)?;
        let stderr = std::fs::File::create(inside(&work_dir, Path::new(stderr_name))?)?;

        // un ejecutable que vino como entrada se corre desde el directorio de trabajo
        let staged = work_dir.join(&job.executable);
        let program: PathBuf = if staged.is_file() {
            staged
        } else {
            PathBuf::from(&job.executable)
        };

        let child = Command::new(&program)
            .args(&job.arguments)
            .envs(job.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::Submission(format!("no se pudo lanzar {}: {e}", program.display()))
            })?;

        let native_id = format!("local-{}", uuid::Uuid::new_v4());
        info!(
            "job local {} lanzado (pid={:?}) en {}",
            native_id,
            child.id(),
            work_dir.display()
        );

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                native_id.clone(),
                LocalJob {
                    child,
                    work_dir,
                    finished: None,
                },
            );

        Ok(native_id)
    }

    async fn status(&self, _session: &SessionContext, native_id: &str) -> Result<BackendStatus> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(native_id).ok_or_else(|| unknown(native_id))?;

        if let Some(ref done) = job.finished {
            return Ok(done.clone());
        }

        let status = match job.child.try_wait() {
            Ok(Some(exit)) if exit.success() => BackendStatus::Done,
            Ok(Some(exit)) => BackendStatus::Failed(format!("terminó con {exit}")),
            Ok(None) => return Ok(BackendStatus::Running),
            Err(e) => return Err(GatewayError::Backend(format!("try_wait {native_id}: {e}"))),
        };

        job.finished = Some(status.clone());
        Ok(status)
    }

    async fn fetch_outputs(
        &self,
        _session: &SessionContext,
        native_id: &str,
        job: &JobDescription,
        dest: &Path,
    ) -> Result<()> {
        let work_dir = {
            let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.get(native_id)
                .map(|j| j.work_dir.clone())
                .ok_or_else(|| unknown(native_id))?
        };

        for out in job.outputs() {
            let src = inside(&work_dir, Path::new(&out.remote))?;
            let dst = inside(dest, &out.local)?;
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(&src, &dst).await.map_err(|e| {
                GatewayError::Backend(format!("falta la salida {}: {e}", out.remote))
            })?;
        }
        Ok(())
    }

    async fn cancel(&self, _session: &SessionContext, native_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(native_id).ok_or_else(|| unknown(native_id))?;

        if job.finished.is_none() {
            if let Err(e) = job.child.start_kill() {
                warn!("no se pudo matar el job local {}: {}", native_id, e);
            }
            job.finished = Some(BackendStatus::Cancelled);
        }
        Ok(())
    }
}
