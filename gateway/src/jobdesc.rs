use std::path::{Path, PathBuf};

use common::{EffectiveParams, Task};
use tracing::warn;

use crate::error::{GatewayError, Result};

/// Salida asumida cuando la tarea no declara archivos ni `filetransfer`.
pub const DEFAULT_OUTPUT_FILE: &str = "output.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// local -> remoto (antes de ejecutar)
    In,
    /// remoto -> local (después de ejecutar)
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub local: PathBuf,
    pub remote: String,
    pub direction: TransferDirection,
}

/// Descripción del job independiente del backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobDescription {
    pub executable: String,
    pub arguments: Vec<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub queue: Option<String>,
    pub working_directory: Option<String>,
    pub wall_time_limit: Option<u32>,
    pub total_cpu_count: Option<u32>,
    pub environment: Vec<(String, String)>,
    pub candidate_hosts: Vec<String>,
    pub file_transfer: Vec<FileTransfer>,
    /// Directorio local de la tarea (origen de entradas, destino de salidas)
    pub staging_dir: PathBuf,
}

impl JobDescription {
    pub fn inputs(&self) -> impl Iterator<Item = &FileTransfer> {
        self.file_transfer
            .iter()
            .filter(|f| f.direction == TransferDirection::In)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &FileTransfer> {
        self.file_transfer
            .iter()
            .filter(|f| f.direction == TransferDirection::Out)
    }
}

fn optional_u32(params: &EffectiveParams, name: &str) -> Option<u32> {
    let raw = params.get(name)?;
    match raw.trim().parse::<u32>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignorando {}={:?}: no es un entero", name, raw);
            None
        }
    }
}

fn resolve_local(cache_dir: &Path, local: &str) -> PathBuf {
    let p = Path::new(local);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cache_dir.join(p)
    }
}

/// Parsea una entrada estilo `local>remote` (entrada) o `local<remote` (salida).
pub fn parse_transfer(entry: &str, cache_dir: &Path) -> Option<FileTransfer> {
    let (sep, direction) = if entry.contains('>') {
        ('>', TransferDirection::In)
    } else if entry.contains('<') {
        ('<', TransferDirection::Out)
    } else {
        return None;
    };

    let (local, remote) = entry.split_once(sep)?;
    let (local, remote) = (local.trim(), remote.trim());
    if local.is_empty() || remote.is_empty() || remote.contains(['<', '>']) {
        return None;
    }

    Some(FileTransfer {
        local: resolve_local(cache_dir, local),
        remote: remote.to_string(),
        direction,
    })
}

/// Transferencias derivadas de los archivos declarados en la tarea.
fn derived_transfers(task: &Task, cache_dir: &Path) -> Vec<FileTransfer> {
    let mut out = Vec::new();

    for f in &task.input_files {
        out.push(FileTransfer {
            local: cache_dir.join(&f.name),
            remote: f.name.clone(),
            direction: TransferDirection::In,
        });
    }
    for f in &task.output_files {
        out.push(FileTransfer {
            local: cache_dir.join(&f.name),
            remote: f.name.clone(),
            direction: TransferDirection::Out,
        });
    }

    if out.is_empty() {
        out.push(FileTransfer {
            local: cache_dir.join(DEFAULT_OUTPUT_FILE),
            remote: DEFAULT_OUTPUT_FILE.to_string(),
            direction: TransferDirection::Out,
        });
    }
    out
}

/// Arma la descripción del job a partir de los parámetros mezclados
/// (infraestructura + aplicación) y los argumentos de la tarea.
///
/// `executable` es obligatorio; el resto se setea si se puede y si no se
/// loguea. `cache_dir` es el directorio local de la tarea en el storage.
pub fn build_job_description(
    task: &Task,
    params: &EffectiveParams,
    cache_dir: &Path,
) -> Result<JobDescription> {
    let executable = params
        .get("executable")
        .map(|s| s.trim().to_string())
        .ok_or_else(|| {
            GatewayError::BadParameter(format!(
                "la tarea {} no tiene executable (aplicación {})",
                task.id, task.application_id
            ))
        })?;

    let mut arguments: Vec<String> = params
        .get_list("arguments")
        .into_iter()
        .map(str::to_string)
        .collect();
    arguments.extend(task.arguments.iter().cloned());

    let mut environment = Vec::new();
    for entry in params.get_list("environment") {
        match entry.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                environment.push((k.trim().to_string(), v.to_string()))
            }
            _ => warn!("ignorando environment mal formado: {:?}", entry),
        }
    }

    let explicit = params.get_list("filetransfer");
    let file_transfer = if explicit.is_empty() {
        derived_transfers(task, cache_dir)
    } else {
        let mut transfers = Vec::new();
        for entry in explicit {
            match parse_transfer(entry, cache_dir) {
                Some(t) => transfers.push(t),
                None => warn!("ignorando filetransfer mal formado: {:?}", entry),
            }
        }
        transfers
    };

    Ok(JobDescription {
        executable,
        arguments,
        output: params.get("output").map(str::to_string),
        error: params.get("error").map(str::to_string),
        queue: params.get("queue").map(str::to_string),
        working_directory: params.get("workingdirectory").map(str::to_string),
        wall_time_limit: optional_u32(params, "walltimelimit"),
        total_cpu_count: optional_u32(params, "totalcpucount"),
        environment,
        candidate_hosts: params
            .get_list("candidatehosts")
            .into_iter()
            .map(str::to_string)
            .collect(),
        file_transfer,
        staging_dir: cache_dir.to_path_buf(),
    })
}
