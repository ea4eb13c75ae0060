use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    CancelTaskResponse, CreateTaskRequest, MonitorMetrics, Task, TaskOutputs, UploadResponse,
};
use reqwest::{Client, Response};
use std::{env, path::PathBuf};

/// - En Docker: GATEWAY_URL=http://gateway:8080
/// - Local: default http://localhost:8080
fn gateway_base_url() -> String {
    env::var("GATEWAY_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Crea una tarea para una aplicación del catálogo
    Submit {
        #[arg(value_name = "APLICACION")]
        application: String,

        /// Usuario en cuyo nombre corre la tarea
        #[arg(long, default_value = "anonymous")]
        user: String,

        /// Archivos de entrada que se van a subir (por nombre)
        #[arg(long = "input", value_name = "ARCHIVO")]
        inputs: Vec<String>,

        /// Archivos de salida esperados
        #[arg(long = "output", value_name = "ARCHIVO")]
        outputs: Vec<String>,

        /// Argumentos extra para el ejecutable
        #[arg(last = true)]
        arguments: Vec<String>,
    },
    /// Consulta el estado de una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Cancela una tarea
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Sube un archivo de entrada declarado por la tarea
    Upload {
        #[arg(value_name = "TASK_ID")]
        id: String,

        #[arg(value_name = "RUTA")]
        path: PathBuf,

        /// Nombre con el que se declaró (default: nombre del archivo)
        #[arg(long)]
        name: Option<String>,
    },
    /// Lista las salidas de una tarea
    Outputs {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Ocupación del monitor de tareas
    Monitor,
}

/// Error legible con el cuerpo que devolvió el gateway.
async fn check(resp: Response, what: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    bail!("{what}: el gateway respondió {status}: {body}");
}

fn print_task(task: &Task) {
    println!("Tarea:");
    println!("  id: {}", task.id);
    println!("  aplicación: {}", task.application_id);
    println!("  usuario: {}", task.user);
    println!("  estado: {}", task.state);
    if let Some(native) = task.native_id() {
        println!("  id nativo: {}", native);
    }
    if let Some(ref infra) = task.infrastructure_id {
        println!("  infraestructura: {}", infra);
    }
    for f in &task.input_files {
        println!("  entrada {}: {:?}", f.name, f.status);
    }
    for f in &task.output_files {
        println!("  salida {}: {:?}", f.name, f.status);
    }
    println!("  creada: {}", task.date_created);
    println!("  último cambio: {}", task.last_change);
}

fn upload_name(path: &std::path::Path, name: Option<String>) -> Result<String> {
    match name {
        Some(n) => Ok(n),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("{} no tiene nombre de archivo", path.display())),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = gateway_base_url();

    match cli.command {
        Commands::Submit {
            application,
            user,
            inputs,
            outputs,
            arguments,
        } => {
            let url = format!("{}/api/v1/tasks", base_url);
            let req = CreateTaskRequest {
                user,
                application_id: application,
                arguments,
                input_files: inputs,
                output_files: outputs,
            };

            let resp = check(client.post(&url).json(&req).send().await?, "submit").await?;
            let task: Task = resp.json().await?;
            print_task(&task);
            if !task.input_files.is_empty() {
                println!("Subí las entradas con: client upload {} <archivo>", task.id);
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{}", base_url, id);
            let resp = check(client.get(&url).send().await?, "status").await?;
            let task: Task = resp.json().await?;
            print_task(&task);
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/tasks/{}/cancel", base_url, id);
            let resp = check(client.post(&url).send().await?, "cancel").await?;
            let r: CancelTaskResponse = resp.json().await?;
            println!("Tarea {} -> {}", r.id, r.state);
        }

        Commands::Upload { id, path, name } => {
            let name = upload_name(&path, name)?;
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("no se pudo leer {}", path.display()))?;

            let url = format!("{}/api/v1/tasks/{}/input/{}", base_url, id, name);
            let resp = check(client.put(&url).body(data).send().await?, "upload").await?;
            let r: UploadResponse = resp.json().await?;
            println!("Entrada {} subida; tarea {} en {}", r.file, r.id, r.state);
        }

        Commands::Outputs { id } => {
            let url = format!("{}/api/v1/tasks/{}/output", base_url, id);
            let resp = check(client.get(&url).send().await?, "outputs").await?;
            let outputs: TaskOutputs = resp.json().await?;

            println!("Salidas de la tarea {}:", outputs.id);
            println!("  directorio: {}", outputs.output_dir);
            if outputs.files.is_empty() {
                println!("  (sin archivos declarados)");
            } else {
                for f in outputs.files {
                    println!("    - {} ({:?})", f.name, f.status);
                }
            }
        }

        Commands::Monitor => {
            let url = format!("{}/api/v1/monitor", base_url);
            let resp = check(client.get(&url).send().await?, "monitor").await?;
            let m: MonitorMetrics = resp.json().await?;

            println!("Monitor:");
            println!("  ocupado        : {}/{}", m.owned, m.capacity);
            println!("  workers        : {}", m.workers);
            println!("  intervalo mín. : {} s", m.min_interval_secs);
            println!("  submits activos: {}", m.submissions_in_flight);
        }
    }

    Ok(())
}
