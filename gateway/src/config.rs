use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_STORAGE_DIR: &str = "/data/gateway";
const DEFAULT_SUBMIT_CONCURRENCY: usize = 4;
const DEFAULT_MONITOR_WORKERS: usize = 4;
const DEFAULT_MONITOR_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_MONITOR_MIN_INTERVAL_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 15;
const DEFAULT_QUEUE_FULL_RETRY_SECS: u64 = 5;

/// Configuración del gateway. Todo sale de variables de entorno con
/// valores por defecto razonables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub storage_dir: PathBuf,
    /// JSON con infraestructuras y aplicaciones
    pub catalog_path: Option<PathBuf>,
    pub submit_concurrency: usize,
    pub monitor_workers: usize,
    pub monitor_capacity: usize,
    pub monitor_min_interval: Duration,
    pub shutdown_grace: Duration,
    pub queue_full_retry: Duration,
}

/// Lee `name`; si falta o no parsea usa `default` (y avisa si no parseaba).
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("{}={:?} inválido, uso el valor por defecto", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_or("GATEWAY_LISTEN", SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))),
            storage_dir: env::var("GATEWAY_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORAGE_DIR)),
            catalog_path: env::var("GATEWAY_CATALOG")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            submit_concurrency: env_or("SUBMIT_CONCURRENCY", DEFAULT_SUBMIT_CONCURRENCY).max(1),
            monitor_workers: env_or("MONITOR_WORKERS", DEFAULT_MONITOR_WORKERS).max(1),
            monitor_capacity: env_or("MONITOR_QUEUE_CAPACITY", DEFAULT_MONITOR_QUEUE_CAPACITY)
                .max(1),
            monitor_min_interval: Duration::from_secs(env_or(
                "MONITOR_MIN_INTERVAL_SECS",
                DEFAULT_MONITOR_MIN_INTERVAL_SECS,
            )),
            shutdown_grace: Duration::from_secs(env_or(
                "SHUTDOWN_GRACE_SECS",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )),
            queue_full_retry: Duration::from_secs(
                env_or("QUEUE_FULL_RETRY_SECS", DEFAULT_QUEUE_FULL_RETRY_SECS).max(1),
            ),
        }
    }
}
