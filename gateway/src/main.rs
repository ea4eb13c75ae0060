use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gateway::{
    backend::{local::LocalJobService, Backends, InfrastructureType},
    config::GatewayConfig,
    credentials::{CredentialProvider, HttpFetcher},
    dispatcher::Dispatcher,
    driver::{self, StoragePersistence},
    engine::Engine,
    handlers,
    monitor::MonitorQueue,
    shutdown,
    state::Catalog,
    storage::{LocalStorage, Storage},
    submission::SubmissionPool,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gateway=debug,tower_http=info,axum=info")),
        )
        .init();

    let config = GatewayConfig::from_env();
    info!("configuración: {:?}", config);

    let catalog = match config.catalog_path {
        Some(ref path) => Catalog::load(path)
            .with_context(|| format!("no se pudo cargar el catálogo {}", path.display()))?,
        None => {
            warn!("GATEWAY_CATALOG no definido, catálogo vacío");
            Catalog::default()
        }
    };
    let (infras, apps) = catalog.counts();
    info!("catálogo: {} infraestructuras, {} aplicaciones", infras, apps);

    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(&config.storage_dir));

    // sólo el adaptador local viene incluido; el resto se registra acá
    let backends =
        Backends::new().register(InfrastructureType::Local, Arc::new(LocalJobService::new()));
    let credentials = CredentialProvider::new(Arc::new(HttpFetcher::new()));
    let dispatcher = Dispatcher::new(backends, credentials);

    let monitor = Arc::new(MonitorQueue::new(
        config.monitor_capacity,
        config.monitor_min_interval,
    ));
    let (engine, events) = Engine::new(
        catalog,
        dispatcher,
        storage.clone(),
        SubmissionPool::new(config.submit_concurrency),
        monitor.clone(),
    );
    monitor.start(config.monitor_workers, Arc::new(engine.clone()));

    let shutdown = shutdown::install_shutdown_handler()
        .context("no se pudieron instalar los handlers de señales")?;

    let driver = tokio::spawn(driver::run(
        engine.clone(),
        events,
        Arc::new(StoragePersistence::new(storage)),
        shutdown.clone(),
        config.queue_full_retry,
    ));

    let app = handlers::build_router(engine.clone());
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.listen))?;
    info!("gateway escuchando en {}", listener.local_addr()?);

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("el servidor HTTP terminó con error")?;

    info!("apagando: drenando monitor (gracia {:?})", config.shutdown_grace);
    shutdown.cancel();
    engine.shutdown(config.shutdown_grace).await;
    if let Err(e) = driver.await {
        warn!("el driver de eventos terminó mal: {}", e);
    }
    info!("gateway detenido");
    Ok(())
}
