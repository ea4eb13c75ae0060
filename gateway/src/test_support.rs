use std::{env, path::PathBuf, sync::Arc, time::Duration};

use common::{Application, Infrastructure, Outcome, Param, TaskChanged, TaskState};
use tokio::sync::mpsc;

use crate::backend::{mock::MockJobService, Backends, InfrastructureType};
use crate::credentials::{tests::FakeFetcher, CredentialProvider};
use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::monitor::MonitorQueue;
use crate::state::Catalog;
use crate::storage::LocalStorage;
use crate::submission::SubmissionPool;

pub(crate) struct Harness {
    pub(crate) engine: Engine,
    pub(crate) events: mpsc::UnboundedReceiver<TaskChanged>,
    pub(crate) backend: Arc<MockJobService>,
    pub(crate) storage_dir: PathBuf,
}

/// Una infraestructura ssh (`ssh-1`) y una aplicación (`app-1`) que corre ahí.
pub(crate) fn ssh_catalog(enabled: bool) -> Catalog {
    let infra = Infrastructure {
        id: "ssh-1".into(),
        name: "cluster".into(),
        kind: Some("ssh".into()),
        parameters: vec![
            Param::new("jobservice", "ssh://cluster.example.org"),
            Param::new("username", "ana"),
            Param::new("password", "secreto"),
        ],
        enabled,
        is_virtual: false,
    };
    let app = Application {
        id: "app-1".into(),
        name: "run".into(),
        outcome: Outcome::Job,
        parameters: vec![Param::new("executable", "run.sh")],
        infrastructures: vec!["ssh-1".into()],
    };
    Catalog::new(vec![infra], vec![app])
}

/// Engine completo con el backend ssh reemplazado por el mock. El monitor
/// no arranca workers: los tests deciden cuándo consultar.
pub(crate) fn harness(name: &str, catalog: Catalog, capacity: usize) -> Harness {
    let storage_dir = env::temp_dir().join("gateway_engine_tests").join(name);
    let _ = std::fs::remove_dir_all(&storage_dir);

    let backend = Arc::new(MockJobService::new());
    let backends = Backends::new().register(InfrastructureType::Ssh, backend.clone());
    let credentials = CredentialProvider::new(Arc::new(FakeFetcher::ok("PROXY")));
    let dispatcher = Dispatcher::new(backends, credentials).with_seed(7);

    let (engine, events) = Engine::new(
        catalog,
        dispatcher,
        Arc::new(LocalStorage::new(&storage_dir)),
        SubmissionPool::new(2),
        Arc::new(MonitorQueue::new(capacity, Duration::from_millis(10))),
    );

    Harness {
        engine,
        events,
        backend,
        storage_dir,
    }
}

pub(crate) async fn wait_for(engine: &Engine, id: &str, state: TaskState) {
    for _ in 0..300 {
        if engine.task(id).map(|t| t.state == state).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let current = engine.task(id).map(|t| t.state.to_string());
    panic!("la tarea {id} no llegó a {state} (está en {current:?})");
}
