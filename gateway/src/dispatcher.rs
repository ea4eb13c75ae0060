use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use common::{merge, Application, EffectiveParams, Infrastructure, Task};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::backend::{Backends, InfrastructureType, JobService};
use crate::credentials::CredentialProvider;
use crate::discovery::ResourceDiscovery;
use crate::error::{GatewayError, Result};
use crate::jobdesc::{build_job_description, JobDescription};
use crate::session::{builder_for, CachedSession, SessionContext};

/// Todo lo necesario para lanzar un job, ya validado.
#[derive(Debug, Clone)]
pub struct SubmitPlan {
    pub family: InfrastructureType,
    pub endpoint: String,
    pub params: EffectiveParams,
    pub job: JobDescription,
}

/// Mapea el tipo de infraestructura a sesión + adaptador + endpoint y arma el job.
pub struct Dispatcher {
    backends: Backends,
    credentials: CredentialProvider,
    rng: Mutex<StdRng>,
}

impl Dispatcher {
    pub fn new(backends: Backends, credentials: CredentialProvider) -> Self {
        Self {
            backends,
            credentials,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Semilla fija para que la selección de endpoints sea reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Parámetros efectivos: infraestructura primero, aplicación después.
    pub fn effective_params(infra: &Infrastructure, app: &Application) -> EffectiveParams {
        merge(&[&infra.parameters, &app.parameters])
    }

    /// Familia del backend: parámetro `type`, si no el campo `type` de la
    /// infraestructura, si no el esquema de `jobservice`.
    pub fn resolve_type(params: &EffectiveParams, infra: &Infrastructure) -> Result<InfrastructureType> {
        if let Some(t) = params.get("type") {
            return InfrastructureType::parse(t);
        }
        if let Some(t) = infra.kind.as_deref().filter(|t| !t.trim().is_empty()) {
            return InfrastructureType::parse(t);
        }
        if let Some(js) = params.get("jobservice") {
            if let Some((scheme, _)) = js.split_once("://") {
                return InfrastructureType::parse(scheme);
            }
        }
        Err(GatewayError::BadParameter(format!(
            "no se puede determinar el tipo de la infraestructura {}",
            infra.id
        )))
    }

    /// Familia resuelta y además soportada (con adaptador registrado).
    pub fn supported_family(
        &self,
        params: &EffectiveParams,
        infra: &Infrastructure,
    ) -> Result<InfrastructureType> {
        let family = Self::resolve_type(params, infra)?;
        self.backends.get(family)?;
        Ok(family)
    }

    pub fn backend(&self, family: InfrastructureType) -> Result<Arc<dyn JobService>> {
        self.backends.get(family)
    }

    /// Sesión cacheable nueva para una familia (una por tarea).
    pub fn session_for(&self, family: InfrastructureType) -> Result<CachedSession> {
        Ok(CachedSession::new(builder_for(family, self.credentials.clone())?))
    }

    /// Endpoint fijo (`jobservice`) o uno elegido por el discovery entre `resource`.
    pub fn endpoint(&self, params: &EffectiveParams, family: InfrastructureType) -> Result<String> {
        if let Some(js) = params.get("jobservice") {
            return Ok(js.trim().to_string());
        }

        if params.get_list("resource").is_empty() {
            return Err(GatewayError::BadParameter(
                "no hay jobservice ni resource configurados".to_string(),
            ));
        }

        let seed: u64 = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen();
        let mut discovery = ResourceDiscovery::seeded(params, seed)?;
        let resource = discovery.get_job_resource()?;

        if resource.contains("://") {
            Ok(resource)
        } else {
            Ok(format!("{family}://{resource}"))
        }
    }

    /// Valida todo lo que se puede validar sin tocar la red.
    pub fn plan(
        &self,
        task: &Task,
        infra: &Infrastructure,
        app: &Application,
        cache_dir: &Path,
    ) -> Result<SubmitPlan> {
        let params = Self::effective_params(infra, app);
        let family = self.supported_family(&params, infra)?;
        let endpoint = self.endpoint(&params, family)?;
        let job = build_job_description(task, &params, cache_dir)?;

        debug!(
            "plan de submit para tarea {}: {} en {} ({} transferencias)",
            task.id,
            family,
            endpoint,
            job.file_transfer.len()
        );

        Ok(SubmitPlan {
            family,
            endpoint,
            params,
            job,
        })
    }

    /// Lanza el job planeado con la sesión dada y devuelve el id nativo.
    pub async fn launch(&self, plan: &SubmitPlan, session: &SessionContext) -> Result<String> {
        let service = self.backend(plan.family)?;
        let native_id = service.submit(session, &plan.endpoint, &plan.job).await?;

        if native_id.trim().is_empty() {
            return Err(GatewayError::Submission(format!(
                "el backend {} devolvió un id vacío",
                plan.family
            )));
        }

        info!("job lanzado en {} con id nativo {}", plan.endpoint, native_id);
        Ok(native_id)
    }
}
