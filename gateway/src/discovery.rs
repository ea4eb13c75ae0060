use std::{collections::VecDeque, fmt};

use common::EffectiveParams;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Tipo de recurso que se le pide al discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCategory {
    JobService,
    Storage,
}

impl ResourceCategory {
    /// Parámetro (multi-valor) de donde salen los candidatos
    fn param_name(self) -> &'static str {
        match self {
            ResourceCategory::JobService => "resource",
            ResourceCategory::Storage => "storage",
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceCategory::JobService => f.write_str("jobservice"),
            ResourceCategory::Storage => f.write_str("storage"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// FIFO en el orden configurado
    Ordered,
    /// Uniforme sin reemplazo
    Random,
}

impl SelectionPolicy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ordered" => Ok(SelectionPolicy::Ordered),
            "random" => Ok(SelectionPolicy::Random),
            other => Err(GatewayError::BadParameter(format!(
                "resourceselection desconocido: {other}"
            ))),
        }
    }
}

/// Entrega endpoints candidatos de a uno hasta agotarlos.
pub struct ResourceDiscovery {
    job_services: VecDeque<String>,
    storages: VecDeque<String>,
    policy: SelectionPolicy,
    rng: Box<dyn RngCore + Send>,
}

impl ResourceDiscovery {
    pub fn new(
        job_services: Vec<String>,
        storages: Vec<String>,
        policy: SelectionPolicy,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            job_services: job_services.into(),
            storages: storages.into(),
            policy,
            rng,
        }
    }

    /// Candidatos leídos de `resource` / `storage`, política de `resourceselection`
    /// (por defecto RANDOM).
    pub fn from_params(params: &EffectiveParams, rng: Box<dyn RngCore + Send>) -> Result<Self> {
        let policy = match params.get("resourceselection") {
            Some(raw) => SelectionPolicy::parse(raw)?,
            None => SelectionPolicy::Random,
        };

        let collect = |c: ResourceCategory| -> Vec<String> {
            params
                .get_list(c.param_name())
                .into_iter()
                .map(str::to_string)
                .collect()
        };

        Ok(Self::new(
            collect(ResourceCategory::JobService),
            collect(ResourceCategory::Storage),
            policy,
            rng,
        ))
    }

    /// Igual que `from_params` pero con semilla fija (tests, reproducibilidad).
    pub fn seeded(params: &EffectiveParams, seed: u64) -> Result<Self> {
        Self::from_params(params, Box::new(StdRng::seed_from_u64(seed)))
    }

    pub fn available(&self, category: ResourceCategory) -> usize {
        match category {
            ResourceCategory::JobService => self.job_services.len(),
            ResourceCategory::Storage => self.storages.len(),
        }
    }

    /// Saca y devuelve un candidato. Pool vacío -> `NoResourceAvailable`.
    pub fn get_resource(&mut self, category: ResourceCategory) -> Result<String> {
        let pool = match category {
            ResourceCategory::JobService => &mut self.job_services,
            ResourceCategory::Storage => &mut self.storages,
        };

        let picked = match self.policy {
            SelectionPolicy::Ordered => pool.pop_front(),
            SelectionPolicy::Random => {
                if pool.is_empty() {
                    None
                } else {
                    let idx = self.rng.gen_range(0..pool.len());
                    pool.remove(idx)
                }
            }
        };

        match picked {
            Some(endpoint) => {
                debug!("discovery: elegido {} ({} restantes)", endpoint, pool.len());
                Ok(endpoint)
            }
            None => Err(GatewayError::NoResourceAvailable(category.to_string())),
        }
    }

    pub fn get_job_resource(&mut self) -> Result<String> {
        self.get_resource(ResourceCategory::JobService)
    }
}
