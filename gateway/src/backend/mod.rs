//! Frontera con los middlewares remotos.
//!
//! Cada familia de backend (grid, cloud, ssh, local) entrega un `JobService`
//! que sabe lanzar un job, consultar su estado y traer las salidas. Los
//! protocolos concretos viven fuera del core; acá sólo está el contrato.

pub mod local;
#[cfg(test)]
pub(crate) mod mock;

use std::{collections::HashMap, fmt, path::Path, sync::Arc};

use async_trait::async_trait;

use crate::error::{GatewayError, Result};
use crate::jobdesc::JobDescription;
use crate::session::SessionContext;

/// Familia de backend de una infraestructura.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfrastructureType {
    /// Grid con broker (WMS)
    Wms,
    /// Grid batch directo (CREAM CE)
    Cream,
    /// Cloud estilo OCCI
    Rocci,
    Ssh,
    /// Ejecución en el propio host del gateway (desarrollo)
    Local,
    Unicore,
    Gos,
    Wsgram,
}

impl InfrastructureType {
    /// Reconoce el nombre de la familia. Un nombre desconocido es error de configuración.
    pub fn parse(raw: &str) -> Result<Self> {
        let t = match raw.trim().to_ascii_lowercase().as_str() {
            "wms" => InfrastructureType::Wms,
            "cream" => InfrastructureType::Cream,
            "rocci" | "occi" => InfrastructureType::Rocci,
            "ssh" => InfrastructureType::Ssh,
            "local" => InfrastructureType::Local,
            "unicore" => InfrastructureType::Unicore,
            "gos" => InfrastructureType::Gos,
            "wsgram" => InfrastructureType::Wsgram,
            other => return Err(GatewayError::UnknownInfrastructureType(other.to_string())),
        };
        Ok(t)
    }

    /// Familias reconocidas para las que existe adaptador.
    pub fn is_implemented(self) -> bool {
        matches!(
            self,
            InfrastructureType::Wms
                | InfrastructureType::Cream
                | InfrastructureType::Rocci
                | InfrastructureType::Ssh
                | InfrastructureType::Local
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InfrastructureType::Wms => "wms",
            InfrastructureType::Cream => "cream",
            InfrastructureType::Rocci => "rocci",
            InfrastructureType::Ssh => "ssh",
            InfrastructureType::Local => "local",
            InfrastructureType::Unicore => "unicore",
            InfrastructureType::Gos => "gos",
            InfrastructureType::Wsgram => "wsgram",
        }
    }
}

impl fmt::Display for InfrastructureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estado de un job tal como lo reporta el backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Aceptado pero todavía en cola remota
    Pending,
    Running,
    Done,
    Failed(String),
    Cancelled,
    /// Estado que el adaptador no sabe traducir
    Unknown(String),
}

#[async_trait]
pub trait JobService: Send + Sync {
    /// Lanza el job y devuelve el identificador nativo.
    async fn submit(
        &self,
        session: &SessionContext,
        endpoint: &str,
        job: &JobDescription,
    ) -> Result<String>;

    async fn status(&self, session: &SessionContext, native_id: &str) -> Result<BackendStatus>;

    /// Trae las salidas del job a `dest`.
    async fn fetch_outputs(
        &self,
        session: &SessionContext,
        native_id: &str,
        job: &JobDescription,
        dest: &Path,
    ) -> Result<()>;

    async fn cancel(&self, session: &SessionContext, native_id: &str) -> Result<()>;
}

/// Registro de adaptadores por familia.
#[derive(Clone, Default)]
pub struct Backends {
    services: HashMap<InfrastructureType, Arc<dyn JobService>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: InfrastructureType, service: Arc<dyn JobService>) -> Self {
        self.services.insert(kind, service);
        self
    }

    pub fn get(&self, kind: InfrastructureType) -> Result<Arc<dyn JobService>> {
        if !kind.is_implemented() {
            return Err(GatewayError::NotImplemented(kind.to_string()));
        }
        self.services.get(&kind).cloned().ok_or_else(|| {
            GatewayError::NotImplemented(format!("{kind} (sin adaptador registrado)"))
        })
    }

    pub fn families(&self) -> Vec<InfrastructureType> {
        self.services.keys().copied().collect()
    }
}
