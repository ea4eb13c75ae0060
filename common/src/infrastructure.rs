use serde::{Deserialize, Serialize};

use crate::params::Param;

pub type InfrastructureId = String;
pub type ApplicationId = String;

/// Destino remoto de ejecución (grid, cloud, host ssh...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Infrastructure {
    pub id: InfrastructureId,
    #[serde(default)]
    pub name: String,
    /// Familia del backend, ej: "ssh", "wms", "rocci".
    /// Puede faltar si se infiere del parámetro `type` o del esquema de `jobservice`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub parameters: Vec<Param>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Infraestructura creada por el propio gateway (ej: VM aprovisionada)
    #[serde(rename = "virtual", default)]
    pub is_virtual: bool,
}

fn default_true() -> bool {
    true
}

/// Qué produce una aplicación cuando termina bien.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    #[default]
    Job,
    Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub outcome: Outcome,
    /// Ejecutable y parámetros por defecto
    #[serde(default)]
    pub parameters: Vec<Param>,
    /// Infraestructuras candidatas donde puede correr
    #[serde(default)]
    pub infrastructures: Vec<InfrastructureId>,
}
