//! Construcción de sesiones autenticadas contra una infraestructura.
//!
//! Un `SessionBuilder` por familia de backend; el dispatcher elige cuál usar.

pub mod cloud;
pub mod grid;
pub mod local;
pub mod ssh;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use common::EffectiveParams;
use tracing::debug;

use crate::backend::InfrastructureType;
use crate::credentials::CredentialProvider;
use crate::error::{GatewayError, Result};

/// Pistas para el broker de grid (sólo infraestructuras con broker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerHints {
    pub retry_count: u32,
    pub shallow_retry_count: u32,
    pub rank: Option<String>,
    pub requirements: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshKeyPair {
    pub user: Option<String>,
    pub public_key: String,
    pub private_key: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

// Sin secretos en los logs
impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(***)"),
            SshAuth::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"***")
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Grid {
        proxy: String,
        broker: Option<BrokerHints>,
    },
    Cloud {
        proxy: String,
        keypair: SshKeyPair,
    },
    Ssh {
        username: String,
        auth: SshAuth,
        /// Siempre false: los hosts suelen ser efímeros o desconocidos.
        strict_host_key_checking: bool,
    },
    Local,
}

/// Contexto autenticado listo para lanzar/consultar jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user: String,
    pub family: InfrastructureType,
    pub kind: SessionKind,
}

#[async_trait]
pub trait SessionBuilder: Send + Sync {
    fn family(&self) -> InfrastructureType;

    async fn build(&self, params: &EffectiveParams, user: &str) -> Result<SessionContext>;
}

/// Builder concreto para una familia. Las familias reconocidas sin
/// adaptador fallan con `NotImplemented`.
pub fn builder_for(
    family: InfrastructureType,
    credentials: CredentialProvider,
) -> Result<Box<dyn SessionBuilder>> {
    let builder: Box<dyn SessionBuilder> = match family {
        InfrastructureType::Wms => Box::new(grid::GridSessionBuilder::with_broker(credentials)),
        InfrastructureType::Cream => Box::new(grid::GridSessionBuilder::direct(credentials)),
        InfrastructureType::Rocci => Box::new(cloud::CloudSessionBuilder::new(credentials)),
        InfrastructureType::Ssh => Box::new(ssh::SshSessionBuilder),
        InfrastructureType::Local => Box::new(local::LocalSessionBuilder),
        InfrastructureType::Unicore | InfrastructureType::Gos | InfrastructureType::Wsgram => {
            return Err(GatewayError::NotImplemented(family.to_string()))
        }
    };
    Ok(builder)
}

/// Builder + la última sesión construida. Una instancia por tarea.
pub struct CachedSession {
    builder: Box<dyn SessionBuilder>,
    cached: Option<Arc<SessionContext>>,
}

impl CachedSession {
    pub fn new(builder: Box<dyn SessionBuilder>) -> Self {
        Self {
            builder,
            cached: None,
        }
    }

    pub fn family(&self) -> InfrastructureType {
        self.builder.family()
    }

    /// Devuelve la sesión cacheada salvo que se pida `renew`.
    pub async fn get(
        &mut self,
        params: &EffectiveParams,
        user: &str,
        renew: bool,
    ) -> Result<Arc<SessionContext>> {
        if !renew {
            if let Some(ref s) = self.cached {
                return Ok(s.clone());
            }
        }

        debug!("construyendo sesión {} para {}", self.builder.family(), user);
        let session = Arc::new(self.builder.build(params, user).await?);
        self.cached = Some(session.clone());
        Ok(session)
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }
}

/// Entero opcional con default; mal formado es error de infraestructura.
pub(crate) fn parse_u32(params: &EffectiveParams, name: &str, default: u32) -> Result<u32> {
    match params.get(name) {
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
            GatewayError::Infrastructure(format!("{name} no es un entero válido: {raw}"))
        }),
        None => Ok(default),
    }
}

pub(crate) fn required<'a>(params: &'a EffectiveParams, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .ok_or_else(|| GatewayError::Infrastructure(format!("falta el parámetro {name}")))
}

/// Las familias con credencial delegada no pueden seguir con una vacía.
pub(crate) fn non_empty_proxy(proxy: String, family: InfrastructureType) -> Result<String> {
    if proxy.trim().is_empty() {
        return Err(GatewayError::Infrastructure(format!(
            "credencial vacía para la sesión {family}"
        )));
    }
    Ok(proxy)
}
