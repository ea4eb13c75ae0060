use async_trait::async_trait;
use common::EffectiveParams;

use super::{SessionBuilder, SessionContext, SessionKind};
use crate::backend::InfrastructureType;
use crate::error::Result;

/// Sesión trivial para el adaptador local: no hay credenciales.
pub struct LocalSessionBuilder;

#[async_trait]
impl SessionBuilder for LocalSessionBuilder {
    fn family(&self) -> InfrastructureType {
        InfrastructureType::Local
    }

    async fn build(&self, _params: &EffectiveParams, user: &str) -> Result<SessionContext> {
        Ok(SessionContext {
            user: user.to_string(),
            family: InfrastructureType::Local,
            kind: SessionKind::Local,
        })
    }
}
