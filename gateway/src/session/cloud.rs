use async_trait::async_trait;
use common::EffectiveParams;

use super::{non_empty_proxy, required, SessionBuilder, SessionContext, SessionKind, SshKeyPair};
use crate::backend::InfrastructureType;
use crate::credentials::CredentialProvider;
use crate::error::Result;

/// Sesión cloud (OCCI): credencial delegada + par de claves SSH para
/// entrar a la VM una vez aprovisionada.
pub struct CloudSessionBuilder {
    credentials: CredentialProvider,
}

impl CloudSessionBuilder {
    pub fn new(credentials: CredentialProvider) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl SessionBuilder for CloudSessionBuilder {
    fn family(&self) -> InfrastructureType {
        InfrastructureType::Rocci
    }

    async fn build(&self, params: &EffectiveParams, user: &str) -> Result<SessionContext> {
        let keypair = SshKeyPair {
            user: params.get("user").map(str::to_string),
            public_key: required(params, "publickey")?.to_string(),
            private_key: required(params, "privatekey")?.to_string(),
        };

        let proxy = self.credentials.resolve(params, user).await?;
        let proxy = non_empty_proxy(proxy, self.family())?;

        Ok(SessionContext {
            user: user.to_string(),
            family: self.family(),
            kind: SessionKind::Cloud { proxy, keypair },
        })
    }
}
