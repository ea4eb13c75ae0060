use async_trait::async_trait;
use common::EffectiveParams;

use super::{non_empty_proxy, parse_u32, BrokerHints, SessionBuilder, SessionContext, SessionKind};
use crate::backend::InfrastructureType;
use crate::credentials::CredentialProvider;
use crate::error::Result;

const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_SHALLOW_RETRY_COUNT: u32 = 3;

/// Sesión grid con credencial delegada. Con broker (WMS) además lleva
/// reintentos y rank/requirements para la selección del CE.
pub struct GridSessionBuilder {
    credentials: CredentialProvider,
    broker: bool,
}

impl GridSessionBuilder {
    pub fn with_broker(credentials: CredentialProvider) -> Self {
        Self {
            credentials,
            broker: true,
        }
    }

    pub fn direct(credentials: CredentialProvider) -> Self {
        Self {
            credentials,
            broker: false,
        }
    }
}

#[async_trait]
impl SessionBuilder for GridSessionBuilder {
    fn family(&self) -> InfrastructureType {
        if self.broker {
            InfrastructureType::Wms
        } else {
            InfrastructureType::Cream
        }
    }

    async fn build(&self, params: &EffectiveParams, user: &str) -> Result<SessionContext> {
        // los parámetros del broker se validan antes de ir a la red
        let broker = if self.broker {
            Some(BrokerHints {
                retry_count: parse_u32(params, "retrycount", DEFAULT_RETRY_COUNT)?,
                shallow_retry_count: parse_u32(
                    params,
                    "shallowretrycount",
                    DEFAULT_SHALLOW_RETRY_COUNT,
                )?,
                rank: params.get("rank").map(str::to_string),
                requirements: params.get("requirements").map(str::to_string),
            })
        } else {
            None
        };

        let proxy = self.credentials.resolve(params, user).await?;
        let proxy = non_empty_proxy(proxy, self.family())?;

        Ok(SessionContext {
            user: user.to_string(),
            family: self.family(),
            kind: SessionKind::Grid { proxy, broker },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::FakeFetcher;
    use crate::error::GatewayError;
    use common::{merge, Param};
    use std::sync::Arc;

    fn params(list: &[(&str, &str)]) -> EffectiveParams {
        let v: Vec<Param> = list.iter().map(|(n, v)| Param::new(*n, *v)).collect();
        merge(&[&v])
    }

    #[tokio::test]
    async fn wms_configura_broker_con_defaults() {
        let creds = CredentialProvider::new(Arc::new(FakeFetcher::ok("PROXY")));
        let builder = GridSessionBuilder::with_broker(creds);
        let p = params(&[
            ("proxyurl", "https://proxy.example.org/p"),
            ("rank", "other.GlueCEStateFreeCPUs"),
        ]);

        let s = builder.build(&p, "ana").await.unwrap();

        match s.kind {
            SessionKind::Grid { proxy, broker } => {
                assert_eq!(proxy, "PROXY");
                let b = broker.unwrap();
                assert_eq!(b.retry_count, 3);
                assert_eq!(b.shallow_retry_count, 3);
                assert_eq!(b.rank.as_deref(), Some("other.GlueCEStateFreeCPUs"));
            }
            other => panic!("sesión inesperada: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cream_no_lleva_broker() {
        let creds = CredentialProvider::new(Arc::new(FakeFetcher::ok("PROXY")));
        let builder = GridSessionBuilder::direct(creds);
        let p = params(&[("proxyurl", "https://proxy.example.org/p")]);

        let s = builder.build(&p, "ana").await.unwrap();
        assert_eq!(s.family, InfrastructureType::Cream);
        assert!(matches!(s.kind, SessionKind::Grid { broker: None, .. }));
    }

    #[tokio::test]
    async fn credencial_vacia_falla_la_sesion() {
        let creds = CredentialProvider::new(Arc::new(FakeFetcher::failing()));
        let builder = GridSessionBuilder::direct(creds);
        let p = params(&[("proxyurl", "https://proxy.example.org/p")]);

        let err = builder.build(&p, "ana").await.unwrap_err();
        assert!(matches!(err, GatewayError::Infrastructure(ref m) if m.contains("vacía")));
    }

    #[tokio::test]
    async fn retrycount_mal_formado_falla() {
        let creds = CredentialProvider::new(Arc::new(FakeFetcher::ok("PROXY")));
        let builder = GridSessionBuilder::with_broker(creds);
        let p = params(&[
            ("proxyurl", "https://proxy.example.org/p"),
            ("retrycount", "muchos"),
        ]);

        assert!(matches!(
            builder.build(&p, "ana").await,
            Err(GatewayError::Infrastructure(_))
        ));
    }
}
