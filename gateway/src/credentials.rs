use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::EffectiveParams;
use reqwest::{Client, Url};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Descarga el contenido de una URL como texto.
#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String>;
}

/// Fetcher HTTP real (reqwest).
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UrlFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<String> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| GatewayError::Backend(format!("GET {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Backend(format!(
                "GET {url} devolvió status {}",
                resp.status()
            )));
        }

        resp.text()
            .await
            .map_err(|e| GatewayError::Backend(format!("leyendo respuesta de {url}: {e}")))
    }
}

fn parse_url(raw: &str, param: &str) -> Result<Url> {
    Url::parse(raw.trim())
        .map_err(|e| GatewayError::Infrastructure(format!("{param} inválido ({raw}): {e}")))
}

/// URL desde donde se baja la credencial delegada.
///
/// Precedencia: `proxyurl` directo; si no, `etokenserverurl` + token id + VO/rol + flags.
pub fn credential_url(params: &EffectiveParams, user: &str) -> Result<Url> {
    if let Some(raw) = params.get("proxyurl") {
        return parse_url(raw, "proxyurl");
    }

    let Some(server) = params.get("etokenserverurl") else {
        return Err(GatewayError::Infrastructure(
            "no hay proxyurl ni etokenserverurl configurados".to_string(),
        ));
    };

    let token_id = params.get("etokenid").ok_or_else(|| {
        GatewayError::Infrastructure("etokenserverurl sin etokenid".to_string())
    })?;

    let mut url = parse_url(server, "etokenserverurl")?;
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            GatewayError::Infrastructure(format!("etokenserverurl no admite rutas: {server}"))
        })?;
        segments.pop_if_empty().push(token_id.trim());
    }

    {
        let mut query = url.query_pairs_mut();
        if let Some(vo) = params.get("vo") {
            let voms = match params.get("vomsrole") {
                Some(role) => format!("{}:{}", vo.trim(), role.trim()),
                None => vo.trim().to_string(),
            };
            query.append_pair("voms", &voms);
        }
        query
            .append_pair(
                "proxy-renewal",
                &params.get_bool("proxyrenewal", false).to_string(),
            )
            .append_pair(
                "disable-voms-proxy",
                &params.get_bool("disablevomsproxy", false).to_string(),
            )
            .append_pair("rfc-proxy", &params.get_bool("rfcproxy", true).to_string())
            .append_pair("cn-label", user);
    }

    Ok(url)
}

/// Resuelve el proxy/token que necesitan las sesiones grid y cloud.
#[derive(Clone)]
pub struct CredentialProvider {
    fetcher: Arc<dyn UrlFetcher>,
}

impl CredentialProvider {
    pub fn new(fetcher: Arc<dyn UrlFetcher>) -> Self {
        Self { fetcher }
    }

    /// Un error de configuración se propaga; una falla al bajar la credencial
    /// se loguea y devuelve credencial vacía (la sesión fallará después).
    pub async fn resolve(&self, params: &EffectiveParams, user: &str) -> Result<String> {
        let url = credential_url(params, user)?;
        debug!("bajando credencial para {} desde {}", user, url);

        match self.fetcher.fetch(&url).await {
            Ok(body) => Ok(body),
            Err(e) => {
                warn!("no se pudo bajar la credencial desde {}: {}", url, e);
                Ok(String::new())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::{merge, Param};
    use std::sync::Mutex;

    /// Fetcher de prueba: guarda las URLs pedidas y responde fijo.
    pub(crate) struct FakeFetcher {
        pub(crate) body: Option<String>,
        pub(crate) requested: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub(crate) fn ok(body: &str) -> Self {
            Self {
                body: Some(body.to_string()),
                requested: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                body: None,
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UrlFetcher for FakeFetcher {
        async fn fetch(&self, url: &Url) -> Result<String> {
            self.requested.lock().unwrap().push(url.to_string());
            self.body
                .clone()
                .ok_or_else(|| GatewayError::Backend("conexión rechazada".to_string()))
        }
    }

    fn params(list: &[(&str, &str)]) -> EffectiveParams {
        let v: Vec<Param> = list.iter().map(|(n, v)| Param::new(*n, *v)).collect();
        merge(&[&v])
    }

    #[test]
    fn proxyurl_tiene_precedencia() {
        let p = params(&[
            ("proxyurl", "https://proxy.example.org/p/1"),
            ("etokenserverurl", "https://etoken.example.org/eTokenServer/eToken"),
        ]);

        let url = credential_url(&p, "ana").unwrap();
        assert_eq!(url.as_str(), "https://proxy.example.org/p/1");
    }

    #[test]
    fn etoken_arma_query_con_defaults() {
        let p = params(&[
            ("etokenserverurl", "https://etoken.example.org/eTokenServer/eToken"),
            ("etokenid", "abc123"),
            ("vo", "gridit"),
            ("vomsrole", "/gridit"),
        ]);

        let url = credential_url(&p, "ana").unwrap();

        assert_eq!(url.path(), "/eTokenServer/eToken/abc123");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(pairs.contains(&("voms".into(), "gridit:/gridit".into())));
        assert!(pairs.contains(&("proxy-renewal".into(), "false".into())));
        assert!(pairs.contains(&("disable-voms-proxy".into(), "false".into())));
        assert!(pairs.contains(&("rfc-proxy".into(), "true".into())));
        assert!(pairs.contains(&("cn-label".into(), "ana".into())));
    }

    #[test]
    fn sin_proxyurl_ni_etoken_es_error_de_infraestructura() {
        let p = params(&[("jobservice", "wms://wms.example.org:7443")]);
        let err = credential_url(&p, "ana").unwrap_err();
        assert!(matches!(err, GatewayError::Infrastructure(_)));
    }

    #[test]
    fn proxyurl_mal_formada_es_error_de_infraestructura() {
        let p = params(&[("proxyurl", "no es una url")]);
        let err = credential_url(&p, "ana").unwrap_err();
        assert!(matches!(err, GatewayError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn falla_de_red_devuelve_credencial_vacia() {
        let fetcher = Arc::new(FakeFetcher::failing());
        let provider = CredentialProvider::new(fetcher.clone());
        let p = params(&[("proxyurl", "https://proxy.example.org/p/1")]);

        let cred = provider.resolve(&p, "ana").await.unwrap();

        assert_eq!(cred, "");
        assert_eq!(fetcher.requested.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_exitoso_devuelve_el_cuerpo() {
        let provider = CredentialProvider::new(Arc::new(FakeFetcher::ok("-----PROXY-----")));
        let p = params(&[("proxyurl", "https://proxy.example.org/p/1")]);

        assert_eq!(provider.resolve(&p, "ana").await.unwrap(), "-----PROXY-----");
    }
}
