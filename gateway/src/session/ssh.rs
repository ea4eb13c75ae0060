use async_trait::async_trait;
use common::EffectiveParams;

use super::{required, SessionBuilder, SessionContext, SessionKind, SshAuth};
use crate::backend::InfrastructureType;
use crate::error::{GatewayError, Result};

/// Sesión SSH pelada: usuario + password o usuario + clave privada.
/// No verifica host keys.
pub struct SshSessionBuilder;

#[async_trait]
impl SessionBuilder for SshSessionBuilder {
    fn family(&self) -> InfrastructureType {
        InfrastructureType::Ssh
    }

    async fn build(&self, params: &EffectiveParams, user: &str) -> Result<SessionContext> {
        let username = required(params, "username")?.to_string();

        let auth = if let Some(password) = params.get("password") {
            SshAuth::Password(password.to_string())
        } else if let Some(key) = params.get("privatekey") {
            SshAuth::PrivateKey {
                key: key.to_string(),
                passphrase: params.get("passphrase").map(str::to_string),
            }
        } else {
            return Err(GatewayError::Infrastructure(
                "ssh necesita password o privatekey".to_string(),
            ));
        };

        Ok(SessionContext {
            user: user.to_string(),
            family: InfrastructureType::Ssh,
            kind: SessionKind::Ssh {
                username,
                auth,
                strict_host_key_checking: false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{merge, Param};

    fn params(list: &[(&str, &str)]) -> EffectiveParams {
        let v: Vec<Param> = list.iter().map(|(n, v)| Param::new(*n, *v)).collect();
        merge(&[&v])
    }

    #[tokio::test]
    async fn password_tiene_precedencia_y_sin_host_key() {
        let p = params(&[
            ("username", "ana"),
            ("password", "secreto"),
            ("privatekey", "/keys/id_rsa"),
        ]);

        let s = SshSessionBuilder.build(&p, "ana").await.unwrap();

        assert_eq!(
            s.kind,
            SessionKind::Ssh {
                username: "ana".into(),
                auth: SshAuth::Password("secreto".into()),
                strict_host_key_checking: false,
            }
        );
    }

    #[tokio::test]
    async fn clave_privada_con_passphrase() {
        let p = params(&[
            ("username", "ana"),
            ("privatekey", "/keys/id_rsa"),
            ("passphrase", "frase"),
        ]);

        let s = SshSessionBuilder.build(&p, "ana").await.unwrap();

        match s.kind {
            SessionKind::Ssh { auth: SshAuth::PrivateKey { key, passphrase }, .. } => {
                assert_eq!(key, "/keys/id_rsa");
                assert_eq!(passphrase.as_deref(), Some("frase"));
            }
            other => panic!("sesión inesperada: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sin_credenciales_es_error_de_infraestructura() {
        let p = params(&[("username", "ana")]);
        let err = SshSessionBuilder.build(&p, "ana").await.unwrap_err();
        assert!(err.is_configuration());

        let p = params(&[("password", "x")]);
        let err = SshSessionBuilder.build(&p, "ana").await.unwrap_err();
        assert!(matches!(err, GatewayError::Infrastructure(ref m) if m.contains("username")));
    }
}
