use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Token que se cancela al recibir SIGTERM o SIGINT. El servidor HTTP, el
/// driver de eventos y el monitor lo escuchan para drenar.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM recibido, apagando"),
            _ = sigint.recv() => info!("SIGINT recibido, apagando"),
        }
        cancel.cancel();
    });

    Ok(token)
}
