use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first SIGINT, SIGTERM or SIGHUP.
///
/// Handlers are registered before this returns, so a signal delivered right
/// after startup is not lost.
pub fn install(token: CancellationToken) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
            _ = token.cancelled() => return,
        };
        tracing::info!(signal = name, "received signal, shutting down");
        token.cancel();
    }))
}
