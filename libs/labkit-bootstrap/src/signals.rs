use std::fmt;

use tokio::signal;

/// The signal that ended [`wait_for_shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    CtrlC,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CtrlC => "SIGINT",
            Self::Terminate => "SIGTERM",
        })
    }
}

/// Resolve on the first of Ctrl+C or SIGTERM.
///
/// # Errors
/// Returns an error if a signal handler cannot be installed.
pub async fn wait_for_shutdown() -> std::io::Result<ShutdownSignal> {
    let received = tokio::select! {
        res = ctrl_c() => res?,
        res = terminate() => res?,
    };
    tracing::info!(signal = %received, "Shutdown requested");
    Ok(received)
}

async fn ctrl_c() -> std::io::Result<ShutdownSignal> {
    signal::ctrl_c().await.inspect_err(|e| {
        tracing::error!(error = %e, "Cannot listen for Ctrl+C");
    })?;
    Ok(ShutdownSignal::CtrlC)
}

#[cfg(unix)]
async fn terminate() -> std::io::Result<ShutdownSignal> {
    let mut stream = signal::unix::signal(signal::unix::SignalKind::terminate()).inspect_err(|e| {
        tracing::error!(error = %e, "Cannot install SIGTERM handler");
    })?;
    stream.recv().await;
    Ok(ShutdownSignal::Terminate)
}

#[cfg(not(unix))]
async fn terminate() -> std::io::Result<ShutdownSignal> {
    std::future::pending().await
}
