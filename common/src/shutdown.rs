use owo_colors::OwoColorize;

/// Resolves once SIGINT or SIGTERM is received (SIGTERM matters: it's what
/// Kubernetes sends on pod termination).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv()  => eprintln!("{}", "🛑 Received SIGINT".red()),
            _ = sigterm.recv() => eprintln!("{}", "🛑 Received SIGTERM".red()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    }
}
