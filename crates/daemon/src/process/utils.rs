use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawns a task that waits for SIGINT, SIGTERM or a programmatic request and
/// then sends the shutdown signal via a watch.
///
/// Returns the join handle, the sender (for programmatic shutdown), and the receiver.
pub fn graceful_shutdown_blocker() -> (JoinHandle<()>, watch::Sender<()>, watch::Receiver<()>) {
    let (tx, rx) = tokio::sync::watch::channel(());
    let signal_tx = tx.clone();
    let mut requested = rx.clone();

    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {}
            _ = requested.changed() => {
                tracing::debug!("shutdown requested");
            }
        }

        let _ = signal_tx.send(());
    });

    (handle, tx, rx)
}

async fn wait_for_signal() {
    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "cannot listen for signals, only programmatic shutdown works");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            tracing::debug!("gracefully exiting on SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::debug!("gracefully exiting on SIGTERM");
        }
    }
}

/// Registers a panic hook that logs panics using the `tracing` crate
pub fn register_panic_logger() {
    std::panic::set_hook(Box::new(|panic| match panic.location() {
        Some(loc) => {
            tracing::error!(
                message = %panic,
                panic.file = loc.file(),
                panic.line = loc.line(),
                panic.column = loc.column(),
            );
        }
        None => tracing::error!(message = %panic),
    }));
}

pub fn report_build_info() {
    let build = common::prelude::build_info();

    tracing::info!(
        build_profile = ?build.build_profile,
        features = ?build.build_features,
        version = ?build.version,
        "server starting up"
    );
}
