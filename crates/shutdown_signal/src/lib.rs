use std::future::Future;
use std::pin::Pin;

use cfg_if::cfg_if;
use futures::{future::Shared, FutureExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

cfg_if! {
    if #[cfg(windows)] {
        use tokio::signal::windows::*;

        async fn raw_shutdown_signal() {
            let (Ok(mut ctrl_c), Ok(mut ctrl_close), Ok(mut ctrl_shutdown)) =
                (ctrl_c(), ctrl_close(), ctrl_shutdown())
            else {
                warn!("Could not attach console shutdown handlers, only programmatic shutdown is available");
                return futures::future::pending::<()>().await;
            };
            select! {
                _ = ctrl_c.recv() => (),
                _ = ctrl_close.recv() => (),
                _ = ctrl_shutdown.recv() => (),
            }
        }
    } else if #[cfg(unix)] {
        use tokio::signal::unix::*;

        async fn unix_shutdown_signal(signal_kind: SignalKind) {
            match signal(signal_kind) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Could not listen to unix signal {:?}", signal_kind);
                    futures::future::pending::<()>().await;
                }
            }
        }

        async fn raw_shutdown_signal() {
            select! {
                _ = unix_shutdown_signal(SignalKind::interrupt()) => (),
                _ = unix_shutdown_signal(SignalKind::terminate()) => (),
                _ = unix_shutdown_signal(SignalKind::hangup()) => (),
            };
        }
    } else {
        compile_error!("Your OS does not support shutdown signal ! Are you targeting wasm ?");
    }
}

/// Future resolving once the process should stop. Cheap to clone; every
/// clone resolves at the same time.
pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Programmatic side of a [`ShutdownSignal`].
///
/// Triggering is sticky: signals created after [`ShutdownTrigger::trigger`]
/// resolve immediately.
#[derive(Clone, Debug, Default)]
pub struct ShutdownTrigger(CancellationToken);

impl ShutdownTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Resolves on SIGINT/SIGTERM/SIGHUP (console events on windows) or when
/// `trigger` fires.
pub fn shutdown_signal(trigger: &ShutdownTrigger) -> ShutdownSignal {
    let token = trigger.0.clone();
    async move {
        select! {
            _ = raw_shutdown_signal() => {
                info!("Shutdown signal detected. Attempting graceful shutdown...");
            }
            _ = token.cancelled() => {
                info!("Shutdown requested. Attempting graceful shutdown...");
            }
        }
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_resolves_every_clone() {
        let trigger = ShutdownTrigger::new();
        let signal = shutdown_signal(&trigger);
        let other = signal.clone();

        assert!(
            tokio::time::timeout(Duration::from_millis(20), signal.clone())
                .await
                .is_err(),
            "signal should stay pending until triggered"
        );

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("signal should resolve");
        tokio::time::timeout(Duration::from_secs(1), other)
            .await
            .expect("clone should resolve");
    }

    #[tokio::test]
    async fn trigger_before_creation_is_not_lost() {
        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        assert!(trigger.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), shutdown_signal(&trigger))
            .await
            .expect("signal should resolve immediately");
    }
}
