use tokio::sync::{broadcast, oneshot};
use tracing::{error, info};

/// A helper for managing subsystem lifecycle with graceful shutdown
pub struct SubsystemHandle {
    name: String,
    shutdown_complete_rx: oneshot::Receiver<()>,
}

impl SubsystemHandle {
    pub fn new(name: impl Into<String>) -> (Self, SubsystemShutdownSignal) {
        let (shutdown_complete_tx, shutdown_complete_rx) = oneshot::channel();
        let name = name.into();

        (
            Self {
                name: name.clone(),
                shutdown_complete_rx,
            },
            SubsystemShutdownSignal {
                name,
                shutdown_complete_tx,
            },
        )
    }

    /// Wait for the subsystem to complete shutdown
    pub async fn wait_for_shutdown(self) {
        match self.shutdown_complete_rx.await {
            Ok(()) => info!("{} subsystem stopped gracefully", self.name),
            Err(_) => error!(
                "{} subsystem stopped without signaling completion",
                self.name
            ),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Signal sent by a subsystem when it completes shutdown
pub struct SubsystemShutdownSignal {
    name: String,
    shutdown_complete_tx: oneshot::Sender<()>,
}

impl SubsystemShutdownSignal {
    pub fn signal(self) {
        let _ = self.shutdown_complete_tx.send(());
    }

    pub fn signal_with_message(self, message: &str) {
        info!("{}: {}", self.name, message);
        let _ = self.shutdown_complete_tx.send(());
    }
}

/// Spawns a subsystem task. The task receives the system shutdown receiver
/// and is expected to return once it fires.
pub fn spawn_subsystem<F, Fut>(
    name: impl Into<String>,
    system_shutdown_rx: broadcast::Receiver<()>,
    task: F,
) -> SubsystemHandle
where
    F: FnOnce(broadcast::Receiver<()>) -> Fut,
    Fut: futures::Future<Output = Result<(), crate::error::CommonError>> + Send + 'static,
{
    let (handle, signal) = SubsystemHandle::new(name);
    let subsystem_name = handle.name().to_string();
    let task = task(system_shutdown_rx);

    tokio::spawn(async move {
        match task.await {
            Ok(()) => {
                signal.signal_with_message("stopped gracefully");
            }
            Err(e) => {
                error!("{} stopped with error: {:?}", subsystem_name, e);
                signal.signal();
            }
        }
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subsystem_stops_on_shutdown_signal() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_subsystem("test", shutdown_rx, |mut shutdown| async move {
            let _ = shutdown.recv().await;
            Ok(())
        });
        assert_eq!(handle.name(), "test");

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle.wait_for_shutdown())
            .await
            .unwrap();
    }
}
