// Cooperative stop signal shared by the stage workers

use tokio::sync::watch;

/// Receiving side; clone one per worker
#[derive(Clone)]
pub struct ShutdownToken {
    stopping: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_shutdown(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Resolves once a stop was requested, immediately if it already was.
    /// A dropped sender counts as a stop request.
    pub async fn wait(&mut self) {
        let _ = self.stopping.wait_for(|stopping| *stopping).await;
    }
}

pub struct ShutdownSender {
    stopping: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Workers finish their current invocation and exit
    pub fn shutdown(&self) {
        self.stopping.send_replace(true);
    }
}

pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (stopping_tx, stopping_rx) = watch::channel(false);
    (
        ShutdownSender {
            stopping: stopping_tx,
        },
        ShutdownToken {
            stopping: stopping_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_clone_observes_shutdown() {
        let (sender, token) = shutdown_channel();
        let mut a = token.clone();
        let b = token.clone();
        assert!(!a.is_shutdown());

        sender.shutdown();
        assert!(b.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), a.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_shutdown_returns_immediately() {
        let (sender, mut token) = shutdown_channel();
        sender.shutdown();
        tokio::time::timeout(Duration::from_millis(100), token.wait())
            .await
            .unwrap();
        // Repeated waits do not block either
        tokio::time::timeout(Duration::from_millis(100), token.wait())
            .await
            .unwrap();
    }
}
