//! Connectivity signal collaborator.
//!
//! The environment (OS network monitor, browser `online` events, a test)
//! publishes whether the device is offline; the offline queue listens.

use tokio::sync::watch;

/// Publisher side of the "is offline" signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Connectivity {
    offline: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(offline: bool) -> Self {
        let (tx, _) = watch::channel(offline);
        Self { offline: tx }
    }

    pub fn online() -> Self {
        Self::new(false)
    }

    pub fn is_offline(&self) -> bool {
        *self.offline.borrow()
    }

    /// Publish a new value. Subscribers are only woken on an actual change.
    pub fn set_offline(&self, offline: bool) {
        self.offline.send_if_modified(|current| {
            if *current == offline {
                false
            } else {
                tracing::info!(offline, "connectivity changed");
                *current = offline;
                true
            }
        });
    }

    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.offline.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let signal = Connectivity::new(true);
        let mut rx = signal.subscribe();
        signal.set_offline(true);
        assert!(!rx.has_changed().unwrap());

        signal.set_offline(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!signal.is_offline());
    }
}
