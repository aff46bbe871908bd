//! Connectivity signal, abstracted away from any platform global.
//!
//! The host application owns the actual online/offline detection (OS events,
//! failed heartbeats, whatever it has) and pushes transitions into
//! [`Connectivity::set_online`]. The engine watches the channel to trigger
//! drains on restore; the interceptor reads the current value on its fast
//! path.

use tokio::sync::watch;

/// Shared connectivity state. Cheap to clone; all clones observe the same
/// channel.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    /// Starts in the given state. Clients almost always boot online.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Records a transition. Redundant updates (online while already online)
    /// are dropped so subscribers only wake on real flips.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|state| {
            if *state == online {
                false
            } else {
                *state = online;
                true
            }
        });
    }

    /// A receiver that yields on every transition. The current value is
    /// readable immediately via `borrow`.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_wake_only_on_real_transitions() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();
        rx.mark_unchanged();

        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(false);
        assert!(rx.has_changed().unwrap());
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
        assert!(!connectivity.is_online());
    }
}
