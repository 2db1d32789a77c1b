use tokio::sync::watch;

/// Level-triggered open/closed flag that tasks can wait on.
///
/// Waiters re-check the flag after every change, so an `open` that happens
/// before a waiter subscribes is never missed.
pub struct Gate {
    state: watch::Sender<bool>,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        let (state, _) = watch::channel(open);
        Self { state }
    }

    pub fn open(&self) {
        self.state.send_replace(true);
    }

    pub fn close(&self) {
        self.state.send_replace(false);
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn wait_open(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = receiver.wait_for(|open| *open).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_open() {
        let gate = Gate::new(true);

        tokio::time::timeout(Duration::from_millis(50), gate.wait_open())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_open() {
        let gate = Arc::new(Gate::new(false));
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_open().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.open();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(gate.is_open());
    }
}
