use tokio::sync::watch;

/// Creates a linked trigger/signal pair. Signals can be cloned freely; a
/// single trigger stops all of them.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownTrigger { sender }, ShutdownSignal { receiver })
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown is requested. Dropping the trigger counts as a
    /// request.
    pub async fn triggered(&mut self) {
        if self.is_triggered() {
            return;
        }
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }
}
