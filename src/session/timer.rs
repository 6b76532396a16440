use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// At most one pending delayed message, tagged with the generation that scheduled it.
///
/// Scheduling replaces (and aborts) whatever was pending. A fire that races
/// with cancellation may still deliver its message, so receivers compare the
/// generation before acting.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` on `sink` after `delay`
    pub fn schedule<T>(&mut self, generation: u64, delay: Duration, sink: mpsc::Sender<T>, message: T)
    where
        T: Send + 'static,
    {
        self.cancel();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sink.send(message).await.is_err() {
                debug!("Timer fired after its receiver went away");
            }
        });
        self.pending = Some(Pending { generation, task });
    }

    /// Abort the pending timer; returns true when one was pending
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                let was_pending = !pending.task.is_finished();
                pending.task.abort();
                if was_pending {
                    debug!(generation = pending.generation, "Pending reconnect cancelled");
                }
                was_pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| !pending.task.is_finished())
    }
}

impl Drop for ReconnectTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
