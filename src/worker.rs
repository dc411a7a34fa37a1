use async_trait::async_trait;
use std::time::Duration;

use crate::swallow_panic;

/// A long-running background consumer: the invoice reconciler and the two
/// chain listeners. `run` owns one subscription; when it returns or panics
/// (the node closed the stream, a connection was lost), the worker is
/// restarted after `restart_delay`, which resubscribes from scratch.
#[async_trait]
pub trait Worker: Send {
    /// Name used when logging restarts.
    fn name(&self) -> &'static str;

    async fn run(&mut self);

    fn restart_delay(&self) -> Duration {
        Duration::from_secs(5)
    }
}

pub fn start<W: Worker + 'static>(mut worker: W) {
    tokio::spawn(async move {
        loop {
            swallow_panic(worker.run()).await;
            log::info!("{} stopped, restarting shortly", worker.name());
            tokio::time::sleep(worker.restart_delay()).await;
        }
    });
}
