// Timeout governor: races a unit of work against a wall-clock deadline.
// One deadline covers the whole test batch, not each test.

use crate::lifecycle::ContainerHandle;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, PartialEq, Eq)]
pub enum Governed<T> {
    Completed(T),
    Expired { after: Duration },
}

/// Run `work` under `deadline`. On expiry the in-flight work is dropped and the
/// container is killed without waiting for running execs to finish.
pub async fn govern<F>(deadline: Duration, handle: &ContainerHandle, work: F) -> Governed<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(deadline, work).await {
        Ok(output) => Governed::Completed(output),
        Err(_) => {
            warn!(
                container_id = %handle.id(),
                deadline_ms = deadline.as_millis() as u64,
                "Execution deadline expired, killing container"
            );
            handle.kill().await;
            Governed::Expired { after: deadline }
        }
    }
}
