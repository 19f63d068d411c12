//! Limit how many CPU-hungry external processes run at once.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core, shared by every `pdftocairo` we launch.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Run `f` while holding a CPU permit.
///
/// In-process CPU work should use
/// [`spawn_blocking_propagating_panics`](crate::async_utils::spawn_blocking_propagating_panics)
/// instead. This is for external renderers that each saturate a core.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let _permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    f().await
}
