pub mod aggregated;

use anyhow::Result;

/// Sink consumes canonical events and exports them. Shutdown is driven by
/// the cancellation token passed to `start`.
pub trait Sink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Initialize the sink.
    fn start(
        &mut self,
        ctx: tokio_util::sync::CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
