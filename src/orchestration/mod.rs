//! The orchestration layer: public batch API, queue routing, initial
//! dispatch, and the worker-side processors that drive batch state.

mod builder;
mod chain_processor;
mod compensation;
mod dispatcher;
mod manager;
mod parallel_processor;
mod queue_resolver;

pub use builder::BatchBuilder;
pub use chain_processor::ChainProcessor;
pub use manager::BatchManager;
pub use parallel_processor::ParallelProcessor;
pub use queue_resolver::QueueResolver;

use crate::messaging::{JobEnvelope, JobResponse};
use crate::registry::{HandlerRegistry, JobOutcome};
use tracing::warn;

/// Execute a callback envelope. Callbacks live outside the batch's job
/// set: they never touch counters, and a failing callback is logged and
/// acknowledged rather than fed back into the batch.
pub(crate) async fn run_callback(registry: &HandlerRegistry, envelope: &JobEnvelope) -> JobResponse {
    let Some(mut handler) = registry.instantiate(&envelope.class) else {
        warn!(class = %envelope.class, "callback class is not registered");
        return JobResponse::Reject;
    };

    match handler.execute(&envelope.args).await {
        Ok(JobOutcome::Complete) => JobResponse::Ack,
        Ok(JobOutcome::Reject) => JobResponse::Reject,
        Ok(JobOutcome::Requeue) => JobResponse::Requeue,
        Err(error) => {
            warn!(class = %envelope.class, %error, "callback job failed");
            JobResponse::Ack
        }
    }
}
