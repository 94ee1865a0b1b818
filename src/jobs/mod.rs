//! Background fulfillment jobs: the Redis task queue, its backoff schedule and
//! the worker pool that drives the orchestrator.

pub mod backoff;
pub mod dispatcher;
pub mod queue;
