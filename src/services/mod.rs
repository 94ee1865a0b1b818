//! Business logic services.
//!
//! Services contain core business logic separated from HTTP handlers.
//! They own the fulfillment state machine, the ledger, the provider client
//! and webhook ingestion; storage and the lease store sit behind traits so the
//! orchestration logic does not depend on a specific backend.

pub mod classifier;
pub mod fulfillment_client;
pub mod lease;
pub mod ledger;
pub mod orchestrator;
pub mod order_store;
pub mod webhook_service;
