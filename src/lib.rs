//! Topup fulfillment service.
//!
//! Fulfills prepaid top-up orders after payment settles: debits the
//! application balance, calls the fulfillment provider, persists the outcome,
//! retries transient failures and pushes status changes to subscribed clients.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (webhooks, status lookup, WebSocket channel)
//! - **Database**: PostgreSQL with sqlx (orders, products, balance)
//! - **Queue / Leases**: Redis (priority lanes, delayed set, per-order leases)
//! - **Format**: JSON requests/responses

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod realtime;
pub mod services;
pub mod state;
