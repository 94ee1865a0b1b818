//! Realtime push of order status to browser clients.

pub mod notifier;
pub mod protocol;
pub mod socket;

pub use notifier::NotifierHandle;
pub use socket::ws_handler;
