mod admission;
mod error_handler;

pub use admission::{admission_gate, client_ip, identity_signals};
pub use error_handler::log_errors;
