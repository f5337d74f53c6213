//! HTTP surface of the session bus.

pub mod bus_api;
pub mod status_api;

pub use bus_api::{clear_history, signals, start_streaming, stop_generation};
pub use status_api::{get_status, set_reasoning_enabled};
