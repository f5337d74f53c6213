//! Client side of the bus: correlates signals with the generation the user
//! is currently looking at and drives a [`Presenter`].

pub mod correlator;
pub mod presenter;
pub mod throttle;

pub use correlator::{Correlator, ExchangeOutcome, ExchangeRecord, UserCommand};
pub use presenter::{Presenter, TerminalPresenter};
pub use throttle::RenderThrottle;
