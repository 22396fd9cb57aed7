pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod geo;
pub mod matching;
pub mod model;
pub mod offers;
pub mod pricing;
pub mod resolver;
pub mod rides;
pub mod spatial;
pub mod store;
pub mod territory;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::EngineConfig;
pub use engine::{Decision, DispatchEngine, EngineBuilder, FeeEstimate, RideReceipt, SweepReport};
pub use error::DispatchError;
