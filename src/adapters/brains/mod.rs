//! Brain adapters.

pub mod mock;

pub use mock::{MockBrain, MockReply};
