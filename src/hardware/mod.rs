//! Acquisition backends.
//!
//! Built-in [`Source`](crate::source::Source) implementations and the registry that
//! creates them from configuration.

pub mod mock;
pub(crate) mod producer;
pub mod registry;
pub mod simulator;

pub use mock::{MockConfig, MockSource};
pub use registry::{SourceFactory, SourceRegistry};
pub use simulator::{Simulator, SimulatorConfig};
