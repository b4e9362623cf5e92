//! Utilities for testing code built on the packet channel contract. They are used for testing the
//!  crate's own components, but they are also exported for testing applications that plug their
//!  own sinks and sources into the data plane.

pub mod sink;
pub mod worker;
