#![forbid(unsafe_code)]

// chatswarm library - load-testing and behavioral-simulation harness for an
// event-protocol chat platform

pub mod api;
pub mod client;
pub mod driver;
pub mod protocol;
pub mod server;
pub mod sim;
pub mod stats;
