//! Process-facing components (C4/C5/C6): launching modules, talking to
//! their service sockets, and decoding the counters they report.

pub mod counters;
pub mod launcher;
pub mod resource_usage;
pub mod service_channel;

pub use counters::{decode as decode_counters, DecodedCounters};
pub use launcher::spawn;
pub use service_channel::ServiceChannel;
