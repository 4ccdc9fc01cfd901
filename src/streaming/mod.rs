//! Fan-out of the single upstream to any number of HTTP clients

mod distributor;
mod relay;

pub use distributor::{ClientSession, DistributorStats, FrameDistributor, FramedChunk};
pub use relay::{Relay, RelayHandle, RelayMonitor, RelayStats};
