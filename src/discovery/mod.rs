pub mod ssdp;

pub use ssdp::{DiscoveredPrinter, SsdpDiscovery};
