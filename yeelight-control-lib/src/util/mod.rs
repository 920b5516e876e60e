// Persistence of known devices, keyed by ip.
pub mod cache;

// Multicast search for devices on the local network.
pub mod discovery;
