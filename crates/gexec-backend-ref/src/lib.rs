//! Reference device for the gexec runtime.
//!
//! Runs partitions as host closures while enforcing the device's memory,
//! stream and event budgets, and records every collaborator call so tests can
//! assert on ordering.

pub mod allocator;
pub mod device;

pub use allocator::{AllocatorCall, RefAllocator};
pub use device::{Kernel, RefCall, RefDevice, RefDeviceConfig};
