//! WireGuard side of the daemon: the tunnel address space, leases on it,
//! and the kernel peers that route them.

pub mod allocator;
pub mod cidr;
pub mod device;
pub mod peer;

pub use allocator::{AddressAllocator, AllocError};
pub use cidr::Cidr;
pub use device::{KeyPair, TunnelDevice, TunnelError, WgTools};
pub use peer::TunnelPeerManager;
