//! DRAM address translation and physical page bookkeeping.
//!
//! - [`DRAMLayout`] describes the machine's address-to-DRAM mapping
//!   (XOR bank functions plus row and column masks).
//! - [`DRAMAddr`] is one (bank, row, column) coordinate with the
//!   reversible codec between it and physical byte addresses.
//! - [`PhysPageInventory`] reserves a large memory region and records,
//!   via the kernel pagemap, which physical frames the process owns.

mod addr;
mod inventory;
mod layout;

pub use self::addr::DRAMAddr;
pub use self::inventory::{AllocPageSize, FrameNo, PhysPageInventory, free_hugepages};
pub use self::layout::{DRAMLayout, PhysAddr, VirtAddr};
