//! Shared utilities for mlink.

pub mod addr;

pub use addr::{BaseAddress, RelayAddress, base_address_of};
