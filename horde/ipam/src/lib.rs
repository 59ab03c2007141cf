// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPv4 address management for devices attaching through an APN
//!
//! Each NAS of an APN hands out addresses from one CIDR range.  The
//! [`IpAllocator`] owns an in-memory [`RangeAllocator`] per NAS, built lazily
//! from the allocations persisted in the APN store, and persists every
//! address it hands out.  Which ranges exist is read from an
//! [`ApnConfigCache`] that can be reloaded while the allocator runs.

mod allocator;
mod config;
mod range;

pub use allocator::IpAllocator;
pub use config::ApnConfig;
pub use config::ApnConfigCache;
pub use config::ApnEntry;
pub use config::NasEntry;
pub use range::RangeAllocator;
pub use range::RangeError;

#[macro_use]
extern crate slog;
