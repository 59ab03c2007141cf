// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Address allocation within one CIDR range

use horde_common::api::external::Error;
use ipnetwork::Ipv4Network;
use slog::Logger;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::net::Ipv4Addr;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("no addresses left in {0}")]
    Exhausted(Ipv4Network),
    #[error("address {0} is not allocated")]
    NotAllocated(Ipv4Addr),
}

impl From<RangeError> for Error {
    fn from(e: RangeError) -> Self {
        match e {
            RangeError::Exhausted(_) => Error::unavail(&e.to_string()),
            RangeError::NotAllocated(_) => {
                Error::internal_error(&e.to_string())
            }
        }
    }
}

/// Hands out the addresses of one CIDR range
///
/// Addresses are handed out in order from the range's first address (the
/// address part of the CIDR, so `10.1.1.1/24` starts at `10.1.1.1`).
/// Released addresses are reused, oldest release first, before the cursor
/// advances any further.  The cursor never wraps around.  `0.0.0.0` is never
/// handed out.
///
/// Not synchronized; callers serialize access.
#[derive(Debug)]
pub struct RangeAllocator {
    log: Logger,
    network: Ipv4Network,
    /// Addresses before this one in the range are never handed out.
    block_start: u64,
    /// Next address the cursor considers, as an integer so that it can move
    /// one past `255.255.255.255`.
    cursor: u64,
    /// One past the last address of the range.
    end: u64,
    free: VecDeque<Ipv4Addr>,
    allocated: BTreeSet<Ipv4Addr>,
}

impl RangeAllocator {
    /// Creates an allocator with nothing allocated.
    pub fn new(log: &Logger, cidr: Ipv4Network) -> RangeAllocator {
        let log = log.new(o!(
            "component" => "RangeAllocator",
            "range" => cidr.to_string(),
        ));
        let base = u64::from(u32::from(cidr.network()));
        let first = u64::from(u32::from(cidr.ip())).max(1);
        RangeAllocator {
            log,
            network: cidr,
            block_start: first - base,
            cursor: first,
            end: base + (1u64 << (32 - u32::from(cidr.prefix()))),
            free: VecDeque::new(),
            allocated: BTreeSet::new(),
        }
    }

    /// Creates an allocator in which `addresses` are already allocated.
    ///
    /// Addresses outside the range are logged and skipped.
    pub fn rebuild(
        log: &Logger,
        cidr: Ipv4Network,
        addresses: impl IntoIterator<Item = Ipv4Addr>,
    ) -> RangeAllocator {
        let mut range = RangeAllocator::new(log, cidr);
        for ip in addresses {
            if range.in_range(ip) {
                range.allocated.insert(ip);
            } else {
                warn!(
                    &range.log,
                    "ignoring allocated address outside range";
                    "ip" => %ip,
                );
            }
        }
        debug!(
            &range.log,
            "rebuilt range";
            "allocated" => range.allocated.len(),
        );
        range
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    fn in_range(&self, ip: Ipv4Addr) -> bool {
        let n = u64::from(u32::from(ip));
        n >= self.first_address() && n < self.end
    }

    fn first_address(&self) -> u64 {
        u64::from(u32::from(self.network.network())) + self.block_start
    }

    /// Returns an unallocated address and marks it allocated.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, RangeError> {
        if let Some(ip) = self.free.pop_front() {
            self.allocated.insert(ip);
            return Ok(ip);
        }
        // Addresses allocated before a rebuild leave holes for the cursor to
        // skip.
        while self.cursor < self.end
            && self.allocated.contains(&to_addr(self.cursor))
        {
            self.cursor += 1;
        }
        if self.cursor >= self.end {
            return Err(RangeError::Exhausted(self.network));
        }
        let ip = to_addr(self.cursor);
        self.cursor += 1;
        self.allocated.insert(ip);
        Ok(ip)
    }

    /// Returns an address to the range.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<(), RangeError> {
        if !self.allocated.remove(&ip) {
            return Err(RangeError::NotAllocated(ip));
        }
        // Addresses at or past the cursor are found again by the cursor.
        if u64::from(u32::from(ip)) < self.cursor {
            self.free.push_back(ip);
        }
        Ok(())
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.allocated.contains(&ip)
    }

    /// Number of addresses that can still be handed out.
    pub fn available(&self) -> u64 {
        let size = self.end - u64::from(u32::from(self.network.network()));
        size - self.block_start - self.allocated.len() as u64
    }

    /// Number of addresses currently handed out.
    pub fn allocated(&self) -> usize {
        self.allocated.len()
    }
}

fn to_addr(n: u64) -> Ipv4Addr {
    Ipv4Addr::from(n as u32)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use horde_test_utils::dev;

    fn cidr(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_allocate_and_release() {
        let logctx = dev::test_setup_log("test_allocate_and_release");
        let mut range = RangeAllocator::new(&logctx.log, cidr("10.1.1.1/24"));
        assert_eq!(range.available(), 255);

        assert_eq!(range.allocate().unwrap(), ip("10.1.1.1"));
        assert_eq!(range.allocate().unwrap(), ip("10.1.1.2"));
        assert_eq!(range.allocate().unwrap(), ip("10.1.1.3"));
        assert_eq!((range.allocated(), range.available()), (3, 252));

        // Released addresses come back first, in release order.
        range.release(ip("10.1.1.2")).unwrap();
        range.release(ip("10.1.1.1")).unwrap();
        assert_eq!(
            range.release(ip("10.1.1.1")),
            Err(RangeError::NotAllocated(ip("10.1.1.1")))
        );
        assert_eq!(
            range.release(ip("10.1.1.200")),
            Err(RangeError::NotAllocated(ip("10.1.1.200")))
        );
        assert_eq!(range.allocate().unwrap(), ip("10.1.1.2"));
        assert_eq!(range.allocate().unwrap(), ip("10.1.1.1"));
        assert_eq!(range.allocate().unwrap(), ip("10.1.1.4"));
        logctx.cleanup_successful();
    }

    #[test]
    fn test_exhaustion() {
        let logctx = dev::test_setup_log("test_exhaustion");
        let mut range = RangeAllocator::new(&logctx.log, cidr("10.0.0.1/30"));
        assert_eq!(range.available(), 3);
        for last in 1..=3 {
            let expected = Ipv4Addr::new(10, 0, 0, last);
            assert_eq!(range.allocate().unwrap(), expected);
        }
        assert_eq!(range.available(), 0);
        assert_matches!(range.allocate(), Err(RangeError::Exhausted(_)));
        // Exhaustion is not sticky.
        range.release(ip("10.0.0.2")).unwrap();
        assert_eq!(range.allocate().unwrap(), ip("10.0.0.2"));
        assert_matches!(range.allocate(), Err(RangeError::Exhausted(_)));

        // The very end of the address space does not wrap.
        let mut top =
            RangeAllocator::new(&logctx.log, cidr("255.255.255.254/31"));
        assert_eq!(top.allocate().unwrap(), ip("255.255.255.254"));
        assert_eq!(top.allocate().unwrap(), ip("255.255.255.255"));
        assert_matches!(top.allocate(), Err(RangeError::Exhausted(_)));
        logctx.cleanup_successful();
    }

    #[test]
    fn test_rebuild_preserves_holes() {
        let logctx = dev::test_setup_log("test_rebuild_preserves_holes");
        let persisted = ["10.1.1.1", "10.1.1.2", "10.1.1.4", "10.9.9.9"];
        let mut range = RangeAllocator::rebuild(
            &logctx.log,
            cidr("10.1.1.1/24"),
            persisted.iter().map(|s| ip(s)),
        );
        // The address outside the range is not counted.
        assert_eq!(range.allocated(), 3);
        assert_eq!(range.available(), 252);
        assert!(range.is_allocated(ip("10.1.1.4")));
        assert!(!range.is_allocated(ip("10.9.9.9")));

        assert_eq!(range.allocate().unwrap(), ip("10.1.1.3"));
        assert_eq!(range.allocate().unwrap(), ip("10.1.1.5"));

        // An address released ahead of the cursor is found by the cursor
        // rather than the free list.
        let mut ahead = RangeAllocator::rebuild(
            &logctx.log,
            cidr("10.1.1.1/24"),
            [ip("10.1.1.3")],
        );
        ahead.release(ip("10.1.1.3")).unwrap();
        assert_eq!(ahead.allocate().unwrap(), ip("10.1.1.1"));
        assert_eq!(ahead.allocate().unwrap(), ip("10.1.1.2"));
        assert_eq!(ahead.allocate().unwrap(), ip("10.1.1.3"));
        assert_eq!(ahead.allocate().unwrap(), ip("10.1.1.4"));
        logctx.cleanup_successful();
    }

    #[test]
    fn test_rebuild_with_scattered_allocations() {
        let logctx =
            dev::test_setup_log("test_rebuild_with_scattered_allocations");
        let persisted: BTreeSet<Ipv4Addr> = [
            1, 9, 11, 12, 15, 16, 17, 100, 110, 118, 119, 125, 150, 175,
        ]
        .into_iter()
        .map(|last| Ipv4Addr::new(10, 1, 1, last))
        .collect();
        let network = cidr("10.1.1.1/24");
        let mut range = RangeAllocator::rebuild(
            &logctx.log,
            network,
            persisted.iter().copied(),
        );
        assert_eq!(range.available(), 241);

        let mut handed_out = BTreeSet::new();
        for _ in 0..239 {
            let ip = range.allocate().unwrap();
            assert!(network.contains(ip));
            assert!(!persisted.contains(&ip), "reused persisted {}", ip);
            assert!(handed_out.insert(ip), "duplicate {}", ip);
        }
        assert_eq!(range.available(), 2);
        assert_eq!(range.allocated(), 253);
        logctx.cleanup_successful();
    }

    #[test]
    fn test_zero_address_is_never_used() {
        let logctx = dev::test_setup_log("test_zero_address_is_never_used");
        let mut range = RangeAllocator::new(&logctx.log, cidr("0.0.0.0/0"));
        assert_eq!(range.allocate().unwrap(), ip("0.0.0.1"));
        assert_eq!(
            range.release(Ipv4Addr::UNSPECIFIED),
            Err(RangeError::NotAllocated(Ipv4Addr::UNSPECIFIED))
        );
        assert_eq!(range.available(), (1u64 << 32) - 2);
        logctx.cleanup_successful();
    }
}
