//! Stateless /24 allocation inside 10.0.0.0/8.

use std::net::Ipv4Addr;

use cidr::{Ipv4Cidr, Ipv4Inet};

use crate::error::{Error, Result};

/// Prefix length of every project subnet.
pub const PROJECT_PREFIX: u8 = 24;

/// Returns the first /24 in `10.1.1.0 ..= 10.255.255.0` that intersects none
/// of `in_use`.
///
/// Candidates are visited in ascending numeric order, so the result is the
/// smallest free network. `10.x.0.0/24` and `10.0.x.0/24` are never handed out.
pub fn allocate(in_use: &[Ipv4Cidr]) -> Result<Ipv4Cidr> {
    for second in 1..=255u8 {
        for third in 1..=255u8 {
            let candidate = Ipv4Cidr::new(Ipv4Addr::new(10, second, third, 0), PROJECT_PREFIX)
                .map_err(|_| Error::SubnetExhausted)?;
            if in_use.iter().all(|used| !overlaps(used, &candidate)) {
                tracing::debug!("found free subnet {}", candidate);
                return Ok(candidate);
            }
        }
    }
    tracing::error!("no unused /24 network available in 10.0.0.0/8");
    Err(Error::SubnetExhausted)
}

/// Two CIDR blocks overlap iff one contains the other's first address.
pub fn overlaps(a: &Ipv4Cidr, b: &Ipv4Cidr) -> bool {
    a.contains(&b.first_address()) || b.contains(&a.first_address())
}

/// The first usable address of the subnet, carried by the bridge.
pub fn gateway(subnet: &Ipv4Cidr) -> Result<Ipv4Inet> {
    subnet.iter().nth(1).ok_or(Error::SubnetExhausted)
}

/// Picks the first free host address, skipping the gateway, the broadcast
/// address and everything in `used`.
pub fn free_address(subnet: &Ipv4Cidr, used: &[Ipv4Addr]) -> Option<Ipv4Inet> {
    let broadcast = subnet.last_address();
    subnet
        .iter()
        .skip(2)
        .find(|inet| inet.address() != broadcast && !used.contains(&inet.address()))
}
