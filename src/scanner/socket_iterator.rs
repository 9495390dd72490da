use itertools::{Itertools, Product};
use std::net::{IpAddr, SocketAddr};

/// Yields every (address, port) pair as a `SocketAddr`.
///
/// Ports form the outer loop so consecutive probes hit different hosts
/// rather than hammering one host port after port.
pub struct SocketIterator<'s> {
    product_it: Product<std::slice::Iter<'s, u16>, std::slice::Iter<'s, IpAddr>>,
}

impl<'s> SocketIterator<'s> {
    pub fn new(ips: &'s [IpAddr], ports: &'s [u16]) -> Self {
        Self {
            product_it: ports.iter().cartesian_product(ips.iter()),
        }
    }
}

impl Iterator for SocketIterator<'_> {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<Self::Item> {
        self.product_it
            .next()
            .map(|(port, ip)| SocketAddr::new(*ip, *port))
    }
}
