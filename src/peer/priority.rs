use std::net::{IpAddr, SocketAddr};

use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Canonical peer priority (BEP-40).
///
/// Both endpoints hash a normalized view of the pair and arrive at the
/// same value; candidate peers are dialed lowest value first. Peers that
/// share more address prefix with us are masked less and so cluster at
/// predictable priorities, spreading connection load across the swarm.
pub fn bep40_priority(a: SocketAddr, b: SocketAddr) -> u32 {
    if a.ip() == b.ip() {
        let (lo, hi) = if a.port() <= b.port() {
            (a.port(), b.port())
        } else {
            (b.port(), a.port())
        };
        let mut buf = [0u8; 4];
        buf[..2].copy_from_slice(&lo.to_be_bytes());
        buf[2..].copy_from_slice(&hi.to_be_bytes());
        return CASTAGNOLI.checksum(&buf);
    }
    match (a.ip(), b.ip()) {
        (IpAddr::V4(x), IpAddr::V4(y)) => {
            let x = x.octets();
            let y = y.octets();
            let mask: [u8; 4] = if x[..3] == y[..3] {
                [0xff, 0xff, 0xff, 0xff]
            } else if x[..2] == y[..2] {
                [0xff, 0xff, 0xff, 0x55]
            } else {
                [0xff, 0xff, 0x55, 0x55]
            };
            hash_masked_pair(&x, &y, &mask)
        }
        (IpAddr::V6(x), IpAddr::V6(y)) => {
            let x = x.octets();
            let y = y.octets();
            // The v6 analog of the v4 rule: full within /48, then
            // progressively coarser masks at /48 and /32 boundaries.
            let mut mask = [0x55u8; 16];
            let full = if x[..6] == y[..6] {
                16
            } else if x[..4] == y[..4] {
                6
            } else {
                4
            };
            mask[..full].fill(0xff);
            hash_masked_pair(&x, &y, &mask)
        }
        // Mixed families never share a transport; fall back to the raw
        // octets so the value is still deterministic.
        (x, y) => {
            let xb = ip_octets(x);
            let yb = ip_octets(y);
            let (lo, hi) = if xb <= yb { (xb, yb) } else { (yb, xb) };
            let mut buf = lo;
            buf.extend_from_slice(&hi);
            CASTAGNOLI.checksum(&buf)
        }
    }
}

fn hash_masked_pair(x: &[u8], y: &[u8], mask: &[u8]) -> u32 {
    let xm: Vec<u8> = x.iter().zip(mask).map(|(b, m)| b & m).collect();
    let ym: Vec<u8> = y.iter().zip(mask).map(|(b, m)| b & m).collect();
    let (lo, hi) = if xm <= ym { (xm, ym) } else { (ym, xm) };
    let mut buf = lo;
    buf.extend_from_slice(&hi);
    CASTAGNOLI.checksum(&buf)
}

fn ip_octets(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn symmetric_for_both_endpoints() {
        let a = addr("123.213.32.10:6881");
        let b = addr("98.76.54.32:51413");
        assert_eq!(bep40_priority(a, b), bep40_priority(b, a));
    }

    #[test]
    fn bep40_reference_vectors() {
        // From the BEP-40 text: crc32-c of the masked, sorted pair.
        assert_eq!(
            bep40_priority(addr("123.213.32.10:0"), addr("98.76.54.32:0")),
            0xec2d7224
        );
        assert_eq!(
            bep40_priority(addr("123.213.32.10:0"), addr("123.213.32.234:0")),
            0x99568189
        );
    }

    #[test]
    fn same_ip_hashes_ports() {
        let a = addr("10.0.0.1:6881");
        let b = addr("10.0.0.1:6882");
        let mut buf = [0u8; 4];
        buf[..2].copy_from_slice(&6881u16.to_be_bytes());
        buf[2..].copy_from_slice(&6882u16.to_be_bytes());
        assert_eq!(bep40_priority(a, b), CASTAGNOLI.checksum(&buf));
        assert_eq!(bep40_priority(a, b), bep40_priority(b, a));
    }

    #[test]
    fn closer_prefixes_change_masking() {
        let local = addr("123.213.32.10:6881");
        // Same /16 but different /24 vs completely different networks
        // should land in different hash inputs.
        let near = bep40_priority(local, addr("123.213.33.10:6881"));
        let far = bep40_priority(local, addr("140.10.33.10:6881"));
        assert_ne!(near, far);
    }

    #[test]
    fn v6_pairs_are_symmetric() {
        let a = addr("[2001:db8::1]:6881");
        let b = addr("[2001:db8:1::2]:6881");
        assert_eq!(bep40_priority(a, b), bep40_priority(b, a));
    }
}
