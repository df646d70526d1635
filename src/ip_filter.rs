//! IP range blocklist with O(log n) lookup.
//!
//! Ranges are normalized to inclusive integer intervals per family,
//! sorted and merged once at construction, then queried by binary
//! search. Rule syntax covers single addresses, `start-end` ranges and
//! CIDR blocks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Default, Clone)]
pub struct IpFilter {
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
}

impl IpFilter {
    /// Parses one rule per line; `#` starts a comment.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut filter = Self::default();
        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            filter
                .add_rule(line)
                .map_err(|err| format!("blocklist line {}: {}", line_no + 1, err))?;
        }
        filter.normalize();
        Ok(filter)
    }

    pub fn from_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = (IpAddr, IpAddr)>,
    {
        let mut filter = Self::default();
        for (start, end) in ranges {
            match (start, end) {
                (IpAddr::V4(s), IpAddr::V4(e)) => filter.v4.push(ordered(u32::from(s), u32::from(e))),
                (IpAddr::V6(s), IpAddr::V6(e)) => {
                    filter.v6.push(ordered(u128::from(s), u128::from(e)))
                }
                _ => {}
            }
        }
        filter.normalize();
        filter
    }

    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => lookup(&self.v4, u32::from(ip)),
            IpAddr::V6(ip) => lookup(&self.v6, u128::from(ip)),
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    fn add_rule(&mut self, rule: &str) -> Result<(), String> {
        if let Some((start, end)) = rule.split_once('-') {
            let start = IpAddr::from_str(start.trim()).map_err(|_| "invalid start ip")?;
            let end = IpAddr::from_str(end.trim()).map_err(|_| "invalid end ip")?;
            match (start, end) {
                (IpAddr::V4(s), IpAddr::V4(e)) => {
                    self.v4.push(ordered(u32::from(s), u32::from(e)));
                }
                (IpAddr::V6(s), IpAddr::V6(e)) => {
                    self.v6.push(ordered(u128::from(s), u128::from(e)));
                }
                _ => return Err("mixed ip families".into()),
            }
            Ok(())
        } else if let Some((base, prefix)) = rule.split_once('/') {
            let base = IpAddr::from_str(base.trim()).map_err(|_| "invalid cidr ip")?;
            let prefix: u8 = prefix.trim().parse().map_err(|_| "invalid cidr prefix")?;
            match base {
                IpAddr::V4(ip) => self.v4.push(cidr_v4(ip, prefix)?),
                IpAddr::V6(ip) => self.v6.push(cidr_v6(ip, prefix)?),
            }
            Ok(())
        } else {
            match IpAddr::from_str(rule).map_err(|_| "invalid ip")? {
                IpAddr::V4(ip) => self.v4.push((u32::from(ip), u32::from(ip))),
                IpAddr::V6(ip) => self.v6.push((u128::from(ip), u128::from(ip))),
            }
            Ok(())
        }
    }

    fn normalize(&mut self) {
        normalize(&mut self.v4);
        normalize(&mut self.v6);
    }
}

fn ordered<T: Ord>(a: T, b: T) -> (T, T) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn normalize<T: Ord + Copy>(ranges: &mut Vec<(T, T)>) {
    ranges.sort_unstable();
    let mut merged: Vec<(T, T)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges.iter() {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end => {
                if end > *last_end {
                    *last_end = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }
    *ranges = merged;
}

fn lookup<T: Ord + Copy>(ranges: &[(T, T)], value: T) -> bool {
    let idx = ranges.partition_point(|&(start, _)| start <= value);
    idx > 0 && value <= ranges[idx - 1].1
}

fn cidr_v4(ip: Ipv4Addr, prefix: u8) -> Result<(u32, u32), String> {
    if prefix > 32 {
        return Err("cidr prefix out of range".into());
    }
    let value = u32::from(ip);
    let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
    Ok((value & mask, (value & mask) | !mask))
}

fn cidr_v6(ip: Ipv6Addr, prefix: u8) -> Result<(u128, u128), String> {
    if prefix > 128 {
        return Err("cidr prefix out of range".into());
    }
    let value = u128::from(ip);
    let mask = if prefix == 0 {
        0
    } else {
        !0u128 << (128 - prefix)
    };
    Ok((value & mask, (value & mask) | !mask))
}
