//! Ordered CIDR-style ACL over NBD client admission.
//!
//! The final partial byte's mask is `prefix_bits % 8`, applied only to that
//! byte, with every full byte before it compared for exact equality — a
//! naive `testbits % 8` over the whole prefix length would select mask
//! index 0 (all-clear) whenever the prefix is a multiple of 8 bits short of
//! the final byte, silently accepting mismatched trailing bytes.

use std::net::IpAddr;

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn bits(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AclEntry {
    pub family: Family,
    pub address: Vec<u8>,
    pub prefix_bits: u8,
}

impl AclEntry {
    /// Parses a textual CIDR entry, e.g. `10.0.0.0/8` or `::1/128`. A bare
    /// address without a `/prefix` is treated as a full-length prefix (a
    /// single-host match).
    pub fn parse(spec: &str) -> Result<Self> {
        let (addr_part, prefix_part) = match spec.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (spec, None),
        };

        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| anyhow::anyhow!("bad IP address: {spec}"))?;

        let (family, address) = match addr {
            IpAddr::V4(v4) => (Family::V4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (Family::V6, v6.octets().to_vec()),
        };

        let max_bits = family.bits();
        let prefix_bits = match prefix_part {
            Some(p) => {
                let parsed: u8 = p.parse().map_err(|_| anyhow::anyhow!("bad prefix: {spec}"))?;
                if parsed > max_bits {
                    bail!("prefix out of range: {spec}");
                }
                parsed
            }
            None => max_bits,
        };

        Ok(Self {
            family,
            address,
            prefix_bits,
        })
    }

    fn matches(&self, family: Family, addr: &[u8]) -> bool {
        if family != self.family {
            return false;
        }

        let full_bytes = (self.prefix_bits / 8) as usize;
        let remaining_bits = self.prefix_bits % 8;

        if self.address[..full_bytes] != addr[..full_bytes] {
            return false;
        }

        if remaining_bits == 0 {
            return true;
        }

        let final_mask: u8 = !(0xFFu8 >> remaining_bits);
        (self.address[full_bytes] & final_mask) == (addr[full_bytes] & final_mask)
    }
}

/// Ordered sequence of ACL entries plus a default-allow/deny flag. Immutable
/// once constructed; replacement is by atomic swap under a lock at the
/// server layer, not by mutation here.
#[derive(Debug, Clone)]
pub struct Acl {
    entries: Vec<AclEntry>,
    default_deny: bool,
}

impl Acl {
    pub fn new(entries: Vec<AclEntry>, default_deny: bool) -> Self {
        Self {
            entries,
            default_deny,
        }
    }

    /// Parses a sequence of CIDR specs. On the first unparseable entry,
    /// returns the index of the offending spec so the caller can report it
    /// without aborting the whole control connection.
    pub fn parse_all(specs: &[String], default_deny: bool) -> Result<Self, usize> {
        let mut entries = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            match AclEntry::parse(spec) {
                Ok(entry) => entries.push(entry),
                Err(_) => return Err(i),
            }
        }
        Ok(Self::new(entries, default_deny))
    }

    pub fn includes(&self, addr: &IpAddr) -> bool {
        let (family, bytes): (Family, Vec<u8>) = match addr {
            IpAddr::V4(v4) => (Family::V4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (Family::V6, v6.octets().to_vec()),
        };

        if self.entries.iter().any(|e| e.matches(family, &bytes)) {
            return true;
        }

        !self.default_deny
    }
}

impl Default for Acl {
    /// No entries, default-allow: accepts every address. Matches the
    /// server's behavior before any `acl` control command has run.
    fn default() -> Self {
        Self::new(Vec::new(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_acl_default_allow_accepts_all() {
        let acl = Acl::new(vec![], false);
        assert!(acl.includes(&"1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn empty_acl_default_deny_rejects_all() {
        let acl = Acl::new(vec![], true);
        assert!(!acl.includes(&"1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn prefix_entry_matches_subnet() {
        let entry = AclEntry::parse("10.0.0.0/8").unwrap();
        let acl = Acl::new(vec![entry], true);
        assert!(acl.includes(&"10.1.2.3".parse().unwrap()));
        assert!(!acl.includes(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn families_are_not_cross_matched() {
        let entry = AclEntry::parse("::1/128").unwrap();
        let acl = Acl::new(vec![entry], true);
        assert!(!acl.includes(&"127.0.0.1".parse().unwrap()));
        assert!(acl.includes(&"::1".parse().unwrap()));
    }

    #[test]
    fn partial_byte_prefix_is_exact_not_all_clear() {
        // /12 leaves 4 bits of the second byte significant: 172.16.0.0/12
        // must accept 172.31.255.255 and reject 172.32.0.0, not blanket
        // accept every address sharing the first byte.
        let entry = AclEntry::parse("172.16.0.0/12").unwrap();
        let acl = Acl::new(vec![entry], true);
        assert!(acl.includes(&"172.31.255.255".parse().unwrap()));
        assert!(!acl.includes(&"172.32.0.0".parse().unwrap()));
        assert!(!acl.includes(&"173.16.0.0".parse().unwrap()));
    }

    #[test]
    fn parse_all_reports_offending_index() {
        let specs = vec!["10.0.0.0/8".to_string(), "not-an-ip".to_string()];
        let err = Acl::parse_all(&specs, false).unwrap_err();
        assert_eq!(err, 1);
    }
}
