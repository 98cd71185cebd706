//! Access-control lists: address-range predicates plus optional TSIG
//! identity, matched first-match-wins.
//!
//! `acl.c` keeps entries as an intrusive singly-linked list built once at
//! config-load time. Since our config tables are immutable after load, a
//! plain owned `Vec` plays the same role without exposing a "next"
//! pointer.

use std::net::IpAddr;

use crate::tsig::rr::TsigStatus;

//----------- RangeKind ----------------------------------------------------------

/// How an [`AclEntry`]'s address range is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeKind {
    /// Match a single address exactly.
    Single,
    /// Match `primary & mask == primary` against a peer-supplied mask.
    Mask,
    /// Match a CIDR subnet, `primary` is the network address.
    Subnet,
    /// Match `primary <= peer <= secondary` in big-endian byte order.
    MinMax,
    /// `acl.c`'s `ACL_RANGE_ANY`: matches every address. Used for
    /// default-permit configs written as a bare `*`.
    Any,
}

//----------- AclError ------------------------------------------------------------

#[derive(Debug)]
pub enum AclError {
    /// A subnet entry whose primary/secondary addresses are not the same
    /// address family, or a prefix length out of range for the family.
    InvalidSubnet { prefix: u8 },
    MixedFamily,
}

impl std::fmt::Display for AclError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AclError::InvalidSubnet { prefix } => {
                write!(f, "invalid subnet prefix length {prefix}")
            }
            AclError::MixedFamily => write!(f, "primary and secondary address families differ"),
        }
    }
}

impl std::error::Error for AclError {}

//----------- AclEntry ------------------------------------------------------------

/// One access-control entry: a range predicate plus optional port and TSIG
/// key name. Matching an entry against a peer additionally checks the
/// peer's TSIG transaction status (see [`AclEntry::matches`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclEntry {
    pub kind: RangeKind,
    pub primary: IpAddr,
    pub secondary: Option<IpAddr>,
    pub port: Option<u16>,
    /// The TSIG key name this entry requires, case-insensitively.
    pub tsig_key_name: Option<String>,
    /// The algorithm a presented key must have been verified under,
    /// case-insensitively. Stored separately from `tsig_key_name` (mirroring
    /// `acl.c`'s `acl->tsig->algorithm`, a field on the ACL's own TSIG config
    /// rather than on the key) so a key rolled from one algorithm to another
    /// doesn't silently satisfy an ACL entry still pinned to the old one.
    pub tsig_algorithm_name: Option<String>,
}

impl AclEntry {
    pub fn single(addr: IpAddr) -> Self {
        Self {
            kind: RangeKind::Single,
            primary: addr,
            secondary: None,
            port: None,
            tsig_key_name: None,
            tsig_algorithm_name: None,
        }
    }

    pub fn wildcard() -> Self {
        Self {
            kind: RangeKind::Any,
            primary: IpAddr::from([0, 0, 0, 0]),
            secondary: None,
            port: None,
            tsig_key_name: None,
            tsig_algorithm_name: None,
        }
    }

    pub fn subnet(addr: IpAddr, prefix: u8) -> Result<Self, AclError> {
        let max_prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max_prefix {
            return Err(AclError::InvalidSubnet { prefix });
        }
        let network = apply_mask(addr, prefix);
        Ok(Self {
            kind: RangeKind::Subnet,
            primary: network,
            secondary: Some(IpAddr::from(prefix_len_to_mask(addr, prefix))),
            port: None,
            tsig_key_name: None,
            tsig_algorithm_name: None,
        })
    }

    pub fn min_max(min: IpAddr, max: IpAddr) -> Result<Self, AclError> {
        if std::mem::discriminant(&min) != std::mem::discriminant(&max) {
            return Err(AclError::MixedFamily);
        }
        Ok(Self {
            kind: RangeKind::MinMax,
            primary: min,
            secondary: Some(max),
            port: None,
            tsig_key_name: None,
            tsig_algorithm_name: None,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Require a verified TSIG signed with `key_name`, compared
    /// case-insensitively against [`VerifiedTsig::key_name`].
    pub fn with_tsig_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.tsig_key_name = Some(key_name.into());
        self
    }

    /// Pin the algorithm a presented key must have been verified under. Set
    /// separately from [`Self::with_tsig_key_name`] since config loading
    /// resolves it from the named key's registry entry only once the whole
    /// file (and thus every `[[tsig_key]]` table) has been parsed.
    pub fn with_tsig_algorithm(mut self, algorithm_name: impl Into<String>) -> Self {
        self.tsig_algorithm_name = Some(algorithm_name.into());
        self
    }

    fn matches_range(&self, peer: IpAddr) -> bool {
        if self.kind != RangeKind::Any && std::mem::discriminant(&self.primary) != std::mem::discriminant(&peer) {
            return false;
        }

        match self.kind {
            RangeKind::Any => true,
            RangeKind::Single => self.primary == peer,
            RangeKind::Subnet => {
                let mask = self.secondary.expect("subnet entry always has a mask");
                apply_raw_mask(peer, mask) == self.primary
            }
            RangeKind::Mask => {
                let mask = self.secondary.expect("mask entry always has a mask");
                apply_raw_mask(peer, mask) == self.primary
            }
            RangeKind::MinMax => {
                let max = self.secondary.expect("minmax entry always has a max");
                be_le(self.primary, peer) && be_le(peer, max)
            }
        }
    }

    /// Match this entry against a peer address/port and an observed TSIG
    /// transaction status.
    ///
    /// TSIG match rules: if the entry names no key, only unsigned queries
    /// match; if it names a key, the query must carry a verified TSIG with
    /// that exact key name, and, if the entry also pins an algorithm, that
    /// exact algorithm too — otherwise a key rolled to a new algorithm (or
    /// a same-named key registered under a weaker one) would still satisfy
    /// an entry written for the old algorithm.
    pub fn matches(&self, peer: IpAddr, peer_port: u16, tsig: &Option<VerifiedTsig>) -> bool {
        if !self.matches_range(peer) {
            return false;
        }
        if let Some(port) = self.port {
            if port != peer_port {
                return false;
            }
        }
        match (&self.tsig_key_name, tsig) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(_), None) => false,
            (Some(wanted), Some(seen)) => {
                let algorithm_matches = match &self.tsig_algorithm_name {
                    Some(wanted_algorithm) => wanted_algorithm.eq_ignore_ascii_case(&seen.algorithm_name),
                    None => true,
                };
                seen.status == TsigStatus::Ok
                    && wanted.eq_ignore_ascii_case(&seen.key_name)
                    && algorithm_matches
                    && seen.error_is_noerror()
            }
        }
    }
}

/// What an ACL match needs to know about a query's TSIG, decoupled from
/// the full transaction state so `acl` doesn't depend on `tsig::rr`'s
/// HMAC machinery.
#[derive(Clone, Debug)]
pub struct VerifiedTsig {
    pub status: TsigStatus,
    pub key_name: String,
    pub algorithm_name: String,
    pub rcode: u8,
}

impl VerifiedTsig {
    fn error_is_noerror(&self) -> bool {
        self.rcode == 0
    }
}

//----------- AclChain -------------------------------------------------------------

/// An ordered list of [`AclEntry`] values, matched first-match-wins.
#[derive(Clone, Debug, Default)]
pub struct AclChain {
    entries: Vec<AclEntry>,
}

impl AclChain {
    pub fn new(entries: Vec<AclEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the first matching entry, if any.
    pub fn find_match(
        &self,
        peer: IpAddr,
        peer_port: u16,
        tsig: &Option<VerifiedTsig>,
    ) -> Option<&AclEntry> {
        self.entries
            .iter()
            .find(|entry| entry.matches(peer, peer_port, tsig))
    }

    pub fn allows(&self, peer: IpAddr, peer_port: u16, tsig: &Option<VerifiedTsig>) -> bool {
        self.find_match(peer, peer_port, tsig).is_some()
    }
}

//----------- helpers --------------------------------------------------------------

fn prefix_len_to_mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(_) => {
            let mask: u32 = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix)
            };
            IpAddr::from(mask.to_be_bytes())
        }
        IpAddr::V6(_) => {
            let mask: u128 = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix)
            };
            IpAddr::from(mask.to_be_bytes())
        }
    }
}

fn apply_mask(addr: IpAddr, prefix: u8) -> IpAddr {
    let mask = prefix_len_to_mask(addr, prefix);
    apply_raw_mask(addr, mask)
}

fn apply_raw_mask(addr: IpAddr, mask: IpAddr) -> IpAddr {
    match (addr, mask) {
        (IpAddr::V4(a), IpAddr::V4(m)) => {
            let a = u32::from_be_bytes(a.octets());
            let m = u32::from_be_bytes(m.octets());
            IpAddr::from((a & m).to_be_bytes())
        }
        (IpAddr::V6(a), IpAddr::V6(m)) => {
            let a = u128::from_be_bytes(a.octets());
            let m = u128::from_be_bytes(m.octets());
            IpAddr::from((a & m).to_be_bytes())
        }
        _ => addr,
    }
}

/// Per-byte big-endian `a <= b`, used for MINMAX ranges.
fn be_le(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets() <= b.octets(),
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets() <= b.octets(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn single_matches_exact_address_only() {
        let chain = AclChain::new(vec![AclEntry::single(addr("192.0.2.1"))]);
        assert!(chain.allows(addr("192.0.2.1"), 53, &None));
        assert!(!chain.allows(addr("192.0.2.2"), 53, &None));
    }

    #[test]
    fn subnet_matches_whole_range() {
        let entry = AclEntry::subnet(addr("192.0.2.0"), 24).unwrap();
        let chain = AclChain::new(vec![entry]);
        assert!(chain.allows(addr("192.0.2.200"), 53, &None));
        assert!(!chain.allows(addr("192.0.3.1"), 53, &None));
    }

    #[test]
    fn minmax_is_inclusive_both_ends() {
        let entry = AclEntry::min_max(addr("192.0.2.10"), addr("192.0.2.20")).unwrap();
        let chain = AclChain::new(vec![entry]);
        assert!(chain.allows(addr("192.0.2.10"), 53, &None));
        assert!(chain.allows(addr("192.0.2.20"), 53, &None));
        assert!(!chain.allows(addr("192.0.2.21"), 53, &None));
    }

    #[test]
    fn wildcard_matches_anything() {
        let chain = AclChain::new(vec![AclEntry::wildcard()]);
        assert!(chain.allows(addr("203.0.113.9"), 53, &None));
        assert!(chain.allows(addr("::1"), 53, &None));
    }

    #[test]
    fn tsig_rules_require_exact_match() {
        let entry = AclEntry::single(addr("192.0.2.1"))
            .with_tsig_key_name("example-key.")
            .with_tsig_algorithm("hmac-sha256.");
        let chain = AclChain::new(vec![entry]);

        // No TSIG presented at all: rejected, a key is required.
        assert!(!chain.allows(addr("192.0.2.1"), 53, &None));

        let good = Some(VerifiedTsig {
            status: TsigStatus::Ok,
            key_name: "Example-Key.".into(),
            algorithm_name: "HMAC-SHA256.".into(),
            rcode: 0,
        });
        assert!(chain.allows(addr("192.0.2.1"), 53, &good));

        let wrong_key = Some(VerifiedTsig {
            status: TsigStatus::Ok,
            key_name: "other-key.".into(),
            algorithm_name: "hmac-sha256.".into(),
            rcode: 0,
        });
        assert!(!chain.allows(addr("192.0.2.1"), 53, &wrong_key));

        // Same key name, but verified under a different algorithm than the
        // entry requires: an operator rolling a key from sha1 to sha256
        // shouldn't have an entry pinned to sha256 accept the old signature.
        let downgraded_algorithm = Some(VerifiedTsig {
            status: TsigStatus::Ok,
            key_name: "example-key.".into(),
            algorithm_name: "hmac-sha1.".into(),
            rcode: 0,
        });
        assert!(!chain.allows(addr("192.0.2.1"), 53, &downgraded_algorithm));
    }

    #[test]
    fn first_match_wins() {
        let deny_all = AclEntry::subnet(addr("192.0.2.0"), 24).unwrap();
        let allow_one = AclEntry::single(addr("192.0.2.5"));
        // Put the broader (but still only "allow") entry first: since ACLs
        // here are permit lists, first-match-wins just means the first
        // entry's predicate decides, not later ones.
        let chain = AclChain::new(vec![deny_all, allow_one]);
        assert!(chain.allows(addr("192.0.2.5"), 53, &None));
        assert_eq!(chain.find_match(addr("192.0.2.5"), 53, &None).unwrap().kind, RangeKind::Subnet);
    }
}
