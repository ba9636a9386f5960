//! Kernel Object Naming and Ownership Tags
//!
//! Every kernel object the reconciler creates gets a deterministic name
//! derived from the owning resource ID, and an ownership tag (link alias or
//! firewall comment) that carries the ID and a parameter fingerprint. That is
//! what lets discovery map kernel state back to resources without a cache.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Tag namespace for every object this reconciler owns
pub const TAG_NAMESPACE: &str = "fabric";

/// Routing-isolation (VRF) device prefix
pub const VRF_PREFIX: &str = "vrf-";
/// Overlay segment (VXLAN) device prefix
pub const SEGMENT_PREFIX: &str = "vx-";
/// Gateway link prefix
pub const GATEWAY_PREFIX: &str = "gw-";

/// First 8 hex digits of SHA-256(id). Keeps names under IFNAMSIZ.
pub fn short_hash(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    hex::encode(&digest[..4])
}

pub fn vrf_device(domain_id: &str) -> String {
    format!("{}{}", VRF_PREFIX, short_hash(domain_id))
}

pub fn segment_device(domain_id: &str) -> String {
    format!("{}{}", SEGMENT_PREFIX, short_hash(domain_id))
}

pub fn gateway_device(gateway_id: &str) -> String {
    format!("{}{}", GATEWAY_PREFIX, short_hash(gateway_id))
}

/// Routing table owned by a domain
pub fn domain_table(table_base: u32, segment_id: u32) -> u32 {
    table_base.saturating_add(segment_id)
}

/// Fingerprint of realized parameters (12 hex digits)
///
/// Inputs must serialize deterministically: structs and `Vec`s in canonical
/// order, no `HashMap`s.
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    hex::encode(&digest[..6])
}

/// IDs end up inside `:`-separated tags and interface aliases
pub fn is_tag_safe(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Ownership tag carried by a kernel object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// Alias on a domain's overlay segment device
    Domain { id: String, fingerprint: String },
    /// Alias on a gateway link
    GatewayLink { id: String, fingerprint: String },
    /// Comment on a gateway's translation rule
    Gateway { id: String, fingerprint: String, index: usize, total: usize },
    /// Comment on a security rule set's filter rule
    RuleSet { id: String, fingerprint: String, index: usize, total: usize },
    /// Comment on a fallback isolation rule between two domains (`low < high`)
    Isolation { low: String, high: String, fingerprint: String, index: usize, total: usize },
}

impl Tag {
    /// Isolation tag with the pair put in canonical order
    pub fn isolation(a: &str, b: &str, fingerprint: &str, index: usize, total: usize) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Tag::Isolation {
            low: low.to_string(),
            high: high.to_string(),
            fingerprint: fingerprint.to_string(),
            index,
            total,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim_matches('"');
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.first() != Some(&TAG_NAMESPACE) {
            return None;
        }

        match parts.as_slice() {
            [_, "domain", id, fp] => Some(Tag::Domain {
                id: id.to_string(),
                fingerprint: fp.to_string(),
            }),
            [_, "gateway", id, fp] => Some(Tag::GatewayLink {
                id: id.to_string(),
                fingerprint: fp.to_string(),
            }),
            [_, "gateway", id, fp, pos] => {
                let (index, total) = parse_position(pos)?;
                Some(Tag::Gateway {
                    id: id.to_string(),
                    fingerprint: fp.to_string(),
                    index,
                    total,
                })
            }
            [_, "sg", id, fp, pos] => {
                let (index, total) = parse_position(pos)?;
                Some(Tag::RuleSet {
                    id: id.to_string(),
                    fingerprint: fp.to_string(),
                    index,
                    total,
                })
            }
            [_, "isolate", low, high, fp, pos] => {
                let (index, total) = parse_position(pos)?;
                Some(Tag::Isolation {
                    low: low.to_string(),
                    high: high.to_string(),
                    fingerprint: fp.to_string(),
                    index,
                    total,
                })
            }
            _ => None,
        }
    }

    /// Whether this isolation tag involves `domain_id`
    pub fn involves(&self, domain_id: &str) -> bool {
        matches!(self, Tag::Isolation { low, high, .. } if low == domain_id || high == domain_id)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Domain { id, fingerprint } => {
                write!(f, "{}:domain:{}:{}", TAG_NAMESPACE, id, fingerprint)
            }
            Tag::GatewayLink { id, fingerprint } => {
                write!(f, "{}:gateway:{}:{}", TAG_NAMESPACE, id, fingerprint)
            }
            Tag::Gateway { id, fingerprint, index, total } => write!(
                f,
                "{}:gateway:{}:{}:{}/{}",
                TAG_NAMESPACE, id, fingerprint, index, total
            ),
            Tag::RuleSet { id, fingerprint, index, total } => write!(
                f,
                "{}:sg:{}:{}:{}/{}",
                TAG_NAMESPACE, id, fingerprint, index, total
            ),
            Tag::Isolation { low, high, fingerprint, index, total } => write!(
                f,
                "{}:isolate:{}:{}:{}:{}/{}",
                TAG_NAMESPACE, low, high, fingerprint, index, total
            ),
        }
    }
}

fn parse_position(raw: &str) -> Option<(usize, usize)> {
    let (index, total) = raw.split_once('/')?;
    let index = index.parse().ok()?;
    let total = total.parse().ok()?;
    (index < total).then_some((index, total))
}
