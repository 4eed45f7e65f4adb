//! Compound endpoint identifiers
//!
//! An endpoint can be addressed by any of its known names using a string of
//! the form `<prefix>:<value>`, e.g. `container-id:4a2b...` or
//! `ipv4:10.0.0.12`. A string without a prefix is a local numeric ID.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Largest numeric endpoint ID handed out on this host.
pub const MAX_ENDPOINT_ID: u16 = 4095;

/// Smallest numeric endpoint ID handed out on this host. 0 means "unassigned".
pub const MIN_ENDPOINT_ID: u16 = 1;

/// The kind of name carried by a compound identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrefixType {
    /// Numeric endpoint ID, unique on this host
    CiliumLocal,
    /// Cluster-wide endpoint ID; not resolvable by a single host
    CiliumGlobal,
    ContainerId,
    DockerEndpoint,
    ContainerName,
    /// `namespace/pod` of the owning pod
    PodName,
    Ipv4,
    Ipv6,
}

impl PrefixType {
    pub const ALL: [PrefixType; 8] = [
        PrefixType::CiliumLocal,
        PrefixType::CiliumGlobal,
        PrefixType::ContainerId,
        PrefixType::DockerEndpoint,
        PrefixType::ContainerName,
        PrefixType::PodName,
        PrefixType::Ipv4,
        PrefixType::Ipv6,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrefixType::CiliumLocal => "cilium-local",
            PrefixType::CiliumGlobal => "cilium-global",
            PrefixType::ContainerId => "container-id",
            PrefixType::DockerEndpoint => "docker-endpoint",
            PrefixType::ContainerName => "container-name",
            PrefixType::PodName => "pod-name",
            PrefixType::Ipv4 => "ipv4",
            PrefixType::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for PrefixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrefixType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PrefixType::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| Error::InvalidPrefix(s.to_string()))
    }
}

/// Build a compound identifier from a prefix and a raw value
pub fn new_id(prefix: PrefixType, value: &str) -> String {
    format!("{}:{}", prefix, value)
}

/// Build the compound identifier of a local numeric endpoint ID
pub fn new_cilium_id(id: u16) -> String {
    new_id(PrefixType::CiliumLocal, &id.to_string())
}

/// Split at the first ':'. IPv6 values keep their own colons.
fn split_id(id: &str) -> (&str, &str) {
    match id.split_once(':') {
        Some((prefix, value)) => (prefix, value),
        None => (PrefixType::CiliumLocal.as_str(), id),
    }
}

/// Parse a compound identifier into its prefix type and raw value
pub fn parse(id: &str) -> Result<(PrefixType, &str)> {
    let (prefix, value) = split_id(id);
    let prefix = prefix.parse::<PrefixType>()?;
    Ok((prefix, value))
}

/// Parse a compound identifier that must name a local numeric endpoint ID.
///
/// Accepts decimal, `0x` hexadecimal, `0o`/leading-zero octal and `0b`
/// binary forms.
pub fn parse_endpoint_id(id: &str) -> Result<u16> {
    let (prefix, value) = split_id(id);
    if prefix != PrefixType::CiliumLocal.as_str() {
        return Err(Error::InvalidEndpointId(format!(
            "'{}' is not a local endpoint identifier",
            id
        )));
    }

    let n = parse_int(value)
        .ok_or_else(|| Error::InvalidEndpointId(format!("invalid numeric endpoint ID '{}'", value)))?;
    if n < 0 {
        return Err(Error::InvalidEndpointId(format!("negative endpoint ID {}", n)));
    }
    if n > i64::from(MAX_ENDPOINT_ID) {
        return Err(Error::InvalidEndpointId(format!("endpoint ID too large: {}", n)));
    }
    Ok(n as u16)
}

fn parse_int(value: &str) -> Option<i64> {
    let (negative, digits) = match value.as_bytes().first()? {
        b'-' => (true, &value[1..]),
        b'+' => (false, &value[1..]),
        _ => (false, value),
    };

    let lower = digits.to_ascii_lowercase();
    let (radix, body) = if let Some(rest) = lower.strip_prefix("0x") {
        (16, rest)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (8, rest)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (8, &lower[1..])
    } else {
        (10, lower.as_str())
    };

    if body.is_empty() || body.starts_with(|c: char| c == '+' || c == '-') {
        return None;
    }
    let n = i64::from_str_radix(body, radix).ok()?;
    Some(if negative { -n } else { n })
}
