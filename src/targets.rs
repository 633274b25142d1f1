//! Target expression parsing, validation, exclusion and canonicalization.
//!
//! A target expression is a whitespace-separated list of IPv4/IPv6 addresses,
//! CIDR networks, IPv4 ranges and FQDNs. The canonical form is what gets stored
//! on a site and what the scan binary finally receives as its target argument,
//! so it only ever contains forms both nmap and masscan accept: plain addresses,
//! `addr/prefix` networks and host names.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("label regex should compile")
});

/// Private and reserved blocks refused when private targets are not allowed.
static RESERVED_NETS: Lazy<Vec<IpNet>> = Lazy::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "::/128",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|s| s.parse().expect("reserved network literal"))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn bits(self) -> u32 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

/// Inclusive run of addresses within one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    family: Family,
    start: u128,
    end: u128,
}

impl Span {
    fn overlaps(&self, other: &Span) -> bool {
        self.family == other.family && self.start <= other.end && other.start <= self.end
    }

    fn len(&self) -> u128 {
        (self.end - self.start).saturating_add(1)
    }
}

/// One canonical target entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Addr(IpAddr),
    /// Always truncated to its network address with a prefix shorter than the
    /// address width.
    Net(IpNet),
    /// Lowercase, no trailing dot.
    Fqdn(String),
}

impl Target {
    fn from_net(net: IpNet) -> Self {
        let net = net.trunc();
        if net.prefix_len() == net.max_prefix_len() {
            Target::Addr(net.network())
        } else {
            Target::Net(net)
        }
    }

    fn from_prefix(family: Family, start: u128, prefix: u8) -> Self {
        let net = match family {
            Family::V4 => IpNet::V4(
                Ipv4Net::new(Ipv4Addr::from(start as u32), prefix).expect("prefix within /32"),
            ),
            Family::V6 => IpNet::V6(
                Ipv6Net::new(Ipv6Addr::from(start), prefix).expect("prefix within /128"),
            ),
        };
        Target::from_net(net)
    }

    fn span(&self) -> Option<Span> {
        match self {
            Target::Addr(ip) => {
                let (family, n) = addr_value(*ip);
                Some(Span {
                    family,
                    start: n,
                    end: n,
                })
            }
            Target::Net(net) => {
                let (family, start) = addr_value(net.network());
                let (_, end) = addr_value(net.broadcast());
                Some(Span { family, start, end })
            }
            Target::Fqdn(_) => None,
        }
    }

    fn prefix_len(&self) -> u8 {
        match self {
            Target::Addr(IpAddr::V4(_)) => 32,
            Target::Addr(IpAddr::V6(_)) => 128,
            Target::Net(net) => net.prefix_len(),
            Target::Fqdn(_) => 0,
        }
    }

    pub fn is_fqdn(&self) -> bool {
        matches!(self, Target::Fqdn(_))
    }

    /// Number of addresses covered; a host name counts as one.
    pub fn address_count(&self) -> u128 {
        self.span().map_or(1, |s| s.len())
    }

    fn sort_key(&self) -> (u8, u128, u8) {
        match self.span() {
            Some(span) => {
                let rank = match span.family {
                    Family::V4 => 0,
                    Family::V6 => 1,
                };
                (rank, span.start, self.prefix_len())
            }
            None => (2, 0, 0),
        }
    }
}

impl Ord for Target {
    /// IPv4 before IPv6, ascending address, wider network first at the same
    /// address, host names last in lexical order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| match (self, other) {
                (Target::Fqdn(a), Target::Fqdn(b)) => a.cmp(b),
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Addr(ip) => ip.fmt(f),
            Target::Net(net) => net.fmt(f),
            Target::Fqdn(name) => f.write_str(name),
        }
    }
}

/// Result of [`extract`]. Valid tokens are always kept even when some are invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Extraction {
    /// Canonical entries with exclusions subtracted.
    pub targets: Vec<Target>,
    /// Canonical entries of the excluded expression on its own.
    pub excluded: Vec<Target>,
    pub canonical: String,
    pub excluded_canonical: String,
    pub invalid: Vec<String>,
    pub invalid_excluded: Vec<String>,
}

impl Extraction {
    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty() && self.invalid_excluded.is_empty()
    }

    pub fn address_count(&self) -> u128 {
        self.targets
            .iter()
            .fold(0u128, |acc, t| acc.saturating_add(t.address_count()))
    }

    /// Turn collected invalid tokens into an error carrying the whole list.
    pub fn into_result(self) -> Result<Self> {
        if !self.invalid.is_empty() {
            return Err(Error::InvalidTarget(self.invalid));
        }
        if !self.invalid_excluded.is_empty() {
            return Err(Error::InvalidExcludedTarget(self.invalid_excluded));
        }
        Ok(self)
    }
}

/// Parse, validate and canonicalize `expression`, then subtract `excluded`.
///
/// IP exclusions remove the exact address set they cover from every overlapping
/// entry; an entry touched by an exclusion is re-expressed as the minimal list of
/// CIDR blocks covering what is left. Host name exclusions only remove the
/// identical host name. Exclusions that match nothing are ignored.
pub fn extract(expression: &str, excluded: Option<&str>, allow_private_ips: bool) -> Extraction {
    let (included, invalid) = parse_expression(expression, allow_private_ips);
    let (excluded, invalid_excluded) =
        parse_expression(excluded.unwrap_or_default(), allow_private_ips);

    let targets = subtract(included, &excluded);
    let excluded: Vec<Target> = excluded.into_iter().collect();

    Extraction {
        canonical: join(&targets),
        excluded_canonical: join(&excluded),
        targets,
        excluded,
        invalid,
        invalid_excluded,
    }
}

/// Canonical form of a target expression, dropping invalid tokens.
pub fn canonicalize(expression: &str) -> String {
    extract(expression, None, true).canonical
}

fn join(targets: &[Target]) -> String {
    targets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_expression(expression: &str, allow_private_ips: bool) -> (BTreeSet<Target>, Vec<String>) {
    let mut valid = BTreeSet::new();
    let mut invalid = Vec::new();
    let mut seen_invalid = HashSet::new();

    for token in expression.split_whitespace() {
        let parsed = parse_token(token)
            .filter(|targets| allow_private_ips || !targets.iter().any(is_reserved));
        match parsed {
            Some(targets) => valid.extend(targets),
            None => {
                if seen_invalid.insert(token) {
                    invalid.push(token.to_string());
                }
            }
        }
    }

    (valid, invalid)
}

/// Classify a single token. Ranges expand to several entries.
pub fn parse_token(token: &str) -> Option<Vec<Target>> {
    if token.contains('/') {
        return token
            .parse::<IpNet>()
            .ok()
            .map(|net| vec![Target::from_net(net)]);
    }

    if let Some((a, b)) = token.split_once('-') {
        if let Ok(start) = a.parse::<Ipv4Addr>() {
            return parse_v4_range(start, b);
        }
    }

    if let Ok(ip) = token.parse::<IpAddr>() {
        return Some(vec![Target::Addr(ip)]);
    }

    parse_fqdn(token).map(|name| vec![Target::Fqdn(name)])
}

/// `a.b.c.d-e.f.g.h`, or `a.b.c.d-h` to vary only the last octet.
fn parse_v4_range(start: Ipv4Addr, end: &str) -> Option<Vec<Target>> {
    let end = match end.parse::<Ipv4Addr>() {
        Ok(ip) => ip,
        Err(_) => {
            if end.is_empty() || !end.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let last = end.parse::<u8>().ok()?;
            let o = start.octets();
            Ipv4Addr::new(o[0], o[1], o[2], last)
        }
    };

    let (start, end) = (u32::from(start) as u128, u32::from(end) as u128);
    if start > end {
        return None;
    }
    Some(cover(Family::V4, start, end))
}

fn parse_fqdn(token: &str) -> Option<String> {
    let name = token.strip_suffix('.').unwrap_or(token);
    if name.is_empty() || name.len() > 253 {
        return None;
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 || !labels.iter().all(|l| DNS_LABEL.is_match(l)) {
        return None;
    }
    // An all-numeric TLD is a mistyped address, e.g. 999.1.1.1.
    let tld = labels.last()?;
    if tld.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

fn addr_value(ip: IpAddr) -> (Family, u128) {
    match ip {
        IpAddr::V4(v4) => (Family::V4, u32::from(v4) as u128),
        IpAddr::V6(v6) => (Family::V6, u128::from(v6)),
    }
}

fn is_reserved(target: &Target) -> bool {
    let Some(span) = target.span() else {
        return false;
    };
    RESERVED_NETS
        .iter()
        .filter_map(|net| Target::Net(*net).span())
        .any(|reserved| reserved.overlaps(&span))
}

/// Minimal list of aligned CIDR blocks covering `start..=end`.
fn cover(family: Family, mut start: u128, end: u128) -> Vec<Target> {
    let bits = family.bits();
    let mut out = Vec::new();
    loop {
        let align = if start == 0 {
            bits
        } else {
            start.trailing_zeros().min(bits)
        };
        let remaining = end - start;
        let fit = if remaining == u128::MAX {
            128
        } else {
            127 - (remaining + 1).leading_zeros()
        };
        let host_bits = align.min(fit);
        out.push(Target::from_prefix(family, start, (bits - host_bits) as u8));

        let block_end = if host_bits == 128 {
            u128::MAX
        } else {
            start + ((1u128 << host_bits) - 1)
        };
        if block_end >= end {
            break;
        }
        start = block_end + 1;
    }
    out
}

fn subtract(included: BTreeSet<Target>, excluded: &BTreeSet<Target>) -> Vec<Target> {
    let cuts = merge_spans(excluded.iter().filter_map(Target::span).collect());
    let mut out = BTreeSet::new();

    for target in included {
        let Some(span) = target.span() else {
            if !excluded.contains(&target) {
                out.insert(target);
            }
            continue;
        };

        // Cuts are disjoint and sorted, so their ends are sorted too.
        let first = cuts.partition_point(|c| (c.family, c.end) < (span.family, span.start));
        let mut touching = cuts[first..]
            .iter()
            .take_while(|c| c.family == span.family && c.start <= span.end)
            .peekable();
        if touching.peek().is_none() {
            out.insert(target);
            continue;
        }

        let mut cursor = span.start;
        let mut exhausted = false;
        for cut in touching {
            if cut.start > cursor {
                out.extend(cover(span.family, cursor, cut.start - 1));
            }
            if cut.end >= span.end {
                exhausted = true;
                break;
            }
            cursor = cut.end + 1;
        }
        if !exhausted {
            out.extend(cover(span.family, cursor, span.end));
        }
    }
    out.into_iter().collect()
}

/// Sorts spans and joins overlapping or adjacent ones.
fn merge_spans(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| (s.family, s.start));
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if last.family == span.family && span.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}
