use std::net::Ipv4Addr;

/// Parses a dotted-quad IPv4 literal: exactly four groups of one to three
/// decimal digits, each in `0..=255`, with nothing before or after.
pub fn parse_ipv4(candidate: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut groups = candidate.split('.');

    for octet in octets.iter_mut() {
        let group = groups.next()?;
        if group.is_empty() || group.len() > 3 || !group.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = group.parse().ok()?;
    }

    if groups.next().is_some() {
        return None;
    }

    Some(Ipv4Addr::from(octets))
}

pub fn is_valid_ipv4(candidate: &str) -> bool {
    parse_ipv4(candidate).is_some()
}
