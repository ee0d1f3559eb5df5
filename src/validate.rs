//! Scalar coercions used when turning raw config strings into tunnel fields.

use std::net::Ipv4Addr;

const TRUTHY: &[&str] = &["yes", "true", "t", "y", "1", "o", "oui", "on"];
const FALSY: &[&str] = &["no", "false", "f", "n", "0", "non", "off"];

/// Coerce a boolean-like value. Numbers count when they truncate to 0 or 1.
pub fn parse_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if let Ok(num) = value.parse::<f64>() {
        if !num.is_finite() {
            return None;
        }
        return match num.trunc() as i64 {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        };
    }
    let lower = value.to_lowercase();
    if TRUTHY.contains(&lower.as_str()) {
        Some(true)
    } else if FALSY.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Coerce a port number. Valid ports are 1 through 65534.
pub fn parse_port(value: &str) -> Option<u16> {
    let num: i64 = value.trim().parse().ok()?;
    if (1..=65534).contains(&num) {
        Some(num as u16)
    } else {
        None
    }
}

/// POSIX-ish login name: `^[a-z_]([a-z0-9_-]{0,31}|[a-z0-9_-]{0,30}\$)$`.
pub fn is_valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    let rest = chars.as_str();
    let body = rest.strip_suffix('$').unwrap_or(rest);
    let limit = if body.len() < rest.len() { 30 } else { 31 };
    body.len() <= limit
        && body
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Whether an address sits in 127.0.0.0/8.
pub fn is_loopback(addr: Ipv4Addr) -> bool {
    addr.octets()[0] == 127
}
