//! Matching tunnels to the systemd units that may run them.

use crate::probe::ProbeCache;
use crate::tunnel::Tunnel;

/// Template unit that can run any tunnel as `sshtunnel@<id>.service`.
pub const TEMPLATE_UNIT: &str = "sshtunnel@.service";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    NotInstalled,
    Enabled,
    Disabled,
}

/// The unit instance for `tunnel`: `@<server>`, `@<name>` or `@<group>`.
pub fn find_unit<'a>(tunnel: &Tunnel, units: &'a [String]) -> Option<&'a str> {
    let suffixes = [
        format!("@{}.service", tunnel.remote_server()),
        format!("@{}.service", tunnel.name()),
        format!("@{}.service", tunnel.group_name()),
    ];
    units
        .iter()
        .find(|unit| suffixes.iter().any(|s| unit.ends_with(s.as_str())))
        .map(String::as_str)
}

/// A tunnel counts as installed with its own instance or with the template.
pub fn is_installed(tunnel: &Tunnel, cache: &ProbeCache) -> bool {
    let units = cache.tunnel_units();
    find_unit(tunnel, units).is_some() || units.iter().any(|u| u == TEMPLATE_UNIT)
}

pub fn unit_state(tunnel: &Tunnel, cache: &ProbeCache) -> UnitState {
    if !is_installed(tunnel, cache) {
        return UnitState::NotInstalled;
    }
    match find_unit(tunnel, cache.tunnel_units()) {
        Some(unit) if cache.unit_enabled(unit) => UnitState::Enabled,
        _ => UnitState::Disabled,
    }
}
