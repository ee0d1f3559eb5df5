//! Layering of `common` → group → tunnel sections into one field set per tunnel.

use crate::error::{Error, Result};
use crate::ini::{Document, FieldSet};

/// Name given to the tunnel synthesized for a group without tunnel sections.
pub const DEFAULT_TUNNEL: &str = "default_tunnel";

/// Sections whose keys apply to every group.
const GLOBAL_SECTIONS: &[&str] = &["global", "common"];

/// Per-group lists of merged tunnel fields, in configuration order.
#[derive(Debug, Default)]
pub struct GroupedFields {
    groups: Vec<(String, Vec<FieldSet>)>,
}

impl GroupedFields {
    fn entry(&mut self, group: &str) -> &mut Vec<FieldSet> {
        let idx = match self.groups.iter().position(|(g, _)| g == group) {
            Some(idx) => idx,
            None => {
                self.groups.push((group.to_string(), Vec::new()));
                self.groups.len() - 1
            }
        };
        &mut self.groups[idx].1
    }

    pub fn get(&self, group: &str) -> Option<&[FieldSet]> {
        self.groups
            .iter()
            .find(|(g, _)| g == group)
            .map(|(_, t)| t.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[FieldSet])> {
        self.groups.iter().map(|(g, t)| (g.as_str(), t.as_slice()))
    }
}

/// Keys with a second spelling, mapped to the one layering stores.
const ALIASES: &[(&str, &str)] = &[
    ("user", "ssh_user"),
    ("key", "ssh_key"),
    ("server", "remote_server"),
];

fn is_global(name: &str) -> bool {
    GLOBAL_SECTIONS.contains(&name)
}

/// `fields` with every alias renamed, so a more specific layer overrides a
/// less specific one whichever spelling each uses.
fn canonical(fields: &FieldSet) -> FieldSet {
    fields
        .iter()
        .map(|(key, value)| {
            let key = ALIASES
                .iter()
                .find(|(alias, _)| *alias == key)
                .map_or(key, |&(_, name)| name);
            (key, value)
        })
        .collect()
}

/// Merge the sections of `doc` into per-tunnel field sets.
///
/// Later layers override earlier ones key by key. Every tunnel set carries
/// `tunnel_name`. A group with fields but no tunnel sections of its own
/// becomes a single [`DEFAULT_TUNNEL`].
pub fn resolve(doc: &Document) -> Result<GroupedFields> {
    let mut common = FieldSet::new();
    for section in doc.sections.iter().filter(|s| is_global(&s.name)) {
        common.overlay(&canonical(&section.fields));
    }

    let mut group_fields: Vec<(&str, FieldSet)> = Vec::new();
    for section in &doc.sections {
        if is_global(&section.name) || section.name.contains('/') {
            continue;
        }
        let mut fields = common.clone();
        fields.overlay(&canonical(&section.fields));
        group_fields.push((section.name.as_str(), fields));
    }

    let mut result = GroupedFields::default();
    for section in &doc.sections {
        let Some((group, tunnel)) = section.name.split_once('/') else {
            continue;
        };
        if group.is_empty() || tunnel.is_empty() {
            return Err(Error::config(format!(
                "Invalid section name '{}'",
                section.name
            )));
        }
        if is_global(group) {
            return Err(Error::config(format!(
                "Section '{}' cannot hold tunnels, '{}' is reserved",
                section.name, group
            )));
        }

        let mut fields = group_fields
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, f)| f.clone())
            .unwrap_or_default();
        fields.insert("tunnel_name", tunnel);
        fields.overlay(&canonical(&section.fields));
        result.entry(group).push(fields);
    }

    for (group, fields) in group_fields {
        if fields.is_empty() || result.get(group).is_some() {
            continue;
        }
        let mut fields = fields;
        fields.insert("tunnel_name", DEFAULT_TUNNEL);
        result.entry(group).push(fields);
    }

    Ok(result)
}
