use std::path::Path;

use tracing::debug;

use crate::dns::Resolve;
use crate::error::{Error, Result};
use crate::ini::Document;
use crate::layers::{self, GroupedFields};
use crate::preprocess;
use crate::tunnel::Tunnel;

/// Every tunnel of one configuration, in configuration order.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: Vec<Tunnel>,
}

impl TunnelRegistry {
    /// Run the whole load pipeline on `path`: includes, layering, validation.
    /// Nothing is returned unless every tunnel validates.
    pub fn load(path: &Path, resolver: &dyn Resolve) -> Result<Self> {
        let text = preprocess::preprocess(path)?;
        let doc = Document::parse(&text, &path.display().to_string())?;
        let grouped = layers::resolve(&doc)?;
        let registry = Self::from_fields(&grouped, resolver)?;
        debug!("Loaded {} tunnel(s) from {}", registry.tunnels.len(), path.display());
        Ok(registry)
    }

    pub fn from_fields(grouped: &GroupedFields, resolver: &dyn Resolve) -> Result<Self> {
        let mut tunnels = Vec::new();
        for (group, sets) in grouped.iter() {
            for fields in sets {
                tunnels.push(Tunnel::build(group, fields, resolver)?);
            }
        }
        Ok(Self { tunnels })
    }

    pub fn all(&self) -> &[Tunnel] {
        &self.tunnels
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Tunnels whose name, group, server or resolved address is in `ids`.
    ///
    /// Fails with every identifier that matched nothing.
    pub fn select(&self, ids: &[String]) -> Result<Vec<&Tunnel>> {
        let mut found = vec![false; ids.len()];
        let mut selected = Vec::new();

        for tunnel in &self.tunnels {
            let address = tunnel.remote_address().to_string();
            let keys = [
                tunnel.name(),
                tunnel.group_name(),
                tunnel.remote_server(),
                address.as_str(),
            ];
            let mut matched = false;
            for (idx, id) in ids.iter().enumerate() {
                if keys.contains(&id.as_str()) {
                    found[idx] = true;
                    matched = true;
                }
            }
            if matched {
                selected.push(tunnel);
            }
        }

        let unknown: Vec<String> = ids
            .iter()
            .zip(&found)
            .filter(|(_, hit)| !**hit)
            .map(|(id, _)| id.clone())
            .collect();
        if !unknown.is_empty() {
            return Err(Error::UnknownTunnels(unknown));
        }
        Ok(selected)
    }

    /// [`select`](Self::select), or every tunnel when `ids` is empty.
    pub fn select_or_all(&self, ids: &[String]) -> Result<Vec<&Tunnel>> {
        if ids.is_empty() {
            Ok(self.tunnels.iter().collect())
        } else {
            self.select(ids)
        }
    }
}
