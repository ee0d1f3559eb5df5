use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ini::{self, Document};

/// Expand `include` directives in `path` into a single INI text.
///
/// Included files get an implicit `[<stem>]` section for their top-level
/// keys, and every section they declare is prefixed with `<stem>/`. Nested
/// includes stack the prefixes (`group/sub/...`).
pub fn preprocess(path: &Path) -> Result<String> {
    let mut active = Vec::new();
    expand(path, None, &mut active)
}

fn expand(path: &Path, subsection: Option<&str>, active: &mut Vec<PathBuf>) -> Result<String> {
    let canonical = fs::canonicalize(path)
        .map_err(|e| Error::config(format!("Unable to read {}: {}", path.display(), e)))?;

    if active.contains(&canonical) {
        let chain: Vec<String> = active
            .iter()
            .chain(std::iter::once(&canonical))
            .map(|p| p.display().to_string())
            .collect();
        return Err(Error::config(format!(
            "Include cycle detected: {}",
            chain.join(" -> ")
        )));
    }

    let content = fs::read_to_string(&canonical)
        .map_err(|e| Error::config(format!("Unable to read {}: {}", path.display(), e)))?;
    let dir = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    active.push(canonical);

    let mut out = String::new();
    // This file's lines alone, includes blanked, for checking it in isolation.
    let mut own = String::new();
    if let Some(sub) = subsection {
        out.push_str(&format!("[{}]\n", sub));
        own.push_str(&format!("[{}]\n", sub));
    }

    for line in content.lines() {
        if let Some(pattern) = include_pattern(line) {
            own.push('\n');
            for included in expand_include(pattern, &dir)? {
                let stem = included
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let child = match subsection {
                    Some(sub) => format!("{}/{}", sub, stem),
                    None => stem,
                };
                debug!("Including {} as [{}]", included.display(), child);
                out.push('\n');
                out.push_str(&expand(&included, Some(&child), active)?);
                out.push('\n');
            }
            continue;
        }

        if let Some(sub) = subsection
            && let Some(name) = ini::section_header(line)
        {
            let header = format!("[{}/{}]\n", sub, name);
            out.push_str(&header);
            own.push_str(&header);
            continue;
        }

        out.push_str(line);
        out.push('\n');
        own.push_str(line);
        own.push('\n');
    }

    active.pop();

    // The injected header is line 0, so errors carry the file's own numbering.
    let first_line = if subsection.is_some() { 0 } else { 1 };
    Document::parse_numbered(&own, &path.display().to_string(), first_line)?;
    Ok(out)
}

/// `include <glob>`, `include=<glob>` or `include:<glob>`, any case.
fn include_pattern(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let keyword = trimmed.get(..7)?;
    if !keyword.eq_ignore_ascii_case("include") {
        return None;
    }
    let rest = &trimmed[7..];
    let sep = rest.chars().next()?;
    if sep != ':' && sep != '=' && !sep.is_whitespace() {
        return None;
    }
    Some(rest[sep.len_utf8()..].trim())
}

/// Resolve an include glob relative to the including file's directory.
/// Matches come back in sorted order; directories are skipped.
fn expand_include(pattern: &str, dir: &Path) -> Result<Vec<PathBuf>> {
    let full = if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!(
            "{}/{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            pattern
        )
    };

    let entries = glob::glob(&full)
        .map_err(|e| Error::config(format!("Invalid include pattern '{}': {}", pattern, e)))?;

    let files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();

    if files.is_empty() {
        warn!("Include pattern '{}' matched no files", pattern);
    }
    Ok(files)
}
