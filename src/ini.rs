use crate::error::{Error, Result};

/// Ordered key/value pairs. Re-inserting a key overwrites it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    entries: Vec<(String, String)>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Layer `other` on top of `self`, key by key.
    pub fn overlay(&mut self, other: &FieldSet) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = FieldSet::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub fields: FieldSet,
}

/// A parsed `[section]` / `key = value` document, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub sections: Vec<Section>,
}

/// Return the header name if `line` is a `[section]` line.
pub fn section_header(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

impl Document {
    /// Parse `text`; `origin` names the source in error messages.
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        Self::parse_numbered(text, origin, 1)
    }

    /// Like [`parse`](Self::parse), numbering the first line `first_line`.
    pub fn parse_numbered(text: &str, origin: &str, first_line: usize) -> Result<Self> {
        let mut sections: Vec<Section> = Vec::new();
        // (key, indent) of the last option line, for continuation lines
        let mut last_key: Option<(String, usize)> = None;

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + first_line;
            let trimmed = raw.trim();
            let fail = |msg: String| Error::config(format!("{}, line {}: {}", origin, lineno, msg));

            if trimmed.is_empty() {
                last_key = None;
                continue;
            }
            if trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if let Some((key, key_indent)) = &last_key
                && indent_of(raw) > *key_indent
            {
                if let Some(section) = sections.last_mut() {
                    let joined = format!("{}\n{}", section.fields.get(key).unwrap_or(""), trimmed);
                    section.fields.insert(key.clone(), joined);
                }
                continue;
            }

            if let Some(name) = section_header(raw) {
                if name.is_empty() {
                    return Err(fail("empty section name".to_string()));
                }
                if sections.iter().any(|s| s.name == name) {
                    return Err(fail(format!("section '{}' already exists", name)));
                }
                sections.push(Section {
                    name: name.to_string(),
                    fields: FieldSet::new(),
                });
                last_key = None;
                continue;
            }

            let Some(section) = sections.last_mut() else {
                return Err(fail(format!("no section header before '{}'", trimmed)));
            };
            let Some(pos) = trimmed.find(['=', ':']) else {
                return Err(fail(format!("expected 'key = value', got '{}'", trimmed)));
            };
            let key = trimmed[..pos].trim().to_lowercase();
            let value = trimmed[pos + 1..].trim();
            if key.is_empty() {
                return Err(fail("missing option name".to_string()));
            }
            if section.fields.contains(&key) {
                return Err(fail(format!(
                    "option '{}' already exists in section '{}'",
                    key, section.name
                )));
            }
            section.fields.insert(key.clone(), value);
            last_key = Some((key, indent_of(raw)));
        }

        Ok(Self { sections })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_set_overwrites_in_place() {
        let mut set: FieldSet = [("a", "1"), ("b", "2")].into_iter().collect();
        set.insert("a", "3");
        let pairs: Vec<_> = set.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn overlay_keeps_untouched_keys() {
        let mut base: FieldSet = [("user", "root"), ("ssh_port", "22")].into_iter().collect();
        let top: FieldSet = [("ssh_port", "2222"), ("reverse", "yes")].into_iter().collect();
        base.overlay(&top);
        assert_eq!(base.get("user"), Some("root"));
        assert_eq!(base.get("ssh_port"), Some("2222"));
        assert_eq!(base.get("reverse"), Some("yes"));
        assert_eq!(base.iter().count(), 3);
    }

    #[test]
    fn parse_sections_and_keys() {
        let doc = Document::parse(
            "# comment\n[common]\nUser = deploy\n\n[db]\nremote_port: 5432\n; other\nlocal_port=15432\n",
            "test.conf",
        )
        .unwrap();
        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.sections[0].name, "common");
        assert_eq!(doc.sections[0].fields.get("user"), Some("deploy"));
        assert_eq!(doc.sections[1].fields.get("remote_port"), Some("5432"));
        assert_eq!(doc.sections[1].fields.get("local_port"), Some("15432"));
    }

    #[test]
    fn parse_keeps_section_case_and_trims() {
        let doc = Document::parse("[ Prod/Web ]\nkey = a = b\n", "t").unwrap();
        assert_eq!(doc.sections[0].name, "Prod/Web");
        assert_eq!(doc.sections[0].fields.get("key"), Some("a = b"));
    }

    #[test]
    fn parse_indented_keys_are_not_continuations() {
        let doc = Document::parse("[g]\n  a = 1\n  b = 2\n", "t").unwrap();
        assert_eq!(doc.sections[0].fields.get("a"), Some("1"));
        assert_eq!(doc.sections[0].fields.get("b"), Some("2"));
    }

    #[test]
    fn parse_continuation_lines() {
        let doc = Document::parse("[g]\nssh_options = -o A=1\n    -o B=2\nnext = x\n", "t").unwrap();
        assert_eq!(doc.sections[0].fields.get("ssh_options"), Some("-o A=1\n-o B=2"));
        assert_eq!(doc.sections[0].fields.get("next"), Some("x"));
    }

    #[test]
    fn parse_empty_value() {
        let doc = Document::parse("[g]\nkey =\n", "t").unwrap();
        assert_eq!(doc.sections[0].fields.get("key"), Some(""));
    }

    #[test]
    fn parse_rejects_key_without_section() {
        let err = Document::parse("user = root\n", "top.conf").unwrap_err();
        assert!(err.to_string().starts_with("top.conf, line 1"));
    }

    #[test]
    fn parse_rejects_line_without_delimiter() {
        assert!(Document::parse("[g]\njust words\n", "t").is_err());
    }

    #[test]
    fn parse_rejects_duplicates() {
        assert!(Document::parse("[g]\na = 1\n[g]\n", "t").is_err());
        assert!(Document::parse("[g]\na = 1\nA = 2\n", "t").is_err());
    }

    #[test]
    fn header_detection() {
        assert_eq!(section_header("  [abc]  "), Some("abc"));
        assert_eq!(section_header("abc"), None);
        assert_eq!(section_header("[abc"), None);
    }
}
