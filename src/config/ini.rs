//! Minimal ini codec for `server.properties`, `server.config` and `cron.config`.

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

pub type Section = BTreeMap<String, String>;

/// Keys before the first `[header]` live in `general`; everything else in `sections`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    pub general: Section,
    pub sections: BTreeMap<String, Section>,
}

impl IniDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let mut doc = Self::new();
        let mut current: Option<String> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim().to_string();
                doc.sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (line, ""),
            };
            if key.is_empty() {
                continue;
            }
            let target = match &current {
                Some(name) => doc.sections.entry(name.clone()).or_default(),
                None => &mut doc.general,
            };
            target.insert(key.to_string(), value.to_string());
        }
        doc
    }

    /// Like [`parse`](Self::parse) but rejects bytes that are not UTF-8.
    pub fn parse_bytes(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok().map(Self::parse)
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section).and_then(|s| s.get(key)).map(String::as_str)
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn get_general(&self, key: &str) -> Option<&str> {
        self.general.get(key).map(String::as_str)
    }

    pub fn set_general(&mut self, key: &str, value: impl Into<String>) {
        self.general.insert(key.to_string(), value.into());
    }

    pub fn remove_section(&mut self, name: &str) -> Option<Section> {
        self.sections.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.sections.is_empty()
    }

    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.general {
            out.push_str(&format!("{}={}\n", k, v));
        }
        for (name, section) in &self.sections {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", name));
            for (k, v) in section {
                out.push_str(&format!("{}={}\n", k, v));
            }
        }
        out
    }
}

// JSON view: general keys at the top level, sections as nested objects.
impl Serialize for IniDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.general.len() + self.sections.len()))?;
        for (k, v) in &self.general {
            map.serialize_entry(k, v)?;
        }
        for (name, section) in &self.sections {
            map.serialize_entry(name, section)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_properties_file() {
        let doc = IniDocument::parse("#Minecraft server properties\nserver-port=25565\nmotd = A Server\nlevel-seed=\n");
        assert_eq!(doc.get_general("server-port"), Some("25565"));
        assert_eq!(doc.get_general("motd"), Some("A Server"));
        assert_eq!(doc.get_general("level-seed"), Some(""));
        assert!(doc.sections.is_empty());
    }

    #[test]
    fn parses_sections() {
        let doc = IniDocument::parse("[java]\njava_xmx=256\njarfile=minecraft_server.jar\n\n[onreboot]\nstart=false\n");
        assert_eq!(doc.get("java", "java_xmx"), Some("256"));
        assert_eq!(doc.get("onreboot", "start"), Some("false"));
        assert_eq!(doc.get("minecraft", "profile"), None);
    }

    #[test]
    fn values_may_contain_equals() {
        let doc = IniDocument::parse("generator-settings=a=b\n");
        assert_eq!(doc.get_general("generator-settings"), Some("a=b"));
    }

    #[test]
    fn serializes_back_to_same_document() {
        let mut doc = IniDocument::new();
        doc.set_general("server-port", "25565");
        doc.set("java", "java_xmx", "1024");
        doc.set("minecraft", "broadcast", "true");
        assert_eq!(IniDocument::parse(&doc.to_ini_string()), doc);
    }

    #[test]
    fn json_view_nests_sections() {
        let mut doc = IniDocument::new();
        doc.set_general("motd", "hi");
        doc.set("java", "java_xmx", "256");
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["motd"], "hi");
        assert_eq!(v["java"]["java_xmx"], "256");
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(IniDocument::parse_bytes(&[0x66, 0xff, 0xfe]).is_none());
    }
}
