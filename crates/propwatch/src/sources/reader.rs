//! Reading property sources into flat key/value maps
//!
//! `.toml` files are flattened into dotted keys, everything else (including
//! coordination node content) is read as `.properties` text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::Chars;

use crate::{PropertiesError, Result};

const WHITESPACE: [char; 3] = [' ', '\t', '\x0c'];

/// Character encoding for source bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TextEncoding {
    /// Strict UTF-8, invalid bytes fail the read
    #[default]
    Utf8,
    /// UTF-8 with invalid sequences replaced by U+FFFD
    Utf8Lossy,
    /// ISO-8859-1, every byte maps to one char
    Latin1,
}

impl TextEncoding {
    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        let text = match self {
            Self::Utf8 => std::str::from_utf8(bytes)
                .map_err(|e| PropertiesError::decode(format!("invalid UTF-8: {e}")))?
                .to_string(),
            Self::Utf8Lossy => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };
        Ok(match text.strip_prefix('\u{feff}') {
            Some(rest) => rest.to_string(),
            None => text,
        })
    }
}

impl std::fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utf8 => write!(f, "UTF-8"),
            Self::Utf8Lossy => write!(f, "UTF-8-lossy"),
            Self::Latin1 => write!(f, "ISO-8859-1"),
        }
    }
}

impl std::str::FromStr for TextEncoding {
    type Err = PropertiesError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "UTF8" => Ok(Self::Utf8),
            "UTF8LOSSY" => Ok(Self::Utf8Lossy),
            "ISO88591" | "LATIN1" => Ok(Self::Latin1),
            _ => Err(PropertiesError::settings(format!("unsupported encoding: {s}"))),
        }
    }
}

impl TryFrom<String> for TextEncoding {
    type Error = PropertiesError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TextEncoding> for String {
    fn from(encoding: TextEncoding) -> Self {
        encoding.to_string()
    }
}

/// Reads the full content of a source into a flat map. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceReader {
    encoding: TextEncoding,
}

impl SourceReader {
    pub fn new(encoding: TextEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Read a static file, choosing the format by extension
    pub fn read_file(&self, path: &Path) -> Result<HashMap<String, String>> {
        let bytes = std::fs::read(path)?;
        let text = self.encoding.decode(&bytes)?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            parse_toml(&text)
        } else {
            parse_properties(&text)
        }
    }

    /// Decode and parse raw node content as `.properties` text
    pub fn read_bytes(&self, bytes: &[u8]) -> Result<HashMap<String, String>> {
        let text = self.encoding.decode(bytes)?;
        parse_properties(&text)
    }
}

/// Parse `.properties` text. Later duplicates of a key win.
pub fn parse_properties(text: &str) -> Result<HashMap<String, String>> {
    let mut properties = HashMap::new();
    for line in logical_lines(text) {
        let (key, value) = parse_line(&line)?;
        properties.insert(key, value);
    }
    Ok(properties)
}

/// Parse TOML text, flattening tables into dotted keys
pub fn parse_toml(text: &str) -> Result<HashMap<String, String>> {
    let table: toml::Table = toml::from_str(text)
        .map_err(|e| PropertiesError::parse(format!("TOML parse error: {e}")))?;

    let mut properties = HashMap::new();
    for (key, value) in &table {
        flatten_toml(key, value, &mut properties);
    }
    Ok(properties)
}

fn flatten_toml(prefix: &str, value: &toml::Value, out: &mut HashMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (key, nested) in table {
                flatten_toml(&format!("{prefix}.{key}"), nested, out);
            }
        }
        toml::Value::Array(items) => {
            let joined = items.iter().map(toml_scalar).collect::<Vec<_>>().join(",");
            out.insert(prefix.to_string(), joined);
        }
        scalar => {
            out.insert(prefix.to_string(), toml_scalar(scalar));
        }
    }
}

fn toml_scalar(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        other => other.to_string(),
    }
}

/// Join continuation lines and drop comments and blank lines
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pending: Option<String> = None;

    for raw in text.lines() {
        let line = raw.trim_start_matches(WHITESPACE);

        if pending.is_none() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
            continue;
        }

        let trailing_backslashes = line.chars().rev().take_while(|c| *c == '\\').count();
        let continued = trailing_backslashes % 2 == 1;
        let body = if continued { &line[..line.len() - 1] } else { line };

        let current = pending.get_or_insert_with(String::new);
        current.push_str(body);

        if !continued {
            lines.extend(pending.take());
        }
    }

    lines.extend(pending);
    lines
}

fn parse_line(line: &str) -> Result<(String, String)> {
    let mut key = String::new();
    let mut chars = line.chars();
    let mut separator_seen = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => key.extend(read_escape(&mut chars)?),
            '=' | ':' => {
                separator_seen = true;
                break;
            }
            c if WHITESPACE.contains(&c) => break,
            c => key.push(c),
        }
    }

    let mut rest = chars.as_str().trim_start_matches(WHITESPACE);
    if !separator_seen && let Some(stripped) = rest.strip_prefix(['=', ':']) {
        rest = stripped.trim_start_matches(WHITESPACE);
    }

    let mut value = String::with_capacity(rest.len());
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            value.extend(read_escape(&mut chars)?);
        } else {
            value.push(c);
        }
    }

    Ok((key, value))
}

fn read_escape(chars: &mut Chars<'_>) -> Result<Option<char>> {
    let escaped = match chars.next() {
        Some('t') => '\t',
        Some('n') => '\n',
        Some('r') => '\r',
        Some('f') => '\x0c',
        Some('u') => {
            let hex: String = chars.by_ref().take(4).collect();
            u32::from_str_radix(&hex, 16)
                .ok()
                .filter(|_| hex.len() == 4)
                .and_then(char::from_u32)
                .ok_or_else(|| PropertiesError::parse(format!("malformed \\u{hex} escape")))?
        }
        Some(other) => other,
        None => return Ok(None),
    };
    Ok(Some(escaped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_basic_properties() {
        let props = parse_properties(
            "# comment\n! also comment\n\na=1\nb : 2\nc 3\n  d=  spaced value\ne=\n",
        )
        .unwrap();

        assert_eq!(props["a"], "1");
        assert_eq!(props["b"], "2");
        assert_eq!(props["c"], "3");
        assert_eq!(props["d"], "spaced value");
        assert_eq!(props["e"], "");
        assert_eq!(props.len(), 5);
    }

    #[test]
    fn test_continuation_and_escapes() {
        let text = "list = one, \\\n       two, \\\n       three\npath=C:\\\\temp\nkey\\ with\\ space=x\nuni=\\u00e9t\\u00e9\ntab=a\\tb\n";
        let props = parse_properties(text).unwrap();

        assert_eq!(props["list"], "one, two, three");
        assert_eq!(props["path"], "C:\\temp");
        assert_eq!(props["key with space"], "x");
        assert_eq!(props["uni"], "été");
        assert_eq!(props["tab"], "a\tb");
    }

    #[test]
    fn test_later_duplicate_wins() {
        let props = parse_properties("a=1\na=2\n").unwrap();
        assert_eq!(props["a"], "2");
    }

    #[test]
    fn test_malformed_unicode_escape() {
        assert!(parse_properties("a=\\u12\n").is_err());
    }

    #[test]
    fn test_toml_flattening() {
        let props = parse_toml(
            r#"
name = "app"

[server]
port = 9090
secure = true

[server.limits]
hosts = ["a", "b"]
"#,
        )
        .unwrap();

        assert_eq!(props["name"], "app");
        assert_eq!(props["server.port"], "9090");
        assert_eq!(props["server.secure"], "true");
        assert_eq!(props["server.limits.hosts"], "a,b");
    }

    #[test]
    fn test_read_file_by_extension() {
        let temp_dir = TempDir::new().unwrap();
        let toml_path = temp_dir.path().join("app.toml");
        let props_path = temp_dir.path().join("app.properties");
        std::fs::write(&toml_path, "[db]\nurl = \"x\"\n").unwrap();
        std::fs::write(&props_path, "db.url=y\n").unwrap();

        let reader = SourceReader::default();
        assert_eq!(reader.read_file(&toml_path).unwrap()["db.url"], "x");
        assert_eq!(reader.read_file(&props_path).unwrap()["db.url"], "y");
        assert!(reader.read_file(&temp_dir.path().join("missing.properties")).is_err());
    }

    #[test]
    fn test_encodings() {
        let latin1 = [b'a', b'=', 0xe9];
        assert!(TextEncoding::Utf8.decode(&latin1).is_err());
        assert_eq!(TextEncoding::Latin1.decode(&latin1).unwrap(), "a=é");
        assert_eq!(TextEncoding::Utf8Lossy.decode(&latin1).unwrap(), "a=\u{fffd}");

        let reader = SourceReader::new(TextEncoding::Latin1);
        assert_eq!(reader.read_bytes(&latin1).unwrap()["a"], "é");
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!("utf-8".parse::<TextEncoding>().unwrap(), TextEncoding::Utf8);
        assert_eq!("ISO-8859-1".parse::<TextEncoding>().unwrap(), TextEncoding::Latin1);
        assert_eq!("latin1".parse::<TextEncoding>().unwrap(), TextEncoding::Latin1);
        assert!("EBCDIC".parse::<TextEncoding>().is_err());
        assert_eq!(TextEncoding::Latin1.to_string(), "ISO-8859-1");
    }
}
