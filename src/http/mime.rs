//! MIME type detection based on file extensions.

use std::collections::HashMap;

const DEFAULTS: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("txt", "text/plain"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("xml", "text/xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("ico", "image/vnd.microsoft.icon"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/x-gzip"),
    ("wasm", "application/wasm"),
];

/// Extension to content-type table.
#[derive(Debug, Clone)]
pub struct MimeTypes {
    types: HashMap<String, String>,
}

impl Default for MimeTypes {
    fn default() -> Self {
        Self {
            types: DEFAULTS
                .iter()
                .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
                .collect(),
        }
    }
}

impl MimeTypes {
    /// Default table with `overrides` layered on top.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut table = Self::default();
        for (ext, mime) in overrides {
            table.add(ext, mime);
        }
        table
    }

    pub fn add(&mut self, ext: &str, mime: &str) {
        self.types.insert(
            ext.trim_start_matches('.').to_ascii_lowercase(),
            mime.to_string(),
        );
    }

    pub fn lookup(&self, ext: &str) -> Option<&str> {
        self.types
            .get(&ext.to_ascii_lowercase())
            .map(String::as_str)
    }
}
