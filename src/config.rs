//! Runtime configuration
//!
//! Everything the build-time collaborator tells the runtime about where its
//! output lives: the public path, filename templates for chunks and hot-update
//! payloads, the per-chunk content hashes and the resource load timeout.
//!
//! # Example
//! ```text
//! {
//!   "public_path": "/assets/",
//!   "runtime_chunk": "main",
//!   "chunk_hashes": { "js": { "vendors": "3f2a" }, "css": { "vendors": "91bc" } }
//! }
//! ```

use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::chunks::ChunkId;
use crate::error::{Error, Result};

/// Default timeout for an injected script or stylesheet, in milliseconds
pub const DEFAULT_CHUNK_LOAD_TIMEOUT_MS: u64 = 120_000;

/// Content hashes recorded per chunk, split by output type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHashes {
    #[serde(default)]
    pub js: HashMap<ChunkId, String>,
    #[serde(default)]
    pub css: HashMap<ChunkId, String>,
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Prefix for every URL the runtime requests
    pub public_path: String,
    /// Marker prefix for the `data-webpack` attribute on injected scripts
    pub unique_name: String,
    /// Runtime-wide chunk name; the update manifest is derived from it
    pub runtime_chunk: String,
    /// Template for lazily loaded chunks (`[id]`, `[hash]`, `[ext]`)
    pub chunk_filename: String,
    /// Template for hot-update payload chunks (`[id]`, `[hash]`)
    pub hot_update_chunk_filename: String,
    /// Template for the update manifest (`[runtime]`, `[hash]`)
    pub hot_update_main_filename: String,
    /// How long an injected resource may stay silent before it counts as failed
    pub chunk_load_timeout_ms: u64,
    /// Install the hot-update coordinator
    pub hot: bool,
    pub chunk_hashes: ChunkHashes,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            public_path: "/".to_string(),
            unique_name: "hotchunk".to_string(),
            runtime_chunk: "main".to_string(),
            chunk_filename: "static/[ext]/[id].[hash].chunk.[ext]".to_string(),
            hot_update_chunk_filename: "[id].hot-update.js".to_string(),
            hot_update_main_filename: "[runtime].hot-update.json".to_string(),
            chunk_load_timeout_ms: DEFAULT_CHUNK_LOAD_TIMEOUT_MS,
            hot: true,
            chunk_hashes: ChunkHashes::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|e| Error::config(e.to_string()))
    }

    /// Load a JSON configuration file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&source)
    }

    pub fn with_public_path(mut self, public_path: impl Into<String>) -> Self {
        self.public_path = public_path.into();
        self
    }

    pub fn with_runtime_chunk(mut self, runtime_chunk: impl Into<String>) -> Self {
        self.runtime_chunk = runtime_chunk.into();
        self
    }

    pub fn with_hot(mut self, hot: bool) -> Self {
        self.hot = hot;
        self
    }

    pub fn with_chunk_load_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_load_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_chunk_hash(mut self, chunk_id: impl Into<ChunkId>, kind: HashKind, hash: impl Into<String>) -> Self {
        let table = match kind {
            HashKind::Js => &mut self.chunk_hashes.js,
            HashKind::Css => &mut self.chunk_hashes.css,
        };
        table.insert(chunk_id.into(), hash.into());
        self
    }

    pub fn chunk_load_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_load_timeout_ms)
    }

    /// Path of a lazily loaded chunk, relative to the public path
    pub fn chunk_path(&self, chunk_id: &ChunkId, kind: HashKind, hash: Option<&str>) -> String {
        render_template(&self.chunk_filename, &[
            ("[id]", chunk_id.as_str()),
            ("[ext]", kind.extension()),
        ], hash)
    }

    /// Full URL of a hot-update payload chunk
    pub fn hot_update_chunk_url(&self, chunk_id: &ChunkId, hash: Option<&str>) -> String {
        let path = render_template(&self.hot_update_chunk_filename, &[("[id]", chunk_id.as_str())], hash);
        format!("{}{}", self.public_path, path)
    }

    /// Full URL of the update manifest
    pub fn hot_update_manifest_url(&self, hash: Option<&str>) -> String {
        let path = render_template(&self.hot_update_main_filename, &[("[runtime]", self.runtime_chunk.as_str())], hash);
        format!("{}{}", self.public_path, path)
    }
}

/// Output type a chunk hash belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    Js,
    Css,
}

impl HashKind {
    pub fn extension(&self) -> &'static str {
        match self {
            HashKind::Js => "js",
            HashKind::Css => "css",
        }
    }
}

/// Substitute placeholders; `[hash]` and the separator before it vanish when no hash is known
fn render_template(template: &str, replacements: &[(&str, &str)], hash: Option<&str>) -> String {
    let mut out = match hash {
        Some(hash) => template.replace("[hash]", hash),
        None => template.replace(".[hash]", "").replace("[hash]", ""),
    };
    for (placeholder, value) in replacements {
        out = out.replace(placeholder, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.public_path, "/");
        assert_eq!(config.chunk_load_timeout(), Duration::from_millis(120_000));
        assert!(config.hot);
    }

    #[test]
    fn test_chunk_path_with_and_without_hash() {
        let config = RuntimeConfig::default();
        let id = ChunkId::from("about");
        assert_eq!(config.chunk_path(&id, HashKind::Js, Some("abc123")), "static/js/about.abc123.chunk.js");
        assert_eq!(config.chunk_path(&id, HashKind::Css, None), "static/css/about.chunk.css");
    }

    #[test]
    fn test_hot_update_urls() {
        let config = RuntimeConfig::default()
            .with_public_path("/assets/")
            .with_runtime_chunk("runtime");
        assert_eq!(config.hot_update_manifest_url(None), "/assets/runtime.hot-update.json");
        assert_eq!(
            config.hot_update_chunk_url(&ChunkId::from("main"), None),
            "/assets/main.hot-update.js"
        );
    }

    #[test]
    fn test_from_json_partial() {
        let config = RuntimeConfig::from_json_str(
            r#"{ "public_path": "/cdn/", "chunk_hashes": { "css": { "7": "ff00" } } }"#,
        )
        .unwrap();
        assert_eq!(config.public_path, "/cdn/");
        assert_eq!(config.runtime_chunk, "main");
        assert_eq!(config.chunk_hashes.css.get(&ChunkId::from("7")).map(String::as_str), Some("ff00"));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, r#"{{ "hot": false, "chunk_load_timeout_ms": 5000 }}"#).unwrap();
        }

        let config = RuntimeConfig::from_path(&path).unwrap();
        assert!(!config.hot);
        assert_eq!(config.chunk_load_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = RuntimeConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
