use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use flate2::{Compression, write::GzEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Js,
    Css,
    Wasm,
    Html,
}

impl AssetKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "js" => Some(AssetKind::Js),
            "css" => Some(AssetKind::Css),
            "wasm" => Some(AssetKind::Wasm),
            "html" => Some(AssetKind::Html),
            _ => None,
        }
    }

    /// HTML is counted raw only.
    pub fn is_compressed(self) -> bool {
        !matches!(self, AssetKind::Html)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleFile {
    pub path: String,
    pub kind: AssetKind,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gzipped_size: Option<u64>,
}

/// Raw and compressed size totals of one build output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSummary {
    #[serde(rename = "totalJS")]
    pub total_js: u64,
    #[serde(rename = "totalCSS")]
    pub total_css: u64,
    #[serde(rename = "totalWASM")]
    pub total_wasm: u64,
    #[serde(rename = "totalHTML")]
    pub total_html: u64,
    #[serde(rename = "totalGzipped")]
    pub total_gzipped: u64,
    #[serde(default)]
    pub files: Vec<BundleFile>,
    /// Set when the build output could not be exported or read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BundleSummary {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// JS + CSS + WASM, the figure reported as the raw bundle size.
    pub fn total_size(&self) -> u64 {
        self.total_js + self.total_css + self.total_wasm
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

struct ByteCounter(u64);

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Size of the file after gzip at the default level.
pub fn gzipped_size(path: &Path) -> io::Result<u64> {
    let mut input = File::open(path)?;
    let mut encoder = GzEncoder::new(ByteCounter(0), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    Ok(encoder.finish()?.0)
}

/// Walk `root` and total the classified assets. A missing root yields zeros.
pub fn inspect_bundle(root: &Path) -> BundleSummary {
    let mut summary = BundleSummary::default();
    if !root.exists() {
        debug!(path = %root.display(), "bundle directory missing");
        return summary;
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable bundle entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(kind) = AssetKind::from_path(path) else {
            continue;
        };
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unable to stat bundle file");
                continue;
            }
        };
        let gzipped = if kind.is_compressed() {
            match gzipped_size(path) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unable to compress bundle file");
                    Some(0)
                }
            }
        } else {
            None
        };

        match kind {
            AssetKind::Js => summary.total_js += size,
            AssetKind::Css => summary.total_css += size,
            AssetKind::Wasm => summary.total_wasm += size,
            AssetKind::Html => summary.total_html += size,
        }
        summary.total_gzipped += gzipped.unwrap_or(0);

        let relative = path.strip_prefix(root).unwrap_or(path);
        summary.files.push(BundleFile {
            path: relative.to_string_lossy().replace('\\', "/"),
            kind,
            size,
            gzipped_size: gzipped,
        });
    }

    summary
        .files
        .sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
    summary
}

/// Inspect a bundle copied into a throwaway staging directory by `export`.
/// The staging directory is removed once inspection finishes.
pub fn inspect_staged<F>(export: F) -> Result<BundleSummary>
where
    F: FnOnce(&Path) -> Result<PathBuf>,
{
    let staging = tempfile::Builder::new()
        .prefix("framebench-bundle-")
        .tempdir()
        .context("Failed to create bundle staging directory")?;
    let exported = export(staging.path())?;
    let summary = inspect_bundle(&exported);
    staging
        .close()
        .context("Failed to remove bundle staging directory")?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(root: &Path, relative: &str, contents: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn assets_are_classified_and_totalled() {
        let dir = tempdir().unwrap();
        let js = "console.log('todo');\n".repeat(200);
        write(dir.path(), "app.js", js.as_bytes());
        write(dir.path(), "assets/chunk.JS", b"export const x = 1;");
        write(dir.path(), "style.css", b"body { margin: 0 }");
        write(dir.path(), "pkg/app_bg.wasm", &[0u8, 97, 115, 109, 1, 0, 0, 0]);
        write(dir.path(), "index.html", b"<html></html>");
        write(dir.path(), "favicon.ico", &[1, 2, 3]);
        write(dir.path(), "README.txt", b"ignored");

        let summary = inspect_bundle(dir.path());

        assert_eq!(summary.total_js, js.len() as u64 + 19);
        assert_eq!(summary.total_css, 18);
        assert_eq!(summary.total_wasm, 8);
        assert_eq!(summary.total_html, 13);
        assert_eq!(summary.total_size(), js.len() as u64 + 19 + 18 + 8);
        assert_eq!(summary.files.len(), 5);
        assert_eq!(summary.files[0].path, "app.js");

        let gzipped: u64 = summary.files.iter().filter_map(|f| f.gzipped_size).sum();
        assert_eq!(summary.total_gzipped, gzipped);
        assert!(summary.files[0].gzipped_size.unwrap() < js.len() as u64);
        let html = summary.files.iter().find(|f| f.kind == AssetKind::Html).unwrap();
        assert!(html.gzipped_size.is_none());
    }

    #[test]
    fn missing_root_reports_zeros() {
        let dir = tempdir().unwrap();
        let summary = inspect_bundle(&dir.path().join("dist"));
        assert_eq!(summary, BundleSummary::default());
        assert!(summary.is_empty());
    }

    #[test]
    fn gzip_size_matches_encoder_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.js");
        fs::write(&path, "a".repeat(4096)).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all("a".repeat(4096).as_bytes()).unwrap();
        let expected = encoder.finish().unwrap().len() as u64;

        assert_eq!(gzipped_size(&path).unwrap(), expected);
    }

    #[test]
    fn staging_directory_is_removed() {
        let mut staged = PathBuf::new();
        let summary = inspect_staged(|dir| {
            staged = dir.to_path_buf();
            let bundle = dir.join("bundle");
            write(&bundle, "main.js", b"let a = 1;");
            Ok(bundle)
        })
        .unwrap();

        assert_eq!(summary.total_js, 10);
        assert!(!staged.as_os_str().is_empty());
        assert!(!staged.exists());
    }
}
