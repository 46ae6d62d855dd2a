use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Runtime classification of a benchmarked implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Javascript,
    Rust,
    Php,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TargetKind::Javascript => "javascript",
            TargetKind::Rust => "rust",
            TargetKind::Php => "php",
        };
        f.write_str(label)
    }
}

/// One framework implementation served from its own compose service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub port: u16,
    /// Compose service id; defaults to the target name.
    #[serde(default)]
    pub service: Option<String>,
    pub kind: TargetKind,
    /// Directory inside the container that holds the served bundle.
    #[serde(default)]
    pub bundle_path: Option<String>,
    /// Local build output used by the standalone bundle command.
    #[serde(default)]
    pub dist_dir: Option<PathBuf>,
}

const NGINX_BUNDLE_PATH: &str = "/usr/share/nginx/html";
const PHP_BUNDLE_PATH: &str = "/var/www/html";

const DEFAULT_TARGETS: &[(&str, u16, TargetKind)] = &[
    ("react", 3001, TargetKind::Javascript),
    ("vue", 3002, TargetKind::Javascript),
    ("angular", 3003, TargetKind::Javascript),
    ("leptos", 3004, TargetKind::Rust),
    ("yew", 3005, TargetKind::Rust),
    ("dioxus", 3006, TargetKind::Rust),
    ("blade", 3007, TargetKind::Php),
];

impl Target {
    pub fn new(name: impl Into<String>, port: u16, kind: TargetKind) -> Self {
        Self {
            name: name.into(),
            port,
            service: None,
            kind,
            bundle_path: None,
            dist_dir: None,
        }
    }

    pub fn service(&self) -> &str {
        self.service.as_deref().unwrap_or(&self.name)
    }

    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub fn container_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.name)
    }

    pub fn bundle_path(&self) -> &str {
        match (&self.bundle_path, self.kind) {
            (Some(path), _) => path,
            (None, TargetKind::Php) => PHP_BUNDLE_PATH,
            (None, _) => NGINX_BUNDLE_PATH,
        }
    }

    pub fn resolve_dist_dir(&self, project_root: &Path) -> PathBuf {
        match &self.dist_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_root.join(dir),
            None => project_root
                .join("implementations")
                .join(&self.name)
                .join("dist"),
        }
    }
}

pub fn default_targets() -> Vec<Target> {
    DEFAULT_TARGETS
        .iter()
        .map(|(name, port, kind)| Target::new(*name, *port, *kind))
        .collect()
}

pub fn find_target<'a>(targets: &'a [Target], name: &str) -> Option<&'a Target> {
    let needle = name.trim();
    if needle.is_empty() {
        return None;
    }
    targets
        .iter()
        .find(|target| target.name.eq_ignore_ascii_case(needle))
}

/// Narrow `targets` to the requested names, keeping declaration order.
/// An empty selection keeps every target.
pub fn select_targets(targets: &[Target], names: &[String]) -> Result<Vec<Target>> {
    if names.is_empty() {
        return Ok(targets.to_vec());
    }
    for name in names {
        if find_target(targets, name).is_none() {
            let known: Vec<&str> = targets.iter().map(|target| target.name.as_str()).collect();
            bail!("unknown target '{name}' (known: {})", known.join(", "));
        }
    }
    Ok(targets
        .iter()
        .filter(|target| {
            names
                .iter()
                .any(|name| target.name.eq_ignore_ascii_case(name.trim()))
        })
        .cloned()
        .collect())
}
