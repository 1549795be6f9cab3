//! # Build metadata and its on-disk cache
//!
//! Build metadata comes from an external service keyed by target and
//! release. [`BuildMetadataSource`] is the seam to that service;
//! [`BuildInfoCache`] keeps one JSON file per (target, release) pair and
//! treats entries older than a day as absent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Kind of release usable for flashing.
pub const STABLE_RELEASE: &str = "Stable";

/// Metadata record of one build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Custom defaults lines to embed in the image, if the build has any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Vec<String>>,
    /// Every other field of the record, kept so the cache round-trips it.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BuildInfo {
    /// Configuration lines, empty when the build carries none.
    pub fn configuration_lines(&self) -> &[String] {
        self.configuration.as_deref().unwrap_or_default()
    }
}

/// One entry of a target's release list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Release identifier, e.g. `4.5.1`.
    pub release: String,
    /// Release kind, e.g. `Stable` or `ReleaseCandidate`.
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct TargetReleases {
    #[serde(default)]
    releases: Vec<Release>,
}

/// Releases whose kind is [`STABLE_RELEASE`], in their original order.
pub fn stable_releases(releases: &[Release]) -> Vec<Release> {
    releases.iter().filter(|r| r.kind == STABLE_RELEASE).cloned().collect()
}

/// Source of build metadata.
pub trait BuildMetadataSource {
    /// All releases published for `target`.
    fn releases(&self, target: &str) -> anyhow::Result<Vec<Release>>;

    /// Metadata of `release` built for `target`.
    fn build_info(&self, release: &str, target: &str) -> anyhow::Result<BuildInfo>;
}

/// Metadata served from a local directory laid out like the build API:
/// `targets/{target}.json` and `builds/{release}/{target}.json`.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    root: PathBuf,
}

impl JsonDirSource {
    /// Serve files below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JsonDirSource { root: root.into() }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

impl BuildMetadataSource for JsonDirSource {
    fn releases(&self, target: &str) -> anyhow::Result<Vec<Release>> {
        let path = self.root.join("targets").join(format!("{target}.json"));
        Ok(read_json::<TargetReleases>(&path)?.releases)
    }

    fn build_info(&self, release: &str, target: &str) -> anyhow::Result<BuildInfo> {
        read_json(&self.root.join("builds").join(release).join(format!("{target}.json")))
    }
}

/// One-file-per-build cache of [`BuildInfo`] records.
///
/// Concurrent writers are not guarded; one process runs per flashing session.
#[derive(Debug, Clone)]
pub struct BuildInfoCache {
    dir: PathBuf,
    max_age: Duration,
}

impl BuildInfoCache {
    /// Entries older than this are refetched.
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(86_400);

    /// Cache in `dir`, created on first store.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        BuildInfoCache { dir: dir.into(), max_age: Self::DEFAULT_MAX_AGE }
    }

    /// Override the staleness limit.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// File holding the entry for `target` and `release`.
    pub fn path_for(&self, target: &str, release: &str) -> PathBuf {
        let name = format!("cfg_{}_{}.json", target, release.replace('.', "_"));
        self.dir.join(name.to_lowercase())
    }

    /// A fresh cached entry, or `None` if missing or stale.
    pub fn load(&self, target: &str, release: &str) -> anyhow::Result<Option<BuildInfo>> {
        let path = self.path_for(target, release);
        let Ok(metadata) = std::fs::metadata(&path) else {
            return Ok(None);
        };
        // An mtime in the future counts as brand new.
        let age = metadata.modified()?.elapsed().unwrap_or_default();
        if age >= self.max_age {
            tracing::debug!(path = %path.display(), ?age, "cached build info is stale");
            return Ok(None);
        }
        tracing::info!(path = %path.display(), "build info from cache");
        read_json(&path).map(Some)
    }

    /// Write an entry, creating the cache directory if needed.
    pub fn store(&self, target: &str, release: &str, info: &BuildInfo) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| format!("create {}", self.dir.display()))?;
        let path = self.path_for(target, release);
        let text = serde_json::to_string(info)?;
        std::fs::write(&path, text).with_context(|| format!("write {}", path.display()))
    }

    /// Cached entry if fresh, otherwise fetch from `source` and cache it.
    pub fn get_or_fetch(
        &self,
        source: &impl BuildMetadataSource,
        target: &str,
        release: &str,
    ) -> anyhow::Result<BuildInfo> {
        if let Some(info) = self.load(target, release)? {
            return Ok(info);
        }
        let info = source
            .build_info(release, target)
            .with_context(|| format!("fetch build info for {target} {release}"))?;
        self.store(target, release, &info)?;
        Ok(info)
    }
}

/// Release and target encoded in a firmware file name such as
/// `betaflight_4.5.1_STM32F7X2_SPEEDYBEEF7V3.hex`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HexFileName {
    /// Second `_`-separated field.
    pub release: Option<String>,
    /// Fourth `_`-separated field.
    pub target: Option<String>,
}

impl HexFileName {
    /// Split the file stem of `path` on `_`.
    pub fn parse(path: impl AsRef<Path>) -> Self {
        let stem = path.as_ref().file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let items: Vec<&str> = stem.split('_').collect();
        HexFileName {
            release: items.get(1).map(|s| s.to_string()),
            target: items.get(3).map(|s| s.to_string()),
        }
    }
}
