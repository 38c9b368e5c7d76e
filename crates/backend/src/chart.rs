//! Chart loading. Rendering is left to the backend; loading only resolves and checks the source.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tillerman_core::PackageSource;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("no chart given")]
    Empty,
    #[error("chart not found at {path}")]
    NotFound { path: String },
    #[error("reading {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("parsing {path}: {source}")]
    Metadata { path: String, #[source] source: serde_yaml::Error },
    #[error("chart {name} is version {found}, requested {requested}")]
    VersionMismatch { name: String, found: String, requested: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedChart {
    pub path: PathBuf,
    /// From `Chart.yaml`; unknown for packaged archives.
    pub name: Option<String>,
    pub version: Option<String>,
    pub requested_version: Option<String>,
}

pub trait ChartLoader: Send + Sync {
    fn load(&self, source: &PackageSource) -> Result<LoadedChart, ChartError>;
}

/// Loads chart directories and packaged `.tgz` archives from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChartDir;

#[derive(Debug, Deserialize)]
struct ChartMetadata {
    name: String,
    #[serde(default)]
    version: String,
}

impl ChartLoader for ChartDir {
    fn load(&self, source: &PackageSource) -> Result<LoadedChart, ChartError> {
        if source.path.is_empty() {
            return Err(ChartError::Empty);
        }
        let path = Path::new(&source.path);
        if path.is_file() {
            debug!(chart = %source.path, "using packaged chart");
            return Ok(LoadedChart { path: path.to_path_buf(), name: None, version: None, requested_version: source.version.clone() });
        }
        if !path.is_dir() {
            return Err(ChartError::NotFound { path: source.path.clone() });
        }
        let meta_path = path.join("Chart.yaml");
        let meta_display = meta_path.display().to_string();
        let text = std::fs::read_to_string(&meta_path).map_err(|source| ChartError::Io { path: meta_display.clone(), source })?;
        let meta: ChartMetadata = serde_yaml::from_str(&text).map_err(|source| ChartError::Metadata { path: meta_display, source })?;
        if let Some(requested) = source.version.as_deref() {
            if requested != meta.version {
                return Err(ChartError::VersionMismatch { name: meta.name, found: meta.version, requested: requested.to_string() });
            }
        }
        debug!(chart = %meta.name, version = %meta.version, "loaded chart directory");
        Ok(LoadedChart {
            path: path.to_path_buf(),
            name: Some(meta.name),
            version: Some(meta.version),
            requested_version: source.version.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tillerman-chart-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn src(path: &Path, version: Option<&str>) -> PackageSource {
        PackageSource { path: path.display().to_string(), version: version.map(str::to_string) }
    }

    #[test]
    fn loads_chart_directory_metadata() {
        let dir = scratch("dir");
        std::fs::write(dir.join("Chart.yaml"), "apiVersion: v1\nname: web\nversion: 0.3.1\n").unwrap();
        let c = ChartDir.load(&src(&dir, Some("0.3.1"))).unwrap();
        assert_eq!(c.name.as_deref(), Some("web"));
        assert_eq!(c.version.as_deref(), Some("0.3.1"));
        assert_eq!(c.requested_version.as_deref(), Some("0.3.1"));
    }

    #[test]
    fn rejects_version_mismatch() {
        let dir = scratch("mismatch");
        std::fs::write(dir.join("Chart.yaml"), "name: web\nversion: 0.3.1\n").unwrap();
        let e = ChartDir.load(&src(&dir, Some("0.4.0"))).unwrap_err();
        assert_eq!(e.to_string(), "chart web is version 0.3.1, requested 0.4.0");
    }

    #[test]
    fn accepts_packaged_archive() {
        let dir = scratch("archive");
        let tgz = dir.join("web-0.3.1.tgz");
        std::fs::write(&tgz, b"not really gzip").unwrap();
        let c = ChartDir.load(&src(&tgz, Some("0.3.1"))).unwrap();
        assert_eq!(c.path, tgz);
        assert_eq!(c.name, None);
        assert_eq!(c.requested_version.as_deref(), Some("0.3.1"));
    }

    #[test]
    fn missing_or_empty_sources_fail() {
        assert!(matches!(ChartDir.load(&PackageSource { path: String::new(), version: None }), Err(ChartError::Empty)));
        let e = ChartDir.load(&PackageSource { path: "/nonexistent/tillerman/chart".into(), version: None }).unwrap_err();
        assert!(matches!(e, ChartError::NotFound { .. }));
        let dir = scratch("nometa");
        assert!(matches!(ChartDir.load(&src(&dir, None)), Err(ChartError::Io { .. })));
    }
}
