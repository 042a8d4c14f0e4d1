use std::fs;
use std::path::{Path, PathBuf};

use pixflow::PipelineSettings;
use pixflow::disk_cache::DataCacheConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Contents of the configuration file.
///
/// ```toml
/// output_dir = "images"
///
/// [pipeline]
/// is_progressive_decoding_enabled = true
///
/// [pipeline.disk_cache]
/// path = "/var/cache/pixflow"
/// size_limit = 52428800
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_dir: Option<PathBuf>,
    pub pipeline: PipelineSettings,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Pipeline settings with a disk cache always configured, at `cache_dir`
    /// when given.
    pub fn pipeline_settings(&self, cache_dir: Option<PathBuf>) -> PipelineSettings {
        let mut settings = self.pipeline.clone();
        let mut disk_cache = settings.disk_cache.take().unwrap_or_default();
        if let Some(path) = cache_dir {
            disk_cache.path = path;
        }
        settings.disk_cache = Some(disk_cache);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_path_gives_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert!(config.output_dir.is_none());
        assert_eq!(config.pipeline, PipelineSettings::default());
    }

    #[test]
    fn loads_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "output_dir = \"out\"\n\n[pipeline]\nis_rate_limiter_enabled = false\n\n[pipeline.queues]\ndecoding = 3"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.output_dir, Some(PathBuf::from("out")));
        assert!(!config.pipeline.is_rate_limiter_enabled);
        assert!(config.pipeline.is_deduplication_enabled);
        assert_eq!(config.pipeline.queues.decoding, 3);
        assert_eq!(config.pipeline.queues.data_loading, 6);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline\nbroken").unwrap();
        assert!(AppConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn cache_dir_overrides_configured_path() {
        let config = AppConfig::default();
        let settings = config.pipeline_settings(Some(PathBuf::from("/tmp/px")));
        let disk_cache = settings.disk_cache.expect("disk cache configured");
        assert_eq!(disk_cache.path, PathBuf::from("/tmp/px"));
        assert_eq!(disk_cache.size_limit, DataCacheConfig::default().size_limit);
    }
}
