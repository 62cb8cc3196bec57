use std::path::Path;
use std::time::Duration;

use beacon_writer::WriterConfig;
use serde::Deserialize;

use crate::error::BeaconError;

/// On-disk settings file. Every field is optional so a file only overrides
/// what it cares about; anything left out keeps [`Settings::default`].
/// Parsing this is purely a binary-level concern — `beacon-writer` and
/// `beacon-reactor` never load files or know this type exists.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub capacity_bytes: Option<usize>,
    pub chunk_bytes: Option<usize>,
    pub idle_threshold_secs: Option<u64>,
}

impl FileSettings {
    pub fn load(path: &Path) -> Result<Self, BeaconError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| BeaconError::SettingsRead { path: path.display().to_string(), source })?;
        serde_json::from_str(&text)
            .map_err(|source| BeaconError::SettingsParse { path: path.display().to_string(), source })
    }
}

/// Typed settings the binary assembles from CLI flags layered over an
/// optional settings file, then translates into `beacon-writer`'s and
/// `beacon-reactor`'s own config types before construction.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub writer: WriterConfig,
    pub idle_threshold: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self { writer: WriterConfig::default(), idle_threshold: Duration::from_secs(60) }
    }
}

impl Settings {
    pub fn merge_file(mut self, file: &FileSettings) -> Self {
        if let Some(capacity_bytes) = file.capacity_bytes {
            self.writer.capacity_bytes = capacity_bytes;
        }
        if let Some(chunk_bytes) = file.chunk_bytes {
            self.writer.chunk_bytes = chunk_bytes;
        }
        if let Some(secs) = file.idle_threshold_secs {
            self.idle_threshold = Duration::from_secs(secs);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_file_only_overrides_fields_present_in_the_file() {
        let defaults = Settings::default();
        let file = FileSettings { capacity_bytes: Some(4096), chunk_bytes: None, idle_threshold_secs: None };

        let merged = defaults.merge_file(&file);

        assert_eq!(merged.writer.capacity_bytes, 4096);
        assert_eq!(merged.writer.chunk_bytes, defaults.writer.chunk_bytes);
        assert_eq!(merged.idle_threshold, defaults.idle_threshold);
    }

    #[test]
    fn load_parses_a_settings_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.json");
        std::fs::write(&path, r#"{"capacity_bytes": 8192, "idle_threshold_secs": 30}"#).unwrap();

        let file = FileSettings::load(&path).unwrap();

        assert_eq!(file.capacity_bytes, Some(8192));
        assert_eq!(file.chunk_bytes, None);
        assert_eq!(file.idle_threshold_secs, Some(30));
    }

    #[test]
    fn load_reports_a_parse_error_for_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileSettings::load(&path).unwrap_err();

        assert!(matches!(err, BeaconError::SettingsParse { .. }));
    }
}
