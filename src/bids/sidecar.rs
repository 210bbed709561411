//! Sidecar metadata and the field-direction side-channel.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::work_unit::DEFAULT_FIELD_DIRECTION;
use crate::error::SidecarError;

/// The subset of sidecar metadata used for grouping.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SidecarMetadata {
    #[serde(rename = "EchoTime")]
    pub echo_time: Option<f64>,
    #[serde(rename = "MagneticFieldStrength")]
    pub field_strength: Option<f64>,
    #[serde(rename = "B0_dir")]
    pub field_direction: Option<[f64; 3]>,
}

impl SidecarMetadata {
    /// Reads and parses a sidecar.
    pub fn read(path: &Path) -> Result<Self, SidecarError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Echo time, ignoring a zero value which carries no information.
    pub fn usable_echo_time(&self) -> Option<f64> {
        self.echo_time.filter(|t| *t != 0.0)
    }
}

/// One entry of the forward-simulation parameter file.
#[derive(Debug, Deserialize)]
struct ForwardParams {
    #[serde(rename = "--acq")]
    acquisition: Option<String>,
    #[serde(rename = "--B0-dir")]
    field_direction: Option<[f64; 3]>,
}

/// Default field direction per acquisition label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDirectionMap {
    by_acquisition: HashMap<String, [f64; 3]>,
}

impl FieldDirectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the map from a parameter file: a JSON list of objects with
    /// `--acq` and an optional `--B0-dir`.
    ///
    /// A missing file yields an empty map. An invalid file is an error the
    /// caller reports as a warning.
    pub fn load(path: &Path) -> Result<Self, SidecarError> {
        if !path.exists() {
            debug!("No field direction file at {}", path.display());
            return Ok(Self::default());
        }
        info!("Reading field directions from {}", path.display());
        let content = fs::read_to_string(path)?;
        let entries: Vec<ForwardParams> = serde_json::from_str(&content)?;

        let mut map = Self::default();
        for entry in entries {
            if let Some(acq) = entry.acquisition {
                let dir = entry.field_direction.unwrap_or(DEFAULT_FIELD_DIRECTION);
                info!(acquisition = %acq, direction = ?dir, "Found field direction");
                map.insert(acq, dir);
            }
        }
        Ok(map)
    }

    pub fn insert(&mut self, acquisition: impl Into<String>, direction: [f64; 3]) {
        self.by_acquisition.insert(acquisition.into(), direction);
    }

    pub fn get(&self, acquisition: Option<&str>) -> Option<[f64; 3]> {
        acquisition.and_then(|a| self.by_acquisition.get(a).copied())
    }

    pub fn is_empty(&self) -> bool {
        self.by_acquisition.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_sidecar() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("echo.json");
        fs::write(
            &path,
            r#"{"EchoTime": 0.004, "MagneticFieldStrength": 7, "Manufacturer": "Siemens"}"#,
        )
        .unwrap();

        let meta = SidecarMetadata::read(&path).unwrap();
        assert_eq!(meta.usable_echo_time(), Some(0.004));
        assert_eq!(meta.field_strength, Some(7.0));
        assert!(meta.field_direction.is_none());
    }

    #[test]
    fn test_invalid_sidecar() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SidecarMetadata::read(&path),
            Err(SidecarError::Json(_))
        ));
        assert!(matches!(
            SidecarMetadata::read(&temp.path().join("missing.json")),
            Err(SidecarError::Io(_))
        ));
    }

    #[test]
    fn test_zero_echo_time_ignored() {
        let meta = SidecarMetadata {
            echo_time: Some(0.0),
            ..Default::default()
        };
        assert_eq!(meta.usable_echo_time(), None);
    }

    #[test]
    fn test_field_direction_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("qsm-forward-params.json");
        fs::write(
            &path,
            r#"[{"--acq": "1p0mm", "--B0-dir": [0.1, 0.0, 0.99]}, {"--acq": "2p0mm"}, {"--TE": [0.004]}]"#,
        )
        .unwrap();

        let map = FieldDirectionMap::load(&path).unwrap();
        assert_eq!(map.get(Some("1p0mm")), Some([0.1, 0.0, 0.99]));
        assert_eq!(map.get(Some("2p0mm")), Some(DEFAULT_FIELD_DIRECTION));
        assert_eq!(map.get(Some("other")), None);
        assert_eq!(map.get(None), None);
    }

    #[test]
    fn test_invalid_field_direction_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("params.json");
        fs::write(&path, r#"{"--acq": "not a list"}"#).unwrap();

        let err = FieldDirectionMap::load(&path).unwrap_err();
        assert!(matches!(err, SidecarError::Json(_)));
        assert!(err.to_string().starts_with("invalid JSON"));
    }

    #[test]
    fn test_missing_field_direction_file() {
        let temp = TempDir::new().unwrap();
        let map = FieldDirectionMap::load(&temp.path().join("none.json")).unwrap();
        assert!(map.is_empty());
    }
}
