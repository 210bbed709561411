//! The work unit: one logical acquisition and all files belonging to it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::entities::{FileKind, Part};

/// Default main magnetic field direction.
pub const DEFAULT_FIELD_DIRECTION: [f64; 3] = [0.0, 0.0, 1.0];

/// Derivatives of a unit: producing software -> artifact kind -> paths.
pub type DerivativeMap = BTreeMap<String, BTreeMap<String, Vec<PathBuf>>>;

/// Composite identity of a work unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub subject: String,
    pub session: Option<String>,
    pub acquisition: Option<String>,
    pub run: Option<String>,
}

impl UnitKey {
    pub fn new(
        subject: impl Into<String>,
        session: Option<String>,
        acquisition: Option<String>,
        run: Option<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            session,
            acquisition,
            run,
        }
    }

    /// Sort key with the empty string standing in for missing fields.
    pub fn sort_key(&self) -> (&str, &str, &str, &str) {
        (
            &self.subject,
            self.session.as_deref().unwrap_or(""),
            self.acquisition.as_deref().unwrap_or(""),
            self.run.as_deref().unwrap_or(""),
        )
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.subject)?;
        if let Some(ses) = &self.session {
            write!(f, "_ses-{}", ses)?;
        }
        if let Some(acq) = &self.acquisition {
            write!(f, "_acq-{}", acq)?;
        }
        if let Some(run) = &self.run {
            write!(f, "_run-{}", run)?;
        }
        Ok(())
    }
}

/// Region-of-interest mask reference: a single path, or several when more
/// than one mask applies to the unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaskPaths {
    Single(PathBuf),
    Many(Vec<PathBuf>),
}

impl MaskPaths {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            MaskPaths::Single(p) => vec![p.as_path()],
            MaskPaths::Many(ps) => ps.iter().map(PathBuf::as_path).collect(),
        }
    }

    fn with(self, path: PathBuf) -> Self {
        let mut all: Vec<PathBuf> = match self {
            MaskPaths::Single(p) => vec![p],
            MaskPaths::Many(ps) => ps,
        };
        insert_sorted(&mut all, path);
        if all.len() == 1 {
            MaskPaths::Single(all.remove(0))
        } else {
            MaskPaths::Many(all)
        }
    }
}

/// One logical acquisition to be processed.
///
/// The serialized form is the input document handed to algorithms, so the
/// field names follow the established `inputs.json` schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    #[serde(rename = "Subject")]
    pub subject: String,
    #[serde(rename = "Session")]
    pub session: Option<String>,
    #[serde(rename = "Acquisition")]
    pub acquisition: Option<String>,
    #[serde(rename = "Run")]
    pub run: Option<String>,
    #[serde(default)]
    pub mag_nii: Vec<PathBuf>,
    #[serde(default)]
    pub phase_nii: Vec<PathBuf>,
    #[serde(default)]
    pub mag_json: Vec<PathBuf>,
    #[serde(default)]
    pub phase_json: Vec<PathBuf>,
    #[serde(rename = "EchoTime", default)]
    pub echo_times: Vec<f64>,
    #[serde(rename = "MagneticFieldStrength", default)]
    pub field_strength: Option<f64>,
    #[serde(rename = "B0_dir", default = "default_field_direction")]
    pub field_direction: [f64; 3],
    #[serde(rename = "Derivatives", default)]
    pub derivatives: DerivativeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<MaskPaths>,
}

fn default_field_direction() -> [f64; 3] {
    DEFAULT_FIELD_DIRECTION
}

impl WorkUnit {
    /// Creates an empty unit for the given identity.
    pub fn new(key: UnitKey) -> Self {
        Self {
            subject: key.subject,
            session: key.session,
            acquisition: key.acquisition,
            run: key.run,
            mag_nii: Vec::new(),
            phase_nii: Vec::new(),
            mag_json: Vec::new(),
            phase_json: Vec::new(),
            echo_times: Vec::new(),
            field_strength: None,
            field_direction: DEFAULT_FIELD_DIRECTION,
            derivatives: DerivativeMap::new(),
            mask: None,
        }
    }

    pub fn key(&self) -> UnitKey {
        UnitKey {
            subject: self.subject.clone(),
            session: self.session.clone(),
            acquisition: self.acquisition.clone(),
            run: self.run.clone(),
        }
    }

    /// Adds a primary file to the matching list, keeping it sorted and unique.
    pub fn add_file(&mut self, part: Part, kind: FileKind, path: PathBuf) -> bool {
        let list = match (part, kind) {
            (Part::Mag, FileKind::Image) => &mut self.mag_nii,
            (Part::Mag, FileKind::Sidecar) => &mut self.mag_json,
            (Part::Phase, FileKind::Image) => &mut self.phase_nii,
            (Part::Phase, FileKind::Sidecar) => &mut self.phase_json,
        };
        insert_sorted(list, path)
    }

    /// Adds an echo time in seconds; duplicates are ignored.
    pub fn add_echo_time(&mut self, seconds: f64) {
        match self
            .echo_times
            .binary_search_by(|t| t.total_cmp(&seconds))
        {
            Ok(_) => {}
            Err(pos) => self.echo_times.insert(pos, seconds),
        }
    }

    /// Records the field strength unless one is already known.
    pub fn set_field_strength_if_unset(&mut self, tesla: f64) {
        if self.field_strength.is_none() {
            self.field_strength = Some(tesla);
        }
    }

    pub fn add_derivative(&mut self, software: &str, kind: &str, path: PathBuf) -> bool {
        let list = self
            .derivatives
            .entry(software.to_string())
            .or_default()
            .entry(kind.to_string())
            .or_default();
        insert_sorted(list, path)
    }

    pub fn add_mask(&mut self, path: PathBuf) {
        self.mask = Some(match self.mask.take() {
            None => MaskPaths::Single(path),
            Some(existing) => existing.with(path),
        });
    }

    /// True when the unit carries at least one raw image.
    pub fn has_raw_payload(&self) -> bool {
        !self.mag_nii.is_empty() || !self.phase_nii.is_empty()
    }

    /// Every dataset file the unit references, sorted and unique.
    pub fn referenced_files(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = self
            .mag_nii
            .iter()
            .chain(&self.phase_nii)
            .chain(&self.mag_json)
            .chain(&self.phase_json)
            .map(PathBuf::as_path)
            .collect();
        for kinds in self.derivatives.values() {
            for paths in kinds.values() {
                files.extend(paths.iter().map(PathBuf::as_path));
            }
        }
        if let Some(mask) = &self.mask {
            files.extend(mask.paths());
        }
        files.sort();
        files.dedup();
        files
    }

    /// Returns a copy with every path rewritten by `f`.
    pub fn map_paths(&self, f: impl Fn(&Path) -> PathBuf) -> WorkUnit {
        let map_list = |list: &[PathBuf]| -> Vec<PathBuf> { list.iter().map(|p| f(p)).collect() };
        let mut unit = self.clone();
        unit.mag_nii = map_list(&self.mag_nii);
        unit.phase_nii = map_list(&self.phase_nii);
        unit.mag_json = map_list(&self.mag_json);
        unit.phase_json = map_list(&self.phase_json);
        for kinds in unit.derivatives.values_mut() {
            for paths in kinds.values_mut() {
                *paths = map_list(paths);
            }
        }
        unit.mask = self.mask.as_ref().map(|m| match m {
            MaskPaths::Single(p) => MaskPaths::Single(f(p)),
            MaskPaths::Many(ps) => MaskPaths::Many(map_list(ps)),
        });
        unit
    }
}

/// Inserts `item` keeping `list` sorted; returns false when already present.
fn insert_sorted<T: Ord>(list: &mut Vec<T>, item: T) -> bool {
    match list.binary_search(&item) {
        Ok(_) => false,
        Err(pos) => {
            list.insert(pos, item);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> WorkUnit {
        WorkUnit::new(UnitKey::new("1", None, Some("A".into()), Some("1".into())))
    }

    #[test]
    fn test_unit_key_display() {
        let key = UnitKey::new("1", Some("pre".into()), Some("A".into()), None);
        assert_eq!(key.to_string(), "sub-1_ses-pre_acq-A");
    }

    #[test]
    fn test_sort_key_uses_empty_string() {
        let key = UnitKey::new("2", None, Some("B".into()), None);
        assert_eq!(key.sort_key(), ("2", "", "B", ""));
    }

    #[test]
    fn test_files_sorted_and_unique() {
        let mut u = unit();
        assert!(u.add_file(Part::Mag, FileKind::Image, "b/echo-2.nii".into()));
        assert!(u.add_file(Part::Mag, FileKind::Image, "b/echo-1.nii".into()));
        assert!(!u.add_file(Part::Mag, FileKind::Image, "b/echo-1.nii".into()));
        assert_eq!(
            u.mag_nii,
            vec![PathBuf::from("b/echo-1.nii"), PathBuf::from("b/echo-2.nii")]
        );
    }

    #[test]
    fn test_echo_times_dedup_ascending() {
        let mut u = unit();
        u.add_echo_time(0.02);
        u.add_echo_time(0.004);
        u.add_echo_time(0.02);
        assert_eq!(u.echo_times, vec![0.004, 0.02]);
    }

    #[test]
    fn test_field_strength_first_wins() {
        let mut u = unit();
        u.set_field_strength_if_unset(7.0);
        u.set_field_strength_if_unset(3.0);
        assert_eq!(u.field_strength, Some(7.0));
    }

    #[test]
    fn test_mask_single_then_many() {
        let mut u = unit();
        u.add_mask("m2.nii".into());
        assert_eq!(u.mask, Some(MaskPaths::Single("m2.nii".into())));
        u.add_mask("m1.nii".into());
        assert_eq!(
            u.mask,
            Some(MaskPaths::Many(vec!["m1.nii".into(), "m2.nii".into()]))
        );
    }

    #[test]
    fn test_input_document_shape() {
        let mut u = unit();
        u.add_file(Part::Phase, FileKind::Image, "p.nii".into());
        u.add_derivative("qsm-forward", "Chimap", "chi.nii".into());
        let json = serde_json::to_value(&u).unwrap();

        assert_eq!(json["Subject"], "1");
        assert_eq!(json["Session"], serde_json::Value::Null);
        assert_eq!(json["Acquisition"], "A");
        assert_eq!(json["B0_dir"], serde_json::json!([0.0, 0.0, 1.0]));
        assert_eq!(json["Derivatives"]["qsm-forward"]["Chimap"][0], "chi.nii");
        assert!(json.get("mask").is_none());

        let back: WorkUnit = serde_json::from_value(json).unwrap();
        assert_eq!(back, u);
    }

    #[test]
    fn test_map_paths_and_referenced_files() {
        let mut u = unit();
        u.add_file(Part::Mag, FileKind::Image, "/data/sub-1/anat/m.nii".into());
        u.add_mask("/data/derivatives/x/sub-1/anat/sub-1_mask.nii".into());

        let mapped = u.map_paths(|p| {
            Path::new("bids").join(p.strip_prefix("/data").unwrap_or(p))
        });
        assert_eq!(mapped.mag_nii[0], PathBuf::from("bids/sub-1/anat/m.nii"));
        assert_eq!(mapped.referenced_files().len(), 2);
        assert!(u.has_raw_payload());
    }
}
