//! Two-pass grouping of a dataset tree into work units.
//!
//! Pass one walks the tree and folds primary files into an index keyed by
//! [`UnitKey`], queueing derivatives per subject and caching parsed sidecars.
//! Pass two applies sidecar metadata, resolves the queue, drops units without
//! raw images and sorts the result.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::derivatives::{resolve_pending, PendingDerivative};
use super::entities::{derivative_kind, EntityParser, FileEntities, FileKind};
use super::sidecar::{FieldDirectionMap, SidecarMetadata};
use super::work_unit::{UnitKey, WorkUnit};
use crate::error::{DiscoveryWarning, GroupError};

/// Output of a grouping pass.
#[derive(Debug, Clone, Serialize)]
pub struct Grouping {
    /// Units sorted by `(subject, session, acquisition, run)`.
    pub units: Vec<WorkUnit>,
    /// Non-fatal problems met along the way.
    pub warnings: Vec<DiscoveryWarning>,
}

/// Mutable state of one grouping pass.
#[derive(Debug, Default)]
pub struct GroupingContext {
    index: HashMap<UnitKey, WorkUnit>,
    pending: BTreeMap<String, Vec<PendingDerivative>>,
    sidecars: HashMap<PathBuf, SidecarMetadata>,
    warnings: Vec<DiscoveryWarning>,
}

impl GroupingContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn unit_mut(&mut self, key: UnitKey, field_directions: &FieldDirectionMap) -> &mut WorkUnit {
        self.index.entry(key).or_insert_with_key(|key| {
            debug!(unit = %key, "New work unit");
            let mut unit = WorkUnit::new(key.clone());
            if let Some(dir) = field_directions.get(key.acquisition.as_deref()) {
                unit.field_direction = dir;
            }
            unit
        })
    }

    fn warn(&mut self, warning: DiscoveryWarning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }
}

/// Groups the files of a dataset into work units.
pub struct Grouper {
    parser: EntityParser,
    field_directions: FieldDirectionMap,
}

impl Default for Grouper {
    fn default() -> Self {
        Self::new()
    }
}

impl Grouper {
    pub fn new() -> Self {
        Self {
            parser: EntityParser::new(),
            field_directions: FieldDirectionMap::new(),
        }
    }

    /// Uses per-acquisition default field directions.
    pub fn with_field_directions(mut self, map: FieldDirectionMap) -> Self {
        self.field_directions = map;
        self
    }

    /// Walks `root` and groups every file found.
    pub fn run(&self, root: &Path) -> Result<Grouping, GroupError> {
        if !root.is_dir() {
            return Err(GroupError::RootNotFound(root.to_path_buf()));
        }
        info!("Scanning dataset directory {}", root.display());

        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        debug!("Found {} files", files.len());

        Ok(self.group_files(root, files))
    }

    /// Groups an explicit list of files below `root`, in any order.
    pub fn group_files<I>(&self, root: &Path, files: I) -> Grouping
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut ctx = GroupingContext::new();
        for path in files {
            self.visit(&mut ctx, root, path);
        }
        self.finalize(ctx, root)
    }

    /// Classifies one file and folds it into the context.
    pub fn visit(&self, ctx: &mut GroupingContext, root: &Path, path: PathBuf) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let Some(kind) = FileKind::from_file_name(name) else {
            return;
        };
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let entities = self.parser.parse(relative);

        let Some(subject) = entities.subject.clone() else {
            return;
        };

        if entities.is_primary() {
            self.visit_primary(ctx, subject, entities, kind, path);
        } else if kind == FileKind::Image {
            let software = entities.derivative_software.clone();
            if let (Some(software), Some(artifact)) = (software, derivative_kind(name)) {
                queue_derivative(ctx, subject, software, artifact, entities, path);
            }
        }
    }

    fn visit_primary(
        &self,
        ctx: &mut GroupingContext,
        subject: String,
        entities: FileEntities,
        kind: FileKind,
        path: PathBuf,
    ) {
        // Primary files always carry a part tag.
        let Some(part) = entities.part else {
            return;
        };
        let key = UnitKey::new(subject, entities.session, entities.acquisition, entities.run);

        if kind == FileKind::Sidecar && !ctx.sidecars.contains_key(&path) {
            match SidecarMetadata::read(&path) {
                Ok(meta) => {
                    ctx.sidecars.insert(path.clone(), meta);
                }
                Err(e) => ctx.warn(DiscoveryWarning::Sidecar {
                    path: path.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        ctx.unit_mut(key, &self.field_directions)
            .add_file(part, kind, path);
    }

    fn finalize(&self, mut ctx: GroupingContext, root: &Path) -> Grouping {
        let pending: Vec<PendingDerivative> =
            std::mem::take(&mut ctx.pending).into_values().flatten().collect();
        let resolve_warnings = resolve_pending(&mut ctx.index, pending);
        ctx.warnings.extend(resolve_warnings);

        for unit in ctx.index.values_mut() {
            apply_metadata(unit, &ctx.sidecars);
        }
        ctx.warnings.sort_by_key(|w| w.to_string());

        let before = ctx.index.len();
        let mut units: Vec<WorkUnit> = ctx
            .index
            .into_values()
            .filter(WorkUnit::has_raw_payload)
            .collect();
        if units.len() < before {
            debug!("Dropped {} units without raw images", before - units.len());
        }
        units.sort_by(|a, b| {
            let (ka, kb) = (a.key(), b.key());
            ka.sort_key().cmp(&kb.sort_key())
        });

        if units.is_empty() {
            let warning = DiscoveryWarning::Empty(root.to_path_buf());
            warn!("{}", warning);
            ctx.warnings.push(warning);
        } else {
            info!("Grouped dataset into {} work units", units.len());
        }

        Grouping {
            units,
            warnings: ctx.warnings,
        }
    }
}

/// Applies sidecar metadata in path order, so the first non-null field
/// strength and the last field direction do not depend on visit order.
fn apply_metadata(unit: &mut WorkUnit, sidecars: &HashMap<PathBuf, SidecarMetadata>) {
    let mut paths: Vec<PathBuf> = unit
        .mag_json
        .iter()
        .chain(&unit.phase_json)
        .cloned()
        .collect();
    paths.sort();

    for path in paths {
        let Some(meta) = sidecars.get(&path) else {
            continue;
        };
        if let Some(te) = meta.usable_echo_time() {
            unit.add_echo_time(te);
        }
        if let Some(b0) = meta.field_strength {
            unit.set_field_strength_if_unset(b0);
        }
        if let Some(dir) = meta.field_direction {
            unit.field_direction = dir;
        }
    }
}

fn queue_derivative(
    ctx: &mut GroupingContext,
    subject: String,
    software: String,
    kind: String,
    entities: FileEntities,
    path: PathBuf,
) {
    debug!(software = %software, kind = %kind, path = %path.display(), "Queued derivative");
    ctx.pending
        .entry(subject.clone())
        .or_default()
        .push(PendingDerivative {
            software,
            kind,
            subject,
            session: entities.session,
            acquisition: entities.acquisition,
            run: entities.run,
            path,
        });
}

/// Groups the dataset at `root` with default settings.
pub fn group(root: &Path) -> Result<Vec<WorkUnit>, GroupError> {
    Grouper::new().run(root).map(|g| g.units)
}

/// Writes each unit as `group_001.json`, `group_002.json`, ... into `dir`.
pub fn save_groups(units: &[WorkUnit], dir: &Path) -> Result<Vec<PathBuf>, GroupError> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(units.len());
    for (i, unit) in units.iter().enumerate() {
        let path = dir.join(format!("group_{:03}.json", i + 1));
        fs::write(&path, serde_json::to_string_pretty(unit)?)?;
        written.push(path);
    }
    info!("Saved {} groups to {}", written.len(), dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_groups_echoes_into_one_unit() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        for echo in 1..=2 {
            for part in ["mag", "phase"] {
                let stem = format!("sub-1/anat/sub-1_acq-A_echo-{}_part-{}_MEGRE", echo, part);
                touch(root, &format!("{}.nii", stem), "");
                touch(
                    root,
                    &format!("{}.json", stem),
                    &format!(r#"{{"EchoTime": 0.00{}, "MagneticFieldStrength": 7}}"#, echo * 4),
                );
            }
        }

        let grouping = Grouper::new().run(root).unwrap();
        assert_eq!(grouping.units.len(), 1);
        let unit = &grouping.units[0];
        assert_eq!(unit.subject, "1");
        assert_eq!(unit.acquisition.as_deref(), Some("A"));
        assert_eq!(unit.mag_nii.len(), 2);
        assert_eq!(unit.phase_json.len(), 2);
        assert_eq!(unit.echo_times, vec![0.004, 0.008]);
        assert_eq!(unit.field_strength, Some(7.0));
        assert!(grouping.warnings.is_empty());
    }

    #[test]
    fn test_bad_sidecar_is_a_warning() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(root, "sub-1/anat/sub-1_echo-1_part-mag_MEGRE.nii", "");
        touch(root, "sub-1/anat/sub-1_echo-1_part-mag_MEGRE.json", "{oops");

        let grouping = Grouper::new().run(root).unwrap();
        assert_eq!(grouping.units.len(), 1);
        assert!(grouping.units[0].echo_times.is_empty());
        match &grouping.warnings[0] {
            DiscoveryWarning::Sidecar { reason, .. } => assert!(reason.starts_with("invalid JSON")),
            other => panic!("unexpected warning: {:?}", other),
        }
    }

    #[test]
    fn test_field_direction_precedence() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        touch(root, "sub-1/anat/sub-1_acq-A_echo-1_part-mag_MEGRE.nii", "");
        touch(root, "sub-1/anat/sub-1_acq-B_echo-1_part-mag_MEGRE.nii", "");
        touch(
            root,
            "sub-1/anat/sub-1_acq-B_echo-1_part-mag_MEGRE.json",
            r#"{"EchoTime": 0.004, "B0_dir": [1.0, 0.0, 0.0]}"#,
        );

        let mut map = FieldDirectionMap::new();
        map.insert("A", [0.0, 1.0, 0.0]);
        map.insert("B", [0.0, 1.0, 0.0]);
        let units = Grouper::new().with_field_directions(map).run(root).unwrap().units;

        assert_eq!(units[0].field_direction, [0.0, 1.0, 0.0]);
        assert_eq!(units[1].field_direction, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_directory() {
        let temp = TempDir::new().unwrap();
        let grouping = Grouper::new().run(temp.path()).unwrap();
        assert!(grouping.units.is_empty());
        assert!(matches!(grouping.warnings[0], DiscoveryWarning::Empty(_)));
    }

    #[test]
    fn test_missing_root() {
        let temp = TempDir::new().unwrap();
        let err = Grouper::new().run(&temp.path().join("nope")).unwrap_err();
        assert!(matches!(err, GroupError::RootNotFound(_)));
    }

    #[test]
    fn test_save_groups() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("bids");
        touch(&root, "sub-1/anat/sub-1_echo-1_part-mag_MEGRE.nii", "");
        touch(&root, "sub-2/anat/sub-2_echo-1_part-mag_MEGRE.nii", "");

        let units = group(&root).unwrap();
        let written = save_groups(&units, &temp.path().join("groups")).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("group_001.json"));

        let first: WorkUnit =
            serde_json::from_str(&fs::read_to_string(&written[0]).unwrap()).unwrap();
        assert_eq!(first.subject, "1");
    }
}
