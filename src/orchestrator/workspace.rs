//! Private working directory of one unit execution.
//!
//! Layout of `<work_root>/runs/<unit_name>/`:
//!
//! ```text
//! bids/...        copies of every dataset file the unit references
//! main.sh ...     copy of the algorithm directory
//! output/         empty; the algorithm writes its images here
//! inputs.json     the unit's input document, paths rewritten to bids/...
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::config::OrchestratorConfig;
use crate::algorithm::AlgorithmDescriptor;
use crate::bids::WorkUnit;
use crate::error::OrchestratorError;

/// Directory, relative to the working directory, holding dataset copies.
pub const DATASET_DIR: &str = "bids";
/// Directory, relative to the working directory, the algorithm writes to.
pub const OUTPUT_DIR: &str = "output";
/// File name of the input document.
pub const INPUT_DOCUMENT: &str = "inputs.json";

/// A prepared working directory.
#[derive(Debug, Clone)]
pub struct UnitWorkspace {
    pub root: PathBuf,
    /// The input document as written, with sandbox-relative paths.
    pub document: WorkUnit,
}

impl UnitWorkspace {
    /// Builds the private directory for `unit`.
    ///
    /// Existing contents are kept (with a warning), but `bids/` and `output/`
    /// are recreated so nothing from an earlier run leaks into this one.
    pub fn prepare(
        config: &OrchestratorConfig,
        unit: &WorkUnit,
        algorithm: &AlgorithmDescriptor,
        unit_name: &str,
    ) -> Result<Self, OrchestratorError> {
        let root = config.runs_dir().join(unit_name);
        let io_err = |e: std::io::Error| OrchestratorError::Workspace {
            path: root.clone(),
            reason: e.to_string(),
        };

        if root.is_dir() && std::fs::read_dir(&root).map_err(io_err)?.next().is_some() {
            warn!(dir = %root.display(), "Working directory is not empty");
        }
        std::fs::create_dir_all(&root).map_err(io_err)?;

        for dir in [DATASET_DIR, OUTPUT_DIR] {
            let path = root.join(dir);
            if path.exists() {
                std::fs::remove_dir_all(&path).map_err(io_err)?;
            }
            std::fs::create_dir_all(&path).map_err(io_err)?;
        }

        let mut relative_paths = BTreeMap::new();
        for file in unit.referenced_files() {
            let relative = dataset_relative(&config.dataset_root, file)?;
            let dest = root.join(DATASET_DIR).join(&relative);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            std::fs::copy(file, &dest).map_err(|e| OrchestratorError::Workspace {
                path: file.to_path_buf(),
                reason: format!("cannot copy dataset file: {}", e),
            })?;
            relative_paths.insert(file.to_path_buf(), Path::new(DATASET_DIR).join(relative));
        }
        debug!(unit = unit_name, files = relative_paths.len(), "Copied dataset files");

        copy_dir_recursive(&algorithm.dir, &root).map_err(io_err)?;
        make_executable(&root.join(config.command.trim_start_matches("./"))).map_err(io_err)?;

        let document = unit.map_paths(|p| {
            relative_paths
                .get(p)
                .cloned()
                .unwrap_or_else(|| p.to_path_buf())
        });
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(root.join(INPUT_DOCUMENT), json).map_err(io_err)?;

        Ok(Self { root, document })
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    /// True when the command names a file present in the working directory.
    pub fn has_entry_script(&self, command: &str) -> bool {
        self.root.join(command.trim_start_matches("./")).is_file()
    }
}

/// Path of `file` relative to the dataset root.
fn dataset_relative(dataset_root: &Path, file: &Path) -> Result<PathBuf, OrchestratorError> {
    if let Ok(relative) = file.strip_prefix(dataset_root) {
        return Ok(relative.to_path_buf());
    }
    if let (Ok(root), Ok(canonical)) = (dataset_root.canonicalize(), file.canonicalize()) {
        if let Ok(relative) = canonical.strip_prefix(&root) {
            return Ok(relative.to_path_buf());
        }
    }
    if file.is_relative() {
        return Ok(file.to_path_buf());
    }
    Err(OrchestratorError::Workspace {
        path: file.to_path_buf(),
        reason: format!("outside dataset root '{}'", dataset_root.display()),
    })
}

/// Environment of the unit: current variable names plus the legacy aliases
/// existing algorithms read. Missing optional fields are empty strings.
pub fn unit_environment(
    unit: &WorkUnit,
    algorithm: &str,
    input_document: &str,
) -> BTreeMap<String, String> {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    let pairs = [
        ("SUBJECT", unit.subject.clone()),
        ("SESSION", opt(&unit.session)),
        ("ACQUISITION", opt(&unit.acquisition)),
        ("RUN", opt(&unit.run)),
        ("ALGORITHM_NAME", algorithm.to_string()),
        ("INPUT_DOCUMENT_PATH", input_document.to_string()),
        ("BIDS_SUBJECT", unit.subject.clone()),
        ("BIDS_SESSION", opt(&unit.session)),
        ("BIDS_ACQUISITION", opt(&unit.acquisition)),
        ("BIDS_RUN", opt(&unit.run)),
        ("PIPELINE_NAME", algorithm.to_string()),
        ("INPUTS_JSON", input_document.to_string()),
    ];
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Recursively copy a directory.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !dst.exists() {
        std::fs::create_dir_all(dst)?;
    }

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let dest_path = dst.join(entry.file_name());

        if path.is_dir() {
            copy_dir_recursive(&path, &dest_path)?;
        } else {
            std::fs::copy(&path, &dest_path)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if !path.is_file() {
        return Ok(());
    }
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    std::fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::{FileKind, Part, UnitKey};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        config: OrchestratorConfig,
        unit: WorkUnit,
        algorithm: AlgorithmDescriptor,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let bids = tmp.path().join("bids");
        let anat = bids.join("sub-1/anat");
        std::fs::create_dir_all(&anat).unwrap();
        let mag = anat.join("sub-1_acq-A_echo-1_part-mag_MEGRE.nii");
        std::fs::write(&mag, b"mag").unwrap();

        let algo_dir = tmp.path().join("algos/tgv");
        std::fs::create_dir_all(algo_dir.join("lib")).unwrap();
        std::fs::write(algo_dir.join("main.sh"), "#!/bin/sh\necho hi\n").unwrap();
        std::fs::write(algo_dir.join("lib/helper.py"), "print(1)\n").unwrap();

        let mut unit = WorkUnit::new(UnitKey::new("1", None, Some("A".into()), None));
        unit.add_file(Part::Mag, FileKind::Image, mag);

        Fixture {
            config: OrchestratorConfig::new(tmp.path().join("work"), &bids),
            unit,
            algorithm: AlgorithmDescriptor::load(&algo_dir).unwrap(),
            _tmp: tmp,
        }
    }

    #[test]
    fn test_prepare_layout() {
        let f = fixture();
        let ws = UnitWorkspace::prepare(&f.config, &f.unit, &f.algorithm, "tgv_acq-A_sub-1").unwrap();

        assert_eq!(ws.root, f.config.work_root.join("runs/tgv_acq-A_sub-1"));
        assert!(ws
            .root
            .join("bids/sub-1/anat/sub-1_acq-A_echo-1_part-mag_MEGRE.nii")
            .is_file());
        assert!(ws.root.join("lib/helper.py").is_file());
        assert!(ws.output_dir().is_dir());
        assert!(ws.has_entry_script("./main.sh"));

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(ws.root.join("inputs.json")).unwrap())
                .unwrap();
        assert_eq!(
            doc["mag_nii"][0],
            "bids/sub-1/anat/sub-1_acq-A_echo-1_part-mag_MEGRE.nii"
        );
        assert_eq!(doc["Acquisition"], "A");
    }

    #[cfg(unix)]
    #[test]
    fn test_entry_script_made_executable() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        let ws = UnitWorkspace::prepare(&f.config, &f.unit, &f.algorithm, "u").unwrap();
        let mode = std::fs::metadata(ws.root.join("main.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_prepare_clears_stale_output() {
        let f = fixture();
        let ws = UnitWorkspace::prepare(&f.config, &f.unit, &f.algorithm, "u").unwrap();
        std::fs::write(ws.output_dir().join("old.nii"), b"stale").unwrap();

        let ws = UnitWorkspace::prepare(&f.config, &f.unit, &f.algorithm, "u").unwrap();
        assert_eq!(std::fs::read_dir(ws.output_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_outside_dataset_root() {
        let mut f = fixture();
        f.unit.add_file(Part::Phase, FileKind::Image, PathBuf::from("/elsewhere/p.nii"));
        let err = UnitWorkspace::prepare(&f.config, &f.unit, &f.algorithm, "u").unwrap_err();
        assert!(matches!(err, OrchestratorError::Workspace { .. }));
    }

    #[test]
    fn test_unit_environment() {
        let unit = WorkUnit::new(UnitKey::new("1", None, Some("A".into()), None));
        let env = unit_environment(&unit, "tgv", "/workdir/inputs.json");

        assert_eq!(env["SUBJECT"], "1");
        assert_eq!(env["SESSION"], "");
        assert_eq!(env["ACQUISITION"], "A");
        assert_eq!(env["RUN"], "");
        assert_eq!(env["ALGORITHM_NAME"], "tgv");
        assert_eq!(env["INPUT_DOCUMENT_PATH"], "/workdir/inputs.json");
        assert_eq!(env["BIDS_ACQUISITION"], "A");
        assert_eq!(env["PIPELINE_NAME"], "tgv");
        assert_eq!(env["INPUTS_JSON"], "/workdir/inputs.json");
        assert_eq!(env.len(), 12);
    }
}
