//! Relocation of algorithm outputs into the derivatives layout.
//!
//! Every image in `output/` is decompressed when gzipped, renamed after the
//! unit that produced it and moved to
//! `<derivatives>/<algorithm>/sub-<s>[/ses-<t>]/anat/`.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use super::result::ExecutionFailure;
use crate::bids::WorkUnit;
use crate::error::HarvestWarning;

/// Artifact kind used when the file name does not carry one.
pub const DEFAULT_KIND: &str = "Chimap";

/// Relocated artifacts and per-file problems of one harvest.
#[derive(Debug, Clone, Default)]
pub struct Harvest {
    pub outputs: Vec<PathBuf>,
    pub warnings: Vec<HarvestWarning>,
}

/// Moves the images in `output_dir` into the derivatives layout.
///
/// Returns [`ExecutionFailure::NoOutput`] when the directory holds no image.
/// Failures on single artifacts become warnings; siblings still move.
pub fn harvest(
    output_dir: &Path,
    derivatives_root: &Path,
    algorithm: &str,
    unit: &WorkUnit,
) -> Result<Harvest, ExecutionFailure> {
    let artifacts = collect_artifacts(output_dir);
    if artifacts.is_empty() {
        return Err(ExecutionFailure::NoOutput);
    }

    let dest_dir = destination_dir(derivatives_root, algorithm, unit);
    let mut harvest = Harvest::default();
    let mut claimed: HashSet<PathBuf> = HashSet::new();

    for artifact in artifacts {
        let source = if is_gzipped(&artifact) {
            match decompress(&artifact) {
                Ok(path) => path,
                Err(reason) => {
                    push_warning(&mut harvest, HarvestWarning::Decompress {
                        path: artifact,
                        reason,
                    });
                    continue;
                }
            }
        } else {
            artifact
        };

        let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let dest = dest_dir.join(destination_name(unit, name));

        if !claimed.insert(dest.clone()) {
            push_warning(&mut harvest, HarvestWarning::Collision {
                from: source,
                to: dest,
            });
            continue;
        }

        if let Err(e) = std::fs::create_dir_all(&dest_dir).and_then(|_| move_file(&source, &dest)) {
            push_warning(&mut harvest, HarvestWarning::Move {
                from: source,
                to: dest,
                reason: e.to_string(),
            });
            continue;
        }

        info!(from = %source.display(), to = %dest.display(), "Harvested artifact");
        harvest.outputs.push(dest);
    }

    Ok(harvest)
}

fn push_warning(harvest: &mut Harvest, warning: HarvestWarning) {
    warn!("{}", warning);
    harvest.warnings.push(warning);
}

/// Image files directly inside `dir`, sorted by name.
fn collect_artifacts(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(".nii"))
        })
        .collect();
    files.sort();
    files
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Decompresses `path` next to itself and removes the archive.
fn decompress(path: &Path) -> Result<PathBuf, String> {
    let target = path.with_extension("");
    let result = (|| -> std::io::Result<()> {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(path)?));
        let mut out = BufWriter::new(File::create(&target)?);
        std::io::copy(&mut decoder, &mut out)?;
        std::io::Write::flush(&mut out)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            std::fs::remove_file(path).map_err(|e| e.to_string())?;
            debug!(from = %path.display(), to = %target.display(), "Decompressed artifact");
            Ok(target)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&target);
            Err(e.to_string())
        }
    }
}

/// `<root>/<algorithm>/sub-<s>[/ses-<t>]/anat`
pub fn destination_dir(derivatives_root: &Path, algorithm: &str, unit: &WorkUnit) -> PathBuf {
    let mut dir = derivatives_root
        .join(algorithm)
        .join(format!("sub-{}", unit.subject));
    if let Some(session) = unit.session.as_deref().filter(|s| !s.is_empty()) {
        dir = dir.join(format!("ses-{}", session));
    }
    dir.join("anat")
}

/// `sub-<s>[_ses-<t>][_acq-<a>][_run-<r>]_<Kind>.<ext>` for an artifact name.
pub fn destination_name(unit: &WorkUnit, artifact_name: &str) -> String {
    let (stem, ext) = artifact_name
        .split_once('.')
        .unwrap_or((artifact_name, "nii"));

    let mut name = format!("sub-{}", unit.subject);
    for (label, value) in [
        ("ses", &unit.session),
        ("acq", &unit.acquisition),
        ("run", &unit.run),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            name.push_str(&format!("_{}-{}", label, value));
        }
    }
    format!("{}_{}.{}", name, artifact_kind(stem), ext)
}

/// Trailing `_<Token>` of the stem when it starts with an upper-case letter.
pub fn artifact_kind(stem: &str) -> &str {
    stem.rsplit_once('_')
        .map(|(_, token)| token)
        .filter(|token| token.starts_with(|c: char| c.is_ascii_uppercase()))
        .unwrap_or(DEFAULT_KIND)
}

/// Moves `from` to `to`: a rename, or a copy to a temporary sibling of `to`
/// followed by a rename when the two are on different file systems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }

    let file_name = to
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = to.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    if let Err(e) = std::fs::copy(from, &tmp).and_then(|_| std::fs::rename(&tmp, to)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bids::UnitKey;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn unit() -> WorkUnit {
        WorkUnit::new(UnitKey::new("1", None, Some("A".into()), Some("1".into())))
    }

    fn gzip(path: &Path, data: &[u8]) {
        let mut enc = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap();
    }

    #[test]
    fn test_artifact_kind() {
        assert_eq!(artifact_kind("chi"), "Chimap");
        assert_eq!(artifact_kind("sub-1_Chimap"), "Chimap");
        assert_eq!(artifact_kind("out_R2starmap"), "R2starmap");
        assert_eq!(artifact_kind("out_mask"), "Chimap");
    }

    #[test]
    fn test_destination_name() {
        let mut u = unit();
        assert_eq!(destination_name(&u, "chi.nii"), "sub-1_acq-A_run-1_Chimap.nii");
        u.session = Some("pre".into());
        assert_eq!(
            destination_name(&u, "x_T2starmap.nii.gz"),
            "sub-1_ses-pre_acq-A_run-1_T2starmap.nii.gz"
        );
        assert_eq!(
            destination_dir(Path::new("/d"), "tgv", &u),
            PathBuf::from("/d/tgv/sub-1/ses-pre/anat")
        );
    }

    #[test]
    fn test_harvest_decompresses_and_moves() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("output");
        std::fs::create_dir(&output).unwrap();
        gzip(&output.join("chi.nii.gz"), b"volume");
        std::fs::write(output.join("notes.txt"), b"ignored").unwrap();

        let derivatives = tmp.path().join("derivatives");
        let h = harvest(&output, &derivatives, "algoX", &unit()).unwrap();

        let expected = derivatives.join("algoX/sub-1/anat/sub-1_acq-A_run-1_Chimap.nii");
        assert_eq!(h.outputs, vec![expected.clone()]);
        assert!(h.warnings.is_empty());
        assert_eq!(std::fs::read(expected).unwrap(), b"volume");
        assert!(!output.join("chi.nii.gz").exists());
        assert!(!output.join("chi.nii").exists());
    }

    #[test]
    fn test_harvest_no_output() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("log.txt"), b"x").unwrap();
        let err = harvest(tmp.path(), &tmp.path().join("d"), "a", &unit()).unwrap_err();
        assert_eq!(err, ExecutionFailure::NoOutput);
    }

    #[test]
    fn test_harvest_collision_and_bad_gzip() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("output");
        std::fs::create_dir(&output).unwrap();
        std::fs::write(output.join("a.nii"), b"first").unwrap();
        std::fs::write(output.join("b.nii"), b"second").unwrap();
        std::fs::write(output.join("c.nii.gz"), b"not gzip").unwrap();

        let derivatives = tmp.path().join("derivatives");
        let h = harvest(&output, &derivatives, "algoX", &unit()).unwrap();

        assert_eq!(h.outputs.len(), 1);
        assert_eq!(std::fs::read(&h.outputs[0]).unwrap(), b"first");
        assert_eq!(h.warnings.len(), 2);
        assert!(h
            .warnings
            .iter()
            .any(|w| matches!(w, HarvestWarning::Collision { from, .. } if from.ends_with("b.nii"))));
        assert!(h
            .warnings
            .iter()
            .any(|w| matches!(w, HarvestWarning::Decompress { .. })));
        assert!(output.join("b.nii").exists());
    }
}
