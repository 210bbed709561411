//! Filename and path grammar for BIDS multi-echo acquisitions.
//!
//! A file is classified from two sources: the directory segments of its
//! path relative to the dataset root (`sub-<label>`, `ses-<label>`,
//! `derivatives/<software>`) and the entity tokens of its file name
//! (`_acq-<label>`, `_run-<label>`, `_echo-<n>_`, `_part-mag|phase_`, `_MEGRE`).

use std::path::{Component, Path};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Magnitude or phase image of a complex acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Part {
    Mag,
    Phase,
}

/// Kind of file considered by the grouper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// `.nii` or `.nii.gz` volume.
    Image,
    /// `.json` sidecar metadata.
    Sidecar,
}

impl FileKind {
    /// Classifies a file name by extension. Other extensions are ignored.
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Some(Self::Image)
        } else if name.ends_with(".json") {
            Some(Self::Sidecar)
        } else {
            None
        }
    }
}

/// Entities extracted from one file of the dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntities {
    pub subject: Option<String>,
    pub session: Option<String>,
    pub acquisition: Option<String>,
    pub run: Option<String>,
    pub echo: Option<String>,
    pub part: Option<Part>,
    pub has_megre_suffix: bool,
    /// Producing software when the file lives under `derivatives/<software>/`.
    pub derivative_software: Option<String>,
}

impl FileEntities {
    /// A primary acquisition file carries an echo index, a part tag and the suffix.
    pub fn is_primary(&self) -> bool {
        self.echo.is_some() && self.part.is_some() && self.has_megre_suffix
    }
}

/// Compiled patterns for the dataset naming grammar.
pub struct EntityParser {
    subject_dir: Regex,
    session_dir: Regex,
    session: Regex,
    acquisition: Regex,
    run: Regex,
    echo: Regex,
    part: Regex,
    suffix: Regex,
}

impl Default for EntityParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityParser {
    pub fn new() -> Self {
        Self {
            subject_dir: Regex::new(r"^sub-(\w+)$").expect("Invalid regex for subject directory"),
            session_dir: Regex::new(r"^ses-(\w+)$").expect("Invalid regex for session directory"),
            session: Regex::new(r"(?:^|_)ses-([^_.]+)").expect("Invalid regex for session token"),
            acquisition: Regex::new(r"_acq-([^_.]+)").expect("Invalid regex for acquisition"),
            run: Regex::new(r"_run-([^_.]+)").expect("Invalid regex for run"),
            echo: Regex::new(r"_echo-([^_]+)_").expect("Invalid regex for echo"),
            part: Regex::new(r"_part-(mag|phase)_").expect("Invalid regex for part"),
            suffix: Regex::new(r"_MEGRE\.").expect("Invalid regex for suffix"),
        }
    }

    /// Parses the entities of `path`, which must be relative to the dataset root.
    pub fn parse(&self, relative: &Path) -> FileEntities {
        let mut entities = FileEntities::default();

        let dirs: Vec<&str> = relative
            .parent()
            .map(|p| {
                p.components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => s.to_str(),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (i, dir) in dirs.iter().enumerate() {
            if *dir == "derivatives" && entities.derivative_software.is_none() {
                entities.derivative_software = dirs.get(i + 1).map(|s| s.to_string());
            }
            // Nearest segment wins.
            if let Some(c) = self.subject_dir.captures(dir) {
                entities.subject = Some(c[1].to_string());
            }
            if let Some(c) = self.session_dir.captures(dir) {
                entities.session = Some(c[1].to_string());
            }
        }

        let Some(name) = relative.file_name().and_then(|n| n.to_str()) else {
            return entities;
        };

        if entities.session.is_none() {
            entities.session = capture(&self.session, name);
        }
        entities.acquisition = capture(&self.acquisition, name);
        entities.run = capture(&self.run, name);
        entities.echo = capture(&self.echo, name);
        entities.part = capture(&self.part, name).map(|p| match p.as_str() {
            "phase" => Part::Phase,
            _ => Part::Mag,
        });
        entities.has_megre_suffix = self.suffix.is_match(name);

        entities
    }
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack).map(|c| c[1].to_string())
}

/// Artifact kind of a derivative image: the last `_`-separated token before
/// the `.nii`/`.nii.gz` extension (`sub-1_acq-A_mask.nii.gz` -> `mask`).
pub fn derivative_kind(file_name: &str) -> Option<String> {
    let stem = file_name
        .strip_suffix(".nii.gz")
        .or_else(|| file_name.strip_suffix(".nii"))?;
    let (_, kind) = stem.rsplit_once('_')?;
    if kind.is_empty() {
        None
    } else {
        Some(kind.to_string())
    }
}
