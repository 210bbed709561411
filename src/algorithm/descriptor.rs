//! Algorithm directory loading and directive parsing.
//!
//! An algorithm is a directory holding an executable `main.sh`. Comment
//! lines of the form `#KEY=value` in that script configure the sandbox:
//!
//! ```text
//! #!/usr/bin/env bash
//! #DOCKER_IMAGE=vnmd/qsmxt_6.4.1:20240307
//! #SINGULARITY_IMAGE=docker://vnmd/qsmxt_6.4.1:20240307
//! #MEMORY=8192
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::sandbox::BackendKind;

/// Entry script every algorithm directory must contain.
pub const ENTRY_SCRIPT: &str = "main.sh";

pub const DEFAULT_DOCKER_IMAGE: &str = "ubuntu:latest";
pub const DEFAULT_APPTAINER_IMAGE: &str = "docker://ubuntu:latest";
pub const DEFAULT_TINYRANGE_IMAGE: &str = "alpine@3.21";

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#([A-Z][A-Z0-9_]*)=(.*)$").expect("Invalid regex for directive"))
}

/// Resources requested for VM-based sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResources {
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub storage_mb: u64,
}

impl Default for VmResources {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            cpu_cores: 2,
            storage_mb: 16384,
        }
    }
}

/// Directives found in the entry script. `None` means absent; an image
/// directive that is present but blank is kept as `Some("")`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directives {
    pub docker_image: Option<String>,
    pub apptainer_image: Option<String>,
    pub tinyrange_image: Option<String>,
    pub memory_mb: Option<u64>,
    pub cpu_cores: Option<u32>,
    pub storage_mb: Option<u64>,
    /// Directives with no meaning to the runner, kept verbatim.
    pub extra: BTreeMap<String, String>,
}

impl Directives {
    /// Parses every `#KEY=value` line. A later occurrence of a key wins.
    pub fn parse(script: &str) -> Result<Self, ConfigError> {
        let mut directives = Directives::default();

        for line in script.lines() {
            let Some(caps) = directive_re().captures(line.trim_end()) else {
                continue;
            };
            let key = &caps[1];
            let value = caps[2].trim().to_string();

            match key {
                "DOCKER_IMAGE" => directives.docker_image = Some(value),
                "SINGULARITY_IMAGE" | "APPTAINER_IMAGE" => directives.apptainer_image = Some(value),
                "TINYRANGE_IMAGE" => directives.tinyrange_image = Some(value),
                "MEMORY" => directives.memory_mb = Some(parse_number(key, &value)?),
                "CPU_CORES" | "CPUS" => directives.cpu_cores = Some(parse_number(key, &value)?),
                "STORAGE" => directives.storage_mb = Some(parse_number(key, &value)?),
                _ => {
                    directives.extra.insert(key.to_string(), value);
                }
            }
        }

        Ok(directives)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidDirective {
        key: key.to_string(),
        reason: format!("expected a positive integer, got '{}'", value),
    })
}

/// A loaded algorithm directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmDescriptor {
    /// Final component of the directory path.
    pub name: String,
    pub dir: PathBuf,
    /// Contents of the entry script, read once at load time.
    pub script: String,
    pub directives: Directives,
}

impl AlgorithmDescriptor {
    /// Loads the algorithm in `dir`, failing when it has no entry script.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        if !dir.is_dir() {
            return Err(ConfigError::NotADirectory(dir.to_path_buf()));
        }

        let entry = dir.join(ENTRY_SCRIPT);
        if !entry.is_file() {
            return Err(ConfigError::MissingEntryScript(entry));
        }

        let script = std::fs::read_to_string(&entry)?;
        let directives = Directives::parse(&script)?;
        let name = dir
            .canonicalize()
            .unwrap_or_else(|_| dir.to_path_buf())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "algorithm".to_string());

        debug!(algorithm = %name, ?directives, "Loaded algorithm descriptor");

        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            script,
            directives,
        })
    }

    /// Image for the given backend, falling back to the default when the
    /// directive is absent. A blank directive is an error.
    pub fn image_for(&self, backend: BackendKind) -> Result<&str, ConfigError> {
        let (directive, default) = match backend {
            BackendKind::Docker => (&self.directives.docker_image, DEFAULT_DOCKER_IMAGE),
            BackendKind::Apptainer => (&self.directives.apptainer_image, DEFAULT_APPTAINER_IMAGE),
            BackendKind::TinyRange => (&self.directives.tinyrange_image, DEFAULT_TINYRANGE_IMAGE),
        };

        match directive.as_deref() {
            None => Ok(default),
            Some("") => Err(ConfigError::MissingImage {
                backend: backend.to_string(),
            }),
            Some(image) => Ok(image),
        }
    }

    pub fn resources(&self) -> VmResources {
        let defaults = VmResources::default();
        VmResources {
            memory_mb: self.directives.memory_mb.unwrap_or(defaults.memory_mb),
            cpu_cores: self.directives.cpu_cores.unwrap_or(defaults.cpu_cores),
            storage_mb: self.directives.storage_mb.unwrap_or(defaults.storage_mb),
        }
    }
}
