//! Lightweight VM backend driven by the `tinyrange` CLI.
//!
//! The VM boots an Alpine image, so the entry script is rewritten before the
//! unit starts: Debian package commands become `apk` commands, `sudo` is
//! dropped and the unit environment is exported at the top, since the VM
//! does not inherit the host environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::process::{child_lines, spawn_piped, wait_child, ProcessRegistry};
use super::{BackendKind, LaunchSpec, SandboxBackend, SandboxHandle};
use crate::error::SandboxError;

/// Name of the translated script written next to the entry script.
pub const VM_SCRIPT: &str = "main.vm.sh";

/// TinyRange launch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TinyRangeOptions {
    pub binary: String,
}

impl Default for TinyRangeOptions {
    fn default() -> Self {
        Self {
            binary: "tinyrange".to_string(),
        }
    }
}

/// Rewrites an entry script for the VM.
pub fn translate_script(script: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(&format!("export {}='{}'\n", key, value.replace('\'', r"'\''")));
    }

    for (i, line) in script.lines().enumerate() {
        if i == 0 && line.starts_with("#!") {
            continue;
        }
        out.push_str(&translate_line(line));
        out.push('\n');
    }
    out
}

fn translate_line(line: &str) -> String {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') || trimmed.is_empty() {
        return line.to_string();
    }
    let indent = &line[..line.len() - trimmed.len()];
    let segments: Vec<String> = trimmed.split(" && ").map(translate_command).collect();
    format!("{}{}", indent, segments.join(" && "))
}

/// Translates a single simple command. Leading `VAR=value` assignments are
/// kept; commands that need no rewrite are returned verbatim.
fn translate_command(command: &str) -> String {
    let words: Vec<&str> = command.split_whitespace().collect();
    let assignments = words.iter().take_while(|w| is_assignment(w)).count();
    let (prefix, rest) = words.split_at(assignments);

    let (dropped_sudo, rest) = match rest.split_first() {
        Some((&"sudo", tail)) => (true, tail),
        _ => (false, rest),
    };

    let apk = match rest.split_first() {
        Some((&"apt-get", args)) | Some((&"apt", args)) => translate_apt(args),
        _ => None,
    };

    let body = match apk {
        Some(apk) => apk,
        None if dropped_sudo => rest.join(" "),
        None => return command.to_string(),
    };

    if prefix.is_empty() {
        body
    } else {
        format!("{} {}", prefix.join(" "), body)
    }
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

fn translate_apt(args: &[&str]) -> Option<String> {
    let sub = args.iter().position(|a| !a.starts_with('-'))?;
    match args[sub] {
        "update" => Some("apk update".to_string()),
        "upgrade" | "dist-upgrade" => Some("apk upgrade".to_string()),
        "install" => {
            let packages: Vec<&str> = args[sub + 1..]
                .iter()
                .filter(|a| !a.starts_with('-'))
                .copied()
                .collect();
            Some(format!("apk add {}", packages.join(" ")).trim_end().to_string())
        }
        _ => None,
    }
}

/// Runs units inside TinyRange VMs.
pub struct TinyRangeBackend {
    options: TinyRangeOptions,
    registry: ProcessRegistry,
}

impl TinyRangeBackend {
    pub fn new(options: TinyRangeOptions) -> Self {
        Self {
            options,
            registry: ProcessRegistry::new(),
        }
    }

    /// Arguments of `tinyrange login` for `spec`.
    pub fn login_args(&self, spec: &LaunchSpec) -> Vec<String> {
        vec![
            "login".to_string(),
            "--cpu".to_string(),
            spec.resources.cpu_cores.to_string(),
            "--memory".to_string(),
            spec.resources.memory_mb.to_string(),
            "--storage".to_string(),
            spec.resources.storage_mb.to_string(),
            "--mount-rw".to_string(),
            format!("{}:{}", spec.host_workdir.display(), spec.container_workdir),
            spec.image.clone(),
            "-E".to_string(),
            format!("cd {} && sh ./{}", spec.container_workdir, VM_SCRIPT),
        ]
    }

    /// Writes the translated entry script into the working directory.
    pub fn write_vm_script(spec: &LaunchSpec) -> Result<PathBuf, SandboxError> {
        let entry = entry_path(&spec.host_workdir, &spec.command);
        let script = std::fs::read_to_string(&entry).map_err(|e| {
            SandboxError::LaunchFailed(format!("Cannot read '{}': {}", entry.display(), e))
        })?;

        let target = spec.host_workdir.join(VM_SCRIPT);
        std::fs::write(&target, translate_script(&script, &spec.env))?;
        Ok(target)
    }
}

fn entry_path(workdir: &Path, command: &str) -> PathBuf {
    workdir.join(command.trim_start_matches("./"))
}

#[async_trait]
impl SandboxBackend for TinyRangeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TinyRange
    }

    async fn prepare(&self, spec: &LaunchSpec) -> Result<(), SandboxError> {
        if self.registry.kill(&spec.unit_name).await? {
            info!(unit = %spec.unit_name, "Killed duplicate VM");
        }
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<SandboxHandle, SandboxError> {
        let script = Self::write_vm_script(spec)?;
        debug!(unit = %spec.unit_name, script = %script.display(), "Wrote VM script");

        let mut command = Command::new(&self.options.binary);
        command.args(self.login_args(spec));
        let child = spawn_piped(command)?;

        // No pid means the VM already exited; `wait` reports its status.
        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.register(&spec.unit_name, pid).await;
        }

        info!(unit = %spec.unit_name, image = %spec.image, ?pid, "VM started");
        let id = pid.map(|p| p.to_string()).unwrap_or_default();
        Ok(SandboxHandle::new(&spec.unit_name, id).with_child(child))
    }

    fn stream_logs(
        &self,
        handle: &mut SandboxHandle,
    ) -> BoxStream<'static, Result<String, SandboxError>> {
        child_lines(handle)
    }

    async fn wait(&self, handle: &mut SandboxHandle) -> Result<i64, SandboxError> {
        let code = wait_child(handle).await;
        self.registry.forget(&handle.unit_name).await;
        code
    }

    async fn teardown(&self, unit_name: &str) -> Result<(), SandboxError> {
        self.registry.kill(unit_name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::VmResources;
    use tempfile::TempDir;

    fn env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("SUBJECT".to_string(), "1".to_string());
        env.insert("SESSION".to_string(), "it's".to_string());
        env
    }

    #[test]
    fn test_translate_script() {
        let script = "#!/usr/bin/env bash\n#DOCKER_IMAGE=ubuntu\nsudo apt-get update\napt-get install -y -qq python3 git\nsudo apt upgrade -y\npython3 run.py\n";
        let out = translate_script(script, &env());

        assert_eq!(
            out,
            "export SESSION='it'\\''s'\nexport SUBJECT='1'\n#DOCKER_IMAGE=ubuntu\napk update\napk add python3 git\napk upgrade\npython3 run.py\n"
        );
    }

    #[test]
    fn test_translate_compound_and_prefixed() {
        assert_eq!(
            translate_line("  apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y curl"),
            "  apk update && DEBIAN_FRONTEND=noninteractive apk add curl"
        );
        assert_eq!(translate_line("sudo make install"), "make install");
        assert_eq!(translate_line("apt-get clean"), "apt-get clean");
        assert_eq!(translate_line("echo apt-get install x"), "echo apt-get install x");
    }

    #[test]
    fn test_login_args() {
        let spec = LaunchSpec::new("tgv_sub-1", "alpine@3.21", "/w/runs/tgv_sub-1").with_resources(
            VmResources {
                memory_mb: 8192,
                cpu_cores: 4,
                storage_mb: 2048,
            },
        );
        let backend = TinyRangeBackend::new(TinyRangeOptions::default());

        assert_eq!(
            backend.login_args(&spec),
            vec![
                "login",
                "--cpu",
                "4",
                "--memory",
                "8192",
                "--storage",
                "2048",
                "--mount-rw",
                "/w/runs/tgv_sub-1:/workdir",
                "alpine@3.21",
                "-E",
                "cd /workdir && sh ./main.vm.sh",
            ]
        );
    }

    #[test]
    fn test_write_vm_script() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("main.sh"), "#!/bin/sh\napt install -y jq\n").unwrap();
        let spec = LaunchSpec::new("u", "alpine@3.21", tmp.path()).with_env(env());

        let path = TinyRangeBackend::write_vm_script(&spec).unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.ends_with("apk add jq\n"));
        assert!(written.starts_with("export SESSION="));
    }

    #[tokio::test]
    async fn test_teardown_unknown_unit() {
        let backend = TinyRangeBackend::new(TinyRangeOptions::default());
        backend.teardown("nothing").await.unwrap();
    }
}
