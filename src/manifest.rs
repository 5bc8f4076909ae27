//! The built-in manifest driver: a declarative TOML command list.
//!
//! This is the thinnest possible front-end, standing in for the
//! language drivers that normally translate a project description into
//! targets.  A `bx.toml` names its commands outright:
//!
//! ```toml
//! [package]
//! name = "hello"
//!
//! [pools.link]
//! capacity = 2
//!
//! [[command]]
//! name = "compile hello"
//! program = "cc"
//! args = ["-c", "hello.c", "-o", "hello.o"]
//! inputs = ["hello.c"]
//! outputs = ["hello.o"]
//! ```
//!
//! Relative input/output paths are resolved against the manifest's
//! directory, and commands run there by default.

use crate::command::Command;
use crate::driver::{Build, Driver, Target};
use crate::error::{Error, Result};
use crate::input::{Input, InputType};
use crate::package::{PackageId, PackagePath};
use crate::pool::ResourcePool;
use semver::Version;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MANIFEST_FILE: &str = "bx.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestDoc {
    #[serde(default)]
    package: Option<PackageSection>,
    #[serde(default)]
    pools: BTreeMap<String, PoolSection>,
    #[serde(default, rename = "command")]
    commands: Vec<CommandSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageSection {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    capacity: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandSection {
    #[serde(default)]
    name: Option<String>,
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    intermediates: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    always: bool,
    #[serde(default)]
    silent: bool,
    #[serde(default)]
    strict_order: i32,
    #[serde(default)]
    pool: Option<String>,
}

pub struct ManifestDriver;

impl ManifestDriver {
    fn id() -> PackageId {
        PackageId::new(
            PackagePath::new("org.bx.driver.manifest").expect("static driver path"),
            Version::new(0, 1, 0),
        )
    }

    fn manifest_path(input: &Input) -> PathBuf {
        match input.ty() {
            InputType::SpecFile => input.path().to_path_buf(),
            _ => input.path().join(MANIFEST_FILE),
        }
    }
}

impl Driver for ManifestDriver {
    fn package_id(&self) -> PackageId {
        Self::id()
    }

    fn detect_inputs(&self, path: &Path, ty: InputType) -> Vec<Input> {
        match ty {
            InputType::SpecFile if path.file_name().is_some_and(|n| n == MANIFEST_FILE) => {
                vec![Input::new(path, ty)]
            }
            InputType::DirectorySpecFile if path.join(MANIFEST_FILE).is_file() => {
                vec![Input::new(path, ty)]
            }
            _ => Vec::new(),
        }
    }

    fn can_load(&self, input: &Input) -> bool {
        Self::manifest_path(input).is_file()
    }

    fn load(&self, build: &mut Build, inputs: &[&Input]) -> Result<()> {
        for input in inputs {
            let manifest_path = Self::manifest_path(input);
            let dir = manifest_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            let text = std::fs::read_to_string(&manifest_path)
                .map_err(|err| load_error(&manifest_path, err.to_string()))?;
            let doc: ManifestDoc = toml::from_str(&text)
                .map_err(|err| load_error(&manifest_path, err.to_string()))?;

            let name = match &doc.package {
                Some(package) => package.name.clone(),
                None => dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "build".to_owned()),
            };

            let pools: BTreeMap<String, Arc<ResourcePool>> = doc
                .pools
                .iter()
                .map(|(name, section)| {
                    (
                        name.clone(),
                        Arc::new(ResourcePool::new(name.clone(), section.capacity)),
                    )
                })
                .collect();

            let mut commands = Vec::with_capacity(doc.commands.len());
            for (index, section) in doc.commands.iter().enumerate() {
                commands.push(command_from_section(
                    section,
                    index,
                    &dir,
                    &pools,
                    &manifest_path,
                )?);
            }

            build.add_target(Box::new(ManifestTarget { name, commands }));
            input.mark_loaded();
        }
        Ok(())
    }
}

fn load_error(path: &Path, cause: String) -> Error {
    Error::DriverLoad {
        driver: ManifestDriver::id().to_string(),
        input: path.to_path_buf(),
        cause,
    }
}

fn resolve(dir: &Path, p: &str) -> String {
    let path = Path::new(p);
    if path.is_absolute() {
        p.to_owned()
    } else {
        dir.join(path).to_string_lossy().into_owned()
    }
}

fn command_from_section(
    section: &CommandSection,
    index: usize,
    dir: &Path,
    pools: &BTreeMap<String, Arc<ResourcePool>>,
    manifest_path: &Path,
) -> Result<Command> {
    let name = section
        .name
        .clone()
        .unwrap_or_else(|| format!("{} #{}", section.program, index + 1));
    let mut cmd = Command::new(name);
    cmd.set_program(&section.program);
    cmd.args(section.args.iter().cloned());
    cmd.set_cwd(
        section
            .cwd
            .as_ref()
            .map(|c| resolve(dir, c))
            .unwrap_or_else(|| dir.to_string_lossy().into_owned()),
    );
    for (k, v) in &section.env {
        cmd.env(k, v);
    }
    for input in &section.inputs {
        cmd.add_input(resolve(dir, input));
    }
    for output in &section.outputs {
        cmd.add_output(resolve(dir, output));
    }
    for intermediate in &section.intermediates {
        cmd.add_intermediate(resolve(dir, intermediate));
    }
    if let Some(stdin) = &section.stdin {
        cmd.redirect_stdin(resolve(dir, stdin));
    }
    if let Some(stdout) = &section.stdout {
        cmd.redirect_stdout(resolve(dir, stdout));
    }
    if let Some(stderr) = &section.stderr {
        cmd.redirect_stderr(resolve(dir, stderr));
    }
    cmd.set_always(section.always);
    cmd.set_silent(section.silent);
    cmd.set_strict_order(section.strict_order);
    if let Some(pool_name) = &section.pool {
        let pool = pools.get(pool_name).ok_or_else(|| {
            load_error(manifest_path, format!("unknown pool: {}", pool_name))
        })?;
        cmd.set_pool(pool.clone());
    }
    Ok(cmd)
}

struct ManifestTarget {
    name: String,
    commands: Vec<Command>,
}

impl Target for ManifestTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<bool> {
        // Manifests are fully explicit; one pass is enough.
        Ok(false)
    }

    fn commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TargetSettings;

    fn load_manifest(dir: &Path, text: &str) -> Result<Build> {
        std::fs::write(dir.join(MANIFEST_FILE), text).unwrap();
        let driver = ManifestDriver;
        let detected = driver.detect_inputs(dir, InputType::DirectorySpecFile);
        assert_eq!(detected.len(), 1);
        let mut build = Build::new(TargetSettings::new());
        driver.load(&mut build, &[&detected[0]])?;
        Ok(build)
    }

    #[test]
    fn detection_requires_the_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let driver = ManifestDriver;
        assert!(driver
            .detect_inputs(dir.path(), InputType::DirectorySpecFile)
            .is_empty());
        std::fs::write(dir.path().join(MANIFEST_FILE), "").unwrap();
        assert_eq!(
            driver
                .detect_inputs(dir.path(), InputType::DirectorySpecFile)
                .len(),
            1
        );
    }

    #[test]
    fn commands_resolve_paths_against_the_manifest_dir() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let build = load_manifest(
            dir.path(),
            r#"
[package]
name = "demo"

[[command]]
name = "copy"
program = "cp"
args = ["in.txt", "out.txt"]
inputs = ["in.txt"]
outputs = ["out.txt"]
"#,
        )?;
        let graph = build.into_graph(dir.path(), 4096)?;
        assert_eq!(graph.len(), 1);
        let cmd = graph.command(crate::graph::CmdId(0));
        let expected = dir.path().join("out.txt");
        assert!(cmd.outputs().any(|o| o == expected.to_str().unwrap()));
        Ok(())
    }

    #[test]
    fn pool_references_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest(
            dir.path(),
            r#"
[[command]]
program = "cc"
pool = "missing"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));
    }

    #[test]
    fn pools_are_shared_between_commands() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let build = load_manifest(
            dir.path(),
            r#"
[pools.link]
capacity = 1

[[command]]
name = "a"
program = "cc"
pool = "link"
outputs = ["a.o"]

[[command]]
name = "b"
program = "cc"
pool = "link"
outputs = ["b.o"]
"#,
        )?;
        let graph = build.into_graph(dir.path(), 4096)?;
        let a = graph.command(crate::graph::CmdId(0));
        let b = graph.command(crate::graph::CmdId(1));
        assert!(Arc::ptr_eq(a.pool().unwrap(), b.pool().unwrap()));
        Ok(())
    }

    #[test]
    fn malformed_toml_is_a_driver_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest(dir.path(), "[[command]]\nnot valid").unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));
    }
}
