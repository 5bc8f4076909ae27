//! Driver and target interfaces: the seam between the core and the
//! language front-ends.
//!
//! A driver recognizes inputs and loads them into targets; a target is
//! prepared over one or more passes and then contributes commands.  The
//! core never looks inside either; it only collects the commands.

use crate::command::Command;
use crate::error::{Error, Result};
use crate::graph::{CmdId, CommandGraph};
use crate::input::{Input, InputType};
use crate::package::PackageId;
use crate::settings::TargetSettings;
use std::collections::HashMap;
use std::path::Path;

pub trait Driver: Send + Sync {
    /// Identity of the driver itself, used for registration and for
    /// dispatching installed-package inputs by namespace.
    fn package_id(&self) -> PackageId;

    /// Inputs this driver recognizes at `path` for the given type.  An
    /// empty list means the driver declines.
    fn detect_inputs(&self, path: &Path, ty: InputType) -> Vec<Input>;

    fn can_load(&self, input: &Input) -> bool;

    /// Load the inputs, producing targets into `build`.
    fn load(&self, build: &mut Build, inputs: &[&Input]) -> Result<()>;

    /// Batch optimization hook; the default loads one input at a time.
    fn load_inputs_batch(&self, build: &mut Build, inputs: &[&Input]) -> Result<()> {
        for input in inputs {
            self.load(build, &[input])?;
        }
        Ok(())
    }
}

/// A named producer of build commands.
pub trait Target: Send {
    fn name(&self) -> &str;

    /// One preparation pass; returns true while more passes are needed.
    fn prepare(&mut self) -> Result<bool>;

    /// Drain the commands this target contributes.  Called once, after
    /// preparation converges.
    fn commands(&mut self) -> Vec<Command>;

    /// Names of targets this one depends on.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// The target's primary artifact, when it has one.
    fn output_file(&self) -> Option<std::path::PathBuf> {
        None
    }
}

/// Current drivers converge in at most this many preparation passes; a
/// target still asking after that is broken.
const MAX_PREPARE_PASSES: usize = 9;

/// Collects targets during loading, then turns them into a command
/// graph.
pub struct Build {
    pub settings: TargetSettings,
    targets: Vec<Box<dyn Target>>,
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("settings", &self.settings)
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl Build {
    pub fn new(settings: TargetSettings) -> Self {
        Build {
            settings,
            targets: Vec::new(),
        }
    }

    pub fn add_target(&mut self, target: Box<dyn Target>) {
        self.targets.push(target);
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Move another build's targets into this one; used when inputs are
    /// loaded in parallel into per-thread builds.
    pub fn merge(&mut self, other: Build) {
        self.targets.extend(other.targets);
    }

    /// Prepare all targets to convergence, collect their commands, and
    /// finalize the graph.
    pub fn into_graph(mut self, rsp_dir: &Path, max_argv_bytes: usize) -> Result<CommandGraph> {
        for pass in 0.. {
            let mut more = false;
            for target in &mut self.targets {
                more |= target.prepare()?;
            }
            if !more {
                break;
            }
            if pass + 1 >= MAX_PREPARE_PASSES {
                return Err(Error::DriverLoad {
                    driver: "build".into(),
                    input: std::path::PathBuf::new(),
                    cause: format!(
                        "targets did not converge after {} preparation passes",
                        MAX_PREPARE_PASSES
                    ),
                });
            }
        }

        let mut graph = CommandGraph::new();
        let mut index_by_name: HashMap<String, usize> = HashMap::new();
        let mut cmds_by_target: Vec<Vec<CmdId>> = Vec::with_capacity(self.targets.len());
        for (index, target) in self.targets.iter_mut().enumerate() {
            index_by_name.entry(target.name().to_owned()).or_insert(index);
            let mut ids = Vec::new();
            for mut cmd in target.commands() {
                cmd.prepare(rsp_dir, max_argv_bytes)?;
                ids.push(graph.register(cmd)?);
            }
            cmds_by_target.push(ids);
        }

        // Target-level dependencies carry no files of their own: every
        // command of a target is ordered after every command of the
        // targets it names.
        for (index, target) in self.targets.iter().enumerate() {
            for dep_name in target.dependencies() {
                let &dep_index = index_by_name.get(&dep_name).ok_or_else(|| {
                    Error::DriverLoad {
                        driver: "build".into(),
                        input: std::path::PathBuf::new(),
                        cause: format!(
                            "target {} depends on unknown target {}",
                            target.name(),
                            dep_name
                        ),
                    }
                })?;
                if dep_index == index {
                    continue;
                }
                for &cmd in &cmds_by_target[index] {
                    for &dep in &cmds_by_target[dep_index] {
                        graph.add_dep(cmd, dep)?;
                    }
                }
            }
        }

        graph.finalize()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingTarget {
        passes_left: usize,
    }

    impl Target for CountingTarget {
        fn name(&self) -> &str {
            "counting"
        }

        fn prepare(&mut self) -> Result<bool> {
            if self.passes_left == 0 {
                return Ok(false);
            }
            self.passes_left -= 1;
            Ok(self.passes_left > 0)
        }

        fn commands(&mut self) -> Vec<Command> {
            let mut cmd = Command::new("noop");
            cmd.set_program("true");
            vec![cmd]
        }
    }

    #[test]
    fn preparation_runs_until_convergence() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut build = Build::new(TargetSettings::new());
        build.add_target(Box::new(CountingTarget { passes_left: 3 }));
        let graph = build.into_graph(dir.path(), 1024)?;
        assert_eq!(graph.len(), 1);
        assert!(graph.is_finalized());
        Ok(())
    }

    struct NamedTarget {
        name: &'static str,
        deps: Vec<String>,
    }

    impl Target for NamedTarget {
        fn name(&self) -> &str {
            self.name
        }

        fn prepare(&mut self) -> Result<bool> {
            Ok(false)
        }

        fn commands(&mut self) -> Vec<Command> {
            let mut cmd = Command::new(format!("{} cmd", self.name));
            cmd.set_program("true");
            cmd.add_output(format!("{}.out", self.name));
            vec![cmd]
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }
    }

    #[test]
    fn target_dependencies_order_commands_without_shared_files() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut build = Build::new(TargetSettings::new());
        build.add_target(Box::new(NamedTarget {
            name: "lib",
            deps: Vec::new(),
        }));
        build.add_target(Box::new(NamedTarget {
            name: "app",
            deps: vec!["lib".to_owned()],
        }));
        let graph = build.into_graph(dir.path(), 1024)?;

        // No files connect the two commands; the edge comes from the
        // target dependency alone.
        let lib = crate::graph::CmdId(0);
        let app = crate::graph::CmdId(1);
        assert!(graph.deps(lib).is_empty());
        assert_eq!(graph.deps(app), &[lib]);
        assert_eq!(graph.dependents(lib), &[app]);
        Ok(())
    }

    #[test]
    fn unknown_target_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = Build::new(TargetSettings::new());
        build.add_target(Box::new(NamedTarget {
            name: "app",
            deps: vec!["nowhere".to_owned()],
        }));
        let err = build.into_graph(dir.path(), 1024).unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));
    }

    #[test]
    fn runaway_preparation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();

        struct NeverDone;
        impl Target for NeverDone {
            fn name(&self) -> &str {
                "never"
            }
            fn prepare(&mut self) -> Result<bool> {
                Ok(true)
            }
            fn commands(&mut self) -> Vec<Command> {
                Vec::new()
            }
        }

        let mut build = Build::new(TargetSettings::new());
        build.add_target(Box::new(NeverDone));
        assert!(build.into_graph(dir.path(), 1024).is_err());
    }
}
