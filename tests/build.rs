//! Integration scenarios: incremental skips, change propagation,
//! partial failure, pools, and plan replay, driven through the library
//! API in temporary workspaces.
#![cfg(unix)]

use anyhow::Result;
use bx::command::Command;
use bx::context::Context;
use bx::db;
use bx::graph::CommandGraph;
use bx::progress::QuietProgress;
use bx::work::{Options, Summary, Work};

/// A temporary project directory.  Each `context()` models a fresh
/// process over the same build directory, which is how incremental
/// behavior is observed across "runs".
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> Result<Self> {
        Ok(TestSpace {
            dir: tempfile::tempdir()?,
        })
    }

    fn path(&self, name: &str) -> String {
        self.dir
            .path()
            .join(name)
            .to_str()
            .expect("utf-8 path")
            .to_owned()
    }

    fn write(&self, name: &str, content: &str) -> Result<()> {
        std::fs::write(self.dir.path().join(name), content)?;
        Ok(())
    }

    fn read(&self, name: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.dir.path().join(name))?)
    }

    fn context(&self) -> Result<Context> {
        Ok(Context::new(self.dir.path())?)
    }

    /// Copy `from` to `to` through cp, declaring both ends.
    fn cp(&self, name: &str, from: &str, to: &str) -> Command {
        let mut cmd = Command::new(name);
        cmd.set_program("cp");
        cmd.args([self.path(from), self.path(to)]);
        cmd.add_input(self.path(from));
        cmd.add_output(self.path(to));
        cmd
    }

    /// A shell command with explicit inputs and outputs.
    fn sh(&self, name: &str, script: &str, inputs: &[&str], outputs: &[&str]) -> Command {
        let mut cmd = Command::new(name);
        cmd.set_program("sh");
        cmd.args(["-c".to_string(), script.to_owned()]);
        cmd.set_cwd(self.dir.path().to_str().unwrap());
        for i in inputs {
            cmd.add_input(self.path(i));
        }
        for o in outputs {
            cmd.add_output(self.path(o));
        }
        cmd
    }

    fn graph(&self, commands: Vec<Command>) -> Result<CommandGraph> {
        let ctx = self.context()?;
        let mut graph = CommandGraph::new();
        for mut cmd in commands {
            cmd.prepare(&ctx.build_dir().rsp(), ctx.options().max_argv_bytes)?;
            graph.register(cmd)?;
        }
        graph.finalize()?;
        Ok(graph)
    }

    fn run(&self, commands: Vec<Command>) -> Result<Summary> {
        let graph = self.graph(commands)?;
        let ctx = self.context()?;
        let mut progress = QuietProgress;
        Ok(ctx.run_graph(&graph, &mut progress)?)
    }
}

#[test]
fn empty_graph_reports_success() -> Result<()> {
    let space = TestSpace::new()?;
    let summary = space.run(Vec::new())?;
    assert!(summary.ok());
    assert_eq!(summary.ran(), 0);
    Ok(())
}

#[test]
fn up_to_date_run_skips_everything() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("in.txt", "contents")?;

    let summary = space.run(vec![space.cp("copy", "in.txt", "out.txt")])?;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(space.read("out.txt")?, "contents");

    // Nothing changed: zero commands run.
    let summary = space.run(vec![space.cp("copy", "in.txt", "out.txt")])?;
    assert_eq!(summary.ran(), 0);
    assert_eq!(summary.skipped, 1);
    Ok(())
}

#[test]
fn removed_output_triggers_a_rerun() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("in.txt", "x")?;
    space.run(vec![space.cp("copy", "in.txt", "out.txt")])?;

    std::fs::remove_file(space.path("out.txt"))?;
    let summary = space.run(vec![space.cp("copy", "in.txt", "out.txt")])?;
    assert_eq!(summary.succeeded, 1);
    Ok(())
}

#[test]
fn input_change_propagates_downstream() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("a.in", "one")?;
    let chain = |s: &TestSpace| {
        vec![
            s.cp("A", "a.in", "b.in"),
            s.cp("B", "b.in", "c.out"),
        ]
    };

    let summary = space.run(chain(&space))?;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(space.read("c.out")?, "one");

    // Change a byte at the root: everything downstream reruns.
    space.write("a.in", "two")?;
    let summary = space.run(chain(&space))?;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(space.read("c.out")?, "two");

    // Touch the intermediate in place with identical bytes: content
    // evidence sees no change, so nothing runs.
    std::thread::sleep(std::time::Duration::from_millis(5));
    space.write("b.in", "two")?;
    let summary = space.run(chain(&space))?;
    assert_eq!(summary.ran(), 0);
    assert_eq!(summary.skipped, 2);
    Ok(())
}

#[test]
fn mtime_evidence_reruns_on_touch() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("in.txt", "same")?;

    let cmd = |s: &TestSpace| {
        let mut c = s.cp("copy", "in.txt", "out.txt");
        c.set_content_evidence(false);
        c
    };

    let summary = space.run(vec![cmd(&space)])?;
    assert_eq!(summary.succeeded, 1);
    let summary = space.run(vec![cmd(&space)])?;
    assert_eq!(summary.skipped, 1);

    // Same bytes, newer mtime: mtime evidence calls that outdated.
    std::thread::sleep(std::time::Duration::from_millis(5));
    space.write("in.txt", "same")?;
    let summary = space.run(vec![cmd(&space)])?;
    assert_eq!(summary.succeeded, 1);
    Ok(())
}

#[test]
fn recorded_input_mtimes_force_reruns() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("in.txt", "same")?;

    let cmd = |s: &TestSpace| {
        let mut c = s.cp("copy", "in.txt", "out.txt");
        c.set_record_inputs_mtime(true);
        c
    };

    let summary = space.run(vec![cmd(&space)])?;
    assert_eq!(summary.succeeded, 1);
    let summary = space.run(vec![cmd(&space)])?;
    assert_eq!(summary.skipped, 1);

    // Content unchanged, but the input is now newer than the recorded
    // run: commands recording input mtimes treat that as outdated.
    std::thread::sleep(std::time::Duration::from_millis(20));
    space.write("in.txt", "same")?;
    let summary = space.run(vec![cmd(&space)])?;
    assert_eq!(summary.succeeded, 1);
    Ok(())
}

#[test]
fn always_commands_never_skip() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("in.txt", "x")?;
    let cmd = |s: &TestSpace| {
        let mut c = s.cp("copy", "in.txt", "out.txt");
        c.set_always(true);
        c
    };
    space.run(vec![cmd(&space)])?;
    let summary = space.run(vec![cmd(&space)])?;
    assert_eq!(summary.succeeded, 1);
    Ok(())
}

#[test]
fn partial_failure_spares_independent_branches() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("c3.in", "x")?;

    let c1 = space.sh("C1", "exit 1", &[], &["c1.out"]);
    let mut c2 = space.cp("C2", "c1.out", "c2.out");
    c2.add_input(space.path("c1.out"));
    let c3 = space.cp("C3", "c3.in", "c3.out");

    let summary = space.run(vec![c1, c2, c3])?;
    assert!(!summary.ok());
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.propagated, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(
        summary.to_string(),
        "succeeded=1, failed=1, skipped=0, propagated=1"
    );
    Ok(())
}

#[test]
fn single_failing_command_reports_promptly() -> Result<()> {
    let space = TestSpace::new()?;
    let summary = space.run(vec![space.sh("fail", "exit 7", &[], &[])])?;
    assert_eq!(summary.failed, 1);
    assert!(!summary.ok());
    Ok(())
}

#[test]
fn missing_declared_output_fails_the_command() -> Result<()> {
    let space = TestSpace::new()?;
    // Succeeds as a process but never writes its declared output.
    let summary = space.run(vec![space.sh("liar", "true", &[], &["never.out"])])?;
    assert_eq!(summary.failed, 1);
    Ok(())
}

#[test]
fn pool_of_one_serializes_commands() -> Result<()> {
    let space = TestSpace::new()?;
    let pool = std::sync::Arc::new(bx::pool::ResourcePool::new("serial", 1));

    let mut commands = Vec::new();
    for name in ["a", "b", "c", "d"] {
        let script = format!(
            "echo start-{name} >> trace.log; sleep 0.05; echo end-{name} >> trace.log; touch {name}.out"
        );
        let mut cmd = space.sh(name, &script, &[], &[&format!("{name}.out")]);
        cmd.set_pool(pool.clone());
        commands.push(cmd);
    }
    let summary = space.run(commands)?;
    assert_eq!(summary.succeeded, 4);

    // With one slot, every start is immediately followed by its end.
    let log = space.read("trace.log")?;
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 8);
    for pair in lines.chunks(2) {
        let started = pair[0].strip_prefix("start-").unwrap();
        let ended = pair[1].strip_prefix("end-").unwrap();
        assert_eq!(started, ended);
    }
    Ok(())
}

#[test]
fn strict_order_ranks_ready_commands() -> Result<()> {
    let space = TestSpace::new()?;

    let mut commands = Vec::new();
    for (name, order) in [("late", 5), ("first", -1), ("middle", 2)] {
        let mut cmd = space.sh(
            name,
            &format!("echo {name} >> order.log; touch {name}.out"),
            &[],
            &[&format!("{name}.out")],
        );
        cmd.set_strict_order(order);
        commands.push(cmd);
    }

    let graph = space.graph(commands)?;
    let mut ctx = space.context()?;
    ctx.options_mut().parallelism = 1;
    let mut progress = QuietProgress;
    ctx.run_graph(&graph, &mut progress)?;

    let log = space.read("order.log")?;
    assert_eq!(log, "first\nmiddle\nlate\n");
    Ok(())
}

#[test]
fn dependents_start_after_dependencies_end() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("seed", "s")?;

    // A slow producer and a fast consumer; the consumer must still see
    // the fully written intermediate.
    let a = space.sh(
        "produce",
        "sleep 0.05; cp seed mid",
        &["seed"],
        &["mid"],
    );
    let b = space.cp("consume", "mid", "end");
    let summary = space.run(vec![b, a])?;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(space.read("end")?, "s");
    Ok(())
}

#[test]
fn timeout_fails_the_command() -> Result<()> {
    let space = TestSpace::new()?;
    let graph = space.graph(vec![space.sh("slow", "sleep 30", &[], &[])])?;
    let mut ctx = space.context()?;
    ctx.options_mut().timeout = Some(std::time::Duration::from_millis(100));
    ctx.options_mut().grace = std::time::Duration::from_millis(50);
    let mut progress = QuietProgress;

    let start = std::time::Instant::now();
    let summary = ctx.run_graph(&graph, &mut progress)?;
    assert_eq!(summary.failed, 1);
    assert!(start.elapsed() < std::time::Duration::from_secs(10));
    Ok(())
}

#[test]
fn cancellation_stops_pending_work() -> Result<()> {
    let space = TestSpace::new()?;
    let a = space.sh("a", "touch a.out", &[], &["a.out"]);
    let mut b = space.sh("b", "touch b.out", &[], &["b.out"]);
    b.add_input(space.path("a.out"));
    let graph = space.graph(vec![a, b])?;

    let ctx = space.context()?;
    let store = db::Store::open(&ctx.build_dir().fingerprints())?;
    let options = Options::default();
    let mut progress = QuietProgress;
    let work = Work::new(
        &graph,
        ctx.file_storage(),
        store,
        &options,
        ctx.build_dir().logs(),
        &mut progress,
    );
    work.cancel_handle().cancel();
    let summary = work.run()?;

    // Nothing starts after cancellation; the dependent never spawns.
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed + summary.propagated, 2);
    assert!(!std::path::Path::new(&space.path("b.out")).exists());
    Ok(())
}

#[test]
fn saved_plan_replays_without_drivers() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("in.txt", "payload")?;
    let graph = space.graph(vec![space.cp("copy", "in.txt", "out.txt")])?;

    let plan_path = space.dir.path().join("saved.plan");
    bx::plan::save_execution_plan(&graph, &plan_path)?;

    let ctx = space.context()?;
    let mut progress = QuietProgress;
    let summary = ctx.run_saved_execution_plan(&plan_path, &mut progress)?;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(space.read("out.txt")?, "payload");

    // Replaying again over the same state is a no-op.
    let ctx = space.context()?;
    let summary = ctx.run_saved_execution_plan(&plan_path, &mut progress)?;
    assert_eq!(summary.ran(), 0);
    Ok(())
}

#[test]
fn context_dedupes_inputs_by_hash() -> Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "bx.toml",
        r#"
[[command]]
name = "noop"
program = "true"
"#,
    )?;

    let mut ctx = space.context()?;
    ctx.register_driver(Box::new(bx::manifest::ManifestDriver));
    let first = ctx.add_input(&space.path("bx.toml"))?;
    let second = ctx.add_input(&space.path("bx.toml"))?;
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert!(std::sync::Arc::ptr_eq(&first[0], &second[0]));
    Ok(())
}

#[test]
fn batch_and_parallel_inputs_load_through_their_paths() -> Result<()> {
    use bx::driver::{Build, Driver, Target};
    use bx::input::{Input, InputType};
    use bx::package::{PackageId, PackagePath};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NullTarget(String);
    impl Target for NullTarget {
        fn name(&self) -> &str {
            &self.0
        }
        fn prepare(&mut self) -> bx::error::Result<bool> {
            Ok(false)
        }
        fn commands(&mut self) -> Vec<Command> {
            Vec::new()
        }
    }

    struct CountingDriver {
        loads: Arc<AtomicUsize>,
        batch_loads: Arc<AtomicUsize>,
    }

    impl Driver for CountingDriver {
        fn package_id(&self) -> PackageId {
            PackageId::new(
                PackagePath::new("org.bx.driver.counting").unwrap(),
                semver::Version::new(0, 1, 0),
            )
        }
        fn detect_inputs(&self, _path: &std::path::Path, _ty: InputType) -> Vec<Input> {
            Vec::new()
        }
        fn can_load(&self, _input: &Input) -> bool {
            true
        }
        fn load(&self, build: &mut Build, inputs: &[&Input]) -> bx::error::Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            for input in inputs {
                build.add_target(Box::new(NullTarget(
                    input.path().display().to_string(),
                )));
            }
            Ok(())
        }
        fn load_inputs_batch(&self, build: &mut Build, inputs: &[&Input]) -> bx::error::Result<()> {
            self.batch_loads.fetch_add(1, Ordering::SeqCst);
            for input in inputs {
                build.add_target(Box::new(NullTarget(
                    input.path().display().to_string(),
                )));
            }
            Ok(())
        }
    }

    let space = TestSpace::new()?;
    let loads = Arc::new(AtomicUsize::new(0));
    let batch_loads = Arc::new(AtomicUsize::new(0));
    let driver_id;
    let mut ctx = space.context()?;
    {
        let driver = CountingDriver {
            loads: loads.clone(),
            batch_loads: batch_loads.clone(),
        };
        driver_id = driver.package_id();
        ctx.register_driver(Box::new(driver));
    }

    let input_of = |n: u64, batch: bool, parallel: bool| {
        let mut input = Input::new(format!("/virtual/{n}"), InputType::SpecFile);
        input.set_hash(n);
        input.set_driver(driver_id.clone());
        input.set_batch_loadable(batch);
        input.set_parallel_loadable(parallel);
        Arc::new(input)
    };
    let inputs = vec![
        input_of(1, true, false),
        input_of(2, true, false),
        input_of(3, false, true),
        input_of(4, false, true),
        input_of(5, false, false),
    ];

    let mut build = ctx.create_build();
    ctx.load_inputs(&inputs, &mut build)?;

    // Two batchable inputs went through one batch call; the parallel
    // pair and the serial one each got their own load.
    assert_eq!(batch_loads.load(Ordering::SeqCst), 1);
    assert_eq!(loads.load(Ordering::SeqCst), 3);
    assert_eq!(build.target_names().len(), 5);
    assert!(inputs.iter().all(|i| i.is_loaded()));

    // A second pass sees everything loaded and does nothing.
    let mut build = ctx.create_build();
    ctx.load_inputs(&inputs, &mut build)?;
    assert_eq!(loads.load(Ordering::SeqCst), 3);
    assert!(build.is_empty());
    Ok(())
}

#[test]
fn manifest_project_builds_end_to_end() -> Result<()> {
    let space = TestSpace::new()?;
    space.write("hello.in", "hi")?;
    space.write(
        "bx.toml",
        r#"
[package]
name = "hello"

[[command]]
name = "copy hello"
program = "cp"
args = ["hello.in", "hello.out"]
inputs = ["hello.in"]
outputs = ["hello.out"]
"#,
    )?;

    let mut ctx = space.context()?;
    ctx.register_driver(Box::new(bx::manifest::ManifestDriver));
    let build = ctx.load(&[space.path("bx.toml")])?;
    let mut progress = QuietProgress;
    let summary = ctx.run(build, &mut progress)?;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(space.read("hello.out")?, "hi");
    Ok(())
}
