//! CLI front-end: flag parsing, context assembly, exit-code mapping.

use crate::context::Context;
use crate::error::Error;
use crate::manifest::ManifestDriver;
use crate::plan;
use crate::progress::{ConsoleProgress, Progress};
use crate::signal;
use anyhow::anyhow;
use std::path::Path;

#[derive(argh::FromArgs)]
/// bx, a build orchestrator and package manager for native code
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// per-command timeout in seconds
    #[argh(option)]
    timeout: Option<u64>,

    /// build directory [default=.bx]
    #[argh(option)]
    build_dir: Option<String>,

    /// command line byte limit before response files are used
    #[argh(option)]
    max_argv_bytes: Option<usize>,

    /// replay a saved execution plan instead of loading inputs
    #[argh(option)]
    plan: Option<String>,

    /// save the execution plan to this file before running
    #[argh(option)]
    save_plan: Option<String>,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// inputs to build: spec files, directories, or package references
    /// [default=.]
    #[argh(positional)]
    inputs: Vec<String>,
}

/// Exit codes: 1 execution failure, 2 load-phase failure, 3 graph
/// rejection (cycle or duplicate output).
fn exit_code_for(err: &Error) -> i32 {
    if err.is_graph_error() {
        3
    } else if err.is_load_error() {
        2
    } else {
        1
    }
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if opts.verbose { "debug" } else { "warn" })
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    signal::register_sigint();

    let mut ctx = match &opts.build_dir {
        Some(dir) => Context::with_build_dir(dir)?,
        None => Context::new(std::env::current_dir()?)?,
    };
    if let Some(parallelism) = opts.parallelism {
        ctx.options_mut().parallelism = parallelism;
    }
    if let Some(seconds) = opts.timeout {
        ctx.options_mut().timeout = Some(std::time::Duration::from_secs(seconds));
    }
    if let Some(max) = opts.max_argv_bytes {
        ctx.options_mut().max_argv_bytes = max;
    }
    ctx.register_driver(Box::new(ManifestDriver));

    let mut progress = ConsoleProgress::new(opts.verbose);

    let summary = if let Some(plan_path) = &opts.plan {
        ctx.run_saved_execution_plan(Path::new(plan_path), &mut progress)
    } else {
        let inputs = if opts.inputs.is_empty() {
            vec![".".to_string()]
        } else {
            opts.inputs.clone()
        };
        ctx.load(&inputs).and_then(|build| {
            let graph =
                build.into_graph(&ctx.build_dir().rsp(), ctx.options().max_argv_bytes)?;
            if let Some(save_path) = &opts.save_plan {
                plan::save_execution_plan(&graph, Path::new(save_path))?;
            }
            ctx.run_graph(&graph, &mut progress)
        })
    };

    match summary {
        Ok(summary) => {
            if summary.ran() == 0 && summary.ok() {
                println!("bx: no work to do");
            } else {
                println!("bx: {}", summary);
            }
            Ok(if summary.ok() { 0 } else { 1 })
        }
        Err(err) => {
            progress.log(&format!("bx: error: {}", err));
            Ok(exit_code_for(&err))
        }
    }
}

pub fn run() -> anyhow::Result<i32> {
    run_impl()
}
