//! Build commands: the unit of work in the graph.
//!
//! A command's identity is its program, argv, working directory,
//! environment, and input/output sets.  Its fingerprint extends the
//! identity with per-input evidence (content hash or mtime) and is the
//! basis of the up-to-date check: a command whose current fingerprint
//! matches the one stored by its last successful run, and whose outputs
//! all exist, is skipped.

use crate::db::StoredRun;
use crate::error::{Error, Result};
use crate::fs::FileStorage;
use crate::hash::{Evidence, Fingerprint, IdentityHasher};
use crate::pool::ResourcePool;
use crate::process::{self, Invocation, Termination};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

pub const WINDOWS_MAX_ARGV_BYTES: usize = 8_191;
pub const POSIX_MAX_ARGV_BYTES: usize = 131_071;

pub fn default_max_argv_bytes() -> usize {
    if cfg!(windows) {
        WINDOWS_MAX_ARGV_BYTES
    } else {
        POSIX_MAX_ARGV_BYTES
    }
}

/// Whether a successful run is allowed to leave an output missing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MaybeUnused {
    /// Outputs are required; a missing one fails the command.
    #[default]
    No,
    /// Tolerated with a warning.
    Maybe,
    /// Tolerated silently.
    Always,
}

/// A resolved tool.  Commands set their program through one of these
/// when the tool binary itself should count as an input, so upgrading
/// the tool invalidates everything built with it.
#[derive(Debug, Clone)]
pub struct Tool {
    pub path: String,
}

impl Tool {
    pub fn new(path: impl Into<String>) -> Self {
        Tool { path: path.into() }
    }
}

/// A response file materialized by `prepare` when the command line
/// exceeds the platform limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RspFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct Timing {
    pub begin: Option<SystemTime>,
    pub end: Option<SystemTime>,
}

#[derive(Debug)]
pub struct Command {
    pub(crate) name: String,
    pub(crate) name_short: String,
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) cwd: Option<String>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) env_remove: BTreeSet<String>,
    /// If set, only these env vars participate in the fingerprint.
    pub(crate) hash_env_allow: Option<BTreeSet<String>>,
    pub(crate) hash_env_deny: BTreeSet<String>,
    pub(crate) inputs: BTreeSet<String>,
    pub(crate) outputs: BTreeSet<String>,
    pub(crate) intermediates: BTreeSet<String>,
    pub(crate) stdin_file: Option<String>,
    pub(crate) stdout_file: Option<String>,
    pub(crate) stderr_file: Option<String>,

    pub(crate) always: bool,
    pub(crate) silent: bool,
    pub(crate) remove_outputs_before_execution: bool,
    pub(crate) use_response_file: bool,
    pub(crate) record_inputs_mtime: bool,
    /// Hash input contents (default); disabled means mtime evidence.
    pub(crate) content_evidence: bool,
    pub(crate) strict_order: i32,
    pub(crate) maybe_unused: MaybeUnused,
    pub(crate) pool: Option<Arc<ResourcePool>>,

    pub(crate) prepared: bool,
    pub(crate) rsp: Option<RspFile>,
    pub(crate) identity: OnceLock<u64>,
    pub(crate) fingerprint: OnceLock<Fingerprint>,
    pub timing: Mutex<Timing>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            name_short: String::new(),
            program: String::new(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            env_remove: BTreeSet::new(),
            hash_env_allow: None,
            hash_env_deny: BTreeSet::new(),
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            intermediates: BTreeSet::new(),
            stdin_file: None,
            stdout_file: None,
            stderr_file: None,
            always: false,
            silent: false,
            remove_outputs_before_execution: false,
            use_response_file: false,
            record_inputs_mtime: false,
            content_evidence: true,
            strict_order: 0,
            maybe_unused: MaybeUnused::No,
            pool: None,
            prepared: false,
            rsp: None,
            identity: OnceLock::new(),
            fingerprint: OnceLock::new(),
            timing: Mutex::new(Timing::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short display name, falling back to the full one.
    pub fn display_name(&self) -> &str {
        if self.name_short.is_empty() {
            &self.name
        } else {
            &self.name_short
        }
    }

    pub fn set_name_short(&mut self, name: impl Into<String>) {
        self.name_short = name.into();
    }

    pub fn set_program(&mut self, program: impl Into<String>) {
        self.program = program.into();
    }

    /// Set the program from a resolved tool; the tool binary becomes an
    /// input so that upgrading it invalidates the command.
    pub fn set_tool(&mut self, tool: &Tool) {
        self.program = tool.path.clone();
        self.add_input(&tool.path);
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    pub fn args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    pub fn set_cwd(&mut self, cwd: impl Into<String>) {
        self.cwd = Some(cwd.into());
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn env_remove(&mut self, key: impl Into<String>) {
        self.env_remove.insert(key.into());
    }

    /// Restrict the fingerprint to these env vars.
    pub fn hash_env_allow<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hash_env_allow = Some(keys.into_iter().map(Into::into).collect());
    }

    /// Exclude an env var from the fingerprint.
    pub fn hash_env_deny(&mut self, key: impl Into<String>) {
        self.hash_env_deny.insert(key.into());
    }

    pub fn add_input(&mut self, path: impl AsRef<str>) {
        self.inputs.insert(crate::canon::canon_path(path.as_ref()));
    }

    pub fn add_output(&mut self, path: impl AsRef<str>) {
        self.outputs.insert(crate::canon::canon_path(path.as_ref()));
    }

    /// Intermediates only order scheduling and get cleaned up; they are
    /// not part of the command's identity.
    pub fn add_intermediate(&mut self, path: impl AsRef<str>) {
        self.intermediates
            .insert(crate::canon::canon_path(path.as_ref()));
    }

    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(String::as_str)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(String::as_str)
    }

    pub fn redirect_stdin(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.add_input(&path);
        self.stdin_file = Some(path);
    }

    pub fn redirect_stdout(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.add_output(&path);
        self.stdout_file = Some(path);
    }

    pub fn redirect_stderr(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.add_output(&path);
        self.stderr_file = Some(path);
    }

    pub fn set_always(&mut self, v: bool) {
        self.always = v;
    }

    pub fn set_silent(&mut self, v: bool) {
        self.silent = v;
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn set_remove_outputs_before_execution(&mut self, v: bool) {
        self.remove_outputs_before_execution = v;
    }

    pub fn set_use_response_file(&mut self, v: bool) {
        self.use_response_file = v;
    }

    pub fn set_record_inputs_mtime(&mut self, v: bool) {
        self.record_inputs_mtime = v;
    }

    /// Switch input evidence from content hashes to mtimes.
    pub fn set_content_evidence(&mut self, v: bool) {
        self.content_evidence = v;
    }

    pub fn set_strict_order(&mut self, order: i32) {
        self.strict_order = order;
    }

    pub fn strict_order(&self) -> i32 {
        self.strict_order
    }

    pub fn set_maybe_unused(&mut self, v: MaybeUnused) {
        self.maybe_unused = v;
    }

    pub fn set_pool(&mut self, pool: Arc<ResourcePool>) {
        self.pool = Some(pool);
    }

    pub fn pool(&self) -> Option<&Arc<ResourcePool>> {
        self.pool.as_ref()
    }

    pub fn rsp_file(&self) -> Option<&RspFile> {
        self.rsp.as_ref()
    }

    /// Rough byte length of the command line as the OS sees it.
    fn argv_bytes(&self) -> usize {
        self.program.len() + self.args.iter().map(|a| a.len() + 1).sum::<usize>()
    }

    pub fn needs_response_file(&self, max_argv_bytes: usize) -> bool {
        self.use_response_file || self.argv_bytes() > max_argv_bytes
    }

    /// Finalize the command for execution.  Idempotent; called once by
    /// the build before registration.  Writes the response file if the
    /// command line is too long and pins the identity hash.
    pub fn prepare(&mut self, rsp_dir: &Path, max_argv_bytes: usize) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        let identity = self.identity();
        if self.needs_response_file(max_argv_bytes) {
            let path = rsp_dir.join(format!("{:016x}.rsp", identity));
            std::fs::create_dir_all(rsp_dir)?;
            let content = self.args.join("\n");
            std::fs::write(&path, &content)?;
            self.rsp = Some(RspFile {
                path: path.to_string_lossy().into_owned(),
                content,
            });
        }
        self.prepared = true;
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Env pairs that participate in the fingerprint, sorted by key.
    fn hashed_env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env
            .iter()
            .filter(|(k, _)| match &self.hash_env_allow {
                Some(allow) => allow.contains(*k),
                None => true,
            })
            .filter(|(k, _)| !self.hash_env_deny.contains(*k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn write_identity(&self, h: &mut IdentityHasher) {
        h.write_str(&self.program);
        h.write_separator();
        for arg in &self.args {
            h.write_str(arg);
        }
        h.write_separator();
        h.write_str(self.cwd.as_deref().unwrap_or(""));
        h.write_separator();
        for (k, v) in self.hashed_env() {
            h.write_str(k);
            h.write_str(v);
        }
        h.write_separator();
        // BTreeSet keeps these sorted, so input/output registration
        // order never shifts the hash.
        for input in &self.inputs {
            h.write_str(input);
        }
        h.write_separator();
        for output in &self.outputs {
            h.write_str(output);
        }
        h.write_separator();
    }

    /// Hash of the command's identity alone, without input evidence.
    /// Used as the stable key for the fingerprint store and for log and
    /// response file names.
    pub fn identity(&self) -> u64 {
        *self.identity.get_or_init(|| {
            let mut h = IdentityHasher::new();
            self.write_identity(&mut h);
            h.finish().0
        })
    }

    /// The full fingerprint: identity plus evidence for every input.
    /// Computed once per process; inputs cannot change between the
    /// up-to-date check and execution because producing commands have
    /// already finished.
    pub fn fingerprint(&self, fsx: &FileStorage) -> Result<Fingerprint> {
        if let Some(fp) = self.fingerprint.get() {
            return Ok(*fp);
        }
        let mut h = IdentityHasher::new();
        self.write_identity(&mut h);
        for input in &self.inputs {
            h.write_str(input);
            let evidence = if self.content_evidence {
                Evidence::Content(fsx.content_hash(input)?)
            } else {
                Evidence::Mtime(fsx.mtime(input)?.encode())
            };
            h.write_evidence(evidence);
        }
        let fp = h.finish();
        Ok(*self.fingerprint.get_or_init(|| fp))
    }

    /// The up-to-date predicate: false only when every output exists,
    /// the current fingerprint matches the stored one, and (for
    /// commands recording input mtimes) no input is newer than the
    /// stored run.
    pub fn is_outdated(&self, fsx: &FileStorage, stored: Option<&StoredRun>) -> Result<bool> {
        if self.always {
            return Ok(true);
        }
        for output in &self.outputs {
            if !fsx.exists(output)? {
                return Ok(true);
            }
        }
        let Some(stored) = stored else {
            return Ok(true);
        };
        let fingerprint = match self.fingerprint(fsx) {
            Ok(fp) => fp,
            // A missing input means outdated regardless; the run will
            // surface the real error.
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(true);
            }
            Err(err) => return Err(err),
        };
        if fingerprint != stored.fingerprint {
            return Ok(true);
        }
        if self.record_inputs_mtime {
            for input in &self.inputs {
                if fsx.mtime(input)?.encode() > stored.run_mtime {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// The argv actually handed to the OS: rewritten to `@file` when a
    /// response file was prepared.
    fn exec_args(&self) -> Vec<String> {
        match &self.rsp {
            Some(rsp) => vec![format!("@{}", rsp.path)],
            None => self.args.clone(),
        }
    }

    fn before_run(&self) {
        self.timing.lock().unwrap().begin = Some(SystemTime::now());
        tracing::debug!(command = %self.name, program = %self.program, "run");
    }

    fn on_end(&self) {
        self.timing.lock().unwrap().end = Some(SystemTime::now());
    }

    /// Run the command to completion.  Preconditions: `prepare` was
    /// called, and (under the executor) all dependencies are terminal.
    /// On success the caller persists the fingerprint.
    pub fn execute(
        &self,
        fsx: &FileStorage,
        log_dir: &Path,
        cancel: &AtomicBool,
        timeout: Option<Duration>,
        grace: Duration,
    ) -> Result<Vec<u8>> {
        self.before_run();
        let _slot = self.pool.as_ref().map(|p| p.acquire());

        if self.remove_outputs_before_execution {
            for output in &self.outputs {
                let _ = std::fs::remove_file(output);
            }
        }
        // Replayed plans carry the response file's content but not the
        // file itself.
        if let Some(rsp) = &self.rsp {
            if let Some(parent) = Path::new(&rsp.path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&rsp.path, &rsp.content)?;
        }
        for path in self.outputs.iter().chain(&self.intermediates) {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let args = self.exec_args();
        let env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let env_remove: Vec<&str> = self.env_remove.iter().map(String::as_str).collect();
        let invocation = Invocation {
            program: &self.program,
            args: &args,
            cwd: self.cwd.as_deref(),
            env: &env,
            env_remove: &env_remove,
            stdin: self.stdin_file.as_deref(),
            stdout: self.stdout_file.as_deref(),
            stderr: self.stderr_file.as_deref(),
        };
        let result =
            process::run(&invocation, cancel, timeout, grace).map_err(|err| Error::Spawn {
                name: self.name.clone(),
                program: self.program.clone(),
                source: err,
            })?;
        self.on_end();

        self.write_logs(log_dir, &result.stdout, &result.stderr);

        // The outputs changed under the cache regardless of the result.
        fsx.invalidate_all(
            self.outputs
                .iter()
                .chain(&self.intermediates)
                .map(String::as_str),
        );

        match result.termination {
            Termination::Success => {
                self.check_outputs(fsx)?;
                let mut display = result.stdout;
                display.extend_from_slice(&result.stderr);
                Ok(display)
            }
            Termination::Failure(code) => Err(Error::ExitNonZero {
                name: self.name.clone(),
                code,
                stderr_tail: stderr_tail(&result.stderr),
            }),
            Termination::Signaled(signal) => Err(Error::Signaled {
                name: self.name.clone(),
                signal,
            }),
            Termination::TimedOut => Err(Error::Timeout {
                name: self.name.clone(),
                seconds: timeout.unwrap_or_default().as_secs(),
            }),
            Termination::Cancelled => Err(Error::Cancelled),
        }
    }

    fn check_outputs(&self, fsx: &FileStorage) -> Result<()> {
        for output in &self.outputs {
            if fsx.exists(output)? {
                continue;
            }
            match self.maybe_unused {
                MaybeUnused::No => {
                    return Err(Error::OutputMissing {
                        name: self.name.clone(),
                        file: output.clone(),
                    });
                }
                MaybeUnused::Maybe => {
                    tracing::warn!(command = %self.name, output = %output, "output not produced");
                }
                MaybeUnused::Always => {}
            }
        }
        Ok(())
    }

    fn write_logs(&self, log_dir: &Path, stdout: &[u8], stderr: &[u8]) {
        // Captured streams are kept for post-mortems; redirected ones
        // already went to their destination files.
        if std::fs::create_dir_all(log_dir).is_err() {
            return;
        }
        let base = format!("{:016x}", self.identity());
        if self.stdout_file.is_none() {
            let _ = std::fs::write(log_dir.join(format!("{}.stdout", base)), stdout);
        }
        if self.stderr_file.is_none() {
            let _ = std::fs::write(log_dir.join(format!("{}.stderr", base)), stderr);
        }
    }

    /// Best-effort removal of everything this command may have written.
    /// Used when a cancelled or failed run leaves partial outputs.
    pub fn clean(&self) {
        for output in self.outputs.iter().chain(&self.intermediates) {
            let _ = std::fs::remove_file(output);
        }
        if let Some(rsp) = &self.rsp {
            let _ = std::fs::remove_file(&rsp.path);
        }
    }
}

/// The last few lines of captured stderr, for error reports.
pub fn stderr_tail(stderr: &[u8]) -> String {
    const MAX_LINES: usize = 10;
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(MAX_LINES);
    lines[start..].join("\n")
}
