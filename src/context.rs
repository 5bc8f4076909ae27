//! The process-scoped context: driver registry, package storage, host
//! settings, the shared file cache, and the build-directory layout.
//!
//! Lifecycle: drivers are registered first, then inputs are added (the
//! input database assigns their hashes and the context dedupes them),
//! then inputs are loaded into a `Build`, and finally the resulting
//! graph is executed.  The executor lives only for the duration of
//! `run_graph`, so it is always gone before the drivers drop with the
//! context.

use crate::db;
use crate::driver::{Build, Driver};
use crate::error::{Error, Result};
use crate::fs::FileStorage;
use crate::input::{Input, InputType};
use crate::inputdb::InputDatabase;
use crate::package::{LocalPackage, PackageId, UnresolvedPackage};
use crate::plan;
use crate::progress::Progress;
use crate::settings::HostSettings;
use crate::storage::LocalStorage;
use crate::work::{Options, Summary, Work};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Name of the build directory created under the project root.
pub const BUILD_DIR_NAME: &str = ".bx";

/// Layout of persisted state under the build directory.
pub struct BuildDir {
    root: PathBuf,
}

impl BuildDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BuildDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inputs_db(&self) -> PathBuf {
        self.root.join("db").join("inputs.db")
    }

    pub fn fingerprints(&self) -> PathBuf {
        self.root.join("fingerprints")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn rsp(&self) -> PathBuf {
        self.root.join("rsp")
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

pub struct Context {
    drivers: Vec<Box<dyn Driver>>,
    storage: LocalStorage,
    host: HostSettings,
    fsx: FileStorage,
    options: Options,
    build_dir: BuildDir,
    inputdb: Mutex<Option<InputDatabase>>,
    /// Registered inputs, deduped by hash.
    inputs: Mutex<HashMap<u64, Arc<Input>>>,
    inputs_added: AtomicBool,
}

impl Context {
    /// Create a context rooted at a project directory; persisted state
    /// goes to `.bx/` underneath it.
    pub fn new(project_root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_build_dir(project_root.into().join(BUILD_DIR_NAME))
    }

    /// Create a context with an explicit build directory, for callers
    /// that keep build state away from the sources.
    pub fn with_build_dir(build_root: impl Into<PathBuf>) -> Result<Self> {
        let build_dir = BuildDir::new(build_root);
        build_dir.create()?;
        let storage_root = build_dir.root().join("storage");
        Ok(Context {
            drivers: Vec::new(),
            storage: LocalStorage::new(storage_root),
            host: HostSettings::detect(),
            fsx: FileStorage::new(),
            options: Options::default(),
            build_dir,
            inputdb: Mutex::new(None),
            inputs: Mutex::new(HashMap::new()),
            inputs_added: AtomicBool::new(false),
        })
    }

    pub fn set_storage(&mut self, storage: LocalStorage) {
        self.storage = storage;
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    pub fn host(&self) -> &HostSettings {
        &self.host
    }

    pub fn set_host(&mut self, host: HostSettings) {
        self.host = host;
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn build_dir(&self) -> &BuildDir {
        &self.build_dir
    }

    pub fn file_storage(&self) -> &FileStorage {
        &self.fsx
    }

    pub fn register_driver(&mut self, driver: Box<dyn Driver>) {
        assert!(
            !self.inputs_added.load(Ordering::SeqCst),
            "drivers must be registered before any input is added"
        );
        debug!(driver = %driver.package_id(), "registering driver");
        self.drivers.push(driver);
    }

    /// A fresh build under this context's host settings.
    pub fn create_build(&self) -> Build {
        Build::new(self.host.to_target_settings())
    }

    /// Add an input by spec string: an existing file or directory goes
    /// through driver detection; anything else is parsed as a package
    /// reference, resolved, installed, and loaded as an installed
    /// package.
    pub fn add_input(&self, spec: &str) -> Result<Vec<Arc<Input>>> {
        let path = Path::new(spec);
        if path.exists() {
            self.add_path_input(path)
        } else {
            let unresolved: UnresolvedPackage = spec
                .parse()
                .map_err(|_| Error::InputNotFound(path.to_path_buf()))?;
            let id = self.storage.resolve(&unresolved)?;
            let local = self.storage.install(&id)?;
            Ok(vec![self.add_package_input(local)?])
        }
    }

    /// The installed-package shortcut: no driver detection, dispatch on
    /// the package's namespace.
    pub fn add_package_input(&self, package: LocalPackage) -> Result<Arc<Input>> {
        debug!(package = %package.id, "loading input");
        let driver = self.driver_for_namespace(&package.id)?;
        let mut input = Input::new(&package.source_dir, InputType::InstalledPackage);
        input.set_driver(driver.package_id());
        input.set_package(package.id);
        self.register_input(input)
    }

    fn add_path_input(&self, path: &Path) -> Result<Vec<Arc<Input>>> {
        let path = std::fs::canonicalize(path)?;
        let meta = std::fs::metadata(&path)?;
        let candidate_types: &[InputType] = if meta.is_file() {
            &[InputType::SpecFile, InputType::InlineSpec]
        } else if meta.is_dir() {
            &[InputType::DirectorySpecFile]
        } else {
            return Err(Error::InputNotFound(path));
        };

        for &ty in candidate_types {
            for driver in &self.drivers {
                let detected = driver.detect_inputs(&path, ty);
                if detected.is_empty() {
                    continue;
                }
                let mut registered = Vec::with_capacity(detected.len());
                for mut input in detected {
                    input.set_driver(driver.package_id());
                    trace!(
                        driver = %driver.package_id(),
                        input = %input.path().display(),
                        "selected driver"
                    );
                    registered.push(self.register_input(input)?);
                }
                return Ok(registered);
            }
        }
        Err(Error::NoDriverAccepted(path))
    }

    /// Hash the input (through the input database) and dedupe it
    /// against previously registered inputs.
    fn register_input(&self, mut input: Input) -> Result<Arc<Input>> {
        self.inputs_added.store(true, Ordering::SeqCst);
        if input.hash() == 0 {
            self.setup_input_hash(&mut input)?;
        }
        let mut inputs = self.inputs.lock().unwrap();
        let entry = inputs
            .entry(input.hash())
            .or_insert_with(|| Arc::new(input));
        Ok(entry.clone())
    }

    /// `setup_input` with the retry-once contract: a database error
    /// recreates the file and tries again; the second failure is fatal.
    fn setup_input_hash(&self, input: &mut Input) -> Result<()> {
        let mut guard = self.inputdb.lock().unwrap();
        if guard.is_none() {
            *guard = Some(InputDatabase::open(&self.build_dir.inputs_db())?);
        }
        match guard.as_mut().unwrap().setup_input(input) {
            Ok(()) => Ok(()),
            Err(err @ Error::Database(_)) => {
                tracing::warn!("recreating input database: {}", err);
                *guard = None;
                let _ = std::fs::remove_file(self.build_dir.inputs_db());
                let mut db = InputDatabase::open(&self.build_dir.inputs_db())?;
                let result = db.setup_input(input);
                *guard = Some(db);
                result
            }
            Err(err) => Err(err),
        }
    }

    fn driver_for_input(&self, input: &Input) -> Result<&dyn Driver> {
        let id = input
            .driver()
            .ok_or_else(|| Error::NoDriverAccepted(input.path().to_path_buf()))?;
        self.drivers
            .iter()
            .map(|d| d.as_ref())
            .find(|d| &d.package_id() == id)
            .ok_or_else(|| Error::NoDriverAccepted(input.path().to_path_buf()))
    }

    fn driver_for_namespace(&self, package: &PackageId) -> Result<&dyn Driver> {
        if let Some(driver) = self
            .drivers
            .iter()
            .find(|d| d.package_id().path.namespace() == package.path.namespace())
        {
            return Ok(driver.as_ref());
        }
        // A single registered driver takes everything.
        match self.drivers.as_slice() {
            [only] => Ok(only.as_ref()),
            _ => Err(Error::NoDriverAccepted(PathBuf::from(package.to_string()))),
        }
    }

    /// Load inputs into the build: batch-loadable ones grouped per
    /// driver, parallel-loadable ones across threads, the rest one at a
    /// time.
    pub fn load_inputs(&self, inputs: &[Arc<Input>], build: &mut Build) -> Result<()> {
        let mut batches: HashMap<String, Vec<&Input>> = HashMap::new();
        let mut parallel: Vec<&Input> = Vec::new();
        let mut serial: Vec<&Input> = Vec::new();

        for input in inputs {
            if input.is_loaded() {
                continue;
            }
            if input.is_batch_loadable() {
                let driver = self.driver_for_input(input)?;
                batches
                    .entry(driver.package_id().to_string())
                    .or_default()
                    .push(input);
            } else if input.is_parallel_loadable() {
                parallel.push(input);
            } else {
                serial.push(input);
            }
        }

        for group in batches.values() {
            let driver = self.driver_for_input(group[0])?;
            driver.load_inputs_batch(build, group)?;
            for input in group {
                input.mark_loaded();
            }
        }

        for input in serial {
            let driver = self.driver_for_input(input)?;
            driver.load(build, &[input])?;
            input.mark_loaded();
        }

        if !parallel.is_empty() {
            let settings = build.settings.clone();
            let loaded: Vec<Result<Build>> = std::thread::scope(|scope| {
                let handles: Vec<_> = parallel
                    .iter()
                    .map(|&input| {
                        let settings = settings.clone();
                        scope.spawn(move || {
                            let mut local = Build::new(settings);
                            let driver = self.driver_for_input(input)?;
                            driver.load(&mut local, &[input])?;
                            input.mark_loaded();
                            Ok(local)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            for result in loaded {
                build.merge(result?);
            }
        }
        Ok(())
    }

    /// Convenience: add and load a set of spec strings into one build.
    pub fn load(&self, specs: &[String]) -> Result<Build> {
        let mut all = Vec::new();
        for spec in specs {
            all.extend(self.add_input(spec)?);
        }
        let mut build = self.create_build();
        self.load_inputs(&all, &mut build)?;
        Ok(build)
    }

    /// Execute a finalized graph under this context.
    pub fn run_graph(
        &self,
        graph: &crate::graph::CommandGraph,
        progress: &mut (dyn Progress + Send),
    ) -> Result<Summary> {
        let store = db::Store::open(&self.build_dir.fingerprints())?;
        let work = Work::new(
            graph,
            &self.fsx,
            store,
            &self.options,
            self.build_dir.logs(),
            progress,
        );
        work.run()
    }

    /// Turn a build into a graph and execute it.
    pub fn run(&self, build: Build, progress: &mut (dyn Progress + Send)) -> Result<Summary> {
        let graph = build.into_graph(&self.build_dir.rsp(), self.options.max_argv_bytes)?;
        self.run_graph(&graph, progress)
    }

    /// Replay a previously saved execution plan without invoking any
    /// driver.
    pub fn run_saved_execution_plan(
        &self,
        path: &Path,
        progress: &mut (dyn Progress + Send),
    ) -> Result<Summary> {
        let graph = plan::load_execution_plan(path)?;
        self.run_graph(&graph, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_dir_layout_matches_the_contract() {
        let bd = BuildDir::new("/proj/.bx");
        assert_eq!(bd.inputs_db(), PathBuf::from("/proj/.bx/db/inputs.db"));
        assert_eq!(bd.fingerprints(), PathBuf::from("/proj/.bx/fingerprints"));
        assert_eq!(bd.logs(), PathBuf::from("/proj/.bx/logs"));
        assert_eq!(bd.rsp(), PathBuf::from("/proj/.bx/rsp"));
    }

    #[test]
    fn unknown_input_is_reported_as_not_found() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(dir.path())?;
        let err = ctx.add_input("no/such/path/anywhere").unwrap_err();
        assert!(matches!(err, Error::InputNotFound(_)));
        Ok(())
    }
}
