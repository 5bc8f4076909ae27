//! Package storage: a remote catalog interface plus the local store of
//! materialized package sources.
//!
//! The local store is content-addressed by package id: each resolved
//! package gets `pkg/<dotted path>/<version>/` under the store root,
//! and installation is idempotent: asking for the same id twice hands
//! back the same directory without touching the catalog.

use crate::error::{Error, Result};
use crate::package::{LocalPackage, PackageId, PackagePath, UnresolvedPackage};
use semver::Version;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// The remote side of package storage, specified at its interface
/// only: version listing and archive materialization.
pub trait RemoteCatalog: Send + Sync {
    fn versions(&self, path: &PackagePath) -> Result<Vec<Version>>;

    /// Materialize the package's source tree into `dest`.
    fn fetch(&self, id: &PackageId, dest: &Path) -> Result<()>;
}

pub struct LocalStorage {
    root: PathBuf,
    catalog: Option<Box<dyn RemoteCatalog>>,
    installed: Mutex<HashMap<PackageId, LocalPackage>>,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStorage {
            root: root.into(),
            catalog: None,
            installed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_catalog(root: impl Into<PathBuf>, catalog: Box<dyn RemoteCatalog>) -> Self {
        LocalStorage {
            root: root.into(),
            catalog: Some(catalog),
            installed: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, id: &PackageId) -> PathBuf {
        self.root
            .join("pkg")
            .join(id.path.as_dir())
            .join(id.version.to_string())
    }

    /// Versions of a package already materialized locally.
    fn local_versions(&self, path: &PackagePath) -> Vec<Version> {
        let dir = self.root.join("pkg").join(path.as_dir());
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| Version::parse(&e.file_name().to_string_lossy()).ok())
            .collect()
    }

    /// Pick the highest version satisfying the range, from the local
    /// store and the catalog combined.
    pub fn resolve(&self, unresolved: &UnresolvedPackage) -> Result<PackageId> {
        let mut versions = self.local_versions(&unresolved.path);
        if let Some(catalog) = &self.catalog {
            versions.extend(catalog.versions(&unresolved.path)?);
        }
        versions.sort();
        versions.dedup();
        let best = versions
            .into_iter()
            .rev()
            .find(|v| unresolved.range.matches(v))
            .ok_or_else(|| {
                Error::Package(format!("no version of {} matches", unresolved))
            })?;
        Ok(PackageId::new(unresolved.path.clone(), best))
    }

    /// Materialize the package, fetching at most once per id.
    pub fn install(&self, id: &PackageId) -> Result<LocalPackage> {
        if let Some(local) = self.installed.lock().unwrap().get(id) {
            return Ok(local.clone());
        }

        let source_dir = self.source_dir(id);
        if !source_dir.is_dir() {
            let Some(catalog) = &self.catalog else {
                return Err(Error::Package(format!(
                    "{} is not installed and no remote catalog is configured",
                    id
                )));
            };
            // Fetch into a staging dir and rename, so a torn download
            // never looks installed.
            let staging = self.root.join("tmp").join(format!(
                "{}-{}",
                id.path.as_str(),
                std::process::id()
            ));
            if staging.exists() {
                std::fs::remove_dir_all(&staging)?;
            }
            std::fs::create_dir_all(&staging)?;
            catalog.fetch(id, &staging)?;
            if let Some(parent) = source_dir.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&staging, &source_dir)?;
            debug!(package = %id, dir = %source_dir.display(), "installed");
        }

        let local = LocalPackage {
            id: id.clone(),
            source_dir,
        };
        self.installed
            .lock()
            .unwrap()
            .insert(id.clone(), local.clone());
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeCatalog {
        fetches: Arc<AtomicUsize>,
    }

    impl RemoteCatalog for FakeCatalog {
        fn versions(&self, _path: &PackagePath) -> Result<Vec<Version>> {
            Ok(vec![
                Version::new(1, 0, 0),
                Version::new(1, 2, 0),
                Version::new(2, 0, 0),
            ])
        }

        fn fetch(&self, id: &PackageId, dest: &Path) -> Result<()> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            std::fs::write(dest.join("spec"), id.to_string())?;
            Ok(())
        }
    }

    fn storage(dir: &Path) -> (LocalStorage, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let catalog = FakeCatalog {
            fetches: fetches.clone(),
        };
        (
            LocalStorage::with_catalog(dir, Box::new(catalog)),
            fetches,
        )
    }

    #[test]
    fn resolve_picks_highest_matching_version() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (storage, _) = storage(dir.path());

        let u: UnresolvedPackage = "org.demo.zlib-1".parse()?;
        assert_eq!(storage.resolve(&u)?.version, Version::new(1, 2, 0));

        let any: UnresolvedPackage = "org.demo.zlib".parse()?;
        assert_eq!(storage.resolve(&any)?.version, Version::new(2, 0, 0));

        let none: UnresolvedPackage = "org.demo.zlib-3".parse()?;
        assert!(storage.resolve(&none).is_err());
        Ok(())
    }

    #[test]
    fn install_is_idempotent_per_id() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (storage, fetches) = storage(dir.path());

        let id: PackageId = "org.demo.zlib-1.2.0".parse()?;
        let a = storage.install(&id)?;
        let b = storage.install(&id)?;
        assert_eq!(a.source_dir, b.source_dir);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(a.source_dir.join("spec").is_file());
        Ok(())
    }

    #[test]
    fn already_materialized_sources_need_no_catalog() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let id: PackageId = "org.demo.zlib-1.0.0".parse()?;

        // Without sources on disk and without a catalog, install fails.
        assert!(storage.install(&id).is_err());

        std::fs::create_dir_all(storage.source_dir(&id))?;
        let local = storage.install(&id)?;
        assert_eq!(local.source_dir, storage.source_dir(&id));

        // And resolution sees the local version.
        let u: UnresolvedPackage = "org.demo.zlib".parse()?;
        assert_eq!(storage.resolve(&u)?.version, Version::new(1, 0, 0));
        Ok(())
    }
}
