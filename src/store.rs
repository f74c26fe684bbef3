use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use semver::Version;
use tracing::{debug, info, warn};
use crate::error::{FormulaError, StoreError};
use crate::formula::{formula_files, Formula, FormulaFile};

/// Every known formula, keyed by name and version.
///
/// Registration is serialised behind a mutex so that conflict checks and the
/// insert that follows them happen as one step. Superseded versions are kept
/// so older releases stay resolvable.
#[derive(Debug, Default)]
pub struct FormulaStore {
    state: Mutex<StoreState>,
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<String, BTreeMap<Version, Formula>>,
    /// ASCII-lowercased name to the registered spelling.
    folded: HashMap<String, String>,
    /// (source_url, version) to the first (name, checksum) seen for it.
    sources: HashMap<(String, Version), (String, String)>,
    /// checksum to every name that declared it.
    checksums: HashMap<String, BTreeSet<String>>,
}

/// Outcome of loading a directory of formula files.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub files: usize,
    /// Records newly added to the store.
    pub registered: usize,
    /// Records identical to one already registered, accepted as no-ops.
    pub duplicates: usize,
    pub rejected: Vec<(PathBuf, StoreError)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

impl FormulaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates and registers a formula.
    ///
    /// Registering the same name, version, and checksum again is a no-op.
    ///
    /// # Errors
    /// - [`StoreError::Invalid`] if a field invariant does not hold
    /// - [`StoreError::NameCollision`] if the name matches a registered one
    ///   ignoring case
    /// - [`StoreError::IntegrityConflict`] if the name and version exist with
    ///   another checksum
    /// - [`StoreError::SourceConflict`] if the source URL and version exist
    ///   with another checksum
    ///
    /// On error the store is left exactly as it was.
    pub fn register(&self, formula: Formula) -> Result<(), StoreError> {
        self.insert(formula).map(|_| ())
    }

    /// Registers `formula`, returning `false` when an identical record was
    /// already present.
    fn insert(&self, formula: Formula) -> Result<bool, StoreError> {
        formula.validate()?;
        let mut state = self.lock();

        let folded = formula.name.to_ascii_lowercase();
        if let Some(existing) = state.folded.get(&folded) {
            if *existing != formula.name {
                return Err(StoreError::NameCollision {
                    existing: existing.clone(),
                    incoming: formula.name.clone(),
                });
            }
        }

        if let Some(existing) = state
            .records
            .get(&formula.name)
            .and_then(|versions| versions.get(&formula.version))
        {
            if existing.checksum != formula.checksum {
                return Err(StoreError::IntegrityConflict {
                    name: formula.name.clone(),
                    version: formula.version.clone(),
                    existing_checksum: existing.checksum.clone(),
                    incoming_checksum: formula.checksum.clone(),
                });
            }
            debug!(name = %formula.name, version = %formula.version, "formula already registered");
            return Ok(false);
        }

        let source_key = (formula.source_url.clone(), formula.version.clone());
        if let Some((existing_name, existing_checksum)) = state.sources.get(&source_key) {
            if *existing_checksum != formula.checksum {
                return Err(StoreError::SourceConflict {
                    source_url: formula.source_url.clone(),
                    version: formula.version.clone(),
                    existing_name: existing_name.clone(),
                    existing_checksum: existing_checksum.clone(),
                    incoming_name: formula.name.clone(),
                    incoming_checksum: formula.checksum.clone(),
                });
            }
        }

        let aliases = state.checksums.entry(formula.checksum.clone()).or_default();
        if !aliases.is_empty() && !aliases.contains(&formula.name) {
            info!(name = %formula.name, aliases = ?aliases, "formula shares its source with other names");
        }
        aliases.insert(formula.name.clone());
        state
            .sources
            .entry(source_key)
            .or_insert_with(|| (formula.name.clone(), formula.checksum.clone()));
        state.folded.insert(folded, formula.name.clone());
        debug!(name = %formula.name, version = %formula.version, "registered formula");
        state
            .records
            .entry(formula.name.clone())
            .or_default()
            .insert(formula.version.clone(), formula);
        Ok(true)
    }

    /// Returns the highest registered version of `name`.
    pub fn resolve(&self, name: &str) -> Result<Formula, StoreError> {
        self.lock()
            .records
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Returns one specific version of `name`.
    pub fn resolve_version(&self, name: &str, version: &Version) -> Result<Formula, StoreError> {
        let state = self.lock();
        let versions = state
            .records
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        versions.get(version).cloned().ok_or_else(|| StoreError::VersionNotFound {
            name: name.to_string(),
            version: version.clone(),
        })
    }

    /// Other names that declare a checksum also declared by `name`.
    ///
    /// Empty for unknown names.
    pub fn aliases_of(&self, name: &str) -> BTreeSet<String> {
        let state = self.lock();
        let Some(versions) = state.records.get(name) else {
            return BTreeSet::new();
        };
        versions
            .values()
            .filter_map(|formula| state.checksums.get(&formula.checksum))
            .flatten()
            .filter(|alias| alias.as_str() != name)
            .cloned()
            .collect()
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().records.keys().cloned().collect();
        names.sort();
        names
    }

    /// All registered versions of `name`, ascending.
    pub fn versions(&self, name: &str) -> Vec<Version> {
        self.lock()
            .records
            .get(name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The highest version of every registered name, sorted by name.
    pub fn latest(&self) -> Vec<Formula> {
        let state = self.lock();
        let mut latest: Vec<Formula> = state
            .records
            .values()
            .filter_map(|versions| versions.values().next_back().cloned())
            .collect();
        latest.sort_by(|a, b| a.name.cmp(&b.name));
        latest
    }

    /// Number of registered records across all names and versions.
    pub fn len(&self) -> usize {
        self.lock().records.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers every record of every formula file below `dir`.
    ///
    /// A rejected record or unreadable file is reported and skipped; the
    /// rest still load.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<LoadReport, FormulaError> {
        let mut report = LoadReport::default();
        for path in formula_files(dir)? {
            report.files += 1;
            let file = match FormulaFile::load(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable formula file");
                    report.rejected.push((path, e.into()));
                    continue;
                }
            };
            for formula in file.formulas {
                match self.insert(formula) {
                    Ok(true) => report.registered += 1,
                    Ok(false) => report.duplicates += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "rejected formula");
                        report.rejected.push((path.clone(), e));
                    }
                }
            }
        }
        info!(files = report.files, registered = report.registered, duplicates = report.duplicates, rejected = report.rejected.len(), "loaded formulas");
        Ok(report)
    }
}
