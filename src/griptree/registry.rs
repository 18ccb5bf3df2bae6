//! On-disk griptree registry and the pointer marker kept in each griptree.
//!
//! The registry lives at `<workspace>/.gitgrip/griptrees.json` and is keyed by
//! sanitized branch name. Each griptree directory also carries a pointer back
//! to its owning workspace; older griptrees only have the legacy `.griptree`
//! pointer and no registry entry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{glog_debug, Error, Result};

const REGISTRY_VERSION: u32 = 1;
pub const REGISTRY_FILE: &str = "griptrees.json";
pub const POINTER_FILE: &str = ".gitgrip/griptree.json";
pub const LEGACY_POINTER_FILE: &str = ".griptree";

/// Registry key and default directory name for a branch: `feat/x` -> `feat-x`.
pub fn sanitize_branch(branch: &str) -> String {
    branch.trim().replace('/', "-")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Griptree {
    pub branch: String,
    pub path: PathBuf,
    #[serde(default)]
    pub locked: bool,
    pub created_at: DateTime<Utc>,
    /// Repository name -> worktree path, for worktrees that were created.
    #[serde(default)]
    pub worktrees: BTreeMap<String, PathBuf>,
    /// Repository name -> upstream (`origin/<branch>`) when tracking a remote.
    #[serde(default)]
    pub upstreams: BTreeMap<String, String>,
}

impl Griptree {
    pub fn new(branch: &str, path: &Path) -> Self {
        Self {
            branch: branch.to_string(),
            path: path.to_path_buf(),
            locked: false,
            created_at: Utc::now(),
            worktrees: BTreeMap::new(),
            upstreams: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        sanitize_branch(&self.branch)
    }

    /// Compare this entry with what is on disk. Nothing is repaired.
    pub fn health(&self) -> GriptreeHealth {
        if !self.path.exists() {
            return GriptreeHealth::MissingPath;
        }
        match GriptreePointer::read(&self.path) {
            Ok(Some(pointer)) if pointer.branch == self.branch => GriptreeHealth::Ok,
            Ok(Some(pointer)) => GriptreeHealth::MarkerMismatch {
                marker_branch: pointer.branch,
            },
            Ok(None) => GriptreeHealth::MissingMarker,
            Err(e) => GriptreeHealth::MarkerUnreadable { error: e.to_string() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum GriptreeHealth {
    Ok,
    /// The registered directory no longer exists.
    MissingPath,
    /// Registry and pointer disagree about the branch.
    MarkerMismatch { marker_branch: String },
    MissingMarker,
    MarkerUnreadable { error: String },
}

impl GriptreeHealth {
    pub fn is_valid(&self) -> bool {
        matches!(self, GriptreeHealth::Ok)
    }
}

/// Pointer written inside a griptree naming the workspace that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GriptreePointer {
    pub main_workspace: PathBuf,
    pub branch: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub locked: bool,
}

impl GriptreePointer {
    pub fn new(main_workspace: &Path, branch: &str) -> Self {
        Self {
            main_workspace: main_workspace.to_path_buf(),
            branch: branch.to_string(),
            created_at: Utc::now(),
            locked: false,
        }
    }

    pub fn write(&self, griptree_dir: &Path) -> Result<()> {
        let path = griptree_dir.join(POINTER_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read the current pointer, falling back to the legacy one.
    pub fn read(griptree_dir: &Path) -> Result<Option<Self>> {
        for name in [POINTER_FILE, LEGACY_POINTER_FILE] {
            let path = griptree_dir.join(name);
            if path.is_file() {
                let pointer = serde_json::from_str(&fs::read_to_string(&path)?)?;
                return Ok(Some(pointer));
            }
        }
        Ok(None)
    }

    pub fn is_legacy(griptree_dir: &Path) -> bool {
        !griptree_dir.join(POINTER_FILE).is_file() && griptree_dir.join(LEGACY_POINTER_FILE).is_file()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    griptrees: Vec<Griptree>,
}

/// Griptree entries keyed by sanitized branch name.
#[derive(Debug, Clone, Default)]
pub struct GriptreeRegistry {
    path: PathBuf,
    entries: BTreeMap<String, Griptree>,
}

impl GriptreeRegistry {
    pub fn path_for(grip_dir: &Path) -> PathBuf {
        grip_dir.join(REGISTRY_FILE)
    }

    /// Load the registry, or an empty one if the file does not exist yet.
    ///
    /// # Errors
    /// `RegistryCorrupt` when two entries claim the same branch key.
    pub fn load(path: &Path) -> Result<Self> {
        glog_debug!("GriptreeRegistry::load path={}", path.display());
        let mut registry = Self {
            path: path.to_path_buf(),
            entries: BTreeMap::new(),
        };
        if !path.exists() {
            return Ok(registry);
        }
        let file: RegistryFile = serde_json::from_str(&fs::read_to_string(path)?)?;
        for griptree in file.griptrees {
            let key = griptree.key();
            if let Some(existing) = registry.entries.get(&key) {
                return Err(Error::RegistryCorrupt(format!(
                    "branches '{}' and '{}' both claim griptree key '{}'",
                    existing.branch, griptree.branch, key
                )));
            }
            registry.entries.insert(key, griptree);
        }
        glog_debug!("Registry loaded: {} griptrees", registry.entries.len());
        Ok(registry)
    }

    /// Write through a temp file, keeping the previous file as `.bak`.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            griptrees: self.entries.values().cloned().collect(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        if self.path.exists() {
            fs::copy(&self.path, self.path.with_extension("json.bak"))?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, &self.path)?;
        glog_debug!("Registry saved: {} griptrees", self.entries.len());
        Ok(())
    }

    pub fn get(&self, branch: &str) -> Option<&Griptree> {
        self.entries.get(&sanitize_branch(branch))
    }

    pub fn get_mut(&mut self, branch: &str) -> Option<&mut Griptree> {
        self.entries.get_mut(&sanitize_branch(branch))
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.entries.contains_key(&sanitize_branch(branch))
    }

    pub fn insert(&mut self, griptree: Griptree) -> Result<()> {
        let key = griptree.key();
        if let Some(existing) = self.entries.get(&key) {
            return Err(Error::GriptreeExists(existing.branch.clone()));
        }
        self.entries.insert(key, griptree);
        Ok(())
    }

    pub fn remove(&mut self, branch: &str) -> Option<Griptree> {
        self.entries.remove(&sanitize_branch(branch))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Griptree> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
