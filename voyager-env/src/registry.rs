//! # Skill Registry
//!
//! Accepted skills persisted under stable, id-derived names. Registration
//! never overwrites: ids are never reused and named saves pick a fresh
//! `V2`, `V3`, ... suffix instead of clobbering an existing file.

use crate::error::{self, Result};
use crate::planner::SkillPlanner;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

pub type SkillId = u64;

const SKILL_PREFIX: &str = "skill_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillMeta {
    pub id: SkillId,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Unix millis
    pub created_at: u64,
}

/// A registered skill; the source is immutable once registered
#[derive(Debug, Clone, PartialEq)]
pub struct Skill {
    pub meta: SkillMeta,
    pub source: String,
}

impl Skill {
    pub fn id(&self) -> SkillId {
        self.meta.id
    }

    /// Name for display: the given name or `skill_<id>`
    pub fn display_name(&self) -> String {
        self.meta
            .name
            .clone()
            .unwrap_or_else(|| format!("{}{}", SKILL_PREFIX, self.meta.id))
    }
}

/// First of `<stem>.<ext>`, `<stem>V2.<ext>`, `<stem>V3.<ext>`, ... not present in `dir`
pub fn free_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let mut path = dir.join(format!("{}.{}", stem, ext));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{}V{}.{}", stem, n, ext));
        n += 1;
    }
    path
}

pub(crate) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Storage backends
// =============================================================================

/// Where skills live
pub trait SkillStore: Send + Sync {
    /// Every stored skill, sorted by id
    fn load_all(&self) -> Result<Vec<Skill>>;

    /// Persist a new skill; fails if its id is already taken
    fn insert(&self, skill: &Skill) -> Result<()>;

    /// On-disk location of a skill's source, if any
    fn location(&self, id: SkillId) -> Option<PathBuf>;

    /// Save under `name`, suffixing on collision. Returns the name used.
    fn save_named(&self, name: &str, source: &str) -> Result<String>;

    fn load_named(&self, name: &str) -> Result<String>;
}

/// One source file plus one metadata file per skill
pub struct FileSkillStore {
    root: PathBuf,
    extension: String,
}

impl FileSkillStore {
    pub fn new(root: impl AsRef<Path>, extension: impl Into<String>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| error::io_error(format!("Failed to create skill dir: {}", e)))?;
        Ok(Self {
            root,
            extension: extension.into(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source_path(&self, id: SkillId) -> PathBuf {
        self.root.join(format!("{}{:06}.{}", SKILL_PREFIX, id, self.extension))
    }

    fn meta_path(&self, id: SkillId) -> PathBuf {
        self.root.join(format!("{}{:06}.json", SKILL_PREFIX, id))
    }

    /// Id encoded in a `skill_NNNNNN.<ext>` file name
    fn parse_id(&self, file_name: &str) -> Option<SkillId> {
        file_name
            .strip_prefix(SKILL_PREFIX)?
            .strip_suffix(&format!(".{}", self.extension))?
            .parse()
            .ok()
    }

    fn write_new(path: &Path, content: &[u8]) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                error::storage_failed(format!("Failed to create {}: {}", path.display(), e))
            })?;
        file.write_all(content)
            .map_err(|e| error::io_error(format!("Failed to write {}: {}", path.display(), e)))
    }
}

impl SkillStore for FileSkillStore {
    fn load_all(&self) -> Result<Vec<Skill>> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| error::io_error(format!("Failed to read skill dir: {}", e)))?;

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| self.parse_id(name).is_some())
            .collect();
        names.sort();

        let mut skills = Vec::with_capacity(names.len());
        for name in names {
            let Some(id) = self.parse_id(&name) else {
                continue;
            };
            let path = self.root.join(&name);
            let source = std::fs::read_to_string(&path)
                .map_err(|e| error::io_error(format!("Failed to read {}: {}", path.display(), e)))?;
            let meta = std::fs::read_to_string(self.meta_path(id))
                .ok()
                .and_then(|s| serde_json::from_str::<SkillMeta>(&s).ok())
                .filter(|m| m.id == id)
                .unwrap_or(SkillMeta {
                    id,
                    name: None,
                    description: None,
                    created_at: 0,
                });
            skills.push(Skill { meta, source });
        }
        skills.sort_by_key(|s| s.meta.id);
        Ok(skills)
    }

    fn insert(&self, skill: &Skill) -> Result<()> {
        let id = skill.meta.id;
        Self::write_new(&self.source_path(id), skill.source.as_bytes())?;
        let meta = serde_json::to_string_pretty(&skill.meta)
            .map_err(|e| error::serialization_error(e.to_string()))?;
        Self::write_new(&self.meta_path(id), meta.as_bytes())
    }

    fn location(&self, id: SkillId) -> Option<PathBuf> {
        let path = self.source_path(id);
        path.exists().then_some(path)
    }

    fn save_named(&self, name: &str, source: &str) -> Result<String> {
        loop {
            let path = free_path(&self.root, name, &self.extension);
            match Self::write_new(&path, source.as_bytes()) {
                Ok(()) => {
                    let used = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or(name)
                        .to_string();
                    return Ok(used);
                }
                // taken between the check and the create
                Err(_) if path.exists() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn load_named(&self, name: &str) -> Result<String> {
        let path = self.root.join(format!("{}.{}", name, self.extension));
        std::fs::read_to_string(&path).map_err(|_| error::skill_not_found(name))
    }
}

/// Volatile store for tests
#[derive(Default)]
pub struct MemorySkillStore {
    skills: RwLock<BTreeMap<SkillId, Skill>>,
    named: RwLock<BTreeMap<String, String>>,
}

impl MemorySkillStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SkillStore for MemorySkillStore {
    fn load_all(&self) -> Result<Vec<Skill>> {
        let skills = self
            .skills
            .read()
            .map_err(|e| error::storage_failed(format!("Lock poisoned: {}", e)))?;
        Ok(skills.values().cloned().collect())
    }

    fn insert(&self, skill: &Skill) -> Result<()> {
        let mut skills = self
            .skills
            .write()
            .map_err(|e| error::storage_failed(format!("Lock poisoned: {}", e)))?;
        if skills.contains_key(&skill.meta.id) {
            return Err(error::storage_failed(format!("skill {} already exists", skill.meta.id)));
        }
        skills.insert(skill.meta.id, skill.clone());
        Ok(())
    }

    fn location(&self, _id: SkillId) -> Option<PathBuf> {
        None
    }

    fn save_named(&self, name: &str, source: &str) -> Result<String> {
        let mut named = self
            .named
            .write()
            .map_err(|e| error::storage_failed(format!("Lock poisoned: {}", e)))?;
        let mut used = name.to_string();
        let mut n = 2;
        while named.contains_key(&used) {
            used = format!("{}V{}", name, n);
            n += 1;
        }
        named.insert(used.clone(), source.to_string());
        Ok(used)
    }

    fn load_named(&self, name: &str) -> Result<String> {
        let named = self
            .named
            .read()
            .map_err(|e| error::storage_failed(format!("Lock poisoned: {}", e)))?;
        named.get(name).cloned().ok_or_else(|| error::skill_not_found(name))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Id-addressed skill library backed by a [`SkillStore`]
pub struct SkillRegistry {
    store: Box<dyn SkillStore>,
    skills: BTreeMap<SkillId, Skill>,
    next_id: SkillId,
}

impl SkillRegistry {
    /// Open over a store, reloading everything it holds
    pub fn open(store: impl SkillStore + 'static) -> Result<Self> {
        let mut registry = Self {
            store: Box::new(store),
            skills: BTreeMap::new(),
            next_id: 0,
        };
        registry.reload()?;
        Ok(registry)
    }

    /// File-backed registry rooted at `root`
    pub fn file(root: impl AsRef<Path>, extension: impl Into<String>) -> Result<Self> {
        Self::open(FileSkillStore::new(root, extension)?)
    }

    pub fn memory() -> Self {
        Self {
            store: Box::new(MemorySkillStore::new()),
            skills: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Re-read the store. Ids come back exactly as they were written.
    pub fn reload(&mut self) -> Result<()> {
        let skills = self.store.load_all()?;
        self.next_id = skills.iter().map(|s| s.meta.id + 1).max().unwrap_or(0);
        self.skills = skills.into_iter().map(|s| (s.meta.id, s)).collect();
        debug!(skills = self.skills.len(), next_id = self.next_id, "skill registry loaded");
        Ok(())
    }

    /// Persist `source` under the next id
    pub fn register(
        &mut self,
        source: impl Into<String>,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<SkillId> {
        let id = self.next_id;
        let skill = Skill {
            meta: SkillMeta {
                id,
                name: name.map(str::to_string),
                description: description.map(str::to_string),
                created_at: current_timestamp(),
            },
            source: source.into(),
        };
        self.store.insert(&skill)?;
        self.next_id += 1;
        info!(skill_id = id, name = ?skill.meta.name, "skill registered");
        self.skills.insert(id, skill);
        Ok(id)
    }

    pub fn get(&self, id: SkillId) -> Result<&Skill> {
        self.skills
            .get(&id)
            .ok_or_else(|| error::skill_not_found(id.to_string()))
    }

    /// All skills, sorted by id
    pub fn list(&self) -> Vec<&Skill> {
        self.skills.values().collect()
    }

    pub fn ids(&self) -> Vec<SkillId> {
        self.skills.keys().copied().collect()
    }

    pub fn path(&self, id: SkillId) -> Option<PathBuf> {
        self.store.location(id)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn save_named(&self, name: &str, source: &str) -> Result<String> {
        let used = self.store.save_named(name, source)?;
        if used != name {
            info!(requested = name, saved_as = %used, "name taken, archived under suffix");
        }
        Ok(used)
    }

    pub fn load_named(&self, name: &str) -> Result<String> {
        self.store.load_named(name)
    }

    /// Ask the planner for a new skill. No retries here.
    pub async fn propose<P: SkillPlanner>(
        &self,
        planner: &P,
        observation: &Value,
        objective: &str,
        error: Option<&str>,
    ) -> Result<String> {
        planner.propose(observation, objective, error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_get() {
        let mut registry = SkillRegistry::memory();
        let a = registry.register("export async function executeSkill() {}", None, None).unwrap();
        let b = registry.register("// swap", Some("jupiter_swap"), Some("swap on jupiter")).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(registry.get(b).unwrap().display_name(), "jupiter_swap");
        assert_eq!(registry.get(a).unwrap().display_name(), "skill_0");
        assert_eq!(registry.get(9).unwrap_err().kind(), ErrorKind::SkillNotFound);
    }

    #[test]
    fn test_file_registry_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mut registry = SkillRegistry::file(dir.path(), "ts").unwrap();
            for i in 0..12 {
                registry.register(format!("// skill {}", i), None, None).unwrap();
            }
            assert!(registry.path(11).unwrap().ends_with("skill_000011.ts"));
        }

        let mut registry = SkillRegistry::file(dir.path(), "ts").unwrap();
        assert_eq!(registry.len(), 12);
        assert_eq!(registry.ids(), (0..12).collect::<Vec<_>>());
        assert_eq!(registry.get(10).unwrap().source, "// skill 10");

        let next = registry.register("// next", None, None).unwrap();
        assert_eq!(next, 12);
    }

    #[test]
    fn test_ids_never_reused() {
        let dir = TempDir::new().unwrap();
        let mut registry = SkillRegistry::file(dir.path(), "ts").unwrap();
        registry.register("// a", None, None).unwrap();
        registry.register("// b", None, None).unwrap();
        // a stray file with a higher id pushes the counter past it
        std::fs::write(dir.path().join("skill_000007.ts"), "// stray").unwrap();
        registry.reload().unwrap();
        assert_eq!(registry.register("// c", None, None).unwrap(), 8);
        assert_eq!(registry.get(0).unwrap().source, "// a");
    }

    #[test]
    fn test_register_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = FileSkillStore::new(dir.path(), "ts").unwrap();
        let skill = Skill {
            meta: SkillMeta { id: 0, name: None, description: None, created_at: 0 },
            source: "// original".into(),
        };
        store.insert(&skill).unwrap();
        let clash = Skill { source: "// replacement".into(), ..skill };
        assert!(store.insert(&clash).is_err());
        assert_eq!(std::fs::read_to_string(dir.path().join("skill_000000.ts")).unwrap(), "// original");
    }

    #[test]
    fn test_save_named_suffixes() {
        let dir = TempDir::new().unwrap();
        let registry = SkillRegistry::file(dir.path(), "ts").unwrap();
        assert_eq!(registry.save_named("swapSol", "// v1").unwrap(), "swapSol");
        assert_eq!(registry.save_named("swapSol", "// v2").unwrap(), "swapSolV2");
        assert_eq!(registry.save_named("swapSol", "// v3").unwrap(), "swapSolV3");
        assert_eq!(registry.load_named("swapSol").unwrap(), "// v1");
        assert_eq!(registry.load_named("swapSolV2").unwrap(), "// v2");
        // named saves are not numbered skills
        assert!(registry.is_empty());

        let memory = SkillRegistry::memory();
        memory.save_named("x", "1").unwrap();
        assert_eq!(memory.save_named("x", "2").unwrap(), "xV2");
        assert_eq!(memory.load_named("x").unwrap(), "1");
    }

    #[test]
    fn test_free_path() {
        let dir = TempDir::new().unwrap();
        assert_eq!(free_path(dir.path(), "candidate", "ts"), dir.path().join("candidate.ts"));
        std::fs::write(dir.path().join("candidate.ts"), "").unwrap();
        assert_eq!(free_path(dir.path(), "candidate", "ts"), dir.path().join("candidateV2.ts"));
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut registry = SkillRegistry::file(dir.path(), "ts").unwrap();
        let id = registry.register("// src", Some("orca_swap"), Some("swaps on orca")).unwrap();
        let reopened = SkillRegistry::file(dir.path(), "ts").unwrap();
        let skill = reopened.get(id).unwrap();
        assert_eq!(skill.meta.description.as_deref(), Some("swaps on orca"));
        assert!(skill.meta.created_at > 0);
    }
}
