//! Known-program registry
//!
//! Maps program addresses to the project that owns them. Built once at
//! startup and read-only afterwards.

use crate::error::{self, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramEntry {
    pub project_name: String,
    pub program_name: Option<String>,
}

/// Immutable program address -> project mapping
#[derive(Debug, Clone, Default)]
pub struct ProgramRegistry {
    programs: BTreeMap<String, ProgramEntry>,
}

impl ProgramRegistry {
    /// Load from a CSV with `program_address` and `project_name` columns and
    /// an optional `program_name` column.
    ///
    /// A missing file, a file without rows, or a file lacking either required
    /// column is rejected.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let file = std::fs::File::open(path)
            .map_err(|e| error::registry_invalid(&shown, format!("cannot open: {}", e)))?;
        let registry = Self::from_reader(file).map_err(|e| e.with_context("path", shown.clone()))?;
        info!(path = %shown, programs = registry.len(), "loaded known-program registry");
        Ok(registry)
    }

    /// Parse CSV content from any reader
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| error::registry_invalid("csv", format!("unreadable header: {}", e)))?
            .clone();

        let column = |name: &str| headers.iter().position(|h| h == name);
        let address_col = column("program_address")
            .ok_or_else(|| error::registry_invalid("csv", "missing column 'program_address'"))?;
        let project_col = column("project_name")
            .ok_or_else(|| error::registry_invalid("csv", "missing column 'project_name'"))?;
        let name_col = column("program_name");

        let mut programs = BTreeMap::new();
        for (line, row) in rdr.records().enumerate() {
            let row = row.map_err(|e| {
                error::registry_invalid("csv", format!("row {}: {}", line + 2, e))
            })?;
            let address = row.get(address_col).unwrap_or_default();
            let project = row.get(project_col).unwrap_or_default();
            if address.is_empty() || project.is_empty() {
                continue;
            }
            let program_name = name_col
                .and_then(|i| row.get(i))
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            programs.insert(
                address.to_string(),
                ProgramEntry {
                    project_name: project.to_string(),
                    program_name,
                },
            );
        }

        if programs.is_empty() {
            return Err(error::registry_invalid("csv", "no program rows"));
        }
        Ok(Self { programs })
    }

    /// Build from `(address, project)` pairs
    pub fn from_pairs<I, A, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, P)>,
        A: Into<String>,
        P: Into<String>,
    {
        let programs = pairs
            .into_iter()
            .map(|(address, project)| {
                (
                    address.into(),
                    ProgramEntry {
                        project_name: project.into(),
                        program_name: None,
                    },
                )
            })
            .collect();
        Self { programs }
    }

    /// Project name used for protocol discovery
    pub fn display_name(&self, program_id: &str) -> Option<&str> {
        self.programs.get(program_id).map(|e| e.project_name.as_str())
    }

    /// `"Project - Program"` when the program has its own name
    pub fn label(&self, program_id: &str) -> Option<String> {
        self.programs.get(program_id).map(|e| match &e.program_name {
            Some(name) => format!("{} - {}", e.project_name, name),
            None => e.project_name.clone(),
        })
    }

    pub fn contains(&self, program_id: &str) -> bool {
        self.programs.contains_key(program_id)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Entries sorted by address
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProgramEntry)> {
        self.programs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Distinct project names, sorted
    pub fn projects(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.programs.values().map(|e| e.project_name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Any address belonging to `project`
    pub fn address_of(&self, project: &str) -> Option<&str> {
        self.programs
            .iter()
            .find(|(_, e)| e.project_name == project)
            .map(|(k, _)| k.as_str())
    }
}
