use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::extract::Address;

pub const HEADER: [&str; 2] = ["EntityName", "ResolvedAddress"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub entity: String,
    pub address: Address,
}

/// Ordered entity → result mapping. Records are never replaced.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    records: Vec<ResultRecord>,
    seen: HashSet<String>,
}

impl Ledger {
    pub fn from_records(records: impl IntoIterator<Item = ResultRecord>) -> Self {
        let mut ledger = Ledger::default();
        for r in records {
            ledger.record(r.entity, r.address);
        }
        ledger
    }

    /// Append a result. Returns false (and changes nothing) if the entity
    /// already has one.
    pub fn record(&mut self, entity: String, address: Address) -> bool {
        if !self.seen.insert(entity.clone()) {
            return false;
        }
        self.records.push(ResultRecord { entity, address });
        true
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.seen.contains(entity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    /// Input entities without a result yet, in input order, each once.
    pub fn pending<'a>(&self, input: &'a [String]) -> Vec<&'a str> {
        let mut queued = HashSet::new();
        input
            .iter()
            .map(String::as_str)
            .filter(|e| !self.contains(e) && queued.insert(*e))
            .collect()
    }
}

/// Two-column CSV snapshot of a ledger, always rewritten in full.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Ledger> {
        if !self.path.exists() {
            return Ok(Ledger::default());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("Failed to open checkpoint {}", self.path.display()))?;

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row.with_context(|| format!("Corrupt checkpoint {}", self.path.display()))?;
            if row.len() != 2 {
                continue;
            }
            records.push(ResultRecord {
                entity: row[0].to_string(),
                address: Address::from_cell(&row[1]),
            });
        }
        Ok(Ledger::from_records(records))
    }

    /// Write to a sibling temp file and rename it over the checkpoint, so a
    /// reader never sees a half-written row.
    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            writer.write_record(HEADER)?;
            for r in ledger.records() {
                writer.write_record([r.entity.as_str(), r.address.as_str()])?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace checkpoint {}", self.path.display()))?;
        Ok(())
    }
}

// ── Tests ──
