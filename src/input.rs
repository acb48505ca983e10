use std::path::Path;

use anyhow::{bail, Context, Result};

/// Entity names from one column of a headed CSV file, exactly as written.
/// Blank cells are skipped. Duplicates are kept; the ledger deduplicates
/// when queuing.
pub fn load_entities(path: &Path, column: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open input {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let Some(idx) = headers.iter().position(|h| h.trim() == column) else {
        bail!(
            "Column '{}' not found in {} (have: {})",
            column,
            path.display(),
            headers.iter().collect::<Vec<_>>().join(", ")
        );
    };

    let mut entities = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("Bad row in {}", path.display()))?;
        match row.get(idx) {
            Some(name) if !name.trim().is_empty() => entities.push(name.to_string()),
            _ => {}
        }
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::checkpoint::CheckpointStore;

    fn csv_file(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn reads_named_column() {
        let f = csv_file("Id,Company\n1, 万华化学 \n2,\n3,利华益集团\n4,  \n5,万华化学\n");
        let names = load_entities(f.path(), "Company").unwrap();
        assert_eq!(names, vec![" 万华化学 ", "利华益集团", "万华化学"]);
    }

    #[test]
    fn padded_names_match_checkpoint_rows() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.csv");
        std::fs::write(&input, "Company\n A \nB\n").unwrap();
        let checkpoint = dir.path().join("addresses.csv");
        std::fs::write(&checkpoint, "EntityName,ResolvedAddress\n A ,X1\n").unwrap();

        let names = load_entities(&input, "Company").unwrap();
        let ledger = CheckpointStore::new(&checkpoint).load().unwrap();
        assert_eq!(ledger.pending(&names), vec!["B"]);
    }

    #[test]
    fn missing_column_is_an_error() {
        let f = csv_file("Name\nfoo\n");
        let err = load_entities(f.path(), "Company").unwrap_err();
        assert!(err.to_string().contains("Company"));
    }
}
