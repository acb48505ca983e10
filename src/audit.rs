use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::driver::BatchSummary;
use crate::extract::report::ReviewEntry;
use crate::extract::{Address, Candidate};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open audit log {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            engine      TEXT NOT NULL,
            strategy    TEXT NOT NULL,
            started_at  TEXT NOT NULL,
            finished_at TEXT,
            attempted   INTEGER,
            found       INTEGER,
            not_found   INTEGER,
            errors      INTEGER,
            halted      BOOLEAN
        );

        CREATE TABLE IF NOT EXISTS lookups (
            id           INTEGER PRIMARY KEY,
            run_id       INTEGER NOT NULL REFERENCES runs(id),
            entity       TEXT NOT NULL,
            address      TEXT NOT NULL,
            looked_up_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_lookups_entity ON lookups(entity);

        CREATE TABLE IF NOT EXISTS candidates (
            id        INTEGER PRIMARY KEY,
            lookup_id INTEGER NOT NULL REFERENCES lookups(id),
            rank      INTEGER NOT NULL,
            tier      INTEGER NOT NULL,
            source    TEXT NOT NULL,
            text      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_candidates_lookup ON candidates(lookup_id);
        ",
    )?;
    Ok(())
}

pub fn start_run(conn: &Connection, engine: &str, strategy: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO runs (engine, strategy, started_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![engine, strategy, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Audit handle for one batch run.
pub struct RunLog<'c> {
    conn: &'c Connection,
    run_id: i64,
}

impl<'c> RunLog<'c> {
    pub fn new(conn: &'c Connection, run_id: i64) -> Self {
        RunLog { conn, run_id }
    }

    pub fn record(&self, entity: &str, address: &Address, candidates: &[Candidate]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO lookups (run_id, entity, address) VALUES (?1, ?2, ?3)",
            rusqlite::params![self.run_id, entity, address.as_str()],
        )?;
        let lookup_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO candidates (lookup_id, rank, tier, source, text)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (rank, c) in candidates.iter().enumerate() {
                stmt.execute(rusqlite::params![lookup_id, rank as i64, c.tier, c.source, c.text])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn finish(&self, summary: &BatchSummary) -> Result<()> {
        self.conn.execute(
            "UPDATE runs SET finished_at = ?2, attempted = ?3, found = ?4, not_found = ?5,
                             errors = ?6, halted = ?7
             WHERE id = ?1",
            rusqlite::params![
                self.run_id,
                chrono::Utc::now().to_rfc3339(),
                summary.attempted as i64,
                summary.found as i64,
                summary.not_found as i64,
                summary.errors as i64,
                summary.halted,
            ],
        )?;
        Ok(())
    }
}

/// Most recent lookup per entity, in the order entities were first seen.
pub fn latest_entries(conn: &Connection) -> Result<Vec<ReviewEntry>> {
    let mut stmt = conn.prepare(
        "SELECT l.id, l.entity, l.address
         FROM lookups l
         JOIN (SELECT entity, MIN(id) AS first_id, MAX(id) AS last_id
               FROM lookups GROUP BY entity) g ON g.last_id = l.id
         ORDER BY g.first_id",
    )?;
    let lookups = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut cand_stmt = conn.prepare(
        "SELECT text, tier, source FROM candidates WHERE lookup_id = ?1 ORDER BY rank",
    )?;
    let mut entries = Vec::with_capacity(lookups.len());
    for (id, entity, address) in lookups {
        let candidates = cand_stmt
            .query_map([id], |row| {
                Ok(Candidate {
                    text: row.get(0)?,
                    tier: row.get(1)?,
                    source: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        entries.push(ReviewEntry {
            entity,
            address: Address::from_cell(&address),
            candidates,
        });
    }
    Ok(entries)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn cand(text: &str, tier: u8) -> Candidate {
        Candidate {
            text: text.into(),
            tier,
            source: "map_snippet".into(),
        }
    }

    #[test]
    fn latest_lookup_wins_first_seen_order_kept() {
        let conn = memory();
        let first = RunLog::new(&conn, start_run(&conn, "baidu", "tiered").unwrap());
        first.record("A", &Address::NotFound, &[]).unwrap();
        first.record("B", &Address::Error, &[]).unwrap();

        let second = RunLog::new(&conn, start_run(&conn, "bing", "structural").unwrap());
        let found = Address::Found("山东省幸福路1号".into());
        second
            .record("A", &found, &[cand("山东省幸福路1号", 2), cand("山东省幸福路", 2)])
            .unwrap();

        let entries = latest_entries(&conn).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.entity.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(entries[0].address, found);
        assert_eq!(entries[0].candidates.len(), 2);
        assert_eq!(entries[0].candidates[1].text, "山东省幸福路");
        assert_eq!(entries[1].address, Address::Error);
    }

    #[test]
    fn finish_updates_run_totals() {
        let conn = memory();
        let log = RunLog::new(&conn, start_run(&conn, "baidu", "tiered").unwrap());
        let summary = BatchSummary {
            attempted: 3,
            found: 1,
            not_found: 1,
            errors: 1,
            halted: true,
            ..Default::default()
        };
        log.finish(&summary).unwrap();
        let (attempted, halted): (i64, bool) = conn
            .query_row("SELECT attempted, halted FROM runs", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(attempted, 3);
        assert!(halted);
    }
}
