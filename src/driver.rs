use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::audit::RunLog;
use crate::checkpoint::{CheckpointStore, Ledger};
use crate::config::PacingSettings;
use crate::error::FetchError;
use crate::extract::{Address, Extraction, Extractor};
use crate::fetcher::{Fetcher, QueryBuilder};

pub const DEFAULT_FLUSH_EVERY: usize = 10;

/// Randomized pause between lookups.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    min: Duration,
    max: Duration,
}

impl Pacer {
    pub fn new(settings: &PacingSettings) -> Self {
        let (lo, hi) = if settings.min_delay_ms <= settings.max_delay_ms {
            (settings.min_delay_ms, settings.max_delay_ms)
        } else {
            (settings.max_delay_ms, settings.min_delay_ms)
        };
        Pacer {
            min: Duration::from_millis(lo),
            max: Duration::from_millis(hi),
        }
    }

    pub fn none() -> Self {
        Pacer {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    fn next_delay(&self) -> Duration {
        if self.max.is_zero() {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(self.min.as_millis()..=self.max.as_millis());
        Duration::from_millis(ms as u64)
    }

    async fn pause(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            debug!("sleeping {:.1}s", delay.as_secs_f64());
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Entities that already had a result when the run started.
    pub skipped: usize,
    pub attempted: usize,
    pub found: usize,
    pub not_found: usize,
    pub errors: usize,
    /// True when a fetch failure stopped the run early.
    pub halted: bool,
}

/// Sequential fetch → extract → record loop over the unresolved entities.
pub struct BatchDriver<'a> {
    extractor: &'a Extractor,
    queries: QueryBuilder,
    store: CheckpointStore,
    pacer: Pacer,
    flush_every: usize,
    limit: Option<usize>,
    audit: Option<RunLog<'a>>,
}

impl<'a> BatchDriver<'a> {
    pub fn new(extractor: &'a Extractor, queries: QueryBuilder, store: CheckpointStore) -> Self {
        BatchDriver {
            extractor,
            queries,
            store,
            pacer: Pacer::none(),
            flush_every: DEFAULT_FLUSH_EVERY,
            limit: None,
            audit: None,
        }
    }

    pub fn pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn flush_every(mut self, n: usize) -> Self {
        self.flush_every = n;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn audit(mut self, log: RunLog<'a>) -> Self {
        self.audit = Some(log);
        self
    }

    /// Process the pending part of `entities`. The fetcher is shut down
    /// before returning, whatever the outcome.
    pub async fn run(
        &self,
        fetcher: &mut dyn Fetcher,
        entities: &[String],
    ) -> Result<BatchSummary> {
        let outcome = self.drive(fetcher, entities).await;
        if let Err(e) = fetcher.shutdown().await {
            warn!("Failed to release fetch session: {}", e);
        }
        if let (Ok(summary), Some(log)) = (&outcome, &self.audit) {
            if let Err(e) = log.finish(summary) {
                warn!("Failed to record run summary: {}", e);
            }
        }
        outcome
    }

    async fn drive(
        &self,
        fetcher: &mut dyn Fetcher,
        entities: &[String],
    ) -> Result<BatchSummary> {
        let mut ledger = self.store.load()?;
        let mut pending = ledger.pending(entities);
        if let Some(n) = self.limit {
            pending.truncate(n);
        }

        let mut summary = BatchSummary {
            skipped: ledger.len(),
            ..Default::default()
        };
        info!(
            "{} entities pending ({} already in {})",
            pending.len(),
            ledger.len(),
            self.store.path().display()
        );

        let pb = ProgressBar::new(pending.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );

        for (i, entity) in pending.iter().enumerate() {
            if i > 0 {
                self.pacer.pause().await;
            }
            pb.set_message(entity.to_string());
            summary.attempted += 1;

            let extraction = match self.lookup(fetcher, entity).await {
                Ok(e) => e,
                Err(e) => {
                    // Treat any failure as the engine starting to block us.
                    warn!("{} --> error: {}; halting batch", entity, e);
                    ledger.record(entity.to_string(), Address::Error);
                    self.log_lookup(entity, &Address::Error, &[]);
                    summary.errors += 1;
                    summary.halted = true;
                    break;
                }
            };

            let address = extraction.address();
            match &address {
                Address::Found(_) => summary.found += 1,
                _ => summary.not_found += 1,
            }
            info!("{} --> {}", entity, address);
            self.log_lookup(entity, &address, &extraction.candidates);
            ledger.record(entity.to_string(), address);

            if self.flush_every > 0 && ledger.len() % self.flush_every == 0 {
                self.flush(&ledger)?;
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.flush(&ledger).context("Final checkpoint write failed")?;
        info!(
            "Batch {}: {} found, {} not found, {} errors",
            if summary.halted { "halted" } else { "complete" },
            summary.found,
            summary.not_found,
            summary.errors
        );
        Ok(summary)
    }

    async fn lookup(
        &self,
        fetcher: &mut dyn Fetcher,
        entity: &str,
    ) -> Result<Extraction, FetchError> {
        let url = self.queries.url(entity)?;
        let html = fetcher.fetch(&url).await?;
        Ok(self.extractor.extract(&html))
    }

    fn flush(&self, ledger: &Ledger) -> Result<()> {
        self.store.save(ledger)?;
        debug!("checkpoint: {} rows", ledger.len());
        Ok(())
    }

    fn log_lookup(&self, entity: &str, address: &Address, candidates: &[crate::extract::Candidate]) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.record(entity, address, candidates) {
                warn!("Audit write failed for {}: {}", entity, e);
            }
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use reqwest::Url;

    use super::*;
    use crate::config::{Settings, StrategyKind};

    /// Serves canned pages keyed by entity; `None` simulates a blocked fetch.
    #[derive(Default)]
    struct FakeFetcher {
        pages: HashMap<String, Option<String>>,
        calls: Vec<String>,
        shutdowns: usize,
        watch: Option<PathBuf>,
        rows_seen: Vec<usize>,
    }

    impl FakeFetcher {
        fn new(pages: &[(&str, Option<&str>)]) -> Self {
            FakeFetcher {
                pages: pages
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                    .collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&mut self, url: &str) -> Result<String, FetchError> {
            let url = Url::parse(url).unwrap();
            let query = url
                .query_pairs()
                .find(|(k, _)| k == "wd")
                .map(|(_, v)| v.into_owned())
                .unwrap();
            let entity = query.split_whitespace().next().unwrap().to_string();

            if let Some(path) = &self.watch {
                let rows = std::fs::read_to_string(path)
                    .map(|t| t.lines().count().saturating_sub(1))
                    .unwrap_or(0);
                self.rows_seen.push(rows);
            }
            self.calls.push(entity.clone());

            match self.pages.get(&entity).cloned().flatten() {
                Some(page) => Ok(page),
                None => Err(FetchError::Transport("connection reset".into())),
            }
        }

        async fn shutdown(&mut self) -> Result<(), FetchError> {
            self.shutdowns += 1;
            Ok(())
        }
    }

    fn extractor() -> Extractor {
        Extractor::new(&Settings::defaults().extract, StrategyKind::Tiered).unwrap()
    }

    fn queries() -> QueryBuilder {
        let s = Settings::defaults();
        QueryBuilder::new(s.engine(Some("baidu")).unwrap().1)
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn rows(path: &Path) -> Vec<(String, String)> {
        CheckpointStore::new(path)
            .load()
            .unwrap()
            .records()
            .iter()
            .map(|r| (r.entity.clone(), r.address.to_string()))
            .collect()
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[tokio::test]
    async fn fetch_failure_halts_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.csv");
        let ex = extractor();
        let driver = BatchDriver::new(&ex, queries(), CheckpointStore::new(&path));
        let mut fetcher = FakeFetcher::new(&[
            ("A", Some("地址:X路1号")),
            ("B", None),
            ("C", Some("地址:Y路2号")),
        ]);

        let summary = driver.run(&mut fetcher, &names(&["A", "B", "C"])).await.unwrap();

        assert_eq!(rows(&path), vec![pair("A", "X路1号"), pair("B", "error")]);
        assert_eq!(fetcher.calls, vec!["A", "B"]);
        assert_eq!(fetcher.shutdowns, 1);
        assert!(summary.halted);
        assert_eq!(summary.found, 1);
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test]
    async fn resolved_entities_are_never_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.csv");
        let ex = extractor();
        let input = names(&["A", "B", "C", "D"]);

        let mut blocked = FakeFetcher::new(&[("A", Some("无")), ("B", None)]);
        BatchDriver::new(&ex, queries(), CheckpointStore::new(&path))
            .run(&mut blocked, &input)
            .await
            .unwrap();

        let mut healthy = FakeFetcher::new(&[
            ("A", Some("地址:A路1号")),
            ("B", Some("地址:B路2号")),
            ("C", Some("地址:C路3号")),
            ("D", Some("地址:D路4号")),
        ]);
        let summary = BatchDriver::new(&ex, queries(), CheckpointStore::new(&path))
            .run(&mut healthy, &input)
            .await
            .unwrap();

        assert_eq!(healthy.calls, vec!["C", "D"]);
        assert_eq!(summary.skipped, 2);
        assert_eq!(
            rows(&path),
            vec![
                pair("A", "address not found"),
                pair("B", "error"),
                pair("C", "C路3号"),
                pair("D", "D路4号"),
            ]
        );
    }

    #[tokio::test]
    async fn resumed_run_matches_uninterrupted_run() {
        let pages = [
            ("A", Some("地址:A路1号")),
            ("B", Some("<p>nothing here</p>")),
            ("C", Some("地址:C路3号")),
            ("D", Some("地址:D路4号")),
        ];
        let input = names(&["A", "B", "C", "D"]);
        let ex = extractor();

        let split = tempfile::tempdir().unwrap();
        let split_path = split.path().join("addresses.csv");
        for upto in [2, 4] {
            let mut f = FakeFetcher::new(&pages);
            BatchDriver::new(&ex, queries(), CheckpointStore::new(&split_path))
                .run(&mut f, &input[..upto])
                .await
                .unwrap();
        }

        let whole = tempfile::tempdir().unwrap();
        let whole_path = whole.path().join("addresses.csv");
        let mut f = FakeFetcher::new(&pages);
        BatchDriver::new(&ex, queries(), CheckpointStore::new(&whole_path))
            .run(&mut f, &input)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(&split_path).unwrap(),
            std::fs::read(&whole_path).unwrap()
        );

        // A second complete run changes nothing.
        let mut again = FakeFetcher::new(&pages);
        let summary = BatchDriver::new(&ex, queries(), CheckpointStore::new(&whole_path))
            .run(&mut again, &input)
            .await
            .unwrap();
        assert!(again.calls.is_empty());
        assert_eq!(summary.attempted, 0);
        assert_eq!(
            std::fs::read(&split_path).unwrap(),
            std::fs::read(&whole_path).unwrap()
        );
    }

    #[tokio::test]
    async fn checkpoint_flushed_every_ten_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.csv");
        let entities: Vec<String> = (0..12).map(|i| format!("E{:02}", i)).collect();
        let pages: Vec<(String, Option<String>)> = entities
            .iter()
            .map(|e| (e.clone(), Some(format!("地址:{}路1号", e))))
            .collect();

        let mut fetcher = FakeFetcher {
            pages: pages.into_iter().collect(),
            watch: Some(path.clone()),
            ..Default::default()
        };
        let ex = extractor();
        BatchDriver::new(&ex, queries(), CheckpointStore::new(&path))
            .run(&mut fetcher, &entities)
            .await
            .unwrap();

        // Nothing on disk until the tenth row, then all ten before the 11th fetch.
        assert_eq!(&fetcher.rows_seen[..10], &[0; 10]);
        assert_eq!(fetcher.rows_seen[10], 10);
        assert_eq!(fetcher.rows_seen[11], 10);
        assert_eq!(rows(&path).len(), 12);
    }

    #[tokio::test]
    async fn cadence_counts_preloaded_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.csv");
        let store = CheckpointStore::new(&path);
        let preloaded = Ledger::from_records((0..8).map(|i| crate::checkpoint::ResultRecord {
            entity: format!("P{}", i),
            address: Address::NotFound,
        }));
        store.save(&preloaded).unwrap();

        let mut fetcher = FakeFetcher {
            pages: [("X", "地址:X路1号"), ("Y", "地址:Y路2号"), ("Z", "地址:Z路3号")]
                .iter()
                .map(|(k, v)| (k.to_string(), Some(v.to_string())))
                .collect(),
            watch: Some(path.clone()),
            ..Default::default()
        };
        let ex = extractor();
        BatchDriver::new(&ex, queries(), store)
            .run(&mut fetcher, &names(&["X", "Y", "Z"]))
            .await
            .unwrap();

        // Ledger reaches 10 after Y, so Z's fetch sees the flushed file.
        assert_eq!(fetcher.rows_seen, vec![8, 8, 10]);
    }

    #[tokio::test]
    async fn limit_and_audit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.csv");
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::audit::init_schema(&conn).unwrap();
        let run_id = crate::audit::start_run(&conn, "baidu", "tiered").unwrap();

        let ex = extractor();
        let mut fetcher = FakeFetcher::new(&[("A", Some("地址:A路1号")), ("B", Some("x"))]);
        let summary = BatchDriver::new(&ex, queries(), CheckpointStore::new(&path))
            .limit(Some(1))
            .audit(RunLog::new(&conn, run_id))
            .run(&mut fetcher, &names(&["A", "B"]))
            .await
            .unwrap();

        assert_eq!(summary.attempted, 1);
        assert_eq!(fetcher.calls, vec!["A"]);
        let entries = crate::audit::latest_entries(&conn).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].candidates[0].source, "map_snippet");
    }

    #[test]
    fn pacer_stays_in_range() {
        let pacer = Pacer::new(&PacingSettings {
            min_delay_ms: 30,
            max_delay_ms: 10,
        });
        for _ in 0..50 {
            let d = pacer.next_delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(30));
        }
        assert!(Pacer::none().next_delay().is_zero());
    }
}
