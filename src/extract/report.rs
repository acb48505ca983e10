//! Flat-text review report: rendering from audited candidates, and the
//! post-hoc structural pass over a (possibly hand-edited) report.
//!
//! Search order per section: `Primary Address:` field, then the enumerated
//! `All potential address matches:` list, then the whole section, then the
//! whole report. The first structural hit at any level ends the search.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use super::rules::{first_match, TextRule, Vars};
use super::{Address, Candidate, Extraction};
use crate::config::{ExtractSettings, ReportSettings, RuleSpec, ScopeKind};

static SECTION_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n-{10,}\n").unwrap());
static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^\n]*\n=+\n").unwrap());
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([^:\n]+):").unwrap());
static PRIMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)Primary Address:\s*(.*?)(?:\n\s*Source:|\z)").unwrap());
static MATCHES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)All potential address matches:(.*?)(?:\n-{10}|\z)").unwrap());
static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\d+\.\s*(.*?)(?:\n\s*Source:|\z)").unwrap());

const DIVIDER_WIDTH: usize = 50;

/// One company block of a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub entity: String,
    pub body: String,
}

impl Section {
    fn primary(&self) -> Option<&str> {
        PRIMARY_RE
            .captures(&self.body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim())
    }

    fn listed_matches(&self) -> Vec<&str> {
        let Some(list) = MATCHES_RE.captures(&self.body).and_then(|c| c.get(1)) else {
            return Vec::new();
        };
        ITEM_RE
            .captures_iter(list.as_str().trim())
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim())
            .collect()
    }
}

/// Split a report into company sections, dropping the title block.
pub fn split_sections(report: &str) -> Vec<Section> {
    let report = report.replace("\r\n", "\n");
    SECTION_SPLIT_RE
        .split(&report)
        .enumerate()
        .filter_map(|(i, chunk)| {
            let chunk = if i == 0 {
                TITLE_RE.replace(chunk.trim_start(), "").into_owned()
            } else {
                chunk.to_string()
            };
            let body = chunk.trim();
            let entity = NAME_RE.captures(body)?.get(1)?.as_str().trim().to_string();
            Some(Section {
                entity,
                body: body.to_string(),
            })
        })
        .collect()
}

pub struct ReportExtractor {
    primary: Vec<TextRule>,
    fallback: Vec<TextRule>,
    loose: Vec<TextRule>,
    region: String,
    markers: Vec<String>,
    head_chars: usize,
    head_tier: u8,
}

impl ReportExtractor {
    pub fn new(report: &ReportSettings, extract: &ExtractSettings) -> Result<Self> {
        let vars = Vars::from_settings(extract);
        let loose = compile_text_rules(&report.loose, &vars).context("report.loose")?;
        let head_tier = loose.iter().map(|r| r.tier).max().unwrap_or(0).saturating_add(1);
        Ok(ReportExtractor {
            primary: compile_text_rules(&report.primary, &vars).context("report.primary")?,
            fallback: compile_text_rules(&report.fallback, &vars).context("report.fallback")?,
            loose,
            region: extract.region.clone(),
            markers: extract.markers.clone(),
            head_chars: report.head_chars,
            head_tier,
        })
    }

    /// Best structural address for one section. `corpus` is the full report,
    /// scanned only when the section itself yields nothing.
    pub fn extract(&self, section: &Section, corpus: &str) -> Extraction {
        let found = self
            .from_primary(section)
            .or_else(|| self.from_listed(section))
            .or_else(|| level("section", first_match(&self.fallback, &section.body)))
            .or_else(|| level("corpus", first_match(&self.fallback, corpus)));
        Extraction {
            candidates: found.into_iter().collect(),
        }
    }

    fn from_primary(&self, section: &Section) -> Option<Candidate> {
        let raw = section.primary()?;
        if let Some(c) = first_match(&self.primary, raw).or_else(|| first_match(&self.loose, raw)) {
            return level("primary", Some(c));
        }
        let head: String = raw.chars().take(self.head_chars).collect();
        let head = head.trim();
        let structural = head.contains(self.region.as_str())
            && self.markers.iter().any(|m| head.contains(m.as_str()));
        structural.then(|| Candidate {
            text: head.to_string(),
            tier: self.head_tier,
            source: "primary/head".to_string(),
        })
    }

    fn from_listed(&self, section: &Section) -> Option<Candidate> {
        let items = section.listed_matches();
        let structured = items.iter().find_map(|item| first_match(&self.fallback, item));
        let found = structured.or_else(|| items.iter().find_map(|item| first_match(&self.loose, item)));
        level("listed", found)
    }
}

fn level(name: &str, candidate: Option<Candidate>) -> Option<Candidate> {
    candidate.map(|c| Candidate {
        source: format!("{}/{}", name, c.source),
        ..c
    })
}

fn compile_text_rules(specs: &[RuleSpec], vars: &Vars) -> Result<Vec<TextRule>> {
    specs
        .iter()
        .map(|s| {
            anyhow::ensure!(
                s.scope == ScopeKind::Page,
                "report rule '{}' must use page scope",
                s.tag
            );
            TextRule::compile(s, vars)
        })
        .collect()
}

/// What the review report shows for one entity.
#[derive(Debug, Clone)]
pub struct ReviewEntry {
    pub entity: String,
    pub address: Address,
    pub candidates: Vec<Candidate>,
}

pub fn render(title: &str, entries: &[ReviewEntry]) -> String {
    let mut out = format!("{}\n{}\n\n", title, "=".repeat(title.chars().count().max(1)));

    for e in entries {
        out.push_str(&format!("{}:\n", e.entity));
        match &e.address {
            Address::Found(addr) => {
                let source = e.candidates.first().map(|c| c.source.as_str()).unwrap_or("-");
                out.push_str(&format!("  Primary Address: {}\n  Source: {}\n\n", addr, source));
                out.push_str("  All potential address matches:\n");
                for (i, c) in e.candidates.iter().enumerate() {
                    out.push_str(&format!("    {}. {}\n       Source: {}\n", i + 1, c.text, c.source));
                }
            }
            Address::NotFound => out.push_str("  No address found.\n"),
            Address::Error => out.push_str("  Lookup failed.\n"),
        }
        out.push_str(&format!("\n{}\n\n", "-".repeat(DIVIDER_WIDTH)));
    }
    out
}

// ── Tests ──
