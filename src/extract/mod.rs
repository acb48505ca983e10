pub mod page;
pub mod report;
pub mod rules;

use std::fmt;

use anyhow::{Context, Result};

use crate::config::{ExtractSettings, StrategyKind};
use page::Page;
use rules::{RuleSet, Vars};

pub const NOT_FOUND: &str = "address not found";
pub const ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub text: String,
    pub tier: u8,
    pub source: String,
}

/// Matches of every rule that fired, in rule order then document order.
/// The first is the address; empty when nothing matched.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub candidates: Vec<Candidate>,
}

impl Extraction {
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn address(&self) -> Address {
        match self.best() {
            Some(c) => Address::Found(c.text.clone()),
            None => Address::NotFound,
        }
    }
}

/// The value stored for an entity: a match or one of the two sentinels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Found(String),
    NotFound,
    Error,
}

impl Address {
    pub fn as_str(&self) -> &str {
        match self {
            Address::Found(s) => s,
            Address::NotFound => NOT_FOUND,
            Address::Error => ERROR,
        }
    }

    pub fn from_cell(cell: &str) -> Self {
        match cell {
            NOT_FOUND => Address::NotFound,
            ERROR => Address::Error,
            s => Address::Found(s.to_string()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live-page extractor. The strategy picks which configured cascade runs.
#[derive(Debug, Clone)]
pub struct Extractor {
    strategy: StrategyKind,
    rules: RuleSet,
}

impl Extractor {
    pub fn new(settings: &ExtractSettings, strategy: StrategyKind) -> Result<Self> {
        let vars = Vars::from_settings(settings);
        let specs = match strategy {
            StrategyKind::Tiered => &settings.tiered,
            StrategyKind::Structural => &settings.structural,
        };
        let rules = RuleSet::compile(specs, &vars)
            .with_context(|| format!("Failed to compile {:?} rules", strategy))?;
        Ok(Extractor { strategy, rules })
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn rule_tags(&self) -> Vec<&str> {
        self.rules
            .rules()
            .iter()
            .map(|r| r.matcher.tag.as_str())
            .collect()
    }

    pub fn extract(&self, document: &str) -> Extraction {
        let page = Page::parse(document);
        self.rules.evaluate(&page)
    }
}

// ── Tests ──
