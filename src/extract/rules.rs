use std::cell::OnceCell;
use std::collections::HashSet;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use scraper::Selector;
use tracing::debug;

use super::page::Page;
use super::{Candidate, Extraction};
use crate::config::{ExtractSettings, RuleSpec, ScopeKind};

/// Values substituted for `{region}` / `{region_short}` in rule definitions.
#[derive(Debug, Clone)]
pub struct Vars {
    pub region: String,
    pub region_short: String,
    pub markers: Vec<String>,
}

impl Vars {
    pub fn from_settings(s: &ExtractSettings) -> Self {
        Vars {
            region: s.region.clone(),
            region_short: s.region_short.clone(),
            markers: s.markers.clone(),
        }
    }

    fn fill(&self, template: &str, escape: bool) -> String {
        let (region, short) = if escape {
            (regex::escape(&self.region), regex::escape(&self.region_short))
        } else {
            (self.region.clone(), self.region_short.clone())
        };
        template
            .replace("{region_short}", &short)
            .replace("{region}", &region)
    }
}

/// Bounds on the text after the region prefix of a structural address.
const SHAPE_TAIL: std::ops::RangeInclusive<usize> = 5..=100;

/// Region prefix, then a bounded run of non-punctuation containing a marker.
#[derive(Debug, Clone)]
struct Shape {
    region: String,
    markers: Vec<String>,
}

impl Shape {
    fn fits(&self, text: &str) -> bool {
        let Some(at) = text.find(self.region.as_str()) else {
            return false;
        };
        let tail = &text[at + self.region.len()..];
        SHAPE_TAIL.contains(&tail.chars().count())
            && !tail.chars().any(is_punctuation)
            && self.markers.iter().any(|m| tail.contains(m.as_str()))
    }
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || "。，、；：？！“”‘’（）《》【】…—".contains(c)
}

/// A compiled matcher over plain text: one `(tag, pattern, tier)` row.
#[derive(Debug, Clone)]
pub struct TextRule {
    pub tag: String,
    pub tier: u8,
    regex: Regex,
    group: usize,
    /// Label rules judge only the first occurrence of the label.
    first_only: bool,
    require: Vec<String>,
    markers: Vec<String>,
    shape: Option<Shape>,
    max_chars: Option<usize>,
}

impl TextRule {
    pub fn compile(spec: &RuleSpec, vars: &Vars) -> Result<Self> {
        let source = match (&spec.label, &spec.pattern) {
            (Some(label), None) => label_pattern(&vars.fill(label, false), &spec.stops),
            (None, Some(pattern)) => vars.fill(pattern, true),
            (Some(_), Some(_)) => bail!("rule '{}' sets both label and pattern", spec.tag),
            (None, None) => bail!("rule '{}' needs a label or a pattern", spec.tag),
        };
        let regex = Regex::new(&source)
            .with_context(|| format!("rule '{}' has an invalid pattern", spec.tag))?;
        let group = if spec.label.is_some() || regex.captures_len() > 1 { 1 } else { 0 };

        Ok(TextRule {
            tag: spec.tag.clone(),
            tier: spec.tier,
            regex,
            group,
            first_only: spec.label.is_some(),
            require: spec.require.iter().map(|r| vars.fill(r, false)).collect(),
            markers: if spec.require_marker { vars.markers.clone() } else { Vec::new() },
            shape: spec.shape.then(|| Shape {
                region: vars.region.clone(),
                markers: vars.markers.clone(),
            }),
            max_chars: spec.max_chars,
        })
    }

    fn matches<'r, 't>(&'r self, text: &'t str) -> impl Iterator<Item = &'t str> + 'r
    where
        't: 'r,
    {
        let group = self.group;
        let limit = if self.first_only { 1 } else { usize::MAX };
        self.regex
            .captures_iter(text)
            .take(limit)
            .filter_map(move |caps| caps.get(group))
            .map(|m| m.as_str().trim())
    }

    /// Every accepted candidate in `text`, in document order.
    pub fn scan(&self, text: &str) -> Vec<String> {
        self.matches(text)
            .filter(|t| self.accepts(t))
            .map(str::to_string)
            .collect()
    }

    pub fn first(&self, text: &str) -> Option<String> {
        self.matches(text)
            .find(|t| self.accepts(t))
            .map(str::to_string)
    }

    pub fn candidate(&self, text: String) -> Candidate {
        Candidate {
            text,
            tier: self.tier,
            source: self.tag.clone(),
        }
    }

    fn accepts(&self, text: &str) -> bool {
        !text.is_empty()
            && self.require.iter().all(|r| text.contains(r.as_str()))
            && (self.markers.is_empty() || self.markers.iter().any(|m| text.contains(m.as_str())))
            && self.max_chars.map_or(true, |max| text.chars().count() <= max)
            && self.shape.as_ref().map_or(true, |shape| shape.fits(text))
    }
}

/// `label [:：]? (capture)` ended by whitespace, a stop phrase, or end of text.
fn label_pattern(label: &str, stops: &[String]) -> String {
    let mut terminators = vec![r"\s".to_string()];
    terminators.extend(stops.iter().map(|s| regex::escape(s)));
    terminators.push("$".to_string());
    format!("{}[:：]?(.*?)(?:{})", regex::escape(label), terminators.join("|"))
}

#[derive(Debug, Clone)]
pub enum Scope {
    /// First element matching the selector.
    Featured(Selector),
    /// Whole document text.
    Page,
    /// Each element matching the selector, in rendered order.
    Entries(Selector),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub matcher: TextRule,
    pub scope: Scope,
}

impl Rule {
    pub fn compile(spec: &RuleSpec, vars: &Vars) -> Result<Self> {
        let selector = || -> Result<Selector> {
            let raw = spec
                .selector
                .as_deref()
                .with_context(|| format!("rule '{}' needs a selector for its scope", spec.tag))?;
            Selector::parse(raw)
                .map_err(|e| anyhow!("rule '{}' has an invalid selector '{}': {:?}", spec.tag, raw, e))
        };
        let scope = match spec.scope {
            ScopeKind::Featured => Scope::Featured(selector()?),
            ScopeKind::Page => Scope::Page,
            ScopeKind::Entries => Scope::Entries(selector()?),
        };
        Ok(Rule {
            matcher: TextRule::compile(spec, vars)?,
            scope,
        })
    }

    fn candidates(&self, page: &Page, page_text: &OnceCell<String>) -> Vec<String> {
        match &self.scope {
            Scope::Featured(sel) => page
                .first_text(sel)
                .map(|t| self.matcher.scan(&t))
                .unwrap_or_default(),
            Scope::Page => self.matcher.scan(page_text.get_or_init(|| page.text())),
            Scope::Entries(sel) => page
                .texts(sel)
                .iter()
                .map(|t| self.matcher.scan(t))
                .find(|found| !found.is_empty())
                .unwrap_or_default(),
        }
    }
}

/// Ordered cascade. The first rule that yields anything supplies the best
/// candidate; later rules only add alternatives behind it.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(specs: &[RuleSpec], vars: &Vars) -> Result<Self> {
        let rules = specs
            .iter()
            .map(|s| Rule::compile(s, vars))
            .collect::<Result<Vec<_>>>()?;
        Ok(RuleSet { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn evaluate(&self, page: &Page) -> Extraction {
        let page_text = OnceCell::new();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for rule in &self.rules {
            let found = rule.candidates(page, &page_text);
            if found.is_empty() {
                continue;
            }
            debug!(
                "rule {} (tier {}) produced {} candidate(s)",
                rule.matcher.tag,
                rule.matcher.tier,
                found.len()
            );
            candidates.extend(
                found
                    .into_iter()
                    .filter(|t| seen.insert(t.clone()))
                    .map(|t| rule.matcher.candidate(t)),
            );
        }
        Extraction { candidates }
    }
}

/// Plain-text cascade: the first rule in the list matching anywhere wins.
pub fn first_match(rules: &[TextRule], text: &str) -> Option<Candidate> {
    rules
        .iter()
        .find_map(|r| r.first(text).map(|t| r.candidate(t)))
}

// ── Tests ──
