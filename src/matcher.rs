//! File-to-biosample matching.
//!
//! Every file runs through an ordered cascade: control detection, primary
//! token, secondary token, then cleanup rules. A strategy that finds more
//! than one biosample ends the cascade with an ambiguous outcome.

use std::collections::{BTreeSet, HashSet};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    BiosampleRecord, ControlKind, FileCatalogEntry, MappingAssignment, MatchConfidence,
    MatchLevel, MatchOutcome, file_stem,
};

#[derive(Debug, Clone)]
pub struct CleanupRule {
    pub pattern: Regex,
    /// Replacement text; may reference capture groups (`$1`).
    pub replacement: String,
    pub level: MatchLevel,
}

#[derive(Debug, Clone)]
pub struct MatchRules {
    pub primary: Regex,
    pub secondary: Regex,
    /// Lowercased substrings marking controls, blanks and QC injections.
    pub control_patterns: Vec<String>,
    pub calibration_patterns: Vec<String>,
    pub cleanup_rules: Vec<CleanupRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchSummary {
    pub total_files: usize,
    pub sample_files: usize,
    pub control_files: usize,
    pub matched: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub multiple_matches: usize,
    pub unmatched: usize,
    pub total_biosamples: usize,
    pub biosamples_with_files: usize,
    pub biosample_coverage_pct: f64,
}

#[derive(Debug, Clone)]
pub struct MatchReport {
    pub assignments: Vec<MappingAssignment>,
    pub summary: MatchSummary,
}

enum Lookup<'a> {
    None,
    One(&'a BiosampleRecord),
    Many(usize),
}

pub struct Matcher<'a> {
    rules: &'a MatchRules,
    biosamples: &'a [BiosampleRecord],
    normalized_names: Vec<String>,
}

impl<'a> Matcher<'a> {
    pub fn new(rules: &'a MatchRules, biosamples: &'a [BiosampleRecord]) -> Self {
        let normalized_names = biosamples
            .iter()
            .map(|record| normalize(&record.name))
            .collect();
        Self {
            rules,
            biosamples,
            normalized_names,
        }
    }

    /// One assignment per distinct file name, sorted by confidence.
    pub fn run(&self, files: &[FileCatalogEntry]) -> MatchReport {
        let mut seen = HashSet::new();
        let mut assignments = Vec::new();
        for entry in files {
            if !seen.insert(entry.short_name.as_str()) {
                debug!(file = %entry.short_name, "duplicate file collapsed");
                continue;
            }
            assignments.push(MappingAssignment {
                raw_file_name: entry.short_name.clone(),
                outcome: self.assign(&entry.short_name),
            });
        }
        sort_by_confidence(&mut assignments);
        let summary = summarize(&assignments, self.biosamples.len());
        info!(
            total = summary.total_files,
            matched = summary.matched,
            multiple = summary.multiple_matches,
            unmatched = summary.unmatched,
            coverage = %format!("{:.1}%", summary.biosample_coverage_pct),
            "biosample matching finished"
        );
        MatchReport {
            assignments,
            summary,
        }
    }

    pub fn assign(&self, file_name: &str) -> MatchOutcome {
        if let Some(kind) = self.control_kind(file_name) {
            return MatchOutcome::Control { kind };
        }
        let stem = file_stem(file_name);

        let tiers = [
            (&self.rules.primary, MatchLevel::High),
            (&self.rules.secondary, MatchLevel::Medium),
        ];
        for (pattern, level) in tiers {
            if let Some(token) = extract_token(pattern, stem)
                && let Some(outcome) = self.resolve(&token, level)
            {
                return outcome;
            }
        }

        for rule in &self.rules.cleanup_rules {
            if !rule.pattern.is_match(stem) {
                continue;
            }
            let token = rule.pattern.replace_all(stem, rule.replacement.as_str());
            if let Some(outcome) = self.resolve(&token, rule.level) {
                return outcome;
            }
        }

        MatchOutcome::Unmatched
    }

    fn control_kind(&self, file_name: &str) -> Option<ControlKind> {
        let lowered = file_name.to_lowercase();
        if self
            .rules
            .calibration_patterns
            .iter()
            .any(|pattern| lowered.contains(pattern))
        {
            return Some(ControlKind::Calibration);
        }
        if self
            .rules
            .control_patterns
            .iter()
            .any(|pattern| lowered.contains(pattern))
        {
            return Some(ControlKind::Control);
        }
        None
    }

    /// `None` means no candidate at all, so the cascade moves on.
    fn resolve(&self, token: &str, level: MatchLevel) -> Option<MatchOutcome> {
        match self.lookup(token) {
            Lookup::None => None,
            Lookup::One(record) => Some(MatchOutcome::Matched {
                biosample_id: record.id.clone(),
                biosample_name: record.name.clone(),
                level,
            }),
            Lookup::Many(candidates) => Some(MatchOutcome::Ambiguous { candidates }),
        }
    }

    fn lookup(&self, token: &str) -> Lookup<'a> {
        let needle = normalize(token);
        if needle.is_empty() {
            return Lookup::None;
        }
        let hits: Vec<usize> = self
            .normalized_names
            .iter()
            .enumerate()
            .filter(|(_, name)| name.contains(&needle))
            .map(|(idx, _)| idx)
            .collect();
        match hits.as_slice() {
            [] => Lookup::None,
            [idx] => {
                let biosamples: &'a [BiosampleRecord] = self.biosamples;
                Lookup::One(&biosamples[*idx])
            }
            many => Lookup::Many(many.len()),
        }
    }
}

fn extract_token(pattern: &Regex, stem: &str) -> Option<String> {
    let captures = pattern.captures(stem)?;
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|found| found.as_str().to_string())
}

/// Lowercase and fold separator characters so `S1-A`, `s1_a` and `S1 A` compare equal.
pub fn normalize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_sep = false;
    for ch in value.trim().chars() {
        if matches!(ch, '-' | '_' | '.') || ch.is_whitespace() {
            if !last_sep {
                out.push('_');
            }
            last_sep = true;
        } else {
            out.extend(ch.to_lowercase());
            last_sep = false;
        }
    }
    out
}

pub fn sort_by_confidence(assignments: &mut [MappingAssignment]) {
    assignments.sort_by_key(|assignment| assignment.confidence());
}

pub fn summarize(assignments: &[MappingAssignment], total_biosamples: usize) -> MatchSummary {
    let mut summary = MatchSummary {
        total_files: assignments.len(),
        total_biosamples,
        ..MatchSummary::default()
    };
    let mut covered = BTreeSet::new();
    for assignment in assignments {
        if let MatchOutcome::Control { .. } = assignment.outcome {
            summary.control_files += 1;
            continue;
        }
        summary.sample_files += 1;
        match assignment.confidence() {
            MatchConfidence::High => summary.high += 1,
            MatchConfidence::Medium => summary.medium += 1,
            MatchConfidence::Low => summary.low += 1,
            MatchConfidence::MultipleMatches => summary.multiple_matches += 1,
            MatchConfidence::NoMatch => summary.unmatched += 1,
        }
        if let Some(id) = assignment.outcome.biosample_id() {
            covered.insert(id.to_string());
        }
    }
    summary.matched = summary.high + summary.medium + summary.low;
    summary.biosamples_with_files = covered.len();
    summary.biosample_coverage_pct = if total_biosamples == 0 {
        0.0
    } else {
        covered.len() as f64 * 100.0 / total_biosamples as f64
    };
    if summary.multiple_matches > 0 {
        warn!(
            count = summary.multiple_matches,
            "files matched several biosamples; review the mapping file"
        );
    }
    summary
}
