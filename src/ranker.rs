use std::cmp::Ordering;
use std::collections::BTreeMap;

use uuid::Uuid;

use crate::config::RankerConfig;
use crate::recommendations::{Recommendation, Source, clamp_confidence};

/// Merge heuristic and LLM candidates into one deduplicated, ordered list.
///
/// Candidates sharing a fingerprint are collapsed within each source first,
/// then merged across sources. The output order is total, so ranking the same
/// inputs twice yields the same list.
pub fn rank(
    heuristic: Vec<Recommendation>,
    llm: Vec<Recommendation>,
    config: &RankerConfig,
) -> Vec<Recommendation> {
    let mut heuristic = collapse(heuristic);
    let llm = collapse(llm);

    for (id, candidate) in llm {
        let merged = match heuristic.remove(&id) {
            Some(existing) => merge(existing, candidate, config.agreement_bonus),
            None => candidate,
        };
        heuristic.insert(id, merged);
    }

    let mut ranked: Vec<Recommendation> = heuristic.into_values().collect();
    ranked.sort_by(compare);
    ranked
}

/// Severity desc, confidence desc, category priority, then fingerprint.
pub fn compare(a: &Recommendation, b: &Recommendation) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.category.priority().cmp(&b.category.priority()))
        .then_with(|| a.id.cmp(&b.id))
}

fn collapse(candidates: Vec<Recommendation>) -> BTreeMap<Uuid, Recommendation> {
    let mut by_id: BTreeMap<Uuid, Recommendation> = BTreeMap::new();
    for candidate in candidates {
        match by_id.remove(&candidate.id) {
            Some(existing) => {
                let combined = combine_duplicates(existing, candidate);
                by_id.insert(combined.id, combined);
            }
            None => {
                by_id.insert(candidate.id, candidate);
            }
        }
    }
    by_id
}

fn combine_duplicates(a: Recommendation, b: Recommendation) -> Recommendation {
    let a_wins = match a.confidence.total_cmp(&b.confidence) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => a.rationale <= b.rationale,
    };
    let (mut keep, other) = if a_wins { (a, b) } else { (b, a) };
    let counts = keep.supporting_digests.max(other.supporting_digests);
    union_digests(&mut keep, other.digests, counts);
    keep.severity = keep.severity.max(other.severity);
    keep
}

fn merge(heuristic: Recommendation, llm: Recommendation, bonus: f64) -> Recommendation {
    let confidence = clamp_confidence(heuristic.confidence.max(llm.confidence) + bonus);
    let counts = heuristic.supporting_digests.max(llm.supporting_digests);
    let mut merged = Recommendation {
        source: Source::Merged,
        confidence,
        severity: heuristic.severity.max(llm.severity),
        suggested_action: heuristic
            .suggested_action
            .clone()
            .or_else(|| llm.suggested_action.clone()),
        rationale: if llm.rationale.trim().is_empty() || llm.rationale == heuristic.rationale {
            heuristic.rationale.clone()
        } else {
            format!("{} LLM analysis agrees: {}", heuristic.rationale, llm.rationale)
        },
        ..heuristic
    };
    union_digests(&mut merged, llm.digests, counts);
    merged
}

fn union_digests(target: &mut Recommendation, extra: Vec<String>, fallback_count: usize) {
    target.digests.extend(extra);
    target.digests.sort();
    target.digests.dedup();
    target.supporting_digests = if target.digests.is_empty() {
        fallback_count
    } else {
        target.digests.len()
    };
}
