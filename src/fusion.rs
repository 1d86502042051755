//! Reciprocal rank fusion of ranked candidate lists.

use std::{cmp::Ordering, collections::HashMap};

use crate::form::FormId;

/// One fused candidate with its 1-based rank in each input list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fused {
    pub form_id: FormId,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
    pub updated_at: u64,
}

/// Fuse a lexical and a semantic ranking with RRF.
///
/// Each list contributes `1 / (k + rank)` for the forms it contains; a form
/// missing from a list gets nothing from it. Ties are broken by most recent
/// `updated_at`, then by ascending id. Duplicate ids within a list keep
/// their best rank.
pub fn rrf_fuse(
    lexical: &[FormId],
    semantic: &[FormId],
    k: u32,
    updated_at: impl Fn(FormId) -> u64,
) -> Vec<Fused> {
    let mut fused: HashMap<FormId, Fused> = HashMap::new();

    for (list, is_lexical) in [(lexical, true), (semantic, false)] {
        for (idx, &id) in list.iter().enumerate() {
            let rank = idx + 1;
            let entry = fused.entry(id).or_insert_with(|| Fused {
                form_id: id,
                score: 0.0,
                lexical_rank: None,
                semantic_rank: None,
                updated_at: updated_at(id),
            });
            let slot = if is_lexical {
                &mut entry.lexical_rank
            } else {
                &mut entry.semantic_rank
            };
            if slot.is_none() {
                *slot = Some(rank);
                entry.score += 1.0 / (f64::from(k) + rank as f64);
            }
        }
    }

    let mut results: Vec<Fused> = fused.into_values().collect();
    results.sort_by(compare);
    results
}

fn compare(a: &Fused, b: &Fused) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.form_id.cmp(&b.form_id))
}
