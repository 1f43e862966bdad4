//! Similarity ranking for the "stub not found" diagnostic.
//!
//! Scores are only used to pick the closest non-matching stub; they never
//! decide whether a stub matches.

use regex::Regex;
use serde_json::Value;

/// Score given to an empty expectation mapping: never a perfect match, but
/// ahead of a true non-match.
const EMPTY_EXPECTATION_SCORE: f64 = 0.1;

/// Strings up to this length use a stack buffer for the edit-distance column.
const STACK_COLUMN_LEN: usize = 64;

/// Normalized Levenshtein similarity in `[0, 1]`.
///
/// Identical strings score 1.0; one empty and one non-empty string score 0.0.
pub fn distance(s: &str, t: &str) -> f64 {
    if s == t {
        return 1.0;
    }
    if s.is_empty() || t.is_empty() {
        return 0.0;
    }

    if s.is_ascii() && t.is_ascii() {
        return distance_ascii(s.as_bytes(), t.as_bytes());
    }

    let s: Vec<char> = s.chars().collect();
    let t: Vec<char> = t.chars().collect();
    let mut column = vec![0; s.len() + 1];
    normalized(&s, &t, &mut column)
}

fn distance_ascii(s: &[u8], t: &[u8]) -> f64 {
    if s.len() < STACK_COLUMN_LEN {
        let mut stack = [0usize; STACK_COLUMN_LEN];
        normalized(s, t, &mut stack[..=s.len()])
    } else {
        let mut column = vec![0; s.len() + 1];
        normalized(s, t, &mut column)
    }
}

fn normalized<T: PartialEq>(s: &[T], t: &[T], column: &mut [usize]) -> f64 {
    let edits = levenshtein(s, t, column);
    let max_len = s.len().max(t.len());
    (max_len - edits) as f64 / max_len as f64
}

/// Single-column edit distance; `column` must hold `s.len() + 1` cells.
fn levenshtein<T: PartialEq>(s: &[T], t: &[T], column: &mut [usize]) -> usize {
    for (y, cell) in column.iter_mut().enumerate() {
        *cell = y;
    }

    for (x, tc) in t.iter().enumerate() {
        column[0] = x + 1;
        let mut last_diag = x;

        for y in 1..=s.len() {
            let old_diag = column[y];
            let cost = usize::from(s[y - 1] != *tc);
            column[y] = (column[y] + 1)
                .min(column[y - 1] + 1)
                .min(last_diag + cost);
            last_diag = old_diag;
        }
    }

    column[s.len()]
}

/// Heuristic similarity of `actual` to `expected`, in `[0, 1]`.
///
/// Mappings average the scores of keys present on both sides. Arrays average
/// every positively scoring element pair, which is a crude all-pairs estimate
/// rather than an assignment. Boolean candidates always score 0.
pub fn rank_match(expected: &Value, actual: &Value) -> f64 {
    match (expected, actual) {
        (Value::Object(want), _) if want.is_empty() => EMPTY_EXPECTATION_SCORE,
        (Value::Object(want), Value::Object(got)) => {
            let scores: Vec<f64> = want
                .iter()
                .filter_map(|(key, w)| got.get(key).map(|g| rank_match(w, g)))
                .collect();
            average(&scores)
        }
        (Value::Array(want), Value::Array(got)) => {
            let scores: Vec<f64> = want
                .iter()
                .flat_map(|w| got.iter().map(move |g| rank_match(w, g)))
                .filter(|score| *score > 0.0)
                .collect();
            average(&scores)
        }
        _ => rank_scalar(expected, actual),
    }
}

fn rank_scalar(expected: &Value, actual: &Value) -> f64 {
    match (expected, actual) {
        (_, Value::Bool(_)) => 0.0,
        (Value::String(want), Value::String(got)) => distance(want, got),
        (want, got) if want == got => 1.0,
        _ => 0.0,
    }
}

/// Similarity of `actual` to a `matches` pattern, in `[0, 1]`.
///
/// The first regex hit scores its byte share of `actual`; with no hit the
/// pattern source is compared as plain text.
pub fn rank_pattern(regex: &Regex, pattern: &str, actual: &str) -> f64 {
    if pattern == actual {
        return 1.0;
    }
    if !actual.is_empty() {
        if let Some(found) = regex.find(actual) {
            return (found.end() - found.start()) as f64 / actual.len() as f64;
        }
    }
    distance(pattern, actual)
}

fn average(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}
