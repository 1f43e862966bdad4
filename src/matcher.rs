//! Request matching logic.
//!
//! Evaluates [`Matcher`] expectations against message payloads and selects
//! the stub that answers a call.

use crate::config::{FieldPatterns, Matcher, Metadata, Payload, RpcShape, Stub};
use crate::ranker::{rank_match, rank_pattern};
use serde_json::Value;
use std::sync::Arc;

/// A call to be routed to a stub.
#[derive(Debug, Clone, Copy)]
pub struct CallQuery<'a> {
    pub service: &'a str,
    pub method: &'a str,
    pub shape: RpcShape,
    pub headers: &'a Metadata,
    pub requests: &'a [Payload],
}

/// The most similar stub when nothing matched.
#[derive(Debug, Clone)]
pub struct ClosestMatch<'a> {
    pub stub: &'a Arc<Stub>,
    /// Similarity in `[0, 1]`
    pub score: f64,
}

/// Returns true when `candidate` satisfies `matcher`.
///
/// `any` is checked first, then `equals`, `contains` and `matches`; absent
/// conditions are vacuously true.
pub fn matches(matcher: &Matcher, candidate: &Payload) -> bool {
    if !matcher.any.is_empty() && !matcher.any.iter().any(|alt| matches(alt, candidate)) {
        return false;
    }

    let ignore_order = matcher.ignore_array_order;

    if !matcher.equals.is_empty() && !map_equals(&matcher.equals, candidate, ignore_order) {
        return false;
    }

    if !matcher.contains.is_empty() && !map_contains(&matcher.contains, candidate, ignore_order) {
        return false;
    }

    if !matcher.matches.is_empty() && !regex_match_all(&matcher.matches, candidate) {
        return false;
    }

    true
}

/// One-sided subset equality: every expected key must be present and equal.
fn map_equals(expected: &Payload, candidate: &Payload, ignore_order: bool) -> bool {
    expected.iter().all(|(key, want)| {
        candidate
            .get(key)
            .is_some_and(|got| equals_value(want, got, ignore_order))
    })
}

fn map_contains(expected: &Payload, candidate: &Payload, ignore_order: bool) -> bool {
    expected.iter().all(|(key, want)| {
        candidate
            .get(key)
            .is_some_and(|got| contains_value(want, got, ignore_order))
    })
}

fn equals_value(expected: &Value, candidate: &Value, ignore_order: bool) -> bool {
    match (expected, candidate) {
        (Value::Object(want), Value::Object(got)) => map_equals(want, got, ignore_order),
        (Value::Object(_), _) => false,
        (Value::Array(want), Value::Array(got)) => {
            if want.len() != got.len() {
                return false;
            }
            if ignore_order {
                greedy_assign(want, got, ignore_order)
            } else {
                want.iter()
                    .zip(got)
                    .all(|(w, g)| equals_value(w, g, ignore_order))
            }
        }
        (Value::Array(_), _) => false,
        (want, got) => scalars_equal(want, got),
    }
}

fn contains_value(expected: &Value, candidate: &Value, ignore_order: bool) -> bool {
    match (expected, candidate) {
        (Value::Object(want), Value::Object(got)) => map_contains(want, got, ignore_order),
        (Value::Object(_), _) => false,
        // No length requirement: the candidate may carry extra elements.
        (Value::Array(want), Value::Array(got)) => greedy_assign(want, got, ignore_order),
        (Value::Array(_), _) => false,
        (Value::String(want), Value::String(got)) => got.contains(want.as_str()),
        (Value::String(_), _) => false,
        (want, got) => scalars_equal(want, got),
    }
}

/// Assigns each expected element to the first unconsumed candidate element
/// that is recursively equal to it.
///
/// This is a greedy heuristic, not a maximum bipartite matching: an early
/// assignment can consume a candidate that a later expected element needed,
/// so some satisfiable inputs are rejected. Callers rely on the current
/// behavior; do not swap in an optimal matcher without a format change.
fn greedy_assign(expected: &[Value], candidate: &[Value], ignore_order: bool) -> bool {
    let mut consumed = vec![false; candidate.len()];

    expected.iter().all(|want| {
        let slot = candidate
            .iter()
            .enumerate()
            .position(|(j, got)| !consumed[j] && equals_value(want, got, ignore_order));
        match slot {
            Some(j) => {
                consumed[j] = true;
                true
            }
            None => false,
        }
    })
}

/// Scalars compare after widening numbers to their family: signed and unsigned
/// integers compare by value, floats only against floats.
fn scalars_equal(expected: &Value, candidate: &Value) -> bool {
    match (expected, candidate) {
        (Value::Number(a), Value::Number(b)) => match (a.is_f64(), b.is_f64()) {
            (true, true) => a.as_f64() == b.as_f64(),
            (false, false) => integer_value(a) == integer_value(b),
            _ => false,
        },
        (a, b) => a == b,
    }
}

fn integer_value(n: &serde_json::Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn regex_match_all(patterns: &FieldPatterns, candidate: &Payload) -> bool {
    patterns.iter().all(|entry| {
        let Some(Value::String(value)) = candidate.get(&entry.field) else {
            return false;
        };
        entry.regex.as_ref().is_some_and(|regex| regex.is_match(value))
    })
}

/// Header metadata as a payload, for matching and guards.
pub fn metadata_payload(metadata: &Metadata) -> Payload {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

/// Find the stub that answers the call.
///
/// Only enabled stubs on the call's route are considered. The highest
/// priority wins; ties keep declaration order.
pub fn find_match<'a>(stubs: &'a [Arc<Stub>], query: &CallQuery<'_>) -> Option<&'a Arc<Stub>> {
    let headers = metadata_payload(query.headers);
    let mut best: Option<&'a Arc<Stub>> = None;

    for stub in stubs {
        if !on_route(stub, query) || !accepts(stub, query, &headers) {
            continue;
        }
        if best.map_or(true, |current| stub.priority > current.priority) {
            best = Some(stub);
        }
    }

    best
}

fn on_route(stub: &Stub, query: &CallQuery<'_>) -> bool {
    stub.enabled && stub.service == query.service && stub.method == query.method
}

fn accepts(stub: &Stub, query: &CallQuery<'_>, headers: &Payload) -> bool {
    if let Some(header_matcher) = &stub.headers {
        if !matches(header_matcher, headers) {
            return false;
        }
    }

    let empty = Payload::new();
    let requests = query.requests;

    if !stub.inputs.is_empty() {
        if requests.len() > stub.inputs.len() {
            return false;
        }
        if query.shape == RpcShape::ClientStream && requests.len() != stub.inputs.len() {
            return false;
        }
        if requests.is_empty() {
            return matches(&stub.inputs[0], &empty);
        }
        return requests
            .iter()
            .zip(&stub.inputs)
            .all(|(request, matcher)| matches(matcher, request));
    }

    let Some(input) = &stub.input else {
        return true;
    };

    if query.shape.client_streams() && !requests.is_empty() {
        requests.iter().all(|request| matches(input, request))
    } else {
        matches(input, requests.first().unwrap_or(&empty))
    }
}

/// Rank stubs that did not match and return the most similar one.
///
/// Route stubs are ranked first; when the route has none, every stub of the
/// service is ranked instead.
pub fn closest_match<'a>(stubs: &'a [Arc<Stub>], query: &CallQuery<'_>) -> Option<ClosestMatch<'a>> {
    let on_method: Vec<&'a Arc<Stub>> = stubs.iter().filter(|s| on_route(s, query)).collect();
    let candidates = if on_method.is_empty() {
        stubs
            .iter()
            .filter(|s| s.enabled && s.service == query.service)
            .collect()
    } else {
        on_method
    };

    let empty = Payload::new();
    let request = Value::Object(query.requests.first().unwrap_or(&empty).clone());

    let mut best: Option<ClosestMatch<'a>> = None;
    for stub in candidates {
        let score = stub
            .primary_input()
            .map_or(0.1, |matcher| matcher_score(matcher, &request));
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(ClosestMatch { stub, score });
        }
    }
    best
}

/// Average similarity over the matcher's non-empty conditions.
fn matcher_score(matcher: &Matcher, request: &Value) -> f64 {
    let mut parts = Vec::with_capacity(3);
    if !matcher.equals.is_empty() {
        parts.push(rank_match(&Value::Object(matcher.equals.clone()), request));
    }
    if !matcher.contains.is_empty() {
        parts.push(rank_match(&Value::Object(matcher.contains.clone()), request));
    }
    if !matcher.matches.is_empty() {
        parts.push(patterns_score(&matcher.matches, request));
    }

    if parts.is_empty() {
        return rank_match(&Value::Object(Payload::new()), request);
    }
    parts.iter().sum::<f64>() / parts.len() as f64
}

/// Average pattern score over fields present in the request.
fn patterns_score(patterns: &FieldPatterns, request: &Value) -> f64 {
    let Value::Object(request) = request else {
        return 0.0;
    };
    let scores: Vec<f64> = patterns
        .iter()
        .filter_map(|entry| {
            let actual = request.get(&entry.field)?;
            Some(match (&entry.regex, actual) {
                (Some(regex), Value::String(actual)) => rank_pattern(regex, &entry.pattern, actual),
                _ => 0.0,
            })
        })
        .collect();

    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}
