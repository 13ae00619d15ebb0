// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Dotted version numbers as reported by rpm and image tools.

use std::cmp::Ordering;

/// Leading numeric components of a version string.
///
/// `2.3.7-1.el8` -> `[2, 3, 7]`, `24.1.0.0.0.240517` -> `[24, 1, 0, 0, 0, 240517]`.
/// Parsing stops at the first component that does not start with a digit.
pub fn parse_version(value: &str) -> Option<Vec<u64>> {
    let mut parts = Vec::new();
    for component in value.trim().split(['.', '-', '_']) {
        let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            break;
        }
        parts.push(digits.parse().ok()?);
        if digits.len() != component.len() {
            break;
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

/// Compare two versions numerically; missing components count as zero.
pub fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// `installed >= minimum`; unparseable input is never sufficient.
pub fn meets_minimum(installed: &str, minimum: &str) -> bool {
    match (parse_version(installed), parse_version(minimum)) {
        (Some(a), Some(b)) => compare_versions(&a, &b) != Ordering::Less,
        _ => false,
    }
}
