// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lexical helpers for remote paths

use std::path::Path;

use path_clean::PathClean;

/// Shortest lexical equivalent of `path`: repeated and trailing separators,
/// `.` elements and resolvable `..` elements are removed. An empty result
/// becomes `"."`.
pub fn clean(path: &str) -> String {
    Path::new(path).clean().to_string_lossy().into_owned()
}

/// Every directory that has to exist for `path` to exist, shortest first,
/// ending with `path` itself. Repeated separators and `.` elements are
/// dropped. `..` elements are kept so the server resolves them against what
/// actually exists. The root and `.` are never yielded.
pub(crate) fn prefixes(path: &str) -> Vec<String> {
    let mut current = if path.starts_with('/') {
        String::from("/")
    } else {
        String::new()
    };
    let mut out = Vec::new();
    for elem in path.split('/').filter(|e| !e.is_empty() && *e != ".") {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(elem);
        out.push(current.clone());
    }
    out
}
