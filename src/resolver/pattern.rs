//! Filter/flatten pattern files: one regular expression per line, blank
//! lines and lines starting with `#` ignored (§6).

use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::warn;

/// Compile every pattern in `path` into a [`Regex`], skipping lines that
/// fail to compile (a warning is logged, the pattern is dropped).
///
/// Returns an empty list if `path` is `None` or unreadable, matching the
/// permissive behavior of the reference configuration loader.
pub fn load(path: Option<&Path>) -> Vec<Regex> {
    let Some(path) = path else {
        return Vec::new();
    };

    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) => {
            warn!(path = %path.display(), %err, "could not read pattern file");
            return Vec::new();
        }
    };

    let mut patterns = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match Regex::new(line) {
            Ok(re) => patterns.push(re),
            Err(err) => {
                warn!(path = %path.display(), line = lineno + 1, %err, "failed to compile pattern");
            }
        }
    }
    patterns
}

/// Does any pattern in `patterns` match `name`, anchored at its start (as
/// Python's `re.match` is)?
pub fn any_matches(patterns: &[Regex], name: &str) -> bool {
    patterns.iter().any(|re| matches_at_start(re, name))
}

fn matches_at_start(re: &Regex, name: &str) -> bool {
    re.find(name).is_some_and(|m| m.start() == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn skips_blank_and_comment_lines() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# a comment").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "^sample\\d+$").unwrap();
        f.flush().unwrap();

        let patterns = load(Some(f.path()));
        assert_eq!(patterns.len(), 1);
        assert!(any_matches(&patterns, "sample42"));
        assert!(!any_matches(&patterns, "other"));
    }

    #[test]
    fn drops_uncompilable_lines_without_failing() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[unterminated").unwrap();
        writeln!(f, "^ok$").unwrap();
        f.flush().unwrap();

        let patterns = load(Some(f.path()));
        assert_eq!(patterns.len(), 1);
        assert!(any_matches(&patterns, "ok"));
    }

    #[test]
    fn missing_file_yields_empty_list() {
        assert!(load(Some(Path::new("/nonexistent/path/to/patterns"))).is_empty());
        assert!(load(None).is_empty());
    }

    #[test]
    fn match_must_anchor_at_start() {
        let patterns = vec![Regex::new("bar").unwrap()];
        assert!(any_matches(&patterns, "barfoo"));
        assert!(!any_matches(&patterns, "foobar"));
    }
}
