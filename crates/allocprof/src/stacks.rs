//! Stack key canonicalization.
//!
//! A key is a `;`-separated list of frames, outermost first. Canonical keys
//! end every frame with `;`, so `a;b` becomes `a;b;`.

/// Frames of `key`, ignoring trailing empty frames.
fn frames(key: &str) -> Vec<&str> {
    let mut frames: Vec<&str> = key.split(';').collect();
    while frames.last().is_some_and(|f| f.is_empty()) {
        frames.pop();
    }
    frames
}

fn join_squashed(frames: &[&str]) -> String {
    let mut out = String::new();
    let mut previous = None;
    for &frame in frames {
        if previous == Some(frame) {
            continue;
        }
        out.push_str(frame);
        out.push(';');
        previous = Some(frame);
    }
    out
}

/// Collapse immediate recursion: consecutive identical frames become one.
///
/// Only direct self-calls collapse; `a;b;a;b` is left as is.
pub fn squash(key: &str) -> String {
    join_squashed(&frames(key))
}

/// Drop every frame before the first one containing `filter`, then squash
/// the rest. Empty when no frame matches. `filter` must be lowercase.
pub fn truncate_and_squash(key: &str, filter: &str) -> String {
    let frames = frames(key);
    match frames.iter().position(|f| f.to_lowercase().contains(filter)) {
        Some(start) => join_squashed(&frames[start..]),
        None => String::new(),
    }
}

/// Whether `key` mentions `filter` anywhere. `filter` must be lowercase.
pub fn matches_filter(key: &str, filter: &str) -> bool {
    key.to_lowercase().contains(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squash_collapses_direct_recursion() {
        assert_eq!(squash("a;a;a;b"), "a;b;");
        assert_eq!(squash("a;b;a;b"), "a;b;a;b;");
        assert_eq!(squash("a;b;"), "a;b;");
        assert_eq!(squash(""), "");
    }

    #[test]
    fn truncate_starts_at_first_match() {
        assert_eq!(truncate_and_squash("a;b;c", "b"), "b;c;");
        assert_eq!(
            truncate_and_squash("a;Run.main;Run.main;c", "run"),
            "Run.main;c;"
        );
        assert_eq!(truncate_and_squash("x;y;z", "b"), "");
    }

    #[test]
    fn filter_match_is_case_insensitive() {
        assert!(matches_filter("app.Main.RUN;x", "run"));
        assert!(!matches_filter("app.Main.go;x", "run"));
    }
}
