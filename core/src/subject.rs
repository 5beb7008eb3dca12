//! Subject grammar for the message bus.
//!
//! Subjects are segment strings joined by a separator (default `:`):
//! `tasks:<agent>`, `results:<task_id>`, `events:<topic>`, `status:<agent>`.
//! In subscription patterns, `*` matches exactly one segment.

/// Default segment separator.
pub const DEFAULT_SEPARATOR: char = ':';

/// Task dispatch subject for an agent.
pub fn tasks(agent: &str) -> String {
    format!("tasks{DEFAULT_SEPARATOR}{agent}")
}

/// Per-task result subject.
pub fn results(task_id: &str) -> String {
    format!("results{DEFAULT_SEPARATOR}{task_id}")
}

/// System event subject for a topic.
pub fn events(topic: &str) -> String {
    format!("events{DEFAULT_SEPARATOR}{topic}")
}

/// Agent status subject.
pub fn status(agent: &str) -> String {
    format!("status{DEFAULT_SEPARATOR}{agent}")
}

/// Whether `pattern` matches `subject` with the default separator.
pub fn matches(pattern: &str, subject: &str) -> bool {
    matches_with(pattern, subject, DEFAULT_SEPARATOR)
}

/// Whether `pattern` matches `subject`.
///
/// Segments must agree pairwise; a `*` pattern segment matches any one
/// subject segment. Patterns and subjects with different segment counts
/// never match.
pub fn matches_with(pattern: &str, subject: &str, separator: char) -> bool {
    let mut pattern_segments = pattern.split(separator);
    let mut subject_segments = subject.split(separator);

    loop {
        match (pattern_segments.next(), subject_segments.next()) {
            (Some(p), Some(s)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_builders() {
        assert_eq!(tasks("supervisor"), "tasks:supervisor");
        assert_eq!(results("t-1"), "results:t-1");
        assert_eq!(events("startup"), "events:startup");
        assert_eq!(status("worker"), "status:worker");
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("tasks:supervisor", "tasks:supervisor"));
        assert!(!matches("tasks:supervisor", "tasks:worker"));
        assert!(!matches("tasks:supervisor", "status:supervisor"));
    }

    #[test]
    fn test_wildcard_matches_one_segment() {
        assert!(matches("results:*", "results:t-1"));
        assert!(matches("*:supervisor", "tasks:supervisor"));
        assert!(matches("*:*", "status:worker"));

        // one segment only, never zero or two
        assert!(!matches("results:*", "results"));
        assert!(!matches("results:*", "results:t-1:extra"));
    }

    #[test]
    fn test_segment_count_mismatch() {
        assert!(!matches("tasks:supervisor", "tasks"));
        assert!(!matches("tasks", "tasks:supervisor"));
    }

    #[test]
    fn test_custom_separator() {
        assert!(matches_with("tasks.supervisor", "tasks.supervisor", '.'));
        assert!(matches_with("tasks.*", "tasks.worker", '.'));
        assert!(!matches_with("tasks.*", "tasks.worker.extra", '.'));
    }
}
