//! Task framing markers and pane output interpretation.
//!
//! Every dispatched task is framed between two marker lines written into the
//! session:
//!
//! ```text
//! ### TASK_START:<task_id>
//! <command>
//! ### TASK_END:<task_id>
//! ```
//!
//! Completion detection matches markers as whole lines: a marker counts only
//! when it is the sole non-whitespace content of a pane line. The echoed
//! `echo '### TASK_END:...'` command line therefore never triggers
//! completion, and neither does a marker embedded inside a longer output
//! line. A command that prints the literal end marker on a line of its own
//! is still treated as complete at that line; that hazard is documented and
//! accepted.

use orchestrator_core::{
    error::{OrchestratorError, Result},
    models::TaskResult,
};
use regex::{Regex, RegexSet};

/// Prefix of the start marker line.
pub const START_MARKER_PREFIX: &str = "### TASK_START:";

/// Prefix of the end marker line.
pub const END_MARKER_PREFIX: &str = "### TASK_END:";

/// Default prompt-stripping pattern (`user@host $` style prompts).
pub const DEFAULT_PROMPT_PATTERN: &str = r"^\w+@\S+\s*[#$]";

/// Default error signatures scanned for in pane output. Matching is
/// case-insensitive and inherently heuristic; false positives and negatives
/// are possible, so the list is configuration.
pub fn default_error_signatures() -> Vec<String> {
    [
        "command not found",
        "No such file or directory",
        "Permission denied",
        "fatal:",
        r"Traceback \(most recent call last\):",
        "SyntaxError:",
        "NameError:",
        "ImportError:",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Start marker line for a task.
pub fn start_marker(task_id: &str) -> String {
    format!("{START_MARKER_PREFIX}{task_id}")
}

/// End marker line for a task.
pub fn end_marker(task_id: &str) -> String {
    format!("{END_MARKER_PREFIX}{task_id}")
}

/// The exact line sequence sent to the session for one task attempt.
pub fn frame_command(task_id: &str, command: &str) -> Vec<String> {
    vec![
        format!("echo '{}'", start_marker(task_id)),
        command.to_string(),
        format!("echo '{}'", end_marker(task_id)),
    ]
}

/// Whether `marker` appears as a line whose sole non-whitespace content is
/// the marker token.
pub fn marker_line_present(output: &str, marker: &str) -> bool {
    output.lines().any(|line| line.trim() == marker)
}

/// Compiled output inspection: error signatures and prompt stripping.
pub struct OutputInspector {
    signatures: RegexSet,
    prompt: Regex,
}

impl OutputInspector {
    /// Compile the inspector from signature patterns and a prompt pattern.
    ///
    /// # Returns
    /// * `Err(OrchestratorError::Configuration)` - If any pattern fails to compile
    pub fn new(signatures: &[String], prompt_pattern: &str) -> Result<Self> {
        let case_insensitive: Vec<String> =
            signatures.iter().map(|s| format!("(?i){s}")).collect();
        let signatures = RegexSet::new(&case_insensitive).map_err(|e| {
            OrchestratorError::Configuration(format!("Invalid error signature: {e}"))
        })?;
        let prompt = Regex::new(prompt_pattern).map_err(|e| {
            OrchestratorError::Configuration(format!("Invalid prompt pattern: {e}"))
        })?;
        Ok(Self { signatures, prompt })
    }

    /// Inspector with the default signature list and prompt pattern.
    pub fn default_inspector() -> Self {
        Self::new(&default_error_signatures(), DEFAULT_PROMPT_PATTERN)
            .expect("default patterns are valid")
    }

    /// Whether any error signature matches the output.
    pub fn has_errors(&self, output: &str) -> bool {
        self.signatures.is_match(output)
    }

    /// The first output line matching an error signature, for error context.
    pub fn first_error_line<'a>(&self, output: &'a str) -> Option<&'a str> {
        output
            .lines()
            .find(|line| self.signatures.is_match(line))
            .map(str::trim)
    }

    /// Extract and structure the output of one task from a pane capture.
    ///
    /// Takes the lines strictly between the matching start and end marker
    /// lines (falling back to the whole capture when markers are absent),
    /// strips prompt lines and echoed commands, and attaches the trailing
    /// JSON object if one parses. `success` is set to `true`; failure paths
    /// override it.
    pub fn parse(&self, output: &str, task_id: &str) -> TaskResult {
        let start = start_marker(task_id);
        let end = end_marker(task_id);
        let all_lines: Vec<&str> = output.lines().collect();

        let start_idx = all_lines.iter().position(|l| l.trim() == start);
        let end_idx = match start_idx {
            Some(s) => all_lines[s + 1..]
                .iter()
                .position(|l| l.trim() == end)
                .map(|i| i + s + 1),
            None => all_lines.iter().position(|l| l.trim() == end),
        };

        let body: Vec<&str> = match (start_idx, end_idx) {
            (Some(s), Some(e)) if e > s => all_lines[s + 1..e].to_vec(),
            _ => all_lines,
        };

        let mut lines: Vec<String> = body
            .into_iter()
            .filter(|line| !self.prompt.is_match(line))
            .filter(|line| !line.trim_start().starts_with("echo "))
            .map(str::to_string)
            .collect();

        // Trim blank edges left by the framing
        while lines.first().map(|l| l.trim().is_empty()).unwrap_or(false) {
            lines.remove(0);
        }
        while lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
            lines.pop();
        }

        let raw_output = lines.join("\n");
        let has_errors = self.has_errors(&raw_output);
        let structured_data = extract_trailing_json(&raw_output);

        TaskResult {
            raw_output,
            lines,
            success: true,
            has_errors,
            structured_data,
        }
    }
}

/// Find the last top-level JSON object substring that parses.
///
/// Brace scanning does not understand string escapes; like the error
/// signatures, this is a best-effort heuristic over opaque shell output.
pub fn extract_trailing_json(text: &str) -> Option<serde_json::Value> {
    let bytes = text.as_bytes();
    let opens: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'{')
        .map(|(i, _)| i)
        .collect();

    for &open in opens.iter().rev() {
        let mut depth = 0usize;
        for (offset, byte) in bytes[open..].iter().enumerate() {
            match byte {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[open..=open + offset];
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                            if value.is_object() {
                                return Some(value);
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}
