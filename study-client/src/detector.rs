//! Command-boundary detection
//!
//! A detector looks at everything received since the last boundary and
//! decides whether the shell is back at an idle prompt. Detection is a
//! heuristic: output that merely looks like a prompt is a boundary too.

use regex::bytes::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// A prompt with nothing before it. Clear the buffer, report nothing.
    IdlePrompt,
    /// A prompt after at least one line of output. Report the buffer.
    CommandFinished,
}

pub trait BoundaryDetector: Send + Sync {
    fn is_boundary(&self, buffer: &[u8]) -> Option<Boundary>;
}

// ============================================================================
// Prompt Pattern
// ============================================================================

/// Matches `<user>@<host-id>:<cwd>$ ` at the very end of the buffer, either
/// at its start or right after a newline.
#[derive(Debug, Clone)]
pub struct PromptPattern {
    regex: Regex,
}

impl PromptPattern {
    /// `host_id_len` is the length of the sandbox's alphanumeric host id
    /// (a container hostname is 12 hex characters).
    pub fn new(user: &str, host_id_len: usize) -> Result<Self, regex::Error> {
        let pattern = format!(
            r"(?:\A|\n){}@[[:alnum:]]{{{host_id_len}}}:(?-u:[^\n])*\$ \z",
            regex::escape(user)
        );
        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }
}

impl BoundaryDetector for PromptPattern {
    fn is_boundary(&self, buffer: &[u8]) -> Option<Boundary> {
        if !self.regex.is_match(buffer) {
            return None;
        }
        if buffer.contains(&b'\n') {
            Some(Boundary::CommandFinished)
        } else {
            Some(Boundary::IdlePrompt)
        }
    }
}

// ============================================================================
// Sentinel
// ============================================================================

/// Boundary on an explicit marker the shell prints after each command,
/// e.g. via `PROMPT_COMMAND`.
#[derive(Debug, Clone)]
pub struct SentinelDetector {
    marker: Vec<u8>,
}

impl SentinelDetector {
    pub fn new(marker: impl Into<Vec<u8>>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl BoundaryDetector for SentinelDetector {
    fn is_boundary(&self, buffer: &[u8]) -> Option<Boundary> {
        if self.marker.is_empty() || !buffer.ends_with(&self.marker) {
            return None;
        }
        let before = &buffer[..buffer.len() - self.marker.len()];
        if before.iter().all(u8::is_ascii_whitespace) {
            Some(Boundary::IdlePrompt)
        } else {
            Some(Boundary::CommandFinished)
        }
    }
}
