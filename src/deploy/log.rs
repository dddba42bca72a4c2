// ABOUTME: Bounded build/deploy log accumulated during one deployment attempt.
// ABOUTME: Drops the oldest lines past the byte limit and marks the truncation.

use parking_lot::Mutex;

/// Upper bound for the log persisted on a deployment row.
pub const MAX_LOG_BYTES: usize = 512 * 1024;

const TRUNCATION_MARKER: &str = "[... earlier output truncated ...]";

/// Shared by the line sinks of every stage; appends are serialized.
#[derive(Debug)]
pub struct BuildLog {
    inner: Mutex<LogLines>,
    limit: usize,
}

#[derive(Debug, Default)]
struct LogLines {
    lines: std::collections::VecDeque<String>,
    bytes: usize,
    truncated: bool,
}

impl Default for BuildLog {
    fn default() -> Self {
        Self::with_limit(MAX_LOG_BYTES)
    }
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(LogLines::default()),
            limit,
        }
    }

    pub fn push(&self, line: &str) {
        let mut inner = self.inner.lock();
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        inner.bytes += line.len() + 1;
        inner.lines.push_back(line);
        while inner.bytes > self.limit && inner.lines.len() > 1 {
            if let Some(dropped) = inner.lines.pop_front() {
                inner.bytes -= dropped.len() + 1;
                inner.truncated = true;
            }
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.inner.lock().truncated
    }

    /// The log as newline-joined text.
    pub fn contents(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::with_capacity(inner.bytes + TRUNCATION_MARKER.len() + 1);
        if inner.truncated {
            out.push_str(TRUNCATION_MARKER);
            out.push('\n');
        }
        for line in &inner.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
