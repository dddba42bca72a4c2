// ABOUTME: Output formatting for CLI feedback.
// ABOUTME: Renders progress events in normal, quiet (CI) and JSON output modes.

use serde::Serialize;
use std::time::Instant;

use crate::progress::{ProgressEvent, Stage};

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-friendly output with progress messages
    Normal,
    /// Minimal output for CI (only final result)
    Quiet,
    /// JSON lines for scripting
    Json,
}

/// Handles CLI output based on the configured mode.
#[derive(Debug, Clone)]
pub struct Output {
    mode: OutputMode,
    start_time: Option<Instant>,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            start_time: None,
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Start timing an operation.
    pub fn start_timer(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Get elapsed time since timer started.
    pub fn elapsed_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn duration(&self) -> Option<f64> {
        self.start_time.map(|_| self.elapsed_secs())
    }

    /// Print a progress message (suppressed in quiet/json mode).
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    /// Render one pipeline event.
    ///
    /// Terminal events are left to [`success`](Self::success) and
    /// [`error`](Self::error) in normal and quiet mode.
    pub fn event(&self, event: &ProgressEvent) {
        match self.mode {
            OutputMode::Normal if !event.stage.is_terminal() => {
                println!("  [{}] {}", event.stage, event.message);
            }
            OutputMode::Normal | OutputMode::Quiet => {}
            OutputMode::Json => {
                let json = JsonEvent {
                    event: "progress",
                    stage: Some(event.stage),
                    message: &event.message,
                    duration_secs: None,
                };
                if let Ok(line) = serde_json::to_string(&json) {
                    println!("{line}");
                }
            }
        }
    }

    /// Print a non-fatal warning.
    pub fn warning(&self, message: &str) {
        match self.mode {
            OutputMode::Normal => eprintln!("Warning: {message}"),
            OutputMode::Quiet => {}
            OutputMode::Json => self.json_line("warning", message, false),
        }
    }

    /// Print a success message with optional timing.
    pub fn success(&self, message: &str) {
        match self.mode {
            OutputMode::Normal => {
                let elapsed = self.elapsed_secs();
                if elapsed > 0.0 {
                    println!("{message} ({:.1}s)", elapsed);
                } else {
                    println!("{message}");
                }
            }
            OutputMode::Quiet => {
                // Print only the essential result
                println!("{message}");
            }
            OutputMode::Json => self.json_line("success", message, false),
        }
    }

    /// Print an error message.
    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => {
                eprintln!("Error: {message}");
            }
            OutputMode::Json => self.json_line("error", message, true),
        }
    }

    fn json_line(&self, event: &str, message: &str, stderr: bool) {
        let json = JsonEvent {
            event,
            stage: None,
            message,
            duration_secs: self.duration(),
        };
        if let Ok(line) = serde_json::to_string(&json) {
            if stderr {
                eprintln!("{line}");
            } else {
                println!("{line}");
            }
        }
    }
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
}
