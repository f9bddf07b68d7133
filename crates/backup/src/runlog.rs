//! Human-readable transcript of one run.

use crate::error::{Result, io};
use exn::ResultExt;
use std::fmt::Display;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Collects the transcript of a run while mirroring every line to `tracing`.
///
/// Create one per run and pass it down to whatever reports progress.
#[derive(Debug, Default)]
pub struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A filesystem change applied to the catalog.
    pub fn change(&mut self, kind: &str, path: &Path) {
        debug!(kind, path = %path.display(), "Change");
        self.lines.push(format!("[{kind}] {}", path.display()));
    }

    pub fn info(&mut self, message: impl Display) {
        info!("{message}");
        self.lines.push(message.to_string());
    }

    /// Something was skipped but the run carries on.
    pub fn notice(&mut self, message: impl Display) {
        warn!("{message}");
        self.lines.push(format!("[Notice] {message}"));
    }

    pub fn warning(&mut self, message: impl Display) {
        warn!("{message}");
        self.lines.push(format!("[Warning] {message}"));
    }

    pub fn error(&mut self, message: impl Display) {
        error!("{message}");
        self.lines.push(format!("[Error] {message}"));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Lines containing `filter`, or every line without one.
    pub fn filtered<'a>(&'a self, filter: Option<&'a str>) -> impl Iterator<Item = &'a str> + 'a {
        self.lines.iter().map(String::as_str).filter(move |line| filter.is_none_or(|f| line.contains(f)))
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let mut text = self.lines.join("\n");
        text.push('\n');
        tokio::fs::write(path, text).await.or_raise(io(path.display()))
    }
}
