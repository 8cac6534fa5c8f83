//! Progress display for foreground imports. Compiles to no-ops without the
//! `progress` feature.

use crate::import::ImportJob;
use std::time::Duration;

#[cfg(feature = "progress")]
pub use indicatif::{ProgressBar, ProgressStyle};

#[cfg(not(feature = "progress"))]
pub use self::noop::*;

#[cfg(not(feature = "progress"))]
mod noop {
    use std::borrow::Cow;
    use std::time::Duration;

    #[derive(Clone)]
    pub struct ProgressBar;

    impl ProgressBar {
        pub fn new_spinner() -> Self {
            ProgressBar
        }

        pub fn set_style(&self, _style: ProgressStyle) {}
        pub fn set_message(&self, _msg: impl Into<Cow<'static, str>>) {}
        pub fn set_position(&self, _pos: u64) {}
        pub fn enable_steady_tick(&self, _interval: Duration) {}
        pub fn finish_with_message(&self, _msg: impl Into<Cow<'static, str>>) {}
        pub fn finish_and_clear(&self) {}
    }

    pub struct ProgressStyle;

    impl ProgressStyle {
        pub fn default_spinner() -> Self {
            ProgressStyle
        }

        pub fn template(self, _template: &str) -> Result<Self, std::convert::Infallible> {
            Ok(self)
        }
    }
}

/// Spinner that follows a running import job
pub struct ImportProgress {
    bar: ProgressBar,
}

impl ImportProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Refresh from the latest job snapshot
    pub fn update(&self, job: &ImportJob) {
        self.bar.set_position(job.rows_read);
        self.bar.set_message(describe(job));
    }

    pub fn finish(&self, job: &ImportJob) {
        self.bar.finish_with_message(describe(job));
    }
}

impl Default for ImportProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line summary of a job's progress
pub fn describe(job: &ImportJob) -> String {
    let mut line = format!(
        "{}: {} rows read, {} rejected",
        job.state, job.rows_read, job.rows_rejected
    );
    if job.rows_coerced > 0 {
        line.push_str(&format!(", {} coerced", job.rows_coerced));
    }
    if let Some(orgs) = job.organizations {
        line.push_str(&format!(", {} organizations", orgs));
    }
    if let Some(source) = job.source.urls.get(job.checkpoint.fetch.source_index)
        && job.state.is_running()
    {
        line.push_str(&format!(" ({})", source));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::SourceDescriptor;

    #[test]
    fn test_describe() {
        let mut job = ImportJob::new(SourceDescriptor::new(vec!["eo1.csv".to_string()]));
        job.rows_read = 10;
        job.rows_rejected = 1;
        job.organizations = Some(9);
        let line = describe(&job);
        assert!(line.starts_with("idle: 10 rows read, 1 rejected"));
        assert!(line.contains("9 organizations"));
        assert!(!line.contains("coerced"));
    }
}
