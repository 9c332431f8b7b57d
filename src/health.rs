//! Preflight checks for a mirror
//!
//! Verifies that the source can be read and that the destination and log
//! file can be written before a run is started.

use crate::config::Config;
use crate::roots::SyncRoots;
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Source root readability
    pub source: CheckResult,
    /// Destination root writability
    pub destination: CheckResult,
    /// Log file location writability
    pub log_file: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config, roots: &SyncRoots) -> Self {
        Self {
            source: Self::check_source(roots.source()).await,
            destination: Self::check_destination(roots.destination()).await,
            log_file: Self::check_log_file(&config.logging.log_file).await,
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.source.passed && self.destination.passed && self.log_file.passed
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.results()
            .into_iter()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.results().into_iter().filter(|r| r.is_warning).collect()
    }

    fn results(&self) -> [&CheckResult; 3] {
        [&self.source, &self.destination, &self.log_file]
    }

    async fn check_source(source: &Path) -> CheckResult {
        match tokio::fs::read_dir(source).await {
            Ok(_) => CheckResult::ok_with_details("Source accessible", source.display().to_string()),
            Err(e) => CheckResult::error_with_details(
                "Source not accessible",
                format!("{}: {}\nCheck that the share is mounted", source.display(), e),
            ),
        }
    }

    async fn check_destination(destination: &Path) -> CheckResult {
        let existed = destination.exists();
        if let Err(e) = tokio::fs::create_dir_all(destination).await {
            return CheckResult::error_with_details(
                "Destination cannot be created",
                format!("{}: {}", destination.display(), e),
            );
        }

        let probe = destination.join(format!(".treemirror-probe-{}", std::process::id()));
        match tokio::fs::write(&probe, b"").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                if existed {
                    CheckResult::ok_with_details(
                        "Destination writable",
                        destination.display().to_string(),
                    )
                } else {
                    CheckResult::warning_with_details(
                        "Destination created",
                        destination.display().to_string(),
                    )
                }
            }
            Err(e) => CheckResult::error_with_details(
                "Destination not writable",
                format!("{}: {}", destination.display(), e),
            ),
        }
    }

    async fn check_log_file(log_file: &str) -> CheckResult {
        let path = Path::new(log_file);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return CheckResult::error_with_details(
                    "Log directory cannot be created",
                    format!("{}: {}", parent.display(), e),
                );
            }
        }

        let opened = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await;
        match opened {
            Ok(_) => CheckResult::ok_with_details("Log file writable", log_file.to_string()),
            Err(e) => CheckResult::error_with_details(
                "Log file not writable",
                format!("{}: {}", log_file, e),
            ),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 3] {
        [
            ("Source Directory", &self.source),
            ("Destination Directory", &self.destination),
            ("Log File", &self.log_file),
        ]
    }
}
