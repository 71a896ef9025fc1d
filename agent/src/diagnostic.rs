//! `--diagnostic` checklist

use std::path::{Path, PathBuf};
use std::time::Duration;

use colored::Colorize;

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::process::cancel::CancelToken;
use crate::process::runner::{CommandSpec, ProcessRunner, SystemRunner};
use crate::storage::settings::Settings;

const TOOL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one check
#[derive(Debug)]
pub struct Check {
    pub name: String,
    pub result: Result<String, String>,
}

impl Check {
    fn new(name: impl Into<String>, result: Result<String, String>) -> Self {
        Self {
            name: name.into(),
            result,
        }
    }

    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }

    fn print(&self) {
        match &self.result {
            Ok(detail) => println!("  {} {} {}", "✓".green(), self.name.bold(), detail.dimmed()),
            Err(reason) => println!("  {} {} {}", "✗".red(), self.name.bold(), reason.red()),
        }
    }
}

/// Run every check against the settings at `settings_path`, print the
/// checklist and return whether all passed
pub async fn run_diagnostic(settings_path: &Path) -> bool {
    println!("\n{}\n", "deployd diagnostic".bold().underline());
    let checks = collect_checks(settings_path, &SystemRunner::default()).await;
    for check in &checks {
        check.print();
    }

    let failed = checks.iter().filter(|c| !c.passed()).count();
    if failed == 0 {
        println!("\n{}", "All checks passed".green());
    } else {
        println!("\n{}", format!("{} of {} checks failed", failed, checks.len()).red());
    }
    failed == 0
}

pub async fn collect_checks(settings_path: &Path, runner: &dyn ProcessRunner) -> Vec<Check> {
    let settings = match Settings::load(&File::new(settings_path)).await {
        Ok(settings) => settings,
        Err(e) => return vec![Check::new("settings", Err(e.to_string()))],
    };
    let mut checks = vec![Check::new("settings", Ok(settings_path.display().to_string()))];

    for (name, dir) in [
        ("agent dir", &settings.paths.agent_dir),
        ("builds dir", &settings.paths.builds_dir),
        ("log dir", &settings.paths.log_dir),
    ] {
        let path = PathBuf::from(dir);
        let result = check_writable(&path)
            .await
            .map(|_| dir.clone())
            .map_err(|e| e.to_string());
        checks.push(Check::new(name, result));
    }

    let tools = [
        (settings.download.tar_path.as_str(), "--version"),
        (settings.download.unzip_path.as_str(), "-v"),
        (settings.download.gpg_path.as_str(), "--version"),
        (settings.download.s3.cli_path.as_str(), "--version"),
    ];
    for (tool, version_flag) in tools {
        checks.push(Check::new(tool, check_tool(runner, tool, version_flag).await));
    }

    checks.push(Check::new(
        "control plane",
        check_reachable(&settings.control_plane.base_url).await,
    ));
    checks
}

async fn check_writable(path: &Path) -> Result<(), AgentError> {
    let dir = Dir::new(path);
    dir.create().await?;
    let probe = dir.file(".deployd-probe");
    probe.write_atomic(b"ok").await?;
    probe.delete().await
}

async fn check_tool(runner: &dyn ProcessRunner, tool: &str, version_flag: &str) -> Result<String, String> {
    let spec = CommandSpec::new(tool, TOOL_CHECK_TIMEOUT).arg(version_flag);
    match runner.run(&spec, &CancelToken::never()).await {
        Ok(output) if output.exit_code == Some(0) => Ok(output
            .stdout
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()),
        Ok(output) => Err(format!("exited with {:?}", output.exit_code)),
        Err(e) => Err(e.to_string()),
    }
}

/// Any HTTP answer counts as reachable
async fn check_reachable(base_url: &str) -> Result<String, String> {
    let client = reqwest::Client::builder()
        .timeout(TOOL_CHECK_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())?;
    client
        .get(base_url)
        .send()
        .await
        .map(|response| format!("{} answered {}", base_url, response.status()))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_settings_fail_first_check() {
        let tmp = tempfile::tempdir().unwrap();
        let checks = collect_checks(&tmp.path().join("missing.json"), &SystemRunner::default()).await;
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].passed());
    }

    #[tokio::test]
    async fn test_missing_tool_fails() {
        let result = check_tool(&SystemRunner::default(), "deployd-no-such-tool", "--version").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_directories_are_probed() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("agent");
        check_writable(&dir).await.unwrap();
        assert!(dir.is_dir());
        assert!(!dir.join(".deployd-probe").exists());
    }
}
