//! Commands run before a backup, such as database dumps.

use crate::runlog::RunLog;
use tokio::process::Command;

fn shell(script: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(script);
        cmd
    }

    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }
}

/// Run each command in turn through the platform shell. A failing command
/// is reported as a warning and never stops the backup.
pub async fn run_commands(commands: &[String], log: &mut RunLog) {
    for script in commands {
        log.info(format!("Running pre-backup command: {script}"));
        match shell(script).kill_on_drop(true).output().await {
            Ok(output) if output.status.success() => {},
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                log.warning(format!("Pre-backup command '{script}' exited with {}: {}", output.status, stderr.trim()));
            },
            Err(err) => log.warning(format!("Pre-backup command '{script}' could not be started: {err}")),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failures_only_warn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("dumped");
        let commands = vec![format!("touch '{}'", marker.display()), "echo broken >&2; exit 3".to_string()];
        let mut log = RunLog::new();
        run_commands(&commands, &mut log).await;
        assert!(marker.exists());
        let warnings: Vec<_> = log.filtered(Some("[Warning]")).collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("broken"));
    }
}
