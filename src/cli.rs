use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cumulus", version, about = "Incremental, encrypted, deduplicating backups")]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "CUMULUS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Back up the configured paths into a new incremental
    Backup {
        /// Run even if the last backup finished within the retry range
        #[arg(short, long)]
        force: bool,

        /// Do not run the pre-backup commands
        #[arg(short = 'p', long)]
        skip_prebackup: bool,
    },
    /// Spot-check the remote backup without modifying it
    Verify,
}

impl Cli {
    /// Default log filter for the requested verbosity.
    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            (false, 2) => "debug",
            (false, _) => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["cumulus", "backup"], "warn")]
    #[case(&["cumulus", "-v", "backup"], "info")]
    #[case(&["cumulus", "backup", "-vv"], "debug")]
    #[case(&["cumulus", "-vvvv", "verify"], "trace")]
    #[case(&["cumulus", "-q", "verify"], "error")]
    fn test_log_level(#[case] args: &[&str], #[case] expected: &str) {
        assert_eq!(Cli::parse_from(args).log_level(), expected);
    }

    #[test]
    fn test_backup_flags() {
        let cli = Cli::parse_from(["cumulus", "--config", "/etc/cumulus.toml", "backup", "-f", "-p"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/cumulus.toml")));
        assert!(matches!(cli.command, Command::Backup { force: true, skip_prebackup: true }));
        assert!(Cli::try_parse_from(["cumulus", "-q", "-v", "verify"]).is_err());
    }
}
