use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "backup-agent", version, about = "Scheduled database backup agent")]
pub struct Cli {
    /// Local settings file
    #[arg(
        short,
        long,
        global = true,
        env = "BACKUP_AGENT_SETTINGS",
        default_value = "settings.json"
    )]
    pub settings: PathBuf,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the service loop until interrupted (default)
    Run,
    /// Run a single cycle and exit
    Tick,
    /// Back up every database now with the EMERGENCY tag
    Emergency,
    /// Back up every database now, recorded under the `manual` point
    Scheduled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_service_loop() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["backup-agent"])?;
        assert_eq!(cli.command.unwrap_or(Commands::Run), Commands::Run);
        assert!(!cli.verbose);
        Ok(())
    }

    #[test]
    fn test_one_shot_commands() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["backup-agent", "emergency", "--settings", "/etc/agent.json"])?;
        assert_eq!(cli.command, Some(Commands::Emergency));
        assert_eq!(cli.settings, PathBuf::from("/etc/agent.json"));
        Ok(())
    }
}
