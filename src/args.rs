use clap::{
    Parser,
    Subcommand,
};
use pattoo_agent_config::AgentKind;
use std::path::PathBuf;

/// Pattoo telemetry agent
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory with the YAML configuration files.
    /// Defaults to `$PATTOO_AGENT_CONFIG` or the platform config directory.
    #[clap(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Which agent program to run.
    #[clap(long, global = true, default_value_t = AgentKind::Snmp)]
    pub kind: AgentKind,

    /// Log at debug level regardless of `main.log_level`.
    #[clap(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the agent.
    Start {
        /// Stay attached to the terminal and log to stderr.
        #[clap(long)]
        foreground: bool,
    },
    /// Stop the running agent.
    Stop,
    /// Stop, then start in the background.
    Restart,
    /// Start after clearing a lock left by a dead agent.
    Force {
        #[clap(long)]
        foreground: bool,
    },
    /// Report whether the agent is running.
    Status,
    /// Print the resolved configuration.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_global_flags_after_the_command() {
        let args = Args::parse_from([
            "pattoo-agent",
            "start",
            "--foreground",
            "--kind",
            "modbus",
            "--config-dir",
            "/etc/pattoo",
        ]);
        assert_eq!(args.command, Command::Start { foreground: true });
        assert_eq!(args.kind, AgentKind::Modbus);
        assert_eq!(args.config_dir, Some(PathBuf::from("/etc/pattoo")));
        assert!(!args.debug);
    }

    #[test]
    fn kind_defaults_to_snmp() {
        let args = Args::parse_from(["pattoo-agent", "status"]);
        assert_eq!(args.kind, AgentKind::Snmp);
        assert_eq!(args.command, Command::Status);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(Args::try_parse_from(["pattoo-agent", "--kind", "bacnet", "status"]).is_err());
    }
}
