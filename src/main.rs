use clap::Parser;
use color_eyre::Result;
use eyre::WrapErr as _;
use pattoo_agent::{
    agent::{
        self,
        AgentSettings,
        ResolvedConfig,
    },
    daemon::{
        DaemonSupervisor,
        Detach,
        DoubleFork,
        Foreground,
        StartOutcome,
        StopOutcome,
    },
    init_errors,
    init_logging,
    Args,
    Command,
};
use pattoo_agent_config::{
    get_config_dir,
    ConfigLoader,
    Settings,
};

fn main() -> Result<()> {
    let args = Args::parse();
    init_errors()?;

    let loader = ConfigLoader::new(args.config_dir.clone().unwrap_or_else(get_config_dir));
    let (settings, agent) = AgentSettings::load(args.kind, &loader).wrap_err_with(|| {
        format!("failed to load configuration from {}", loader.config_dir().display())
    })?;
    let level = if args.debug { "debug".to_string() } else { settings.log_level.clone() };

    let background = matches!(
        args.command,
        Command::Start { foreground: false } | Command::Force { foreground: false } | Command::Restart
    );
    // opened before detaching, the descriptor survives the forks
    let log_file = background.then(|| settings.log_file());
    init_logging(&level, log_file.as_deref())?;

    let mut supervisor = DaemonSupervisor::new(settings.agent_daemon_directory(), settings.stop_timeout());
    let name = settings.agent_name.clone();

    match args.command {
        Command::Start { foreground } => {
            let outcome = supervisor.start(detach_for(foreground))?;
            launch(outcome, &supervisor, settings, agent)
        }
        Command::Force { foreground } => {
            let outcome = supervisor.force(detach_for(foreground))?;
            launch(outcome, &supervisor, settings, agent)
        }
        Command::Restart => {
            let (stopped, outcome) = supervisor.restart(&DoubleFork)?;
            report_stop(&name, stopped);
            launch(outcome, &supervisor, settings, agent)
        }
        Command::Stop => {
            report_stop(&name, supervisor.stop()?);
            Ok(())
        }
        Command::Status => {
            println!("{name}: {}", supervisor.status()?);
            Ok(())
        }
        Command::Config => {
            let agent_id = supervisor
                .files()
                .agent_id(&name)
                .wrap_err("failed to read agent identity")?;
            let snapshot = settings.snapshot(agent_id)?;
            let resolved = ResolvedConfig {
                snapshot: &snapshot,
                agent: &agent,
            };
            print!("{}", serde_yml::to_string(&resolved)?);
            Ok(())
        }
    }
}

fn detach_for(foreground: bool) -> &'static dyn Detach {
    if foreground {
        &Foreground
    } else {
        &DoubleFork
    }
}

fn report_stop(name: &str, outcome: StopOutcome) {
    match outcome {
        StopOutcome::Stopped { pid, forced: false } => println!("{name}: stopped PID {pid}"),
        StopOutcome::Stopped { pid, forced: true } => println!("{name}: killed PID {pid} after it ignored SIGTERM"),
        StopOutcome::NotRunning { stale_pid: Some(pid) } => {
            println!("{name}: not running, removed leftovers of PID {pid}")
        }
        StopOutcome::NotRunning { stale_pid: None } => println!("{name}: not running"),
    }
}

/// Runs the agent if this process became it.
fn launch(outcome: StartOutcome, supervisor: &DaemonSupervisor, settings: Settings, agent: AgentSettings) -> Result<()> {
    let daemon = match outcome {
        StartOutcome::Detached { pid } => {
            println!("{}: started with PID {pid}", settings.agent_name);
            return Ok(());
        }
        StartOutcome::Running(daemon) => daemon,
    };

    let agent_id = supervisor
        .files()
        .agent_id(&settings.agent_name)
        .wrap_err("failed to read agent identity")?;
    let snapshot = settings.snapshot(agent_id)?;
    let collector = agent.collector(snapshot.fetch_timeout());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to start async runtime")?;
    let result = runtime.block_on(agent::run(snapshot, vec![collector]));
    drop(runtime);

    daemon.release()?;
    result
}
