//! # Voyager CLI
//!
//! Command-line interface for running discovery episodes against a local
//! validator and inspecting what they produced.
//!
//! Usage:
//!   voyager run [--episodes N] [--objective TEXT]
//!   voyager grow [--objective TEXT]
//!   voyager skills
//!   voyager programs
//!   voyager report [--protocol NAME]
//!   voyager export [--output FILE]
//!
//! Examples:
//!   voyager -c voyager.json run --episodes 3
//!   voyager grow --objective "Swap 0.1 SOL for USDC through Jupiter"
//!   voyager report --protocol Jupiter
//!   voyager export -o trajectory.csv

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voyager_agent::{Action, Agent, ExplorationPolicy, SessionLauncher};
use voyager_env::{
    EnvConfig, LlmPlanner, OpenAIProvider, ProgramRegistry, ProviderConfig, RpcClient, SkillRegistry,
    SkillRunner, TrajectoryLog,
};

type VoyagerAgent = Agent<SessionLauncher, LlmPlanner<OpenAIProvider>, SkillRunner>;

#[derive(Parser)]
#[command(name = "voyager")]
#[command(author, version, about = "Voyager - grow skills that discover Solana protocols")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Trajectory file, overrides the configured one
    #[arg(short, long, global = true)]
    trajectory: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only print results
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run exploration episodes
    Run {
        #[arg(short, long, default_value = "1")]
        episodes: usize,

        /// Steps per episode, overrides the configured limit
        #[arg(short, long)]
        max_steps: Option<usize>,

        /// Objective for every new skill; the planner picks one when omitted
        #[arg(short, long)]
        objective: Option<String>,
    },
    /// Grow a single skill in a fresh episode
    Grow {
        #[arg(short, long)]
        objective: Option<String>,
    },
    /// List the skill library
    Skills,
    /// List known programs
    Programs,
    /// Summarize a trajectory
    Report {
        /// Also report when this protocol was first discovered
        #[arg(short, long)]
        protocol: Option<String>,
    },
    /// Write one CSV row per attempt
    Export {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<EnvConfig> {
    let mut config = match &cli.config {
        Some(path) => EnvConfig::load(path)?,
        None => EnvConfig::default(),
    }
    .with_env_overrides();
    if let Some(path) = &cli.trajectory {
        config.agent.trajectory_path = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

fn load_programs(config: &EnvConfig) -> anyhow::Result<Arc<ProgramRegistry>> {
    let programs = ProgramRegistry::load_csv(&config.registry.programs_csv)
        .with_context(|| format!("known-program registry {}", config.registry.programs_csv.display()))?;
    Ok(Arc::new(programs))
}

fn open_skills(config: &EnvConfig) -> anyhow::Result<SkillRegistry> {
    Ok(SkillRegistry::file(&config.registry.skill_root, config.registry.extension.clone())?)
}

fn build_agent(config: &EnvConfig, objective: Option<String>) -> anyhow::Result<VoyagerAgent> {
    let programs = load_programs(config)?;
    if config.planner.api_key.is_none() {
        warn!("no planner api key configured, set OPENROUTER_API_KEY");
    }
    let provider = OpenAIProvider::new(ProviderConfig::from(&config.planner))?;
    let planner = LlmPlanner::new(provider, programs.clone(), &config.planner);
    let engine = voyager_env::DiscoveryEngine::new(programs, config.reward.clone());
    let examples = RpcClient::new(
        config.rpc.fetch_url.clone(),
        config.rpc.request_timeout(),
        config.rpc.commitment.clone(),
    )?;

    let agent = Agent::new(
        SessionLauncher::new(config.clone()),
        planner,
        SkillRunner::new(config.runner.clone(), config.registry.extension.clone()),
        engine,
        open_skills(config)?,
        config.agent.clone(),
    )
    .with_examples(examples)
    .with_objective(objective.unwrap_or_default());
    Ok(agent)
}

fn load_trajectory(config: &EnvConfig) -> anyhow::Result<TrajectoryLog> {
    let Some(path) = &config.agent.trajectory_path else {
        bail!("no trajectory file configured");
    };
    TrajectoryLog::load(path).with_context(|| format!("trajectory {}", path.display()))
}

async fn run_episodes(config: &EnvConfig, episodes: usize, objective: Option<String>, quiet: bool) -> anyhow::Result<()> {
    let mut agent = build_agent(config, objective)?;
    let mut policy = ExplorationPolicy::new();

    for n in 1..=episodes {
        info!(episode = n, of = episodes, "starting episode");
        let episode = agent.run_episode(&mut policy).await?;
        if quiet {
            println!("{}\t{:.2}\t{}", episode.id, episode.total_reward, episode.protocols_discovered.join(","));
        } else {
            println!(
                "episode {}: reward {:.2}, {} attempts, {} planner calls, {:.1}s",
                episode.id,
                episode.total_reward,
                episode.attempts.len(),
                episode.planner_calls.len(),
                episode.duration_ms() as f64 / 1000.0
            );
            if !episode.protocols_discovered.is_empty() {
                println!("  protocols: {}", episode.protocols_discovered.join(", "));
            }
            if !episode.skills_created.is_empty() {
                println!("  skills:    {}", episode.skills_created.join(", "));
            }
        }
    }

    if !quiet {
        println!("\n--- Summary ---\n{}", agent.trajectory().metrics());
    }
    Ok(())
}

async fn grow_one(config: &EnvConfig, objective: Option<String>) -> anyhow::Result<()> {
    let mut agent = build_agent(config, objective)?;
    let grown = async {
        agent.reset().await?;
        agent.step(Action::NewSkill).await
    }
    .await;
    let closed = agent.close().await;
    let result = grown?;
    closed?;

    match result.error {
        None => println!(
            "accepted skill {} (reward {:.2}, {} attempts)",
            result.info["skill_id"], result.reward, result.info["attempts"]
        ),
        Some(e) => bail!("no skill accepted after {} attempts: {}", result.info["attempts"], e),
    }
    Ok(())
}

fn list_skills(config: &EnvConfig) -> anyhow::Result<()> {
    let skills = open_skills(config)?;
    if skills.is_empty() {
        println!("(no skills in {})", config.registry.skill_root.display());
        return Ok(());
    }
    for skill in skills.list() {
        let description = skill.meta.description.as_deref().unwrap_or("");
        println!("{:6}  {:24}  {}", skill.id(), skill.display_name(), truncate(description, 60));
    }
    Ok(())
}

fn list_programs(config: &EnvConfig) -> anyhow::Result<()> {
    let programs = load_programs(config)?;
    for (program_id, _) in programs.iter() {
        println!("{:44}  {}", program_id, programs.label(program_id).unwrap_or_default());
    }
    Ok(())
}

fn report(config: &EnvConfig, protocol: Option<String>) -> anyhow::Result<()> {
    let log = load_trajectory(config)?;
    println!("{}", log.metrics());

    let Some(protocol) = protocol else {
        return Ok(());
    };
    let firsts = log.first_discovery(&protocol);
    if firsts.is_empty() {
        println!("\n{} was never discovered", protocol);
        return Ok(());
    }
    println!("\n--- First discovery of {} ---", protocol);
    for first in &firsts {
        println!(
            "  episode {:3}: attempt {}, {} planner calls, {:.1}s in, after [{}]",
            first.episode_id,
            first.attempts,
            first.planner_calls,
            first.elapsed_ms as f64 / 1000.0,
            first.protocols_before.join(", ")
        );
    }
    Ok(())
}

fn export(config: &EnvConfig, output: Option<PathBuf>) -> anyhow::Result<()> {
    let log = load_trajectory(config)?;
    match output {
        Some(path) => {
            let file = std::fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
            log.export_csv(file)?;
            info!(path = %path.display(), "trajectory exported");
        }
        None => log.export_csv(std::io::stdout().lock())?,
    }
    Ok(())
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Run {
            episodes,
            max_steps,
            objective,
        } => {
            let mut config = config;
            if let Some(max_steps) = max_steps {
                config.agent.max_steps = max_steps;
            }
            run_episodes(&config, episodes, objective, cli.quiet).await
        }
        Commands::Grow { objective } => grow_one(&config, objective).await,
        Commands::Skills => list_skills(&config),
        Commands::Programs => list_programs(&config),
        Commands::Report { protocol } => report(&config, protocol),
        Commands::Export { output } => export(&config, output),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
