//! Swarm CLI - adaptive LLM routing and ensemble synthesis

use std::io::Write;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde::Serialize;
use swarm_core::config::{BanditConfig, BanditParamsPatch, Config};
use swarm_core::engine::{AgentChoice, AnswerEnvelope, ChatRequest, Engine, ResponseEvent};
use swarm_core::feedback::Verdict;
use swarm_core::routing::RouteTarget;

#[derive(Parser)]
#[command(name = "swarm")]
#[command(author, version, about = "Adaptive LLM routing and ensemble synthesis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a query, routed automatically unless an agent is given
    Ask {
        /// The query
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        /// Agent id (or "auto")
        #[arg(short, long)]
        agent: Option<String>,
        /// Force an ensemble answer
        #[arg(long)]
        swarm: bool,
        /// User id recorded with the answer
        #[arg(short, long)]
        user: Option<String>,
        /// Extra system prompt appended for every agent
        #[arg(long)]
        system: Option<String>,
    },

    /// Show the routing decision for a query without answering it
    Route {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        /// Force an ensemble decision
        #[arg(long)]
        swarm: bool,
    },

    /// Answer with a fixed ensemble of agents
    Ensemble {
        /// Comma-separated agent ids
        #[arg(short, long, value_delimiter = ',', required = true)]
        agents: Vec<String>,
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Rate an answer (up or down)
    Feedback {
        /// Response id printed with the answer
        response_id: String,
        /// up or down
        verdict: String,
        /// Agents to credit when the response is not on record
        #[arg(short, long, value_delimiter = ',')]
        agents: Vec<String>,
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show agent statistics and learning counters
    Stats,

    /// Inspect collaboration runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Run self-reflection over recent interactions
    Reflect,

    /// Apply the interaction retention cap
    Prune,

    /// List configured agents
    Agents,

    /// UCB bandit parameters
    Bandit {
        #[command(subcommand)]
        action: BanditAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List recent runs
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one run by id or response id
    Show { id: String },
}

#[derive(Subcommand)]
enum BanditAction {
    /// Show active parameters
    Show,
    /// Update parameters
    Set {
        #[arg(long)]
        c: Option<f64>,
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        beta: Option<f64>,
        #[arg(long)]
        diversity_bonus: Option<f64>,
    },
    /// Re-read the parameter file
    Reload,
    /// Show bandit file path
    Path,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("swarm=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Agents => cmd_agents(out),
        Commands::Bandit { action } => cmd_bandit(action, out),
        Commands::Config { action } => cmd_config(action, out),
        command => {
            let engine = Engine::builder(Config::load()?).build().await?;
            let result = run(&engine, command, out).await;
            engine.shutdown().await;
            result
        }
    }
}

/// Commands that need the engine
async fn run(engine: &Engine, command: Commands, out: Output) -> anyhow::Result<()> {
    match command {
        Commands::Ask {
            query,
            agent,
            swarm,
            user,
            system,
        } => {
            let choice = agent.as_deref().map(AgentChoice::parse).unwrap_or_default();
            let request = ChatRequest::new(query.join(" "))
                .with_agent(choice)
                .force_ensemble(swarm)
                .with_user(user)
                .with_system_prompt_override(system);
            cmd_ask(engine, request, out).await
        }

        Commands::Route { query, swarm } => cmd_route(engine, query.join(" "), swarm, out).await,

        Commands::Ensemble {
            agents,
            query,
            user,
        } => {
            let request = ChatRequest::new(query.join(" "))
                .with_agent(AgentChoice::Ensemble(agents))
                .with_user(user);
            cmd_ask(engine, request, out).await
        }

        Commands::Feedback {
            response_id,
            verdict,
            agents,
            user,
        } => {
            let verdict: Verdict = verdict.parse()?;
            cmd_feedback(engine, response_id, verdict, agents, user, out).await
        }

        Commands::Stats => cmd_stats(engine, out).await,

        Commands::Runs { action } => cmd_runs(engine, action, out).await,

        Commands::Reflect => cmd_reflect(engine, out).await,

        Commands::Prune => cmd_prune(engine, out).await,

        Commands::Agents | Commands::Bandit { .. } | Commands::Config { .. } => {
            Err(anyhow!("command does not use the engine"))
        }
    }
}

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_ask(engine: &Engine, request: ChatRequest, out: Output) -> anyhow::Result<()> {
    if out.json() {
        let envelope = engine.ask(request).await?;
        return out.print_json(&envelope);
    }

    let mut envelope = AnswerEnvelope::default();
    let mut stdout = std::io::stdout();
    let mut events = std::pin::pin!(engine.respond(request));

    while let Some(event) = events.next().await {
        match event {
            ResponseEvent::SelectedAgent { agent_id, reason, .. } => {
                envelope.agent_id = agent_id;
                envelope.reason = Some(reason);
            }
            ResponseEvent::ResponseId { response_id } => envelope.response_id = response_id,
            ResponseEvent::FormatIntent(intent) => envelope.format = Some(intent.format),
            ResponseEvent::CollabAgents { agent_ids } => {
                if !out.quiet {
                    eprintln!("Ensemble: {}", agent_ids.join(", "));
                }
                envelope.agents = agent_ids;
            }
            ResponseEvent::Content { text } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            ResponseEvent::Done { agent_id, .. } => {
                envelope.agent_id = agent_id;
                writeln!(stdout)?;
            }
            ResponseEvent::Error { code, message } => {
                return Err(anyhow!("[{}] {}", code, message));
            }
        }
    }

    if !out.quiet {
        eprintln!();
        eprintln!("Response: {}", envelope.response_id);
        eprintln!(
            "Agent:    {} ({})",
            envelope.agent_id,
            envelope.reason.map(|r| r.as_str()).unwrap_or("-")
        );
        eprintln!(
            "Rate it:  swarm feedback {} up|down --agents {}",
            envelope.response_id,
            if envelope.is_ensemble() {
                envelope.agents.join(",")
            } else {
                envelope.agent_id.clone()
            }
        );
    }
    Ok(())
}

async fn cmd_route(engine: &Engine, query: String, swarm: bool, out: Output) -> anyhow::Result<()> {
    let decision = engine.route(&query, swarm).await?;
    if out.json() {
        return out.print_json(&decision);
    }

    match &decision.target {
        RouteTarget::Single { agent_id } => println!("Single: {}", agent_id),
        RouteTarget::Ensemble { agent_ids } => println!("Ensemble: {}", agent_ids.join(", ")),
    }
    if !out.quiet {
        println!("Reason: {}", decision.reason);
        for (agent, score) in &decision.scores {
            println!("  {:<12} {:.4}", agent, score);
        }
    }
    Ok(())
}

async fn cmd_feedback(
    engine: &Engine,
    response_id: String,
    verdict: Verdict,
    agents: Vec<String>,
    user: Option<String>,
    out: Output,
) -> anyhow::Result<()> {
    let report = engine
        .record_feedback(&response_id, user.as_deref(), &agents, verdict)
        .await?;
    if out.json() {
        return out.print_json(&report);
    }

    if !out.quiet {
        println!("Recorded {} for {}", report.verdict, report.response_id);
        for a in &report.attributions {
            println!(
                "  {:<12} contribution {:.2}  weight {:.2}  reward {:.3}",
                a.agent_id, a.contribution, a.ucb_weight, a.reward
            );
        }
        if report.attributions.is_empty() {
            println!("  No agents credited (unknown response; pass --agents)");
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StatsReport {
    agents: Vec<swarm_core::storage::AgentStat>,
    interactions: u64,
    collab: swarm_core::storage::CollabStats,
    feedback: swarm_core::storage::FeedbackStats,
    chunk_training_examples: u64,
}

async fn cmd_stats(engine: &Engine, out: Output) -> anyhow::Result<()> {
    let store = engine.store();
    let report = StatsReport {
        agents: store.agent_stats().await?,
        interactions: store.interaction_count().await?,
        collab: store.collab_stats().await?,
        feedback: store.feedback_stats().await?,
        chunk_training_examples: store.chunk_training_count().await?,
    };
    if out.json() {
        return out.print_json(&report);
    }

    println!("Agents:");
    if report.agents.is_empty() {
        println!("  (no rewards recorded yet)");
    }
    for stat in &report.agents {
        println!(
            "  {:<12} pulls {:>6}  mean {:.3}",
            stat.agent_id, stat.pulls, stat.mean_reward
        );
    }
    println!("Interactions: {}", report.interactions);
    println!("Collaboration runs: {}", report.collab.total_runs);
    println!(
        "Feedback: {} up, {} down",
        report.feedback.total.up, report.feedback.total.down
    );
    println!("Chunk training examples: {}", report.chunk_training_examples);
    Ok(())
}

async fn cmd_runs(engine: &Engine, action: RunsAction, out: Output) -> anyhow::Result<()> {
    match action {
        RunsAction::List { limit } => {
            let runs = engine.store().recent_collab_runs(limit).await?;
            if out.json() {
                return out.print_json(&runs);
            }
            if runs.is_empty() {
                if !out.quiet {
                    println!("No collaboration runs recorded.");
                }
                return Ok(());
            }
            for run in runs {
                println!(
                    "{:>5}  {}  {:<16} {:<20} {}",
                    run.id,
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    run.router_reason,
                    run.agents_used.join(","),
                    truncate(&run.query, 60)
                );
            }
        }
        RunsAction::Show { id } => {
            let run = engine
                .store()
                .collab_run_details(&id)
                .await?
                .with_context(|| format!("No collaboration run '{}'", id))?;
            if out.json() {
                return out.print_json(&run);
            }
            println!("Run {} ({})", run.id, run.response_id);
            println!("Query:       {}", run.query);
            println!("Reason:      {}", run.router_reason);
            println!("Leader:      {}", run.leader_agent);
            println!("Synthesizer: {}", run.synthesizer_id.as_deref().unwrap_or("-"));
            println!("Answers:");
            for answer in &run.answers {
                match (&answer.text, &answer.error) {
                    (_, Some(error)) => println!("  {:<12} failed: {}", answer.agent_id, error),
                    (Some(text), None) => println!("  {:<12} {}", answer.agent_id, truncate(text, 80)),
                    (None, None) => println!("  {:<12} (no answer)", answer.agent_id),
                }
            }
            println!(
                "Chunks: {} scored, {} selected{}",
                run.metrics.chunk_scores.len(),
                run.metrics.selected_chunks.len(),
                if run.metrics.degraded { " (degraded)" } else { "" }
            );
            println!();
            println!("{}", run.final_answer);
        }
    }
    Ok(())
}

async fn cmd_reflect(engine: &Engine, out: Output) -> anyhow::Result<()> {
    let report = engine.reflect().await?;
    if out.json() {
        return out.print_json(&report);
    }

    if report.insights.is_empty() {
        println!("Not enough judged interactions yet.");
        return Ok(());
    }
    for insight in &report.insights {
        let flag = if report.underperformers.contains(&insight.agent_id) {
            "underperforming"
        } else if report.overperformers.contains(&insight.agent_id) {
            "overperforming"
        } else {
            "ok"
        };
        println!(
            "  {:<12} mean {:.3} over {} samples  {}",
            insight.agent_id, insight.mean, insight.samples, flag
        );
    }
    if !out.quiet && let Some(prompt) = &report.improvement_prompt {
        println!();
        println!("{}", prompt);
    }
    Ok(())
}

async fn cmd_prune(engine: &Engine, out: Output) -> anyhow::Result<()> {
    let deleted = engine.prune().await?;
    if out.json() {
        return out.print_json(&serde_json::json!({ "deleted": deleted }));
    }
    if !out.quiet {
        println!("Pruned {} interactions", deleted);
    }
    Ok(())
}

#[derive(Serialize)]
struct AgentRow {
    id: String,
    model: String,
    specialty: String,
    routable: bool,
    available: bool,
    default: bool,
}

fn cmd_agents(out: Output) -> anyhow::Result<()> {
    let config = Config::load()?;
    let mut rows = Vec::new();
    for agent in &config.agents {
        rows.push(AgentRow {
            id: agent.id.clone(),
            model: agent.model.clone(),
            specialty: agent.specialty.clone(),
            routable: agent.routable,
            available: config.llm.agent_api_key(&agent.id)?.is_some(),
            default: agent.id == config.routing.default_agent,
        });
    }
    if out.json() {
        return out.print_json(&rows);
    }

    for row in &rows {
        println!(
            "{:<12} {:<44} {}{}{}",
            row.id,
            row.model,
            if row.available { "available" } else { "no key" },
            if row.default { ", default" } else { "" },
            if row.routable { "" } else { ", not routable" }
        );
        if !out.quiet && !row.specialty.is_empty() {
            println!("             {}", row.specialty);
        }
    }
    Ok(())
}

fn cmd_bandit(action: BanditAction, out: Output) -> anyhow::Result<()> {
    let path = Config::bandit_path()?;
    match action {
        BanditAction::Show | BanditAction::Reload => {
            let params = BanditConfig::load(&path)?.current();
            if out.json() {
                return out.print_json(&params);
            }
            println!("c = {}", params.c);
            println!("alpha = {}", params.alpha);
            println!("beta = {}", params.beta);
            println!("diversity_bonus = {}", params.diversity_bonus);
        }
        BanditAction::Set {
            c,
            alpha,
            beta,
            diversity_bonus,
        } => {
            let bandit = BanditConfig::load(&path)?;
            let params = bandit.update(BanditParamsPatch {
                c,
                alpha,
                beta,
                diversity_bonus,
            })?;
            if out.json() {
                return out.print_json(&params);
            }
            if !out.quiet {
                println!(
                    "Updated: c = {}, alpha = {}, beta = {}, diversity_bonus = {}",
                    params.c, params.alpha, params.beta, params.diversity_bonus
                );
            }
        }
        BanditAction::Path => println!("{}", path.display()),
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, out: Output) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !out.quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            if out.json() {
                let map: serde_json::Map<String, serde_json::Value> = items
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                return out.print_json(&map);
            }
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !out.quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let head: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ensemble_agents() {
        let cli = Cli::parse_from(["swarm", "ensemble", "--agents", "solar,qwen", "compare", "rust"]);
        match cli.command {
            Commands::Ensemble { agents, query, .. } => {
                assert_eq!(agents, vec!["solar", "qwen"]);
                assert_eq!(query.join(" "), "compare rust");
            }
            _ => panic!("expected ensemble command"),
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer line", 8), "a muc...");
        assert_eq!(truncate("first\nsecond", 20), "first");
    }
}
