use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use fleetscript::{
    CallerContext, Config, ExecutionRequest, Fleet, Parameter, ReportStatus, ScriptDraft,
    init_tracing, serve_agent,
};

/// Manage scripts and run them across a fleet of nodes
#[derive(Parser)]
#[command(name = "fleetscript")]
#[command(version)]
struct Cli {
    /// TOML configuration file; FLEETSCRIPT_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Capabilities to act with; only admin may approve
    #[arg(long = "as", value_enum, global = true, default_value_t = Role::Maintainer)]
    role: Role,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the agent endpoint until Ctrl-C
    Agent,
    /// List registered scripts
    List,
    /// Reconcile the registry with the script directory
    Sync,
    /// Store a script from a file
    Add {
        file: PathBuf,
        /// Script id, defaults to the file name
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        /// Declared parameter with its default, as name=default
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<Parameter>,
        /// Only privileged users may run it unattended
        #[arg(long)]
        restricted: bool,
        /// Always run on the controller
        #[arg(long)]
        controller_only: bool,
    },
    /// Remove a script and its source
    Remove { id: String },
    /// List script bodies waiting for approval
    Pending,
    /// Approve a script body by hash
    Approve { hash: String },
    /// Reject a script body by hash
    Reject { hash: String },
    /// Run a script
    Run {
        /// Stored script id; optional when --script is given
        id: Option<String>,
        /// Node, (built-in), (all) or (all agents)
        #[arg(short, long, default_value = "(built-in)")]
        target: String,
        /// Parameter override, as name=value
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<Parameter>,
        /// Run this file's contents instead of the stored body
        #[arg(long)]
        script: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_param(pair: &str) -> Result<Parameter, String> {
    Parameter::parse_pair(pair).map_err(|e| e.to_string())
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Operator,
    Maintainer,
    Admin,
}

fn caller_as(role: Role) -> CallerContext {
    let user = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());
    match role {
        Role::Operator => CallerContext::operator(user),
        Role::Maintainer => CallerContext::maintainer(user),
        Role::Admin => CallerContext::admin(user),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = Config::load(cli.config.as_deref())?;
    let open = || Fleet::open(&config);
    let caller = caller_as(cli.role);

    match cli.command {
        Commands::Agent => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(());
                }
            });
            serve_agent(config.clone(), shutdown_rx).await?;
        }
        Commands::List => {
            let fleet = open()?;
            for record in fleet.manager.visible_scripts(&caller) {
                let mut flags = Vec::new();
                if !record.available {
                    flags.push("unavailable");
                }
                if record.restricted_to_privileged_users {
                    flags.push("restricted");
                }
                if record.only_controller_node {
                    flags.push("controller-only");
                }
                println!(
                    "{:<32} {:<32} {}",
                    record.id,
                    record.display_name,
                    flags.join(",")
                );
            }
        }
        Commands::Sync => {
            let report = open()?.startup;
            println!(
                "added: {}, unavailable: {}, restored: {}",
                report.added.len(),
                report.marked_unavailable.len(),
                report.restored.len()
            );
        }
        Commands::Add {
            file,
            id,
            name,
            comment,
            params,
            restricted,
            controller_only,
        } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let id = match id {
                Some(id) => id,
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .context("file has no usable name")?,
            };
            let draft = ScriptDraft {
                display_name: name.unwrap_or_default(),
                comment: comment.unwrap_or_default(),
                parameters: params,
                restricted_to_privileged_users: restricted,
                only_controller_node: controller_only,
                ..ScriptDraft::new(id, body)
            };
            let id = open()?.manager.save_script(&caller, draft)?;
            println!("saved {}", id);
        }
        Commands::Remove { id } => {
            open()?.manager.remove_script(&caller, &id)?;
            println!("removed {}", id);
        }
        Commands::Pending => {
            for (hash, record) in open()?.manager.pending_approvals() {
                println!("{}  {}", hash, record.registered_at.to_rfc3339());
            }
        }
        Commands::Approve { hash } => {
            open()?.manager.approve(&caller, &hash)?;
            println!("approved {}", hash);
        }
        Commands::Reject { hash } => {
            open()?.manager.reject(&caller, &hash)?;
            println!("rejected {}", hash);
        }
        Commands::Run {
            id,
            target,
            params,
            script,
            json,
        } => {
            let body = match script {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("cannot read {}", path.display()))?,
                ),
                None => None,
            };
            let request = match (id, body) {
                (Some(id), Some(body)) => ExecutionRequest::for_script(id).with_body(body),
                (Some(id), None) => ExecutionRequest::for_script(id),
                (None, Some(body)) => ExecutionRequest::ad_hoc(body),
                (None, None) => anyhow::bail!("give a script id or --script"),
            }
            .on(target)
            .with_parameters(params);

            let fleet = open()?;
            let report = fleet.dispatcher.run(request, &caller).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_text());
            }
            if report.status != ReportStatus::Completed || !report.succeeded() {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
