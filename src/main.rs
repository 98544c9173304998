use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use toolmesh::McpClient;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server configuration file (JSON or YAML)
    #[arg(short, long, env = "TOOLMESH_CONFIG")]
    config: PathBuf,

    /// Write logs to this directory instead of stderr
    #[arg(long, env = "TOOLMESH_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Write logs to the platform data directory
    #[arg(long, conflicts_with = "log_dir")]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every server and report its state
    Status,
    /// List discovered tools
    Tools,
    /// Find tools whose name or description contains any term
    Search {
        #[arg(required = true)]
        terms: Vec<String>,
    },
    /// Execute a tool
    Call {
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_dir = match (&cli.log_dir, cli.log_file) {
        (Some(dir), _) => Some(dir.clone()),
        (None, true) => Some(toolmesh::data_dir().join("logs")),
        (None, false) => None,
    };
    toolmesh::init_tracing(log_dir.as_deref()).context("failed to initialize logging")?;

    let client = McpClient::from_config_file(&cli.config);
    let failures: Vec<Value> = client
        .connect_all()
        .await
        .into_iter()
        .map(|(server, error)| json!({"server": server, "error": error.to_string()}))
        .collect();

    let output = match cli.command {
        Command::Status => json!({
            "servers": client.status().await,
            "failures": failures,
        }),
        Command::Tools => {
            client.discover_all().await;
            serde_json::to_value(client.list_tools())?
        }
        Command::Search { terms } => {
            client.discover_all().await;
            serde_json::to_value(client.find_by_keyword(&terms))?
        }
        Command::Call { tool, args } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            client.discover_all().await;
            let result = client.execute(&tool, arguments).await;
            client.disconnect_all().await;
            let result = result?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
            return Ok(());
        }
    };

    client.disconnect_all().await;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
