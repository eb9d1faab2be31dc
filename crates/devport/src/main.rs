use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use devport_core::client::{parse_data, request};
use devport_core::wire::{
    METHOD_ADD_PROJECT, METHOD_ADD_QUICK_ACCESS_SITE, METHOD_CLEAR_SERVER, METHOD_DELETE_PROJECT,
    METHOD_DELETE_QUICK_ACCESS_SITE, METHOD_GET_CONFIG, METHOD_GET_PROJECTS,
    METHOD_GET_RUNNING_SERVERS, METHOD_GET_SERVER_LOGS, METHOD_PING, METHOD_SHUTDOWN,
    METHOD_START_SERVER, METHOD_STOP_SERVER, METHOD_TAIL_SERVER_LOGS,
};
use devport_core::{
    AppConfig, LogTail, NewProject, NewQuickAccessSite, Project, QuickAccessSite,
    RunningServerInfo, StartedServer, default_socket_path,
};

#[derive(Debug, Parser)]
#[command(name = "devport", version, about = "CLI for the devportd daemon")]
struct Cli {
    #[arg(long)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check daemon health.
    Ping,
    /// List registered projects.
    Projects,
    /// Register a project.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        path: String,
        #[arg(long)]
        command: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove a registered project.
    Remove { project: String },
    /// Start a project's dev server.
    Start { project: String },
    /// Stop a project's dev server.
    Stop { project: String },
    /// Show tracked servers and their state.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show captured server output.
    Logs {
        project: String,
        /// Keep polling for new output.
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
    /// Discard a crashed server entry.
    Clear { project: String },
    /// List quick-access sites.
    Sites,
    /// Bookmark a URL or local file.
    AddSite {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove a quick-access site.
    RemoveSite { id: String },
    /// Ask the daemon to exit.
    Shutdown,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket.unwrap_or_else(default_socket_path);

    match cli.command {
        Commands::Ping => {
            let response = request(&socket, METHOD_PING, Value::Null)?;
            let data: Value = parse_data(response)?;
            println!(
                "daemon alive (version {})",
                data.get("version").and_then(Value::as_str).unwrap_or("?")
            );
        }
        Commands::Projects => {
            let projects: Vec<Project> =
                parse_data(request(&socket, METHOD_GET_PROJECTS, Value::Null)?)?;
            if projects.is_empty() {
                println!("no projects registered");
                return Ok(());
            }
            for p in projects {
                let port = p
                    .port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "auto".to_string());
                println!("{}  {}  port={}  {}", p.id, p.name, port, p.path);
            }
        }
        Commands::Add {
            name,
            path,
            command,
            port,
            description,
        } => {
            let new = NewProject {
                name,
                path,
                command,
                port,
                description,
            };
            let project: Project = parse_data(request(
                &socket,
                METHOD_ADD_PROJECT,
                serde_json::to_value(new)?,
            )?)?;
            println!("registered {} ({})", project.name, project.id);
        }
        Commands::Remove { project } => {
            let id = resolve_project(&socket, &project)?;
            parse_data::<bool>(request(&socket, METHOD_DELETE_PROJECT, json!({ "id": id }))?)?;
            println!("removed {project}");
        }
        Commands::Start { project } => {
            let id = resolve_project(&socket, &project)?;
            let started: StartedServer = parse_data(request(
                &socket,
                METHOD_START_SERVER,
                json!({ "project_id": id }),
            )?)?;
            if started.already_running {
                println!("{project} already running on port {}", started.port);
            } else {
                println!("{project} starting on port {}", started.port);
            }
        }
        Commands::Stop { project } => {
            let id = resolve_project(&socket, &project)?;
            parse_data::<bool>(request(
                &socket,
                METHOD_STOP_SERVER,
                json!({ "project_id": id }),
            )?)?;
            println!("{project} stopped");
        }
        Commands::Status { json } => {
            let response = request(&socket, METHOD_GET_RUNNING_SERVERS, Value::Null)?;
            if json {
                let data: Value = parse_data(response)?;
                println!("{}", serde_json::to_string_pretty(&data)?);
                return Ok(());
            }
            let servers: Vec<RunningServerInfo> = parse_data(response)?;
            if servers.is_empty() {
                println!("no servers running");
                return Ok(());
            }
            for s in servers {
                let detail = s.message.map(|m| format!("  ({m})")).unwrap_or_default();
                println!(
                    "{}  {}  port={}  {}{}",
                    s.project_id, s.project_name, s.port, s.state, detail
                );
            }
        }
        Commands::Logs { project, follow } => {
            let id = resolve_project(&socket, &project)?;
            if !follow {
                let logs: Vec<String> = parse_data(request(
                    &socket,
                    METHOD_GET_SERVER_LOGS,
                    json!({ "project_id": id }),
                )?)?;
                for line in logs {
                    println!("{line}");
                }
                return Ok(());
            }

            let mut cursor = 0u64;
            loop {
                let tail: LogTail = parse_data(request(
                    &socket,
                    METHOD_TAIL_SERVER_LOGS,
                    json!({ "project_id": id, "cursor": cursor, "limit": 500 }),
                )?)?;
                for line in tail.lines {
                    println!("{line}");
                }
                cursor = tail.next_cursor;
                thread::sleep(Duration::from_millis(500));
            }
        }
        Commands::Clear { project } => {
            let id = resolve_project(&socket, &project)?;
            parse_data::<bool>(request(
                &socket,
                METHOD_CLEAR_SERVER,
                json!({ "project_id": id }),
            )?)?;
            println!("cleared {project}");
        }
        Commands::Sites => {
            let config: AppConfig =
                parse_data(request(&socket, METHOD_GET_CONFIG, Value::Null)?)?;
            if config.quick_access_sites.is_empty() {
                println!("no quick-access sites");
                return Ok(());
            }
            for s in config.quick_access_sites {
                println!("{}  {}  {}", s.id, s.name, s.url);
            }
        }
        Commands::AddSite {
            name,
            url,
            description,
        } => {
            let new = NewQuickAccessSite {
                name,
                url,
                description,
                icon: None,
            };
            let site: QuickAccessSite = parse_data(request(
                &socket,
                METHOD_ADD_QUICK_ACCESS_SITE,
                serde_json::to_value(new)?,
            )?)?;
            println!("bookmarked {} ({})", site.name, site.id);
        }
        Commands::RemoveSite { id } => {
            parse_data::<bool>(request(
                &socket,
                METHOD_DELETE_QUICK_ACCESS_SITE,
                json!({ "id": id }),
            )?)?;
            println!("removed site {id}");
        }
        Commands::Shutdown => {
            parse_data::<bool>(request(&socket, METHOD_SHUTDOWN, Value::Null)?)?;
            println!("daemon shutting down");
        }
    }

    Ok(())
}

/// Accept either a project id or a unique project name.
fn resolve_project(socket: &std::path::Path, id_or_name: &str) -> Result<String> {
    let projects: Vec<Project> = parse_data(
        request(socket, METHOD_GET_PROJECTS, Value::Null)
            .context("failed to list projects from daemon")?,
    )?;

    if projects.iter().any(|p| p.id == id_or_name) {
        return Ok(id_or_name.to_string());
    }

    let mut by_name = projects.iter().filter(|p| p.name == id_or_name);
    match (by_name.next(), by_name.next()) {
        (Some(p), None) => Ok(p.id.clone()),
        (Some(_), Some(_)) => bail!("project name {id_or_name:?} is ambiguous; use its id"),
        (None, _) => bail!("no project with id or name {id_or_name:?}"),
    }
}
