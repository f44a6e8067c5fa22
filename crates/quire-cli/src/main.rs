//! Quire CLI
//!
//! Command-line interface for Quire - local-first writing projects that
//! sync with a Quire server when one is reachable.

use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quire_core::{Config, ContextRegistry, KvStore, SqliteKvStore};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "quire")]
#[command(about = "Quire - Local-first writing projects")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage storage contexts (servers and local-only mode)
    #[command(alias = "ctx")]
    Context {
        #[command(subcommand)]
        command: Option<ContextCommands>,
    },
    /// Manage projects in the active context
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Show the active context and pending changes
    Status,
    /// Copy projects from the active context into another one
    Migrate {
        /// Target context (id or display name)
        #[arg(long)]
        to: String,
        /// Owner of the migrated projects (defaults to the target's signed-in user)
        #[arg(long)]
        owner: Option<String>,
        /// Only migrate these projects (owner/slug); repeatable
        #[arg(short, long = "project")]
        projects: Vec<String>,
        /// Give a project a new slug in the target: owner/slug=new-slug
        #[arg(long)]
        rename: Vec<String>,
    },
    /// Reconcile the active remote context with its server
    Sync {
        /// Keep running and reconcile whenever the server becomes reachable
        #[arg(long)]
        watch: bool,
        /// Seconds between reachability checks in watch mode
        #[arg(long, default_value_t = 30, requires = "watch")]
        interval: u64,
    },
    /// Store a session token for the active remote context
    Login {
        /// Bearer token issued by the server
        token: String,
    },
    /// Forget the session token of the active remote context
    Logout,
}

#[derive(Subcommand)]
enum ContextCommands {
    /// List all contexts
    #[command(alias = "ls")]
    List,
    /// Register a server endpoint
    Add {
        /// Server URL (http, https, ws or wss)
        endpoint: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
        /// Switch to the new context immediately
        #[arg(long)]
        activate: bool,
    },
    /// Switch the active context
    Use {
        /// Context id or display name
        id: String,
    },
    /// Remove a server context (its stored records are kept)
    #[command(alias = "rm")]
    Remove {
        /// Context id or display name
        id: String,
    },
    /// Fetch profile and version information from the active server
    Refresh,
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// List projects
    #[command(alias = "ls")]
    List,
    /// Show project details
    Show {
        /// Project key (owner/slug)
        key: String,
    },
    /// Create a project
    #[command(alias = "add")]
    Create {
        /// Project slug
        slug: String,
        /// Project title
        #[arg(short = 'T', long)]
        title: String,
        /// Project description
        #[arg(short, long)]
        description: Option<String>,
        /// Template to create the project from
        #[arg(long)]
        template: Option<String>,
        /// Owner (defaults to the signed-in user, or the local owner)
        #[arg(long)]
        owner: Option<String>,
    },
    /// Edit project metadata
    Edit {
        /// Project key (owner/slug)
        key: String,
        /// New title
        #[arg(short = 'T', long)]
        title: Option<String>,
        /// New description
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Attach a media file to a project
    Attach {
        /// Project key (owner/slug)
        key: String,
        /// File to attach
        file: std::path::PathBuf,
        /// MIME type of the file
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
    },
    /// Delete a project
    #[command(alias = "rm")]
    Delete {
        /// Project key (owner/slug)
        key: String,
    },
}

/// Everything a command needs from the environment
pub struct App {
    pub config: Config,
    pub kv: Arc<dyn KvStore>,
    pub registry: ContextRegistry,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let db_path = config.database_path();
        let kv: Arc<dyn KvStore> = Arc::new(
            SqliteKvStore::open(&db_path)
                .with_context(|| format!("Failed to open record store at {:?}", db_path))?,
        );
        let registry =
            ContextRegistry::open(kv.clone()).context("Failed to load storage contexts")?;
        Ok(Self {
            config,
            kv,
            registry,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config);

    let mut app = App::open(config)?;

    match cli.command {
        Commands::Context { command } => handle_context_command(command, &mut app, &output).await,
        Commands::Project { command } => handle_project_command(command, &app, &output),
        Commands::Status => commands::status::show(&app, &output),
        Commands::Migrate {
            to,
            owner,
            projects,
            rename,
        } => commands::migrate::migrate(&app, &to, owner, projects, rename, &output),
        Commands::Sync { watch, interval } => {
            if watch {
                commands::sync::watch(&app, interval, &output).await
            } else {
                commands::sync::sync(&app, &output).await
            }
        }
        Commands::Login { token } => commands::login::login(&app, &token, &output),
        Commands::Logout => commands::login::logout(&app, &output),
    }
}

async fn handle_context_command(
    command: Option<ContextCommands>,
    app: &mut App,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ContextCommands::List) | None => commands::context::list(app, output),
        Some(ContextCommands::Add {
            endpoint,
            name,
            activate,
        }) => commands::context::add(app, &endpoint, name.as_deref(), activate, output),
        Some(ContextCommands::Use { id }) => commands::context::switch(app, &id, output),
        Some(ContextCommands::Remove { id }) => commands::context::remove(app, &id, output),
        Some(ContextCommands::Refresh) => commands::context::refresh(app, output).await,
    }
}

fn handle_project_command(command: ProjectCommands, app: &App, output: &Output) -> Result<()> {
    match command {
        ProjectCommands::List => commands::project::list(app, output),
        ProjectCommands::Show { key } => commands::project::show(app, &key, output),
        ProjectCommands::Create {
            slug,
            title,
            description,
            template,
            owner,
        } => commands::project::create(app, &slug, title, description, template, owner, output),
        ProjectCommands::Edit {
            key,
            title,
            description,
        } => commands::project::edit(app, &key, title, description, output),
        ProjectCommands::Attach { key, file, mime } => {
            commands::project::attach(app, &key, &file, &mime, output)
        }
        ProjectCommands::Delete { key } => commands::project::delete(app, &key, output),
    }
}

/// Initialize logging
///
/// Only initializes if QUIRE_LOG is set (e.g. `QUIRE_LOG=debug`).
/// Logs go to `config.log_file` when configured, otherwise to stderr so they
/// never mix with command output.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("QUIRE_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!("quire_core={},quire={}", log_level, log_level));

    if let Some(ref log_path) = config.log_file {
        match File::options().create(true).append(true).open(log_path) {
            Ok(log_file) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(log_file)
                    .try_init();
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            }
        }
        return;
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
