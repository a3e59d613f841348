use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "caseflow")]
#[command(about = "Case lifecycle operator tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the transition graph with the capability each edge requires
    Graph {
        /// Only edges leaving this status (operator label, e.g. "Case Booked")
        #[arg(long)]
        from: Option<String>,

        /// Emit JSON instead of one edge per line
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> tenant -> overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Validate typed settings and report config keys nothing reads
    ConfigCheck {
        #[arg(required = true)]
        paths: Vec<String>,

        /// Fail when the config carries unused keys
        #[arg(long, default_value_t = false)]
        strict: bool,
    },

    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Ledger journal utilities
    Journal {
        #[command(subcommand)]
        cmd: JournalCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum JournalCmd {
    /// Check sequence continuity and the hash chain of a JSONL journal
    Verify { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // dev-time .env.local bootstrap; absent file is fine
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Graph { from, json } => commands::graph::print_graph(from.as_deref(), json)?,

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = caseflow_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::ConfigCheck { paths, strict } => commands::config::check(&paths, strict)?,

        Commands::Db { cmd } => {
            let pool = caseflow_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = caseflow_db::status(&pool).await?;
                    println!("db_ok={} has_cases_table={}", s.ok, s.has_cases_table);
                }
                DbCmd::Migrate => {
                    caseflow_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Journal { cmd } => match cmd {
            JournalCmd::Verify { path } => commands::journal::verify(&path)?,
        },
    }

    Ok(())
}
