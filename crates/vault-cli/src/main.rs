//! Command-line front end for the local secrets vault
//!
//! Every command opens the database, authenticates when it needs secrets and
//! logs out before exiting. Nothing is kept between invocations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vault_core::generator::{self, CharacterClass, StrengthLabel};
use vault_core::{
    ConfigManager, SchemaMigrator, SecretId, SecretUpdate, SessionId, SqliteStorage, Vault,
    VaultConfig,
};

/// Local secrets vault
#[derive(Parser, Debug)]
#[command(name = "vault")]
#[command(author = "Symbia Labs")]
#[command(version)]
#[command(about = "Local secrets vault - encrypted per-principal secret storage")]
struct Args {
    /// Database file (defaults to the configured path, then the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory holding config.json
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Principal to act as
    #[arg(long, short, global = true, env = "VAULT_USER")]
    user: Option<String>,

    /// Master secret; prompted for when not set
    #[arg(long, global = true, env = "VAULT_MASTER_SECRET", hide_env_values = true)]
    master_secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a principal
    Init,

    /// Store a new secret
    Add {
        /// Site or service, e.g. github.com
        label: String,
        /// Username on that service
        account: String,
        #[arg(long)]
        note: Option<String>,
        /// Generate a secret of this length instead of prompting
        #[arg(long, value_name = "LENGTH")]
        generate: Option<usize>,
    },

    /// Print a secret
    Get {
        id: SecretId,
        /// Also print the note
        #[arg(long)]
        note: bool,
    },

    /// List secrets whose label or account contains QUERY
    Search {
        query: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Change fields of a secret
    Update {
        id: SecretId,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        account: Option<String>,
        /// Prompt for a new secret value
        #[arg(long)]
        secret: bool,
        #[arg(long, conflicts_with = "clear_note")]
        note: Option<String>,
        #[arg(long)]
        clear_note: bool,
    },

    /// Delete a secret
    Rm { id: SecretId },

    /// Change the master secret
    Passwd,

    /// Print a random secret
    Generate {
        #[arg(long, short, default_value = "20")]
        length: usize,
        #[arg(long)]
        no_lowercase: bool,
        #[arg(long)]
        no_uppercase: bool,
        #[arg(long)]
        no_digits: bool,
        #[arg(long)]
        no_symbols: bool,
    },

    /// Score a secret read from the prompt
    Strength,

    /// Show the schema version and apply pending migrations
    Migrate {
        /// Only report, do not migrate
        #[arg(long)]
        status: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match &args.command {
        Command::Generate {
            length,
            no_lowercase,
            no_uppercase,
            no_digits,
            no_symbols,
        } => {
            let excluded = [*no_lowercase, *no_uppercase, *no_digits, *no_symbols];
            let classes: Vec<CharacterClass> = CharacterClass::ALL
                .into_iter()
                .zip(excluded)
                .filter(|(_, skip)| !skip)
                .map(|(class, _)| class)
                .collect();
            let secret = generator::generate(*length, &classes)?;
            println!("{}", secret.expose());
            return Ok(());
        }
        Command::Strength => {
            let secret = rpassword::prompt_password("Secret to score: ")?;
            let score = generator::score(&secret);
            println!(
                "{} (score {:.2}, ~{:.0} bits)",
                StrengthLabel::from_score(score),
                score,
                generator::estimate_entropy(&secret)
            );
            return Ok(());
        }
        Command::Migrate { status } => return migrate(&args, *status).await,
        _ => {}
    }

    let vault = open_vault(&args).await?;
    let user = args
        .user
        .as_deref()
        .context("no principal given (use --user or VAULT_USER)")?;

    if let Command::Init = args.command {
        let secret = new_master_secret(&args)?;
        let principal = vault.create_principal(user, secret).await?;
        println!("Created principal {user} ({principal})");
        return Ok(());
    }

    let master = master_secret(&args, "Master secret: ")?;
    let session = vault
        .authenticate(user, master)
        .await
        .context("authentication failed")?;

    let outcome = run(&args, &vault, session).await;
    vault.logout(session).await?;
    vault.shutdown().await;
    outcome
}

async fn run(args: &Args, vault: &Vault, session: SessionId) -> Result<()> {
    match &args.command {
        Command::Add {
            label,
            account,
            note,
            generate,
        } => {
            let secret = match generate {
                Some(length) => generator::generate(*length, &CharacterClass::ALL)?.into_inner(),
                None => rpassword::prompt_password("Secret: ")?,
            };
            if generate.is_none() {
                warn_if_weak(&secret);
            }
            let id = vault
                .create_secret(session, label, account, &secret, note.as_deref())
                .await?;
            println!("{id}");
        }
        Command::Get { id, note } => {
            if *note {
                let entry = vault.read_entry(session, *id).await?;
                println!("{}", entry.secret.expose());
                if let Some(note) = entry.note {
                    println!("{}", note.expose());
                }
            } else {
                println!("{}", vault.read_secret(session, *id).await?.expose());
            }
        }
        Command::Search { query, json } => {
            let summaries = vault
                .search_secrets(session, query.as_deref().unwrap_or(""))
                .await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                for summary in &summaries {
                    println!(
                        "{}  {:<32} {}{}",
                        summary.id,
                        summary.label,
                        summary.account_identifier,
                        if summary.has_note { "  [note]" } else { "" }
                    );
                }
            }
        }
        Command::Update {
            id,
            label,
            account,
            secret,
            note,
            clear_note,
        } => {
            let mut update = SecretUpdate::new();
            if let Some(label) = label {
                update = update.label(label.as_str());
            }
            if let Some(account) = account {
                update = update.account_identifier(account.as_str());
            }
            if *secret {
                let value = rpassword::prompt_password("New secret: ")?;
                warn_if_weak(&value);
                update = update.secret(&value);
            }
            if let Some(note) = note {
                update = update.note(note);
            }
            if *clear_note {
                update = update.clear_note();
            }
            if update.is_empty() {
                bail!("nothing to update");
            }
            vault.update_secret(session, *id, update).await?;
            println!("Updated {id}");
        }
        Command::Rm { id } => {
            vault.delete_secret(session, *id).await?;
            println!("Deleted {id}");
        }
        Command::Passwd => {
            let secret = new_master_secret(args)?;
            vault.change_master_secret(session, secret).await?;
            println!("Master secret changed");
        }
        Command::Init
        | Command::Generate { .. }
        | Command::Strength
        | Command::Migrate { .. } => bail!("command does not take a session"),
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<VaultConfig> {
    let dir = match &args.config_dir {
        Some(dir) => dir.clone(),
        None => match ConfigManager::default_dir() {
            Some(dir) => dir,
            None => return Ok(VaultConfig::default()),
        },
    };
    Ok(ConfigManager::load(&dir)?.get().clone())
}

fn database_path(args: &Args, config: &VaultConfig) -> Result<PathBuf> {
    if let Some(path) = args.db.clone().or_else(|| config.database_path.clone()) {
        return Ok(path);
    }
    Ok(SqliteStorage::default_path()?)
}

async fn open_vault(args: &Args) -> Result<Vault> {
    let config = load_config(args)?;
    let path = database_path(args, &config)?;
    let storage = SqliteStorage::open(&path)
        .with_context(|| format!("cannot open database {}", path.display()))?;
    info!("Using database {}", path.display());
    Ok(Vault::open(Arc::new(storage), config).await?)
}

async fn migrate(args: &Args, status_only: bool) -> Result<()> {
    let config = load_config(args)?;
    let path = database_path(args, &config)?;
    let storage = SqliteStorage::open(&path)
        .with_context(|| format!("cannot open database {}", path.display()))?;
    let migrator = SchemaMigrator::default();

    let status = migrator.status(&storage).await?;
    println!("Schema version {} of {}", status.current, status.latest);
    for (version, name) in &status.pending {
        println!("  pending: {version} {name}");
    }

    if !status_only && !status.is_ready() {
        let version = migrator.migrate_to_latest(&storage).await?;
        println!("Migrated to version {version}");
    }
    Ok(())
}

fn master_secret(args: &Args, prompt: &str) -> Result<String> {
    match &args.master_secret {
        Some(secret) => Ok(secret.clone()),
        None => Ok(rpassword::prompt_password(prompt)?),
    }
}

/// Prompt twice for a new master secret
fn new_master_secret(args: &Args) -> Result<String> {
    if args.master_secret.is_some() && matches!(args.command, Command::Init) {
        return master_secret(args, "");
    }
    let first = rpassword::prompt_password("New master secret: ")?;
    let second = rpassword::prompt_password("Repeat master secret: ")?;
    if first != second {
        bail!("master secrets do not match");
    }
    warn_if_weak(&first);
    Ok(first)
}

fn warn_if_weak(secret: &str) {
    let label = StrengthLabel::of(secret);
    if label <= StrengthLabel::Weak {
        eprintln!("warning: this secret is {label}");
    }
}
