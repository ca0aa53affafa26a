use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

mod api;
mod cache;
mod config;
mod crypto;
mod error;
mod logger;
mod models;
mod session;
mod sync;

use api::ApiClient;
use cache::RecordCache;
use config::{HistoryEntry, HistoryStore};
use models::{Record, RecordDraft};
use session::Session;
use sync::{spawn_search_debouncer, SyncReport, SyncRepository};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Server host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,
    /// Server port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and sync the vault
    Login {
        username: String,
        /// Keep credentials for silent login
        #[arg(long)]
        remember: bool,
    },
    /// Forget stored credentials
    Logout,
    /// Create an account (generates a fresh secret key)
    Signup { username: String },
    /// Generate a random secret key and print it
    GenKey,
    /// Re-sync the vault and print counts
    Refresh,
    /// List groups
    Groups,
    /// List records, all or one group's
    List {
        #[arg(long)]
        group: Option<i64>,
    },
    /// Show one record, including the secret
    Show { id: i64 },
    /// Search titles and usernames; without a term, enter live mode
    Search { term: Option<String> },
    /// Create a group
    AddGroup {
        name: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Rename a group
    RenameGroup {
        id: i64,
        name: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Delete a group and all its records
    RmGroup {
        id: i64,
        #[arg(long)]
        yes: bool,
    },
    /// Create a record
    Add {
        title: String,
        #[arg(long)]
        group: i64,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        link: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Edit a record's fields
    Edit {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        link: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Delete a record
    Rm { id: i64 },
}

type Repo = SyncRepository<ApiClient>;

fn build_repo(host: &str, port: u16) -> Repo {
    let url = config::get_server_url(host, port);
    SyncRepository::new(
        ApiClient::new(url),
        Arc::new(Session::new()),
        RecordCache::new(),
    )
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Failed to read input")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn warn_undecryptable(report: &SyncReport) {
    if !report.undecryptable.is_empty() {
        eprintln!(
            "Warning: {} record(s) could not be decrypted with this key (ids {:?}).",
            report.undecryptable.len(),
            report.undecryptable
        );
    }
}

fn print_report(report: &SyncReport) {
    println!("Synced {} records in {} groups.", report.records, report.groups);
    warn_undecryptable(report);
}

fn print_records(records: &[Record], selected: Option<i64>) {
    if records.is_empty() {
        println!("No records.");
        return;
    }
    for r in records {
        let marker = if selected == Some(r.id) { "*" } else { " " };
        let link = r.link.as_deref().unwrap_or("-");
        println!("{}{:>5}  {:<24} {:<20} {}", marker, r.id, r.title, r.username, link);
    }
}

/// Interactive search: every input line is fed through the debouncer and
/// results print as the cache view re-emits. An empty line exits.
async fn live_search(repo: Repo) -> Result<()> {
    let repo = Arc::new(repo);
    let search_tx = spawn_search_debouncer(Arc::clone(&repo), Duration::from_millis(300));
    let mut views = repo.cache().subscribe();

    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        loop {
            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });

    println!("Live search. Type a term and press enter; an empty line exits.");
    loop {
        tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) if line.is_empty() => break,
                Some(line) => {
                    let _ = search_tx.send(line);
                }
                None => break,
            },
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                if view.search_active {
                    print_records(&view.records, view.selected_record);
                }
            }
        }
    }
    Ok(())
}

/// Sign in from the most recent history entry: token first, password as the
/// fallback when the token has expired.
async fn signed_in(history: &HistoryStore, host: Option<String>, port: Option<u16>) -> Result<Repo> {
    let entry = history
        .last()
        .ok_or_else(|| anyhow!("Not signed in. Run `passkeep login <username>` first."))?;
    if !entry.silently_login {
        return Err(anyhow!(
            "Silent login is disabled for {}. Run `passkeep login {}`.",
            entry.username,
            entry.username
        ));
    }

    let host = host.unwrap_or_else(|| entry.host.clone());
    let port = port.unwrap_or(entry.port);
    let repo = build_repo(&host, port);

    match repo.login_with_token(&entry.token, &entry.secret_key).await {
        Ok(report) => {
            logger::log(&format!(
                "main: silent login via token, {} records in {} groups",
                report.records, report.groups
            ));
            warn_undecryptable(&report);
        }
        Err(e) => {
            logger::log(&format!("main: token login failed ({}), trying password", e));
            let report = repo
                .login(&entry.username, &entry.password, &entry.secret_key)
                .await
                .context("Silent login failed")?;
            warn_undecryptable(&report);
            // Token was stale; remember the fresh one.
            let mut renewed = entry.clone();
            renewed.token = repo.session().token();
            renewed.saved = Utc::now().to_rfc3339();
            let _ = history.push(renewed);
        }
    }
    Ok(repo)
}

async fn handle_login(
    history: &HistoryStore,
    username: String,
    host: String,
    port: u16,
    remember: bool,
) -> Result<()> {
    let password = prompt("Password")?;
    let secret_key = prompt("Secret key (base64)")?;

    let repo = build_repo(&host, port);
    let report = repo.login(&username, &password, &secret_key).await?;
    println!("Signed in as {}.", repo.session().snapshot().username);
    print_report(&report);

    if remember {
        history.push(HistoryEntry {
            username,
            password,
            secret_key,
            host,
            port,
            token: repo.session().token(),
            saved: Utc::now().to_rfc3339(),
            silently_login: true,
        })?;
        println!("Credentials saved for silent login.");
    }
    Ok(())
}

async fn handle_signup(
    history: &HistoryStore,
    username: String,
    host: String,
    port: u16,
) -> Result<()> {
    let password = prompt("Password")?;
    let confirm = prompt("Confirm password")?;
    if password != confirm {
        return Err(anyhow!("Passwords do not match."));
    }

    let secret_key = crypto::generate_key();
    let repo = build_repo(&host, port);
    repo.register(&username, &password, &secret_key).await?;

    println!("Account created for {}.", username);
    println!();
    println!("Your secret key (store it somewhere safe):");
    println!("  {}", secret_key);
    println!("Without this key your records cannot be decrypted, not even by the server.");

    history.push(HistoryEntry {
        username,
        password,
        secret_key,
        host,
        port,
        token: repo.session().token(),
        saved: Utc::now().to_rfc3339(),
        silently_login: true,
    })?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logger::init();
    logger::log(&format!("main: passkeep {} starting", config::APP_VERSION));

    let args = Args::parse();
    let app_config = config::load_config();
    let history = HistoryStore::default_store();

    let host = args.host.clone().unwrap_or(app_config.general.host.clone());
    let port = args.port.unwrap_or(app_config.general.port);

    match args.command {
        Commands::Login { username, remember } => {
            handle_login(&history, username, host, port, remember).await
        }
        Commands::Logout => {
            history.clear()?;
            println!("Signed out. Stored credentials removed.");
            Ok(())
        }
        Commands::Signup { username } => handle_signup(&history, username, host, port).await,
        Commands::GenKey => {
            println!("{}", crypto::generate_key());
            Ok(())
        }
        Commands::Refresh => {
            let repo = signed_in(&history, args.host, args.port).await?;
            let report = repo.refresh().await?;
            print_report(&report);
            Ok(())
        }
        Commands::Groups => {
            let repo = signed_in(&history, args.host, args.port).await?;
            let view = repo.cache().snapshot();
            if view.groups.is_empty() {
                println!("No groups.");
            }
            for g in view.groups.iter() {
                let comment = g.comment.as_deref().unwrap_or("");
                println!("{:>6}  {:<24} {}", g.id, g.display_name(), comment);
            }
            Ok(())
        }
        Commands::List { group } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            match group {
                Some(id) => {
                    repo.cache().select_group(Some(id)).await?;
                    let view = repo.cache().snapshot();
                    if !view.groups.iter().any(|g| Some(g.id) == view.selected_group) {
                        return Err(anyhow!("No group with id {}", id));
                    }
                    print_records(&view.records, view.selected_record);
                }
                None => {
                    let mut all = repo.cache().all_records().await?;
                    all.sort_by_key(|r| r.id);
                    print_records(&all, None);
                }
            }
            Ok(())
        }
        Commands::Show { id } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            let all = repo.cache().all_records().await?;
            let record = all
                .iter()
                .find(|r| r.id == id)
                .ok_or_else(|| anyhow!("No record with id {}", id))?;
            println!("Title:    {}", record.title);
            println!("Username: {}", record.username);
            println!("Secret:   {}", record.secret);
            println!("Link:     {}", record.link.as_deref().unwrap_or("-"));
            println!("Note:     {}", record.note.as_deref().unwrap_or("-"));
            println!("Updated:  {}", record.updated_at);
            Ok(())
        }
        Commands::Search { term } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            match term {
                Some(term) => {
                    repo.search(&term).await?;
                    let view = repo.cache().snapshot();
                    print_records(&view.records, None);
                }
                None => live_search(repo).await?,
            }
            Ok(())
        }
        Commands::AddGroup { name, comment } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            let group = repo.create_group(&name, comment.as_deref()).await?;
            println!("Created group {} ({}).", group.display_name(), group.id);
            Ok(())
        }
        Commands::RenameGroup { id, name, comment } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            match repo.rename_group(id, &name, comment.as_deref()).await? {
                Some(group) => println!("Renamed group {} to {}.", id, group.display_name()),
                None => println!("No group with id {}.", id),
            }
            Ok(())
        }
        Commands::RmGroup { id, yes } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            if !yes {
                let answer = prompt(&format!(
                    "Delete group {} and all of its records? [y/N]",
                    id
                ))?;
                if !answer.eq_ignore_ascii_case("y") {
                    println!("Aborted.");
                    return Ok(());
                }
            }
            match repo.delete_group(id).await? {
                Some(group) => println!("Deleted group {} and its records.", group.display_name()),
                None => println!("No group with id {}.", id),
            }
            Ok(())
        }
        Commands::Add {
            title,
            group,
            username,
            secret,
            link,
            note,
        } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            let secret = match secret {
                Some(secret) => secret,
                None => prompt("Secret")?,
            };
            let draft = RecordDraft {
                group_id: group,
                title,
                username: username.unwrap_or_default(),
                secret,
                link,
                note,
            };
            let record = repo.create_record(draft).await?;
            println!("Created record {} ({}).", record.title, record.id);
            Ok(())
        }
        Commands::Edit {
            id,
            title,
            username,
            secret,
            link,
            note,
        } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            let all = repo.cache().all_records().await?;
            let current = all
                .iter()
                .find(|r| r.id == id)
                .ok_or_else(|| anyhow!("No record with id {}", id))?;

            let draft = RecordDraft {
                group_id: current.group_id,
                title: title.unwrap_or_else(|| current.title.clone()),
                username: username.unwrap_or_else(|| current.username.clone()),
                secret: secret.unwrap_or_else(|| current.secret.clone()),
                link: link.or_else(|| current.link.clone()),
                note: note.or_else(|| current.note.clone()),
            };
            match repo.update_record(id, draft).await? {
                Some(record) => println!("Updated record {} ({}).", record.title, record.id),
                None => println!("No record with id {}.", id),
            }
            Ok(())
        }
        Commands::Rm { id } => {
            let repo = signed_in(&history, args.host, args.port).await?;
            match repo.delete_record(id).await? {
                Some(record) => println!("Deleted record {}.", record.title),
                None => println!("No record with id {}.", id),
            }
            Ok(())
        }
    }
}
