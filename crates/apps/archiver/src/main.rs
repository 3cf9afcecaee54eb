//! archiver - Command-line front end for the mail archive
//!
//! Runs syncs in the foreground, hosts the background scheduler, and prints
//! archived data as JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use archive::gmail::{FileTokenStore, StoredToken, TokenStore};
use archive::{
    ArchiveService, ArchiveSettings, GmailCredentials, SyncRequest, SyncRunId, SyncTarget,
    ThreadSearch,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "archiver", version, about = "Archive a Gmail mailbox locally")]
struct Cli {
    /// Override the data directory from archive.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct OwnerArg {
    /// Mailbox owner (the account's email address)
    #[arg(short, long)]
    owner: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetArg {
    Mail,
    Labels,
    Contacts,
}

impl From<TargetArg> for SyncTarget {
    fn from(target: TargetArg) -> Self {
        match target {
            TargetArg::Mail => SyncTarget::Mail,
            TargetArg::Labels => SyncTarget::Labels,
            TargetArg::Contacts => SyncTarget::Contacts,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run a sync in the foreground
    Sync {
        #[command(flatten)]
        owner: OwnerArg,
        /// Gmail search query, e.g. "older_than:1y"
        #[arg(short, long, default_value = "")]
        query: String,
        #[arg(short, long, value_enum, default_value = "mail")]
        target: TargetArg,
        /// Keep archiving one day at a time once this run finishes
        #[arg(long)]
        daily: bool,
        /// Permanently delete archived messages from Gmail
        #[arg(long)]
        delete_after_archive: bool,
    },
    /// List sync runs, newest first
    Runs {
        #[command(flatten)]
        owner: OwnerArg,
    },
    /// Retry a failed run from its last checkpoint
    Retry { run_id: SyncRunId },
    /// Continue an interrupted run in the foreground
    Resume { run_id: SyncRunId },
    /// Resume interrupted runs and schedule daily windows until killed
    Daemon,
    /// List archived threads, newest first
    Threads {
        #[command(flatten)]
        owner: OwnerArg,
        #[arg(short, long)]
        label: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show a thread with its messages
    Thread {
        #[command(flatten)]
        owner: OwnerArg,
        thread_id: String,
    },
    /// Search archived threads (case-insensitive substring)
    Search {
        #[command(flatten)]
        owner: OwnerArg,
        text: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Write an archived attachment's bytes to a file
    Attachment {
        #[command(flatten)]
        owner: OwnerArg,
        attachment_id: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Entity counts for an owner
    Stats {
        #[command(flatten)]
        owner: OwnerArg,
    },
    Labels {
        #[command(flatten)]
        owner: OwnerArg,
    },
    Contacts {
        #[command(flatten)]
        owner: OwnerArg,
    },
    /// Rebuild a thread's messages from archived raw payloads
    Redecode {
        #[command(flatten)]
        owner: OwnerArg,
        thread_id: String,
    },
    /// Manage stored OAuth tokens
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
}

#[derive(Subcommand)]
enum TokenCommand {
    /// Store a token JSON file ({access_token, refresh_token, expires_at}) for an owner
    Import {
        #[command(flatten)]
        owner: OwnerArg,
        file: PathBuf,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_settings(data_dir: Option<PathBuf>) -> Result<ArchiveSettings> {
    let mut settings = ArchiveSettings::load().context("Failed to load archive settings")?;
    if data_dir.is_some() {
        settings.data_dir = data_dir;
    }
    Ok(settings)
}

fn open_service(settings: ArchiveSettings) -> Result<ArchiveService> {
    let credentials = match GmailCredentials::load() {
        Ok(creds) => creds,
        Err(e) => {
            warn!("Gmail credentials not found ({}); token refresh will fail", e);
            if let Some(path) = config::credentials_path() {
                warn!(
                    "Place your Google OAuth credentials at {} or set GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                    path.display()
                );
            }
            GmailCredentials {
                client_id: String::new(),
                client_secret: String::new(),
            }
        }
    };
    ArchiveService::open(settings, credentials)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    if let Err(e) = run(Cli::parse()) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Token {
        command: TokenCommand::Import { owner, file },
    } = &cli.command
    {
        let token: StoredToken = config::load_json_file(file)?;
        FileTokenStore::default_location()?.save(&owner.owner, &token)?;
        info!("Stored token for {}", owner.owner);
        return Ok(());
    }

    let service = open_service(load_settings(cli.data_dir)?)?;

    match cli.command {
        Command::Sync {
            owner,
            query,
            target,
            daily,
            delete_after_archive,
        } => {
            let mut request = SyncRequest::mail(owner.owner, query);
            request.target = target.into();
            if daily {
                request = request.daily();
            }
            let request = request.delete_after_archive(delete_after_archive);
            let run = service.run_sync_blocking(request)?;
            print_json(&run)?;
        }
        Command::Runs { owner } => print_json(&service.list_sync_runs(&owner.owner)?)?,
        Command::Retry { run_id } => {
            let id = service.retry_sync(run_id)?;
            info!("Retrying run {} as run {}", run_id, id);
            while !service.wait_for_idle(Duration::from_secs(60)) {
                info!("Run {} still in progress", id);
            }
            print_json(&service.get_sync_run(id)?)?;
        }
        Command::Resume { run_id } => print_json(&service.resume_sync_blocking(run_id)?)?,
        Command::Daemon => {
            info!("Starting scheduler");
            service.scheduler().spawn()?.join();
        }
        Command::Threads {
            owner,
            label,
            limit,
            offset,
        } => {
            let threads = match label {
                Some(label) => service.list_threads_by_label(&owner.owner, &label, limit, offset)?,
                None => service.list_threads(&owner.owner, limit, offset)?,
            };
            print_json(&threads)?;
        }
        Command::Thread { owner, thread_id } => {
            match service.get_thread(&owner.owner, &thread_id)? {
                Some(detail) => print_json(&detail)?,
                None => bail!("Thread {} is not archived", thread_id),
            }
        }
        Command::Search {
            owner,
            text,
            from,
            to,
            subject,
            body,
            limit,
        } => {
            let search = ThreadSearch {
                text,
                from,
                to,
                subject,
                body,
            };
            print_json(&service.search_threads(&owner.owner, &search, limit, 0)?)?;
        }
        Command::Attachment {
            owner,
            attachment_id,
            out,
        } => {
            let bytes = service
                .get_attachment_bytes(&owner.owner, &attachment_id)?
                .with_context(|| format!("Attachment {} is not archived", attachment_id))?;
            std::fs::write(&out, &bytes)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            info!("Wrote {} bytes to {}", bytes.len(), out.display());
        }
        Command::Stats { owner } => print_json(&service.stats(&owner.owner)?)?,
        Command::Labels { owner } => print_json(&service.list_labels(&owner.owner)?)?,
        Command::Contacts { owner } => print_json(&service.list_contacts(&owner.owner)?)?,
        Command::Redecode { owner, thread_id } => {
            match service.redecode_thread(&owner.owner, &thread_id)? {
                Some(thread) => print_json(&thread)?,
                None => bail!("No raw messages archived for thread {}", thread_id),
            }
        }
        Command::Token { .. } => {}
    }

    Ok(())
}
