//! cvault: encrypted, deduplicating backups
//!
//! Commands:
//!   backup <dir> --partition <name>        - back up a directory tree
//!   restore <dir> --partition <name>       - restore a partition (optionally under --prefix)
//!   change-password                        - re-wrap the data key under a new password
//!   multi-backup <root>                    - back up each subdirectory as its own partition
//!   list --partition <name>                - show stored metadata entries
//!   config show                            - display current configuration

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cvault_core::config::VaultConfig;
use cvault_core::{path_from_key, prefix_key, FileMetadataEntry, VaultError};
use cvault_crypto::DataKey;
use cvault_engine::{
    BackupOrchestrator, BackupReport, KeyManager, ProgressFn, RestoreOrchestrator, RestoreReport,
};
use cvault_storage::{
    build_stores, check_health, BlobStore, Credentials, EntityStore, OpendalBlobStore,
    OpendalEntityStore, Table,
};

const DEFAULT_CONFIG: &str = "~/.config/cvault/config.toml";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cvault",
    version,
    about = "Encrypted, deduplicating backup to blob storage",
    long_about = "cvault: mirror directory trees into remote blob storage, encrypted \
                  client-side and stored once per unique content"
)]
struct Cli {
    /// Path to config.toml (default: ~/.config/cvault/config.toml)
    #[arg(long, short = 'c', env = "CVAULT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides config; RUST_LOG wins over both)
    #[arg(long, env = "CVAULT_LOG", global = true)]
    log: Option<String>,

    /// Log format (overrides config)
    #[arg(long, env = "CVAULT_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

/// Storage account credentials, shared by every remote command
#[derive(Args, Debug)]
struct StoreArgs {
    /// Storage account name (azblob) or access key id (s3)
    #[arg(long, env = "CVAULT_ACCOUNT")]
    account: Option<String>,

    /// Storage account key (azblob) or secret access key (s3)
    #[arg(long = "accesskey", env = "CVAULT_ACCESS_KEY", hide_env_values = true)]
    access_key: Option<String>,
}

#[derive(Args, Debug)]
struct PasswordArg {
    /// Encryption password (prompted for when omitted)
    #[arg(long, env = "CVAULT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Back up a directory tree into a partition
    Backup {
        /// Directory to back up
        directory: PathBuf,
        /// Backup-set name the metadata is stored under
        #[arg(long)]
        partition: String,
        /// Concurrent file workers (overrides config; 0 = CPU count)
        #[arg(long)]
        workers: Option<usize>,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        password: PasswordArg,
    },

    /// Restore a partition into a directory
    Restore {
        /// Target directory (created if missing)
        directory: PathBuf,
        #[arg(long)]
        partition: String,
        /// Only restore paths starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long)]
        workers: Option<usize>,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        password: PasswordArg,
    },

    /// Re-wrap the data key under a new password
    #[command(name = "change-password")]
    ChangePassword {
        #[arg(long, env = "CVAULT_OLD_PASSWORD", hide_env_values = true)]
        old_password: Option<String>,
        #[arg(long, env = "CVAULT_NEW_PASSWORD", hide_env_values = true)]
        new_password: Option<String>,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Back up every immediate subdirectory of root, each as its own partition
    #[command(name = "multi-backup")]
    MultiBackup {
        root: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        password: PasswordArg,
    },

    /// List metadata entries of a partition
    List {
        #[arg(long)]
        partition: String,
        #[arg(long, default_value = "")]
        prefix: String,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| expand_tilde(Path::new(DEFAULT_CONFIG)));
    let mut config = load_config(&config_path).await?;
    config.storage.root = expand_tilde(&config.storage.root);

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(if config.log.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, format);

    match cli.command {
        Commands::Backup {
            directory,
            partition,
            workers,
            store,
            password,
        } => {
            let session = Session::open(&config, &store).await?;
            let dek = session.unlock(&config, password.password).await?;
            let backup = session.backup_orchestrator(&config, dek, workers);
            let report = run_backup(&backup, &directory, &partition).await?;
            print_backup_summary(&report);
            Ok(())
        }
        Commands::Restore {
            directory,
            partition,
            prefix,
            workers,
            store,
            password,
        } => {
            let session = Session::open(&config, &store).await?;
            let dek = session.unlock_existing(&config, password.password).await?;
            cmd_restore(&session, &config, dek, &directory, &partition, &prefix, workers).await
        }
        Commands::ChangePassword {
            old_password,
            new_password,
            store,
        } => cmd_change_password(&config, &store, old_password, new_password).await,
        Commands::MultiBackup {
            root,
            workers,
            store,
            password,
        } => {
            let session = Session::open(&config, &store).await?;
            let dek = session.unlock(&config, password.password).await?;
            cmd_multi_backup(&session, &config, dek, &root, workers).await
        }
        Commands::List {
            partition,
            prefix,
            store,
        } => {
            let session = Session::open(&config, &store).await?;
            cmd_list(&session, &partition, &prefix).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stderr keeps stdout free for summaries and listings
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn load_config(path: &Path) -> Result<VaultConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(VaultConfig::default())
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

/// Flag value if given, otherwise an interactive prompt.
fn resolve_password(flag: Option<String>, prompt: &str) -> Result<SecretString> {
    match flag {
        Some(p) => Ok(SecretString::from(p)),
        None => {
            let p = rpassword::prompt_password(prompt).context("reading password")?;
            Ok(SecretString::from(p))
        }
    }
}

/// Cancel the token on Ctrl-C so in-flight files finish but no new ones start.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight files");
            child.cancel();
        }
    });
    token
}

// ── Store session ─────────────────────────────────────────────────────────────

/// Blob store and metadata tables opened from config + credentials.
struct Session {
    blobs: Arc<dyn BlobStore>,
    tables: Arc<dyn EntityStore>,
}

impl Session {
    async fn open(config: &VaultConfig, store: &StoreArgs) -> Result<Self> {
        let creds = Credentials {
            account: store.account.clone().or_else(|| config.storage.account.clone()),
            access_key: store.access_key.clone(),
        };
        let ops = build_stores(&config.storage, &creds).context("building storage operators")?;
        check_health(&ops.tables)
            .await
            .context("metadata store is unreachable")?;
        Ok(Self {
            blobs: Arc::new(OpendalBlobStore::new(ops.blobs)),
            tables: Arc::new(OpendalEntityStore::new(ops.tables)),
        })
    }

    fn keys(&self) -> KeyManager {
        KeyManager::new(Arc::clone(&self.tables))
    }

    fn files(&self) -> Table<FileMetadataEntry> {
        Table::new(Arc::clone(&self.tables))
    }

    /// Unwrap the data key, creating it on first use.
    async fn unlock(&self, config: &VaultConfig, password: Option<String>) -> Result<Arc<DataKey>> {
        let password = resolve_password(password, "Password: ")?;
        let dek = self
            .keys()
            .load_or_create(&config.crypto.key_name, &password)
            .await
            .with_context(|| format!("unlocking key '{}'", config.crypto.key_name))?;
        Ok(Arc::new(dek))
    }

    /// Unwrap an existing data key; restoring never creates one.
    async fn unlock_existing(
        &self,
        config: &VaultConfig,
        password: Option<String>,
    ) -> Result<Arc<DataKey>> {
        let password = resolve_password(password, "Password: ")?;
        let dek = self
            .keys()
            .load(&config.crypto.key_name, &password)
            .await
            .with_context(|| format!("unlocking key '{}'", config.crypto.key_name))?;
        Ok(Arc::new(dek))
    }

    fn backup_orchestrator(
        &self,
        config: &VaultConfig,
        dek: Arc<DataKey>,
        workers: Option<usize>,
    ) -> BackupOrchestrator {
        BackupOrchestrator::new(Arc::clone(&self.blobs), self.files(), dek)
            .with_workers(resolve_workers(config, workers))
            .with_excludes(&config.backup.exclude_patterns)
    }
}

fn resolve_workers(config: &VaultConfig, flag: Option<usize>) -> usize {
    let mut backup = config.backup.clone();
    if let Some(n) = flag {
        backup.workers = n;
    }
    backup.effective_workers()
}

// ── Progress ──────────────────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_callback(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |done, total, msg| {
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(msg.replace('|', "/"));
    })
}

// ── `cvault backup` / `cvault multi-backup` ───────────────────────────────────

async fn run_backup(
    backup: &BackupOrchestrator,
    directory: &Path,
    partition: &str,
) -> Result<BackupReport> {
    println!("Backing up {} → partition '{}'", directory.display(), partition);

    let pb = make_progress_bar("backup");
    let progress = progress_callback(&pb);
    let cancel = cancel_on_ctrl_c();

    let report = backup
        .run(directory, partition, &cancel, Some(&progress))
        .await
        .with_context(|| format!("backing up {}", directory.display()));
    pb.finish_and_clear();
    report
}

async fn cmd_multi_backup(
    session: &Session,
    config: &VaultConfig,
    dek: Arc<DataKey>,
    root: &Path,
    workers: Option<usize>,
) -> Result<()> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("reading directory: {}", root.display()))?;

    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading directory: {}", root.display()))?
    {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let backup = session.backup_orchestrator(config, dek, workers);
    let mut failed_sets = Vec::new();
    for dir in &dirs {
        let Some(partition) = dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        match run_backup(&backup, dir, &partition).await {
            Ok(report) => {
                print_backup_summary(&report);
                if report.cancelled {
                    break;
                }
            }
            Err(e) => {
                if e.downcast_ref::<VaultError>().is_some_and(VaultError::is_fatal) {
                    return Err(e);
                }
                warn!(partition = %partition, "backup set failed: {e:#}");
                failed_sets.push(partition);
            }
        }
    }

    info!(sets = dirs.len(), failed = failed_sets.len(), "multi-backup finished");
    if !failed_sets.is_empty() {
        anyhow::bail!("backup failed for: {}", failed_sets.join(", "));
    }
    Ok(())
}

fn print_backup_summary(r: &BackupReport) {
    println!();
    println!("Backup of '{}' {}", r.partition, if r.cancelled { "cancelled" } else { "complete" });
    println!(
        "  files:       {} ({} uploaded, {} deduplicated, {} unchanged, {} failed)",
        r.processed,
        r.uploaded,
        r.deduplicated,
        r.unchanged,
        r.failed.len()
    );
    println!("  hashed:      {}", r.hashed);
    println!("  transferred: {}", fmt_bytes(r.bytes_transferred));
    println!("  elapsed:     {:.1}s", r.elapsed.as_secs_f64());
    println!("  throughput:  {}/s", fmt_bytes(r.throughput() as u64));
    for f in &r.failed {
        println!("  FAILED {}: {}", f.path_key.replace('|', "/"), f.error);
    }
}

// ── `cvault restore` ──────────────────────────────────────────────────────────

async fn cmd_restore(
    session: &Session,
    config: &VaultConfig,
    dek: Arc<DataKey>,
    directory: &Path,
    partition: &str,
    prefix: &str,
    workers: Option<usize>,
) -> Result<()> {
    println!(
        "Restoring partition '{}'{} → {}",
        partition,
        if prefix.is_empty() {
            String::new()
        } else {
            format!(" (prefix {prefix})")
        },
        directory.display()
    );

    let restore = RestoreOrchestrator::new(Arc::clone(&session.blobs), session.files(), dek)
        .with_workers(resolve_workers(config, workers));
    let pb = make_progress_bar("restore");
    let progress = progress_callback(&pb);
    let cancel = cancel_on_ctrl_c();

    let report = restore
        .run(directory, partition, prefix, &cancel, Some(&progress))
        .await
        .with_context(|| format!("restoring into {}", directory.display()));
    pb.finish_and_clear();
    print_restore_summary(&report?);
    Ok(())
}

fn print_restore_summary(r: &RestoreReport) {
    println!();
    println!("Restore of '{}' {}", r.partition, if r.cancelled { "cancelled" } else { "complete" });
    println!(
        "  files:       {} ({} restored, {} skipped, {} failed)",
        r.processed,
        r.downloaded,
        r.skipped,
        r.failed.len()
    );
    println!("  written:     {}", fmt_bytes(r.bytes_transferred));
    println!("  elapsed:     {:.1}s", r.elapsed.as_secs_f64());
    println!("  throughput:  {}/s", fmt_bytes(r.throughput() as u64));
    for f in &r.failed {
        println!("  FAILED {}: {}", f.path_key.replace('|', "/"), f.error);
    }
}

// ── `cvault change-password` ──────────────────────────────────────────────────

async fn cmd_change_password(
    config: &VaultConfig,
    store: &StoreArgs,
    old_password: Option<String>,
    new_password: Option<String>,
) -> Result<()> {
    let session = Session::open(config, store).await?;
    let old = resolve_password(old_password, "Current password: ")?;
    let new = match new_password {
        Some(p) => SecretString::from(p),
        None => {
            let first = rpassword::prompt_password("New password: ").context("reading password")?;
            let again =
                rpassword::prompt_password("Repeat new password: ").context("reading password")?;
            if first != again {
                anyhow::bail!("new passwords do not match");
            }
            SecretString::from(first)
        }
    };

    let key_name = &config.crypto.key_name;
    session
        .keys()
        .rotate_password(key_name, &old, &new)
        .await
        .with_context(|| format!("changing password for key '{key_name}'"))?;
    println!("Password changed for key '{key_name}'");
    Ok(())
}

// ── `cvault list` ─────────────────────────────────────────────────────────────

async fn cmd_list(session: &Session, partition: &str, prefix: &str) -> Result<()> {
    let rows = session
        .files()
        .query_prefix(partition, &prefix_key(prefix))
        .await
        .with_context(|| format!("listing partition '{partition}'"))?;

    let mut total = 0u64;
    for (key, entry) in &rows {
        let display = path_from_key(key)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| key.clone());
        println!(
            "{}  {:>10}  {}  {}",
            &entry.hash[..16.min(entry.hash.len())],
            fmt_bytes(entry.size),
            entry.modified_date.format("%Y-%m-%d %H:%M:%S"),
            display
        );
        total += entry.size;
    }
    println!("{} entries, {}", rows.len(), fmt_bytes(total));
    Ok(())
}

// ── `cvault config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &VaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_backup_flags() {
        let cli = Cli::try_parse_from([
            "cvault",
            "backup",
            "/data/photos",
            "--account",
            "acct",
            "--accesskey",
            "key",
            "--password",
            "pw",
            "--partition",
            "photos",
        ])
        .unwrap();
        match cli.command {
            Commands::Backup {
                directory,
                partition,
                store,
                password,
                ..
            } => {
                assert_eq!(directory, PathBuf::from("/data/photos"));
                assert_eq!(partition, "photos");
                assert_eq!(store.account.as_deref(), Some("acct"));
                assert_eq!(store.access_key.as_deref(), Some("key"));
                assert_eq!(password.password.as_deref(), Some("pw"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn restore_prefix_defaults_to_empty() {
        let cli =
            Cli::try_parse_from(["cvault", "restore", "/tmp/out", "--partition", "p"]).unwrap();
        match cli.command {
            Commands::Restore { prefix, .. } => assert_eq!(prefix, ""),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn backup_requires_partition() {
        assert!(Cli::try_parse_from(["cvault", "backup", "/data"]).is_err());
    }

    #[test]
    fn fmt_bytes_units() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn expand_tilde_uses_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/.config/cvault/config.toml")),
            PathBuf::from(home).join(".config/cvault/config.toml")
        );
        assert_eq!(expand_tilde(Path::new("/etc/x")), PathBuf::from("/etc/x"));
    }
}
