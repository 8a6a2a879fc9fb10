use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vaultsync_core::access::FileAccessLog;
use vaultsync_core::audit::get_audit_log_dir;
use vaultsync_core::sync::DirectoryTransport;
use vaultsync_core::{
    ensure_data_dir, get_default_config_path, AccessTracker, AccessType, AuditEventType,
    AuditLogger, ConflictRecord, EntryDraft, EntryKind, EntryStore, KdfParams, Resolution,
    Settings, SyncEngine, SyncReport, VaultEntry,
};
use zeroize::Zeroizing;

const PASSPHRASE_ENV: &str = "VAULTSYNC_PASSPHRASE";

/// Fields never printed unless asked for.
const SENSITIVE_FIELDS: &[&str] = &["password", "secret", "pin", "cvv", "number", "totp"];

/// VaultSync - encrypted credential vault with multi-device sync
#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(about = "Local-first encrypted credential vault", long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Vault database override
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault and settings file
    Init {
        /// Folder shared with other devices
        #[arg(long)]
        remote_dir: Option<PathBuf>,

        /// Human-readable name for this device
        #[arg(long)]
        device_name: Option<String>,
    },

    /// Add an entry
    Add {
        #[arg(long, value_enum, default_value_t = KindArg::Login)]
        kind: KindArg,

        /// Field as name=value, repeatable
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,

        #[arg(short, long = "tag")]
        tags: Vec<String>,

        #[arg(long)]
        folder: Option<Uuid>,
    },

    /// List live entries
    List {
        #[arg(long)]
        folder: Option<Uuid>,

        #[arg(long)]
        tag: Option<String>,
    },

    /// Show one entry
    Show {
        id: Uuid,

        /// Print sensitive fields in plain text
        #[arg(long)]
        reveal: bool,
    },

    /// Change fields of an entry
    Edit {
        id: Uuid,

        /// Field as name=value, repeatable; an empty value clears it
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,

        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Fail if the entry changed since this version
        #[arg(long)]
        expected_version: Option<u64>,
    },

    /// Delete an entry
    Delete {
        id: Uuid,

        #[arg(long)]
        expected_version: Option<u64>,
    },

    /// Bring back a deleted entry with new content
    Undelete {
        id: Uuid,

        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Manage folders
    Folder {
        #[command(subcommand)]
        command: FolderCommands,
    },

    /// Synchronize with the shared folder
    Sync,

    /// Show conflicts a sync would report, without changing anything
    Conflicts,

    /// Settle a conflict
    Resolve {
        id: Uuid,

        #[arg(long, value_enum)]
        keep: KeepArg,
    },

    /// Report bursts of access to single entries
    Anomalies,

    /// Remove old tombstones every device has seen
    Purge,

    /// Show the audit trail
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        min_severity: u8,
    },
}

#[derive(Subcommand)]
enum FolderCommands {
    Add { name: String },
    Rename { id: Uuid, name: String },
    Delete { id: Uuid },
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Login,
    Note,
    Card,
    Identity,
}

impl From<KindArg> for EntryKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Login => EntryKind::Login,
            KindArg::Note => EntryKind::Note,
            KindArg::Card => EntryKind::Card,
            KindArg::Identity => EntryKind::Identity,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KeepArg {
    Local,
    Remote,
}

fn parse_field(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    if name.trim().is_empty() {
        return Err("field name must not be empty".to_string());
    }
    Ok((name.trim().to_string(), value.to_string()))
}

/// Everything a command needs once the vault is unlocked.
/// Best effort: a broken audit log must not mask the unlock error.
fn record_failed_unlock(log_dir: &Path) -> bool {
    let logged = AuditLogger::new(log_dir)
        .and_then(|audit| audit.log(AuditEventType::VaultUnlocked { success: false }, ""));
    if let Err(audit_err) = &logged {
        warn!("Failed to record failed unlock: {}", audit_err);
    }
    logged.is_ok()
}

struct Session {
    settings: Settings,
    store: Arc<EntryStore>,
    tracker: Arc<AccessTracker>,
    audit: Arc<AuditLogger>,
}

impl Session {
    fn open(settings: Settings) -> Result<Self> {
        let passphrase = read_passphrase("Vault passphrase: ")?;
        let store = match EntryStore::open(&settings.vault_path, passphrase.as_bytes()) {
            Ok(store) => store,
            Err(e) => {
                record_failed_unlock(&get_audit_log_dir());
                return Err(e).with_context(|| {
                    format!("failed to open vault at {}", settings.vault_path.display())
                });
            }
        };

        let audit = Arc::new(AuditLogger::new(&get_audit_log_dir())?.with_device(store.device_id()));
        audit.log(AuditEventType::VaultUnlocked { success: true }, "")?;

        let access_log = FileAccessLog::open(ensure_data_dir()?.join("access.log"))?;
        let tracker = Arc::new(AccessTracker::new(
            Box::new(access_log),
            settings.anomaly_config(),
        ));
        let store = Arc::new(store.with_access_tracker(tracker.clone()));

        Ok(Self {
            settings,
            store,
            tracker,
            audit,
        })
    }

    fn engine(&self) -> Result<SyncEngine> {
        let remote_dir = self
            .settings
            .remote_dir
            .clone()
            .ok_or_else(|| anyhow!("no remote_dir configured; set it in the settings file"))?;
        Ok(SyncEngine::new(
            self.store.clone(),
            Arc::new(DirectoryTransport::new(remote_dir)),
            self.settings.sync_options(),
        )
        .with_audit(self.audit.clone()))
    }
}

fn read_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        return Ok(Zeroizing::new(value));
    }
    Ok(Zeroizing::new(rpassword::prompt_password(prompt)?))
}

fn read_new_passphrase() -> Result<Zeroizing<String>> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        return Ok(Zeroizing::new(value));
    }
    let first = Zeroizing::new(rpassword::prompt_password("New vault passphrase: ")?);
    let second = Zeroizing::new(rpassword::prompt_password("Repeat passphrase: ")?);
    if *first != *second {
        bail!("passphrases do not match");
    }
    if first.is_empty() {
        bail!("passphrase must not be empty");
    }
    Ok(first)
}

fn actor() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "cli".to_string())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn print_entry(entry: &VaultEntry, reveal: bool) {
    println!("{}  [{}]  v{} by {}", entry.id, entry.kind.as_str(), entry.version, entry.device_id);
    for (name, value) in &entry.fields {
        let Some(value) = value.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };
        if reveal || !SENSITIVE_FIELDS.contains(&name.as_str()) {
            println!("    {}: {}", name, value);
        } else {
            println!("    {}: ********", name);
        }
    }
    if !entry.tags.is_empty() {
        let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
        println!("    tags: {}", tags.join(", "));
    }
    if let Some(folder) = entry.folder_id {
        println!("    folder: {}", folder);
    }
}

fn print_summary(entry: &VaultEntry) {
    let label = entry
        .field("title")
        .or_else(|| entry.field("username"))
        .or_else(|| entry.field("name"))
        .unwrap_or("-");
    println!("{}  {:<8}  {}", entry.id, entry.kind.as_str(), label);
}

fn print_conflict(conflict: &ConflictRecord) {
    println!(
        "{}  {:?} ({})  local v{}  remote v{}  fields: {}",
        conflict.entry_id,
        conflict.kind,
        conflict.strategy,
        conflict.local_version.map_or("-".to_string(), |v| v.to_string()),
        conflict.remote_version.map_or("-".to_string(), |v| v.to_string()),
        conflict.unresolved_fields.join(", ")
    );
}

fn print_report(report: &SyncReport) {
    println!(
        "Sync finished: {} entries, {} conflicts, local {}, {}",
        report.entry_count,
        report.conflicts.len(),
        if report.local_changed { "updated" } else { "unchanged" },
        if report.uploaded {
            "published"
        } else {
            "nothing published"
        }
    );
    for conflict in &report.conflicts {
        print_conflict(conflict);
    }
    if report.pending().next().is_some() {
        println!("Run `vaultsync resolve <id> --keep local|remote` to settle pending conflicts.");
    }
}

fn load_settings(cli: &Cli) -> Result<(PathBuf, Settings)> {
    let path = cli.config.clone().unwrap_or_else(get_default_config_path);
    let mut settings = Settings::load(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    if let Some(vault) = &cli.vault {
        settings.vault_path = vault.clone();
    }
    Ok((path, settings))
}

fn init(
    settings_path: &Path,
    mut settings: Settings,
    remote_dir: Option<PathBuf>,
    device_name: Option<String>,
) -> Result<()> {
    if settings.vault_path.exists() {
        bail!("a vault already exists at {}", settings.vault_path.display());
    }
    if settings.device_id.is_empty() {
        settings.device_id = Uuid::new_v4().to_string();
    }
    if let Some(dir) = remote_dir {
        settings.remote_dir = Some(dir);
    }
    if let Some(name) = device_name {
        settings.device_name = name;
    }
    if let Some(parent) = settings.vault_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let passphrase = read_new_passphrase()?;
    EntryStore::create_vault(
        &settings.vault_path,
        &settings.device_id,
        passphrase.as_bytes(),
        KdfParams::new(),
    )?;
    settings.save(settings_path)?;

    let audit = AuditLogger::new(&get_audit_log_dir())?.with_device(settings.device_id.as_str());
    audit.log(AuditEventType::VaultCreated, &settings.device_name)?;

    info!(device_id = %settings.device_id, "Vault initialized");
    println!("Created vault at {}", settings.vault_path.display());
    println!("Settings written to {}", settings_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (settings_path, settings) = load_settings(&cli)?;

    let command = match cli.command {
        Commands::Init {
            remote_dir,
            device_name,
        } => return init(&settings_path, settings, remote_dir, device_name),
        command => command,
    };

    let session = Session::open(settings)?;
    run(&session, command).await
}

async fn run(session: &Session, command: Commands) -> Result<()> {
    let store = &session.store;

    match command {
        Commands::Init { .. } => bail!("the vault is already initialized"),
        Commands::Add {
            kind,
            fields,
            tags,
            folder,
        } => {
            let mut draft = EntryDraft::new(kind.into());
            for (name, value) in fields {
                draft = draft.field(name, value);
            }
            for tag in tags {
                draft = draft.tag(tag);
            }
            if let Some(folder) = folder {
                draft = draft.in_folder(folder);
            }
            let entry = store.create(draft)?;
            session
                .audit
                .log(AuditEventType::EntryCreated { entry_id: entry.id }, "")?;
            println!("{}", entry.id);
        }
        Commands::List { folder, tag } => {
            let entries = match (folder, tag) {
                (Some(folder), _) => store.list_in_folder(folder)?,
                (None, Some(tag)) => store.list_tagged(&tag)?,
                (None, None) => store.list()?,
            };
            for entry in &entries {
                print_summary(entry);
            }
            println!("{} entries", entries.len());
        }
        Commands::Show { id, reveal } => {
            let access = if reveal { AccessType::Copy } else { AccessType::View };
            let entry = store.access(id, &actor(), access)?;
            session
                .audit
                .log(AuditEventType::EntryViewed { entry_id: id }, &actor())?;
            print_entry(&entry, reveal);
        }
        Commands::Edit {
            id,
            fields,
            tags,
            expected_version,
        } => {
            let current = store.get(id)?;
            let mut draft = EntryDraft::from_entry(&current);
            for (name, value) in fields {
                draft.fields.insert(name, Some(value));
            }
            for tag in tags {
                draft = draft.tag(tag);
            }
            let entry = store.update(id, draft, expected_version)?;
            session
                .audit
                .log(AuditEventType::EntryModified { entry_id: id }, "")?;
            println!("{} now at v{}", entry.id, entry.version);
        }
        Commands::Delete {
            id,
            expected_version,
        } => {
            store.delete(id, expected_version)?;
            session
                .audit
                .log(AuditEventType::EntryDeleted { entry_id: id }, "")?;
            println!("Deleted {}", id);
        }
        Commands::Undelete { id, fields } => {
            let current = store.get_any(id)?;
            let mut draft = EntryDraft::new(current.kind);
            for (name, value) in fields {
                draft = draft.field(name, value);
            }
            let entry = store.undelete(id, draft)?;
            session
                .audit
                .log(AuditEventType::EntryRestored { entry_id: id }, "")?;
            println!("Restored {} at v{}", entry.id, entry.version);
        }
        Commands::Folder { command } => match command {
            FolderCommands::Add { name } => {
                let folder = store.create_folder(&name)?;
                println!("{}", folder.id);
            }
            FolderCommands::Rename { id, name } => {
                store.rename_folder(id, &name)?;
            }
            FolderCommands::Delete { id } => {
                store.delete_folder(id)?;
            }
            FolderCommands::List => {
                for folder in store.list_folders()? {
                    println!("{}  {}", folder.id, folder.name);
                }
            }
        },
        Commands::Sync => {
            let report = session.engine()?.sync().await?;
            print_report(&report);
        }
        Commands::Conflicts => {
            let outcome = session.engine()?.preview().await?;
            if outcome.conflicts.is_empty() {
                println!("No conflicts");
            }
            for conflict in &outcome.conflicts {
                print_conflict(conflict);
            }
        }
        Commands::Resolve { id, keep } => {
            let choice = match keep {
                KeepArg::Local => Resolution::KeepLocal,
                KeepArg::Remote => Resolution::KeepRemote,
            };
            let report = session.engine()?.resolve_manual([(id, choice)]).await?;
            print_report(&report);
        }
        Commands::Anomalies => {
            let events = session.tracker.detect_anomalies(now_millis())?;
            if events.is_empty() {
                println!("No anomalies");
            }
            for event in events {
                println!(
                    "{}  {} accessed {} times",
                    event.entry_id, event.actor, event.count
                );
                session.audit.log(
                    AuditEventType::AnomalyDetected {
                        entry_id: event.entry_id,
                        actor: event.actor.clone(),
                        count: event.count,
                    },
                    "",
                )?;
            }
        }
        Commands::Purge => {
            let purged = store.purge_tombstones(now_millis(), session.settings.tombstone_retention())?;
            session.audit.log(
                AuditEventType::TombstonesPurged {
                    count: purged.len(),
                },
                "",
            )?;
            println!("Purged {} tombstones", purged.len());
        }
        Commands::Audit {
            limit,
            min_severity,
        } => {
            for entry in session.audit.get_entries(limit)? {
                if entry.severity >= min_severity {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            }
        }
    }

    Ok(())
}
