//! pgbackup - main entry point
//!
//! Command line front end over the backup engine.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pgbackup::catalog::{BackupId, BackupMode, BackupStatus, CatalogContext};
use pgbackup::catchup::{CatchupEngine, CatchupOptions};
use pgbackup::executor::progress::format_bytes;
use pgbackup::executor::{BackupExecutor, BackupOptions};
use pgbackup::pg::Lsn;
use pgbackup::restore::{self, parse_tablespace_mapping, RestoreOptions};
use pgbackup::retention::{self, ExpireOptions};
use pgbackup::show::{self, ShowFormat};
use pgbackup::source::LocalSource;
use pgbackup::validate::{self, parse_target_time, RecoveryTarget};
use pgbackup::wal::PushOutcome;
use pgbackup::{interrupt, merge, utils, Config};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backup catalog directory
    #[arg(short = 'B', long, global = true, value_name = "DIR")]
    backup_path: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct InstanceArg {
    #[arg(long)]
    instance: String,
}

#[derive(Args, Debug)]
struct TargetArgs {
    #[arg(long, value_name = "TIME", conflicts_with_all = ["recovery_target_lsn", "recovery_target_xid"])]
    recovery_target_time: Option<String>,
    #[arg(long, value_name = "LSN", conflicts_with = "recovery_target_xid")]
    recovery_target_lsn: Option<Lsn>,
    #[arg(long, value_name = "XID")]
    recovery_target_xid: Option<u64>,
}

impl TargetArgs {
    fn target(&self) -> Result<Option<RecoveryTarget>> {
        if let Some(raw) = &self.recovery_target_time {
            return Ok(Some(RecoveryTarget::Time(parse_target_time(raw)?)));
        }
        Ok(self
            .recovery_target_lsn
            .map(RecoveryTarget::Lsn)
            .or(self.recovery_target_xid.map(RecoveryTarget::Xid)))
    }
}

#[derive(Args, Debug)]
struct CatchupArgs {
    #[arg(short = 'b', long)]
    backup_mode: BackupMode,
    #[arg(long)]
    source_pgdata: PathBuf,
    #[arg(long)]
    destination_pgdata: PathBuf,
    #[arg(short = 'j', long)]
    threads: Option<usize>,
    #[arg(short = 'T', long = "tablespace-mapping", value_name = "OLDDIR=NEWDIR")]
    tablespace_mapping: Vec<String>,
    #[arg(long = "exclude-path", value_name = "PATH")]
    exclude_paths: Vec<PathBuf>,
    #[arg(long)]
    waldir: Option<PathBuf>,
    #[arg(short = 'S', long)]
    slot: Option<String>,
    #[arg(long)]
    perm_slot: bool,
    #[arg(long)]
    temp_slot: bool,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty backup catalog
    Init,

    /// Register a data directory as an instance
    AddInstance {
        #[command(flatten)]
        instance: InstanceArg,
        #[arg(short = 'D', long)]
        pgdata: PathBuf,
    },

    /// Take a backup
    Backup {
        #[command(flatten)]
        instance: InstanceArg,
        #[arg(short = 'b', long)]
        backup_mode: BackupMode,
        /// Data directory; the registered one when unset
        #[arg(short = 'D', long)]
        pgdata: Option<PathBuf>,
        #[arg(short = 'j', long)]
        threads: Option<usize>,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        no_validate: bool,
        #[arg(long = "exclude-path", value_name = "PATH")]
        exclude_paths: Vec<PathBuf>,
    },

    /// Restore a backup into an empty directory
    Restore {
        #[command(flatten)]
        instance: InstanceArg,
        #[arg(short = 'i', long)]
        backup_id: Option<BackupId>,
        #[arg(short = 'D', long)]
        pgdata: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
        /// OLDDIR=NEWDIR
        #[arg(short = 'T', long = "tablespace-mapping", value_name = "OLDDIR=NEWDIR")]
        tablespace_mapping: Vec<String>,
        #[arg(long)]
        restore_command: Option<String>,
        #[arg(short = 'j', long)]
        threads: Option<usize>,
        #[arg(long)]
        no_validate: bool,
    },

    /// Synchronize a stopped data directory with a running cluster
    Catchup(CatchupArgs),

    /// Check backup files and the WAL they need
    Validate {
        /// Every instance when unset
        #[arg(long)]
        instance: Option<String>,
        #[arg(short = 'i', long)]
        backup_id: Option<BackupId>,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// List backups
    Show {
        #[arg(long)]
        instance: Option<String>,
        #[arg(short = 'i', long, requires = "instance")]
        backup_id: Option<BackupId>,
        #[arg(long, default_value = "plain")]
        format: ShowFormat,
    },

    /// Remove backups and archived WAL
    Delete {
        #[command(flatten)]
        instance: InstanceArg,
        #[arg(short = 'i', long, conflicts_with_all = ["status", "delete_expired"])]
        backup_id: Option<BackupId>,
        #[arg(long, conflicts_with = "delete_expired")]
        status: Option<BackupStatus>,
        #[arg(long)]
        delete_expired: bool,
        /// Remove WAL no remaining backup needs
        #[arg(long)]
        wal: bool,
        #[arg(long)]
        retention_redundancy: Option<u32>,
        #[arg(long)]
        retention_window: Option<u32>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Fold an incremental chain into one FULL backup
    Merge {
        #[command(flatten)]
        instance: InstanceArg,
        #[arg(short = 'i', long)]
        backup_id: BackupId,
    },

    /// Store a WAL file in the archive
    ArchivePush {
        #[command(flatten)]
        instance: InstanceArg,
        #[arg(long)]
        wal_file_path: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },

    /// Fetch a WAL file from the archive
    ArchiveGet {
        #[command(flatten)]
        instance: InstanceArg,
        #[arg(long)]
        wal_file_name: String,
        #[arg(long)]
        wal_file_path: PathBuf,
    },
}

fn mappings(raw: &[String]) -> Result<Vec<(PathBuf, PathBuf)>> {
    raw.iter()
        .map(|m| parse_tablespace_mapping(m).map_err(Into::into))
        .collect()
}

async fn catchup(args: CatchupArgs, config: &Config, cancel: CancellationToken) -> Result<()> {
    let source = LocalSource::new(&args.source_pgdata);
    let mut options = CatchupOptions::new(args.backup_mode, args.destination_pgdata);
    options.threads = args.threads;
    options.exclude_paths = args.exclude_paths;
    options.tablespace_mapping = mappings(&args.tablespace_mapping)?;
    options.waldir = args.waldir;
    options.slot = args.slot;
    options.perm_slot = args.perm_slot;
    options.temp_slot = args.temp_slot;
    options.dry_run = args.dry_run;
    let summary = CatchupEngine::new(config, &source)
        .with_cancel(cancel)
        .run(&options)
        .await?;
    tracing::info!(
        "Catchup completed: {} files, {} copied, stop LSN {}",
        summary.files_copied,
        format_bytes(summary.bytes_copied),
        summary.stop_lsn
    );
    Ok(())
}

async fn run(cli: Cli, config: Config, cancel: CancellationToken) -> Result<()> {
    let command = match cli.command {
        // no catalog involved
        Command::Catchup(args) => return catchup(args, &config, cancel).await,
        command => command,
    };
    let root = cli
        .backup_path
        .context("required parameter not specified: BACKUP_PATH (-B, --backup-path)")?;

    let ctx = CatalogContext::new(root, config).with_cancel(cancel);
    match command {
        Command::Catchup(args) => catchup(args, &ctx.config, ctx.cancel.clone()).await?,
        Command::Init => ctx.init()?,
        Command::AddInstance { instance, pgdata } => {
            ctx.add_instance(&instance.instance, &LocalSource::new(pgdata))?;
        }
        Command::Backup {
            instance,
            backup_mode,
            pgdata,
            threads,
            note,
            no_validate,
            exclude_paths,
        } => {
            let registered = ctx.open_instance(&instance.instance)?.config;
            let source = LocalSource::new(pgdata.unwrap_or(registered.pgdata))
                .with_segment_size(registered.wal_segment_size);
            let mut options = BackupOptions::new(backup_mode);
            options.threads = threads;
            options.note = note;
            options.exclude_paths = exclude_paths;
            if no_validate {
                options.validate = Some(false);
            }
            let backup = BackupExecutor::new(&ctx, &source)
                .execute(&instance.instance, &options)
                .await?;
            tracing::info!("Backup {} completed", backup.id);
        }
        Command::Restore {
            instance,
            backup_id,
            pgdata,
            target,
            tablespace_mapping,
            restore_command,
            threads,
            no_validate,
        } => {
            let options = RestoreOptions {
                backup_id,
                target_dir: pgdata,
                tablespace_mapping: mappings(&tablespace_mapping)?,
                recovery_target: target.target()?,
                restore_command,
                threads,
                no_validate,
            };
            let summary = restore::restore(&ctx, &instance.instance, &options).await?;
            tracing::info!("Restore of backup {} completed", summary.backup_id);
        }
        Command::Validate {
            instance,
            backup_id,
            target,
        } => {
            let target = target.target()?;
            match instance {
                Some(name) => validate::validate(&ctx, &name, backup_id, target).await?,
                None => {
                    if backup_id.is_some() || target.is_some() {
                        anyhow::bail!("required parameter not specified: --instance");
                    }
                    for name in ctx.instances()? {
                        validate::validate(&ctx, &name, None, None).await?;
                    }
                }
            }
        }
        Command::Show {
            instance,
            backup_id,
            format,
        } => {
            let out = match (instance.as_deref(), backup_id) {
                (Some(name), Some(id)) => show::show_backup(&ctx, name, id, format)?,
                (instance, _) => show::show(&ctx, instance, format)?,
            };
            println!("{}", out);
        }
        Command::Delete {
            instance,
            backup_id,
            status,
            delete_expired,
            wal,
            retention_redundancy,
            retention_window,
            dry_run,
        } => {
            let name = instance.instance;
            if let Some(id) = backup_id {
                retention::delete_backup(&ctx, &name, id)?;
            } else if let Some(status) = status {
                retention::delete_by_status(&ctx, &name, status)?;
            } else if delete_expired || wal {
                let options = ExpireOptions {
                    redundancy: retention_redundancy,
                    window_days: retention_window,
                    purge_wal: wal,
                    dry_run,
                };
                if delete_expired {
                    retention::delete_expired(&ctx, &name, &options)?;
                } else {
                    let catalog = ctx.open_instance(&name)?;
                    let _lock = catalog.lock("delete")?;
                    retention::purge_wal(&catalog, &catalog.archive(&ctx), dry_run)?;
                }
            } else {
                anyhow::bail!("You must specify at least one of the delete options: --delete-expired |--wal |-i BACKUP_ID | --status");
            }
        }
        Command::Merge { instance, backup_id } => {
            let merged = merge::merge(&ctx, &instance.instance, backup_id).await?;
            tracing::info!("Merge of backup {} completed", merged.id);
        }
        Command::ArchivePush {
            instance,
            wal_file_path,
            overwrite,
        } => {
            let catalog = ctx.open_instance(&instance.instance)?;
            match catalog.archive(&ctx).push(&wal_file_path, overwrite)? {
                PushOutcome::Stored => tracing::info!("pg_wal file \"{}\" archived", wal_file_path.display()),
                PushOutcome::AlreadyArchived => {}
            }
        }
        Command::ArchiveGet {
            instance,
            wal_file_name,
            wal_file_path,
        } => {
            let catalog = ctx.open_instance(&instance.instance)?;
            catalog.archive(&ctx).get(&wal_file_name, &wal_file_path)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            std::process::exit(1);
        }
    };

    let log_level = cli.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    if let Err(e) = utils::logger::init(&log_level) {
        eprintln!("WARNING: cannot initialize logging: {}", e);
    }

    let cancel = CancellationToken::new();
    if let Err(e) = interrupt::cancel_on_signal(cancel.clone()) {
        tracing::warn!("Cannot install signal handlers: {}", e);
    }

    if let Err(e) = run(cli, config, cancel).await {
        eprintln!("ERROR: {:#}", e);
        std::process::exit(1);
    }
}
