use crate::audit::{count_with_links, verify_folder};
use crate::cli::{Cli, Command};
use crate::config::AppConfig;
use crate::export::{open_writer, ExportField, Exporter};
use crate::imap::ImapSource;
use crate::storage::{Index, MessageStore};
use crate::sync::{ScreeningRules, SyncEngine, SyncOptions};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(folder) = &cli.folder {
        config.folder = folder.clone();
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    let index = Arc::new(Index::open_in(&config.data_dir).await?);
    let store = Arc::new(MessageStore::open(&config.data_dir).await?);
    info!(path = %index.path().display(), "Using archive index");

    let result = match cli.command {
        Command::Sync {
            concurrency,
            no_verify,
            limit,
            no_screening,
            timeout_secs,
        } => {
            if let Some(n) = concurrency {
                config.concurrency = n;
            }
            if no_verify {
                config.verify_checksum = false;
            }
            if limit.is_some() {
                config.limit = limit;
            }
            config.validate()?;
            let screening = if no_screening {
                ScreeningRules::default()
            } else {
                config.screening.rules()
            };
            let options = SyncOptions {
                concurrency: config.concurrency,
                verify_checksum: config.verify_checksum,
                limit: config.limit,
                screening,
            };
            run_sync(
                &config,
                options,
                index.clone(),
                store.clone(),
                timeout_secs.map(Duration::from_secs),
            )
            .await
        }
        Command::Export {
            output,
            format,
            fields,
        } => {
            if let Some(format) = format {
                config.export_format = format;
            }
            if let Some(raw) = fields {
                config.export_fields = ExportField::parse_list(&raw)?;
            }
            config.validate()?;
            let path = output.unwrap_or_else(|| config.default_export_path());
            run_export(&config, index.clone(), store.clone(), path).await
        }
        Command::Stats => print_stats(&index, &store, cli.folder.as_deref()).await,
        Command::Verify => run_verify(&index, &store, cli.folder.as_deref()).await,
    };

    index.close().await;
    result
}

async fn run_sync(
    config: &AppConfig,
    options: SyncOptions,
    index: Arc<Index>,
    store: Arc<MessageStore>,
    timeout: Option<Duration>,
) -> Result<()> {
    let source = Arc::new(ImapSource::new(config.imap.clone(), config.concurrency)?);
    let engine = SyncEngine::new(source.clone(), index, store, options);
    let folder = config.folder.as_str();

    let pass = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, engine.sync_folder(folder)).await {
                Ok(res) => res.map_err(anyhow::Error::from),
                Err(_) => Err(anyhow!("sync pass timed out after {:?}; re-run to resume", limit)),
            },
            None => engine.sync_folder(folder).await.map_err(anyhow::Error::from),
        }
    };

    let outcome = tokio::select! {
        res = pass => res,
        _ = tokio::signal::ctrl_c() => {
            warn!(folder = %folder, "Interrupted; archived messages are kept, re-run sync to resume");
            Err(anyhow!("interrupted"))
        }
    };
    source.shutdown().await;

    let summary = outcome?;
    println!("{}", summary);
    Ok(())
}

async fn run_export(
    config: &AppConfig,
    index: Arc<Index>,
    store: Arc<MessageStore>,
    path: PathBuf,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }

    let exporter = Exporter::new(index, store, config.export_fields.clone());
    let mut writer = open_writer(config.export_format, &path)?;
    let report = exporter.export(&config.folder, writer.as_mut()).await?;

    println!(
        "Exported {} rows from {} to {}",
        report.rows,
        config.folder,
        path.display()
    );
    for row in &report.row_errors {
        println!("  ! {}: {}", row.identity, row.error);
    }
    Ok(())
}

async fn print_stats(index: &Index, store: &MessageStore, folder: Option<&str>) -> Result<()> {
    let stats = index.stats(folder).await?;
    if stats.is_empty() {
        println!("Archive is empty.");
        return Ok(());
    }

    println!(
        "{:<30} {:>10} {:>12} {:>10}  {:<19}  {:<19}",
        "folder", "messages", "size", "with links", "first", "last"
    );
    for s in stats {
        let with_links = count_with_links(index, store, &s.folder).await?;
        println!(
            "{:<30} {:>10} {:>12} {:>10}  {:<19}  {:<19}",
            s.folder,
            s.records,
            human_size(s.total_bytes),
            with_links,
            format_millis(s.first_archived_at),
            format_millis(s.last_archived_at)
        );
    }
    Ok(())
}

async fn run_verify(index: &Index, store: &MessageStore, folder: Option<&str>) -> Result<()> {
    let folders = match folder {
        Some(f) => vec![f.to_string()],
        None => index.folders().await?,
    };

    let mut problems = 0;
    for folder in &folders {
        let report = verify_folder(index, store, folder).await?;
        println!(
            "{}: checked={} missing={} mismatched={}",
            report.folder,
            report.checked,
            report.missing.len(),
            report.mismatched.len()
        );
        for id in &report.missing {
            println!("  missing blob: {}", id);
        }
        for id in &report.mismatched {
            println!("  checksum mismatch: {}", id);
        }
        problems += report.missing.len() + report.mismatched.len();
    }

    if problems > 0 {
        bail!("{} archived messages failed verification", problems);
    }
    Ok(())
}

fn format_millis(ts: Option<i64>) -> String {
    ts.and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
