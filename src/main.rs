mod core;
mod plugins;

use clap::{Arg, ArgAction, ArgMatches, Command};
use crate::core::bundler::Naming;
use crate::core::engine::{Engine, EngineConfig};
use crate::core::events::EngineEvent;
use crate::core::model::{BatchRequest, BatchResult, ItemStatus, Quality};
use crate::core::store::{ProgressStore, SqliteStore};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use crate::plugins::registry::{DownloadCliConfig, PluginRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn common_args(cmd: Command, registry: &PluginRegistry) -> Command {
    let cmd = cmd
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Output directory (also holds the progress database)")
                .default_value("./downloads")
                .num_args(1),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .help("Max concurrent item downloads")
                .default_value("4")
                .num_args(1),
        )
        .arg(
            Arg::new("keep_files")
                .long("keep-files")
                .help("Keep individual files after bundling")
                .action(ArgAction::SetTrue),
        );
    registry.augment_download_command(cmd)
}

fn build_cli(registry: &PluginRegistry) -> Command {
    let download = Command::new("download")
        .about("Download a batch of verses")
        .arg(
            Arg::new("verses")
                .help("Verse ids and ranges, e.g. '1, 3-5, 10-20'")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("quality")
                .long("quality")
                .help("Audio quality")
                .value_parser(["low", "high"])
                .default_value("high")
                .num_args(1),
        )
        .arg(
            Arg::new("bundle")
                .long("bundle")
                .help("Package every verse into one zip once the whole batch completed")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no_sort")
                .long("no-sort")
                .help("Keep verses in the order given instead of ascending")
                .action(ArgAction::SetTrue),
        );

    let resume = Command::new("resume")
        .about("Resume every interrupted download")
        .arg(
            Arg::new("bundle")
                .long("bundle")
                .help("Bundle the resumed items once all of them completed")
                .action(ArgAction::SetTrue),
        );

    let list = Command::new("list").about("List interrupted downloads that can be resumed");

    let retry = Command::new("retry")
        .about("Retry one failed item from its last saved offset")
        .arg(Arg::new("item").required(true).num_args(1));

    let forget = Command::new("forget")
        .about("Delete the saved progress of one item")
        .arg(Arg::new("item").required(true).num_args(1));

    Command::new("recitation-downloader")
        .about("Resumable batch downloader for verse recitations")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(common_args(download, registry))
        .subcommand(common_args(resume, registry))
        .subcommand(common_args(list, registry))
        .subcommand(common_args(retry, registry))
        .subcommand(common_args(forget, registry))
}

async fn build_engine(registry: &PluginRegistry, m: &ArgMatches) -> anyhow::Result<Engine> {
    let out_dir: PathBuf = m
        .get_one::<String>("out_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./downloads"));
    let concurrency: usize = match m.get_one::<String>("concurrency") {
        Some(s) => s.parse()?,
        None => 4,
    };

    tokio::fs::create_dir_all(&out_dir).await?;

    let mut cli_cfg = DownloadCliConfig::default();
    registry.apply_download_matches(m, &mut cli_cfg)?;

    let store: Arc<dyn ProgressStore> = Arc::new(SqliteStore::open(&out_dir.join(".downloader.sqlite")).await?);
    let resolver = registry.resolver(&cli_cfg)?;
    let fetcher = registry.fetcher(&cli_cfg)?;
    tracing::debug!(resolver = resolver.name(), fetcher = fetcher.name(), out_dir = %out_dir.display(), "engine configured");

    let mut cfg = EngineConfig::new(out_dir, Naming::for_reciter(&cli_cfg.source.reciter));
    cfg.concurrency = concurrency;
    cfg.keep_files = m.get_flag("keep_files");

    Ok(Engine::new(cfg, resolver, fetcher, store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let registry = PluginRegistry::with_defaults();
    let app = build_cli(&registry);
    let matches = app.get_matches();

    let Some((name, m)) = matches.subcommand() else {
        return Ok(());
    };
    let engine = build_engine(&registry, m).await?;

    match name {
        "download" => {
            let verses = m.get_one::<String>("verses").cloned().unwrap_or_default();
            let quality: Quality = m
                .get_one::<String>("quality")
                .map(|s| s.parse())
                .transpose()
                .map_err(anyhow::Error::msg)?
                .unwrap_or_default();
            let req = BatchRequest::new(verses)
                .quality(quality)
                .bundle(m.get_flag("bundle"))
                .sorted(!m.get_flag("no_sort"));

            let e2 = engine.clone();
            let res = run_with_ui(&engine, async move { e2.submit(req).await }).await?;
            finish(res)
        }
        "resume" => {
            let bundle = m.get_flag("bundle");
            let e2 = engine.clone();
            let res = run_with_ui(&engine, async move { e2.resume_all(bundle).await }).await?;
            finish(res)
        }
        "retry" => {
            let item = m.get_one::<String>("item").cloned().unwrap_or_default();
            let e2 = engine.clone();
            let res = run_with_ui(&engine, async move { e2.retry(&item).await }).await?;
            finish(res)
        }
        "list" => {
            let items = engine.list_resumable().await?;
            if items.is_empty() {
                println!("Nothing to resume.");
            }
            for it in items {
                println!(
                    "- item={} status={} {} / {} ({}%) quality={} collection={}",
                    it.id,
                    it.status,
                    fmt_bytes(it.bytes_downloaded),
                    fmt_total(it.bytes_total),
                    it.progress_percent(),
                    it.quality,
                    it.collection,
                );
            }
            Ok(())
        }
        "forget" => {
            let item = m.get_one::<String>("item").cloned().unwrap_or_default();
            if engine.forget(&item).await? {
                println!("Forgot {}", item);
            } else {
                println!("No saved progress for {}", item);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Drives the progress bars while `job` runs; Ctrl-C pauses every running batch.
async fn run_with_ui<F>(engine: &Engine, job: F) -> anyhow::Result<BatchResult>
where
    F: std::future::Future<Output = Result<BatchResult, crate::core::error::BatchError>> + Send + 'static,
{
    let mut rx = engine.subscribe();

    let ctrl_c_engine = engine.clone();
    let ctrl_c = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, pausing downloads (progress is kept, run `resume` later)");
            ctrl_c_engine.cancel_all();
        }
    });

    let ui_task = tokio::spawn(async move {
        let mp = MultiProgress::new();
        let sty_pb = ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("|/-\\ ");
        let sty_bar = ProgressStyle::with_template(
            "{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {wide_msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let sty_total = ProgressStyle::with_template("{prefix} {bar:40.green/white} {pos}/{len} verses")
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let mut bars: HashMap<String, ProgressBar> = HashMap::new();
        let mut overall: Option<ProgressBar> = None;

        loop {
            let evt = match rx.recv().await {
                Ok(e) => e,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };

            match evt {
                EngineEvent::BatchStarted { items, .. } => {
                    let total = mp.add(ProgressBar::new(items.len() as u64));
                    total.set_style(sty_total.clone());
                    total.set_prefix("[total]");
                    overall = Some(total);
                    for id in items {
                        let pb = mp.add(ProgressBar::new_spinner());
                        pb.set_style(sty_pb.clone());
                        pb.set_prefix(format!("[{id}]"));
                        pb.enable_steady_tick(std::time::Duration::from_millis(120));
                        pb.set_message("pending");
                        bars.insert(id, pb);
                    }
                }
                EngineEvent::ItemStatusChanged { item_id, status, error, .. } => {
                    if let Some(pb) = bars.get(&item_id) {
                        match status {
                            ItemStatus::Completed => pb.finish_with_message("done"),
                            ItemStatus::Failed => {
                                pb.finish_with_message(format!("failed: {}", error.unwrap_or_default()))
                            }
                            s => pb.set_message(format!("status={}", s)),
                        }
                    }
                }
                EngineEvent::Progress { item_id, downloaded, total, .. } => {
                    let Some(pb) = bars.get(&item_id) else { continue };
                    if total > 0 {
                        if pb.length().unwrap_or(0) != total {
                            pb.set_style(sty_bar.clone());
                            pb.set_length(total);
                        }
                        pb.set_position(downloaded.min(total));
                    } else {
                        pb.set_message(fmt_bytes(downloaded));
                    }
                }
                EngineEvent::AggregateProgress { completed, total, .. } => {
                    if let Some(o) = &overall {
                        o.set_length(total as u64);
                        o.set_position(completed as u64);
                    }
                }
                EngineEvent::ItemSaved { .. } => {}
                EngineEvent::BundleCreated { archive, .. } => {
                    let _ = mp.println(format!("[BUNDLE] {} ({} entries)", archive.path.display(), archive.entries.len()));
                }
                EngineEvent::Error { scope, message } => {
                    let _ = mp.println(format!("[ERR] {}: {}", scope, message));
                }
                EngineEvent::Info { scope, message } => {
                    let _ = mp.println(format!("[INFO] {}: {}", scope, message));
                }
                EngineEvent::BatchFinished { .. } => {
                    if let Some(o) = &overall {
                        o.finish();
                    }
                    for pb in bars.values() {
                        if !pb.is_finished() {
                            pb.abandon();
                        }
                    }
                    break;
                }
            }
        }
    });

    let res = job.await;
    ctrl_c.abort();
    match &res {
        Ok(_) => {
            let _ = ui_task.await;
        }
        Err(_) => ui_task.abort(),
    }
    Ok(res?)
}

fn finish(res: BatchResult) -> anyhow::Result<()> {
    println!();
    println!("Summary (batch {}):", res.batch_id);
    for it in &res.items {
        println!(
            "- item={} status={} {} / {}",
            it.id,
            it.status,
            fmt_bytes(it.bytes_downloaded),
            fmt_total(it.bytes_total),
        );
        if let Some(e) = &it.error {
            println!("  error: {}", e);
        }
    }
    if let Some(a) = &res.archive {
        println!("Archive: {}", a.path.display());
    }
    if let Some(e) = &res.bundle_error {
        println!("Bundle failed: {}", e);
    }

    if res.cancelled {
        println!("Paused; run `resume` to continue.");
        return Ok(());
    }
    let failed = res.failed().count();
    if failed > 0 {
        anyhow::bail!("{} of {} item(s) failed; use `retry <item>` to resume them", failed, res.items.len());
    }
    if let Some(e) = res.bundle_error {
        anyhow::bail!("bundling failed: {}", e);
    }
    Ok(())
}

fn fmt_total(n: u64) -> String {
    if n == 0 {
        "?".to_string()
    } else {
        fmt_bytes(n)
    }
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
