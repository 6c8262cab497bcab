//! CLI mode for hvault: one-shot sync, download and library queries.

mod progress;

use std::sync::Arc;

use console::style;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::coordinator::{AppContext, Coordinator, DownloadRequest, SyncRequest};
use crate::download::DownloadObserver;
use crate::error::Error;
use crate::model::AssetQuery;

use progress::{BarObserver, LogObserver, print_library_stats, print_summary};

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP API with background enrichment.
    Serve,
    Sync(SyncRequest),
    Download(DownloadRequest),
    Reconcile,
    Search(AssetQuery),
    Stats,
    Help,
}

/// Prints usage to stderr.
pub fn print_usage() {
    eprintln!("Usage: hvault <COMMAND> [OPTIONS]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve                          Start the HTTP API and background enrichment");
    eprintln!("  sync [--trove] [--full] [--update]");
    eprintln!("                                 Index purchases (or the trove) into the library");
    eprintln!("  download [--update] [--trove|--purchases] [--workers N]");
    eprintln!("                                 Download pending assets");
    eprintln!("  reconcile                      Mark assets already present on disk");
    eprintln!("  search [--category C] [--limit N] <terms>...");
    eprintln!("                                 Search the library");
    eprintln!("  stats                          Show library totals");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --trove        Sync or download Humble Trove content");
    eprintln!("  --full         Enumerate every purchase, not just known orders");
    eprintln!("  --update       sync: refresh metadata; download: re-check changed files");
    eprintln!("  --workers N    Concurrent downloads (1 shows progress bars)");
    eprintln!("  -h, --help     Show this help");
    eprintln!();
    eprintln!("Environment: HVAULT_SESSION, HVAULT_LIBRARY, HVAULT_DATA_DIR, OPENWEBUI_URL, RUST_LOG");
}

fn value_of(args: &[String], i: &mut usize, flag: &str) -> std::result::Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn number_of(args: &[String], i: &mut usize, flag: &str) -> std::result::Result<usize, String> {
    let raw = value_of(args, i, flag)?;
    raw.parse()
        .map_err(|_| format!("{flag} expects a number, got '{raw}'"))
}

/// Parses arguments (without the program name) into a [`Command`].
///
/// # Errors
///
/// Returns a message describing the first invalid argument.
pub fn parse_args(args: &[String]) -> std::result::Result<Command, String> {
    let Some(name) = args.first() else {
        return Ok(Command::Help);
    };
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(Command::Help);
    }
    let rest = &args[1..];

    match name.as_str() {
        "serve" => Ok(Command::Serve),
        "reconcile" => Ok(Command::Reconcile),
        "stats" => Ok(Command::Stats),
        "sync" => {
            let mut request = SyncRequest::default();
            for arg in rest {
                match arg.as_str() {
                    "--trove" => request.trove = Some(true),
                    "--full" => request.full = true,
                    "--update" | "--force-meta" => request.force_meta = true,
                    other => return Err(format!("unknown sync option '{other}'")),
                }
            }
            Ok(Command::Sync(request))
        }
        "download" => {
            let mut request = DownloadRequest::default();
            let mut i = 0;
            while i < rest.len() {
                match rest[i].as_str() {
                    "--update" => request.update = Some(true),
                    "--trove" => request.trove = Some(true),
                    "--purchases" => request.trove = Some(false),
                    "--workers" | "-w" => request.workers = Some(number_of(rest, &mut i, "--workers")?),
                    other => return Err(format!("unknown download option '{other}'")),
                }
                i += 1;
            }
            Ok(Command::Download(request))
        }
        "search" => {
            let mut query = AssetQuery::default();
            let mut terms = Vec::new();
            let mut i = 0;
            while i < rest.len() {
                match rest[i].as_str() {
                    "--category" | "-c" => query.category = Some(value_of(rest, &mut i, "--category")?),
                    "--limit" | "-n" => query.limit = number_of(rest, &mut i, "--limit")?,
                    other if other.starts_with('-') => {
                        return Err(format!("unknown search option '{other}'"));
                    }
                    term => terms.push(term.to_string()),
                }
                i += 1;
            }
            query.query = Some(terms.join(" ")).filter(|q| !q.is_empty());
            Ok(Command::Search(query))
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

/// Trips the returned token on Ctrl+C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling, waiting for in-flight work...");
            trigger.cancel();
        }
    });
    token
}

/// Runs a one-shot command against the configured library.
///
/// # Errors
///
/// Returns an error if the library cannot be opened or the command fails.
pub async fn run(command: Command, config: AppConfig) -> crate::Result<()> {
    let ctx = Arc::new(AppContext::open(config)?);
    let root = ctx.config().paths.library_root;
    let store = Arc::clone(ctx.store());

    match command {
        Command::Serve | Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Sync(request) => {
            let coordinator = Coordinator::new(ctx);
            let cancel = cancel_on_ctrl_c();
            let count = coordinator.sync(&request, &cancel).await?;
            println!("{} {count} assets indexed", style("✓").green());
            Ok(())
        }
        Command::Download(request) => {
            if root.as_os_str().is_empty() {
                return Err(Error::Config("library path is not configured".into()));
            }
            let coordinator = Coordinator::new(Arc::clone(&ctx));
            let cancel = cancel_on_ctrl_c();
            let workers = request.workers.unwrap_or(ctx.config().download.workers);
            let stats = if workers <= 1 {
                let bars = BarObserver::new();
                let stats = coordinator
                    .download(&request, Some(&bars as &dyn DownloadObserver), &cancel)
                    .await;
                bars.finish();
                stats?
            } else {
                coordinator
                    .download(&request, Some(&LogObserver as &dyn DownloadObserver), &cancel)
                    .await?
            };
            print_summary(&stats);
            Ok(())
        }
        Command::Reconcile => {
            let count = store.reconcile(&root)?;
            println!("{count} assets found on disk and marked downloaded");
            Ok(())
        }
        Command::Search(query) => {
            let page = store.search(&query)?;
            for asset in &page.items {
                let marker = if asset.downloaded {
                    style("✓").green()
                } else {
                    style("·").dim()
                };
                println!(
                    "{marker} {:>6}  {:<10} {} / {} / {}",
                    asset.id.unwrap_or_default(),
                    asset.category.as_deref().unwrap_or("-"),
                    asset.bundle_title,
                    asset.product_title,
                    if asset.file_name.is_empty() { "(no file)" } else { asset.file_name.as_str() },
                );
            }
            println!("{} of {} matches", page.items.len(), page.total);
            Ok(())
        }
        Command::Stats => {
            let stats = store.stats(Some(&root))?;
            print_library_stats(&stats);
            for count in store.category_counts(10)? {
                println!(
                    "  {:<12} {:>6} ({} downloaded)",
                    count.category.as_deref().unwrap_or("unknown"),
                    count.count,
                    count.downloaded
                );
            }
            Ok(())
        }
    }
}
