use core::sync::atomic::Ordering;
use std::path::PathBuf;

use lscr::{
    Crawler,
    scrape::{SiteConfig, SiteExtractor, SiteNavigator, puppeteer},
};

/// Crawl a paginated listing site into a CSV file, resuming from the last checkpoint.
#[derive(clap::Parser)]
#[command(version)]
struct Args {
    /// Site description (targets, selectors, key fields).
    #[arg(value_name = "file")]
    site: PathBuf,
    /// Output CSV [default: <name>.csv]
    #[arg(short, long)]
    out: Option<PathBuf>,
    /// Checkpoint file [default: <name>_checkpoint.json]
    #[arg(short, long)]
    checkpoint: Option<PathBuf>,
    /// Stop once the newest record of the previous complete run shows up again.
    /// The checkpoint of a finished run points past the end, so pair this with
    /// --fresh to walk the newest pages again.
    #[arg(long, value_name = "file")]
    point_mark: Option<PathBuf>,
    #[arg(long)]
    max_pages: Option<u32>,
    #[arg(long)]
    headless: bool,
    #[arg(long, env = "PROXY_SERVER")]
    proxy: Option<String>,
    /// Forget the checkpoint and start from page 1.
    #[arg(long)]
    fresh: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;

    pretty_env_logger::formatted_timed_builder()
        .parse_filters(std::env::var("RUST_LOG").as_deref().unwrap_or("info"))
        .init();

    let args = Args::parse();

    let mut site = SiteConfig::load(&args.site)?;
    if let Some(max_pages) = args.max_pages {
        site.crawl.max_pages = max_pages;
    }
    let out = args
        .out
        .unwrap_or_else(|| format!("{}.csv", site.name).into());
    let checkpoint = args
        .checkpoint
        .unwrap_or_else(|| format!("{}_checkpoint.json", site.name).into());

    tracing::info!(target: "main", "crawling \x1b[1;36m{}\x1b[0m: {} targets -> {}", site.name, site.targets.len(), out.display());

    let mut crawler = Crawler::new(
        site.crawl.clone(),
        site.targets.clone(),
        site.key.clone(),
        out,
        checkpoint,
    );
    if let Some(path) = args.point_mark {
        crawler = crawler.with_point_mark(path);
    }
    if args.fresh {
        crawler.store_mut().clear()?;
        tracing::info!(target: "main", "checkpoint cleared, starting fresh");
    }

    let stop = crawler.stop_handle();
    let waits = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(target: "main", "\x1b[33minterrupted, saving progress ...\x1b[0m");
            stop.store(true, Ordering::Release);
        }
    });

    let headless = args.headless;
    let proxy = args.proxy;
    let summary = tokio::task::spawn_blocking(move || {
        let browser = puppeteer::puppeteer(headless, proxy.as_deref())?;
        let tab = puppeteer::first_tab(&browser, site.timeout())?;
        let mut extractor = SiteExtractor::new(tab.clone(), &site)?.with_stop(waits.clone());
        let mut navigator = SiteNavigator::new(tab, &site).with_stop(waits);
        crawler.run(&mut extractor, &mut navigator)
    })
    .await??;

    tracing::info!(target: "main", "{summary:#?}");
    Ok(())
}
