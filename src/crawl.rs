use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{CheckpointState, PointMarkStore, Position, ProgressStore},
    ledger::DedupLedger,
    record::{KeySpec, Record, RecordIdentifier},
    sink::RecordSink,
};

/// The page currently being crawled. Items are numbered from 1.
#[derive(Clone, Copy, Debug)]
pub struct PageContext<'a> {
    pub target_index: usize,
    pub target: &'a str,
    pub page: u32,
}

/// Per-site field scraping.
pub trait ItemExtractor {
    /// Number of items on the current page.
    fn enumerate(&mut self, ctx: &PageContext<'_>) -> anyhow::Result<usize>;

    /// Cheap list-level fields of `item`, read without leaving the list page.
    /// Used to recognise known records before paying for [`extract`](Self::extract).
    fn preview(&mut self, _ctx: &PageContext<'_>, _item: u32) -> Option<Record> {
        None
    }

    /// Full record for `item`; `Ok(None)` when the item could not be read.
    fn extract(&mut self, ctx: &PageContext<'_>, item: u32) -> anyhow::Result<Option<Record>>;
}

/// Per-site pagination.
pub trait PageNavigator {
    /// Places the session on `ctx.page`, preferring `resume_url` when given.
    fn open(&mut self, ctx: &PageContext<'_>, resume_url: Option<&str>) -> anyhow::Result<()>;

    /// `true` iff the next page is now showing. `false` ends the target.
    fn advance(&mut self, ctx: &PageContext<'_>) -> bool;

    fn current_url(&self) -> Option<String> {
        None
    }
}

/// Unrecoverable loss of the browsing session. Anywhere in an error chain it
/// aborts the crawl instead of skipping the item.
#[derive(Debug)]
pub struct SessionLost(pub String);

impl fmt::Display for SessionLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "browser session lost: {}", self.0)
    }
}

impl core::error::Error for SessionLost {}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<SessionLost>())
}

/// A wait cut short by the stop flag. The item it interrupted counts as not
/// yet processed.
#[derive(Debug)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted")
    }
}

impl core::error::Error for Interrupted {}

fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<Interrupted>())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub max_pages: u32,
    /// Known pagination sizes; anything beyond is ignored.
    pub max_items_per_page: u32,
    pub empty_page_limit: u32,
    /// Records with more sentinel fields than this are dropped.
    pub max_sentinels: usize,
    pub flush_threshold: usize,
    pub item_delay_ms: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_items_per_page: 12,
            empty_page_limit: 3,
            max_sentinels: 5,
            flush_threshold: 5,
            item_delay_ms: 500,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopReason {
    /// The navigator found no further page.
    #[default]
    Exhausted,
    MaxPages,
    EmptyPages,
    PointMarkReached,
    Interrupted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub stop: StopReason,
    pub pages: u32,
    pub extracted: usize,
    /// Known records extracted again, replacing their stored row.
    pub refreshed: usize,
    pub duplicates: usize,
    pub resumed_skips: usize,
    pub failed: usize,
    pub discarded: usize,
    pub first_new: Option<RecordIdentifier>,
    pub position: Position,
}

enum Flow {
    Next,
    PointMark,
    Interrupted,
}

/// Drives page-then-item traversal over a list of targets, checkpointing
/// after every item.
pub struct Crawler {
    config: CrawlConfig,
    targets: Vec<String>,
    key: KeySpec,
    store: ProgressStore,
    sink: RecordSink,
    point_mark: Option<PointMarkStore>,
    stop: Arc<AtomicBool>,
}

impl Crawler {
    pub fn new(
        config: CrawlConfig,
        targets: Vec<String>,
        key: KeySpec,
        output: impl Into<PathBuf>,
        checkpoint: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            sink: RecordSink::new(output, key.clone()),
            key,
            targets,
            store: ProgressStore::new(checkpoint),
            point_mark: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_point_mark(mut self, path: impl Into<PathBuf>) -> Self {
        self.point_mark = Some(PointMarkStore::new(path));
        self
    }

    /// Setting the flag stops the crawl before the next item; buffered
    /// records and the checkpoint are still written.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub const fn store_mut(&mut self) -> &mut ProgressStore {
        &mut self.store
    }

    pub fn run<E, N>(&mut self, extractor: &mut E, navigator: &mut N) -> anyhow::Result<CrawlSummary>
    where
        E: ItemExtractor + ?Sized,
        N: PageNavigator + ?Sized,
    {
        let resumed = self.store.load();
        let ledger = DedupLedger::bootstrap(self.sink.path(), &self.key);
        let mark = self.point_mark.as_ref().and_then(PointMarkStore::load);
        let mut run = Run {
            config: &self.config,
            targets: &self.targets,
            key: &self.key,
            store: &mut self.store,
            sink: &mut self.sink,
            stop: &self.stop,
            ledger,
            mark,
            state: resumed
                .clone()
                .unwrap_or_else(|| CheckpointState::at(Position::FRESH)),
            summary: CrawlSummary::default(),
        };

        let result = run.crawl(extractor, navigator, resumed.as_ref());

        // Save what we have, whatever happened.
        run.flush();
        run.store.save(&mut run.state);
        run.summary.position = run.state.position();

        match result {
            Ok(stop) => {
                run.summary.stop = stop;
                if stop != StopReason::Interrupted
                    && let Some(first) = &run.summary.first_new
                    && let Some(marks) = &self.point_mark
                {
                    marks.save(first);
                }
                let s = &run.summary;
                tracing::info!(
                    target: "crawl",
                    "\x1b[32mcrawl finished ({stop:?}): {} pages, {} extracted, {} refreshed, {} duplicates, {} failed, {} discarded\x1b[0m",
                    s.pages, s.extracted, s.refreshed, s.duplicates, s.failed, s.discarded,
                );
                Ok(run.summary)
            }
            Err(err) => {
                tracing::error!(target: "crawl", "\x1b[31mcrawl aborted at {:?}: {err:#}\x1b[0m", run.summary.position);
                Err(err)
            }
        }
    }
}

struct Run<'c> {
    config: &'c CrawlConfig,
    targets: &'c [String],
    key: &'c KeySpec,
    store: &'c mut ProgressStore,
    sink: &'c mut RecordSink,
    stop: &'c AtomicBool,
    ledger: DedupLedger,
    mark: Option<RecordIdentifier>,
    state: CheckpointState,
    summary: CrawlSummary,
}

impl Run<'_> {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn flush(&mut self) {
        if let Err(err) = self.sink.flush() {
            tracing::error!(target: "sink", "\x1b[31mflush to {} failed: {err:#}\x1b[0m", self.sink.path().display());
        }
    }

    fn checkpoint(&mut self, page: u32, item: u32, url: Option<String>) {
        self.state.page = page;
        self.state.item = item;
        if url.is_some() {
            self.state.last_url = url;
        }
        self.store.save(&mut self.state);
    }

    fn crawl<E, N>(
        &mut self,
        extractor: &mut E,
        navigator: &mut N,
        resumed: Option<&CheckpointState>,
    ) -> anyhow::Result<StopReason>
    where
        E: ItemExtractor + ?Sized,
        N: PageNavigator + ?Sized,
    {
        let start = self.state.position();
        let targets = self.targets;
        let mut reason = StopReason::Exhausted;

        for target_index in start.target..targets.len() {
            let target = targets[target_index].as_str();
            let resume = resumed.filter(|s| s.target == target_index);
            let (page, skip_up_to) = resume.map_or((1, 0), |s| (s.page, s.item));

            tracing::info!(target: "crawl", "======== \x1b[32mTARGET #{target_index} \x1b[36m{target}\x1b[0m from page {page} ========");

            let ctx = PageContext {
                target_index,
                target,
                page,
            };
            let resume_url = resume.and_then(|s| s.last_url.as_deref());
            let opened = navigator.open(&ctx, resume_url).or_else(|err| {
                if is_fatal(&err) || is_interrupted(&err) || resume_url.is_none() {
                    return Err(err);
                }
                tracing::warn!(target: "crawl", "[#{target_index}] cannot reopen {resume_url:?}: {err:#}, starting from the target");
                navigator.open(&ctx, None)
            });
            match opened {
                Ok(()) => {}
                Err(err) if is_interrupted(&err) => return Ok(StopReason::Interrupted),
                Err(err) => return Err(err),
            }
            if let Some(url) = navigator.current_url() {
                self.state.last_url = Some(url);
            }

            reason = self.crawl_target(extractor, navigator, target_index, target, page, skip_up_to)?;
            if matches!(reason, StopReason::PointMarkReached | StopReason::Interrupted) {
                return Ok(reason);
            }

            if target_index + 1 < targets.len() {
                self.state.target = target_index + 1;
                self.state.last_url = None;
                self.checkpoint(1, 0, None);
            }
        }

        Ok(reason)
    }

    fn crawl_target<E, N>(
        &mut self,
        extractor: &mut E,
        navigator: &mut N,
        target_index: usize,
        target: &str,
        mut page: u32,
        mut skip_up_to: u32,
    ) -> anyhow::Result<StopReason>
    where
        E: ItemExtractor + ?Sized,
        N: PageNavigator + ?Sized,
    {
        let mut empty = 0;

        loop {
            if page > self.config.max_pages {
                tracing::info!(target: "crawl", "[#{target_index}] reached page limit {}", self.config.max_pages);
                return Ok(StopReason::MaxPages);
            }
            if self.stopped() {
                return Ok(StopReason::Interrupted);
            }

            let ctx = PageContext {
                target_index,
                target,
                page,
            };
            self.summary.pages += 1;

            let count = match extractor.enumerate(&ctx) {
                Ok(n) => n.min(self.config.max_items_per_page as usize) as u32,
                Err(err) if is_fatal(&err) => return Err(err),
                Err(err) if is_interrupted(&err) => return Ok(StopReason::Interrupted),
                Err(err) => {
                    tracing::warn!(target: "crawl", "[#{target_index}] [Page #{page}] cannot list items: {err:#}");
                    0
                }
            };

            if count == 0 {
                empty += 1;
                tracing::warn!(target: "crawl", "[#{target_index}] [Page #{page}] no items ({empty}/{} empty pages)", self.config.empty_page_limit);
                if empty >= self.config.empty_page_limit {
                    return Ok(StopReason::EmptyPages);
                }
            } else {
                empty = 0;
                tracing::info!(target: "crawl", "[#{target_index}] [Page #{page}] {count} items");
            }

            for item in 1..=count {
                if self.stopped() {
                    return Ok(StopReason::Interrupted);
                }
                if item <= skip_up_to {
                    self.summary.resumed_skips += 1;
                    continue;
                }

                match self.process_item(extractor, &ctx, item)? {
                    Flow::Next => {}
                    Flow::PointMark => return Ok(StopReason::PointMarkReached),
                    Flow::Interrupted => return Ok(StopReason::Interrupted),
                }
                self.checkpoint(page, item, navigator.current_url());

                if self.sink.buffered() >= self.config.flush_threshold {
                    self.flush();
                }
            }
            self.flush();

            if !navigator.advance(&ctx) {
                tracing::info!(target: "crawl", "[#{target_index}] [Page #{page}] no next page");
                return Ok(StopReason::Exhausted);
            }
            page += 1;
            skip_up_to = 0;
            self.checkpoint(page, 0, navigator.current_url());
        }
    }

    fn process_item<E>(&mut self, extractor: &mut E, ctx: &PageContext<'_>, item: u32) -> anyhow::Result<Flow>
    where
        E: ItemExtractor + ?Sized,
    {
        let page = ctx.page;
        let preview_id = extractor
            .preview(ctx, item)
            .and_then(|p| self.key.identify_partial(&p));

        if let Some(id) = &preview_id {
            if self.mark.as_ref() == Some(id) {
                tracing::info!(target: "crawl", "[Page #{page}] item {item}: \x1b[33mpoint mark reached\x1b[0m ({id})");
                return Ok(Flow::PointMark);
            }
            if self.ledger.contains(id) {
                tracing::debug!(target: "crawl", "[Page #{page}] item {item}: already captured ({id})");
                self.summary.duplicates += 1;
                self.state.last_id = Some(id.clone());
                return Ok(Flow::Next);
            }
        }

        let record = match extractor.extract(ctx, item) {
            Ok(Some(r)) => r,
            Ok(None) => {
                tracing::warn!(target: "crawl", "[Page #{page}] item {item}: extraction produced nothing");
                self.summary.failed += 1;
                self.state.last_id = preview_id;
                return Ok(Flow::Next);
            }
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) if is_interrupted(&err) => return Ok(Flow::Interrupted),
            Err(err) => {
                tracing::warn!(target: "crawl", "[Page #{page}] item {item}: {err:#}");
                self.summary.failed += 1;
                self.state.last_id = preview_id;
                return Ok(Flow::Next);
            }
        };

        let sentinels = record.sentinel_count();
        if sentinels > self.config.max_sentinels {
            tracing::warn!(target: "crawl", "[Page #{page}] item {item}: {sentinels}/{} fields missing, discarded", record.len());
            self.summary.discarded += 1;
            self.state.last_id = preview_id;
            return Ok(Flow::Next);
        }

        let id = self.key.identify(&record);
        if preview_id.is_none() && self.mark.as_ref() == Some(&id) {
            tracing::info!(target: "crawl", "[Page #{page}] item {item}: \x1b[33mpoint mark reached\x1b[0m ({id})");
            return Ok(Flow::PointMark);
        }

        if self.ledger.add(id.clone()) {
            tracing::info!(target: "crawl", "[Page #{page}] item {item}: \x1b[36m{id}\x1b[0m");
            self.summary.first_new.get_or_insert_with(|| id.clone());
            self.summary.extracted += 1;
        } else {
            tracing::info!(target: "crawl", "[Page #{page}] item {item}: {id} (refreshed)");
            self.summary.refreshed += 1;
        }
        // The list-level identifier is what later listings are checked against.
        if let Some(preview_id) = preview_id {
            self.ledger.add(preview_id);
        }
        self.state.last_id = Some(id);
        self.sink.buffer(record);

        if self.config.item_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.item_delay_ms));
        }
        Ok(Flow::Next)
    }
}
