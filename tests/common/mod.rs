#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use hashbrown::HashSet;
use lscr::{
    CrawlConfig, Crawler, Interrupted, ItemExtractor, KeySpec, PageContext, PageNavigator,
    Position, ProgressStore, Record, SENTINEL, SessionLost, table,
};

pub fn key() -> KeySpec {
    KeySpec::new(["Title", "Institution", "Date"])
}

pub fn lecture(title: &str) -> Record {
    Record::new()
        .with("Title", title)
        .with("Institution", "Library")
        .with("Date", "2024-05-01")
        .with("Fee", "Free")
        .with("Quota", "20")
        .with("Address", "Main St")
        .with("State", "Open")
}

pub fn hollow(title: &str) -> Record {
    lecture(title)
        .with("Fee", SENTINEL)
        .with("Quota", SENTINEL)
        .with("Address", SENTINEL)
        .with("State", SENTINEL)
        .with("Phone", SENTINEL)
        .with("Email", SENTINEL)
}

/// `pages[target][page - 1]` lists the items of that page.
pub type Site = Vec<Vec<Vec<Record>>>;

pub fn one_target(pages: Vec<Vec<Record>>) -> Site {
    vec![pages]
}

pub fn titles(prefix: &str, n: usize) -> Vec<Record> {
    (1..=n).map(|i| lecture(&format!("{prefix}{i}"))).collect()
}

#[derive(Default)]
pub struct FakeExtractor {
    pub site: Site,
    pub previews: bool,
    /// Appended to the previewed title, as when a list truncates it.
    pub preview_suffix: &'static str,
    pub returns_none: HashSet<(u32, u32)>,
    pub errors: HashSet<(u32, u32)>,
    pub fatal: Option<(u32, u32)>,
    /// Raises the flag once this item has been extracted.
    pub stop_after: Option<((u32, u32), Arc<AtomicBool>)>,
    /// Raises the flag while this item is still loading.
    pub interrupt_at: Option<((u32, u32), Arc<AtomicBool>)>,
    /// Reads the checkpoint on every extract call.
    pub probe: Option<PathBuf>,
    pub probed: Vec<Option<Position>>,
    pub extracted: Vec<(usize, u32, u32)>,
}

impl FakeExtractor {
    pub fn new(site: Site) -> Self {
        Self {
            site,
            previews: true,
            ..Self::default()
        }
    }

    fn item(&self, ctx: &PageContext<'_>, item: u32) -> Option<&Record> {
        self.site
            .get(ctx.target_index)?
            .get(ctx.page as usize - 1)?
            .get(item as usize - 1)
    }

    pub fn extracted_items(&self) -> Vec<(u32, u32)> {
        self.extracted.iter().map(|&(_, p, i)| (p, i)).collect()
    }
}

impl ItemExtractor for FakeExtractor {
    fn enumerate(&mut self, ctx: &PageContext<'_>) -> anyhow::Result<usize> {
        Ok(self
            .site
            .get(ctx.target_index)
            .and_then(|t| t.get(ctx.page as usize - 1))
            .map_or(0, Vec::len))
    }

    fn preview(&mut self, ctx: &PageContext<'_>, item: u32) -> Option<Record> {
        if !self.previews {
            return None;
        }
        let full = self.item(ctx, item)?;
        let preview = Record::from_pairs(
            ["Title", "Institution", "Date"]
                .into_iter()
                .filter_map(|f| Some((f, full.get(f)?.to_owned()))),
        );
        let title = format!("{}{}", full.get("Title")?, self.preview_suffix);
        Some(preview.with("Title", title))
    }

    fn extract(&mut self, ctx: &PageContext<'_>, item: u32) -> anyhow::Result<Option<Record>> {
        if let Some(path) = &self.probe {
            let loaded = ProgressStore::new(path).load().map(|s| s.position());
            self.probed.push(loaded);
        }
        self.extracted.push((ctx.target_index, ctx.page, item));

        let at = (ctx.page, item);
        if self.fatal == Some(at) {
            return Err(anyhow::Error::new(SessionLost("tab crashed".into())).context("extract"));
        }
        if let Some((when, flag)) = &self.interrupt_at
            && *when == at
        {
            flag.store(true, Ordering::Release);
            return Err(anyhow::Error::new(Interrupted).context("waiting for the detail page"));
        }
        if self.errors.contains(&at) {
            anyhow::bail!("stale element at page {} item {item}", ctx.page);
        }
        if let Some((when, flag)) = &self.stop_after
            && *when == at
        {
            flag.store(true, Ordering::Release);
        }
        if self.returns_none.contains(&at) {
            return Ok(None);
        }
        Ok(self.item(ctx, item).cloned())
    }
}

pub struct FakeNavigator {
    pub pages: Vec<u32>,
    /// Keeps claiming success past the last page.
    pub endless: bool,
    /// Saved URLs no longer load.
    pub stale_resume: bool,
    pub opened: Vec<(usize, u32, Option<String>)>,
}

impl FakeNavigator {
    pub fn new(site: &Site) -> Self {
        Self {
            pages: site.iter().map(|t| t.len() as u32).collect(),
            endless: false,
            stale_resume: false,
            opened: Vec::new(),
        }
    }
}

impl PageNavigator for FakeNavigator {
    fn open(&mut self, ctx: &PageContext<'_>, resume_url: Option<&str>) -> anyhow::Result<()> {
        self.opened
            .push((ctx.target_index, ctx.page, resume_url.map(ToOwned::to_owned)));
        if self.stale_resume && resume_url.is_some() {
            anyhow::bail!("waiting for \"table\": timed out");
        }
        Ok(())
    }

    fn advance(&mut self, ctx: &PageContext<'_>) -> bool {
        self.endless || ctx.page < self.pages[ctx.target_index]
    }

    fn current_url(&self) -> Option<String> {
        Some("https://example.org/list".to_owned())
    }
}

pub struct Files {
    pub dir: tempfile::TempDir,
}

impl Files {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn out(&self) -> PathBuf {
        self.dir.path().join("lectures.csv")
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.dir.path().join("lectures_checkpoint.json")
    }

    pub fn mark(&self) -> PathBuf {
        self.dir.path().join("point_mark.json")
    }

    pub fn crawler(&self, targets: usize) -> Crawler {
        self.crawler_with(targets, config())
    }

    pub fn crawler_with(&self, targets: usize, config: CrawlConfig) -> Crawler {
        let targets = (0..targets)
            .map(|i| format!("https://example.org/list/{i}?page=1"))
            .collect();
        Crawler::new(config, targets, key(), self.out(), self.checkpoint())
    }

    pub fn saved_position(&self) -> Position {
        ProgressStore::new(self.checkpoint())
            .load()
            .unwrap()
            .position()
    }

    pub fn output_titles(&self) -> Vec<String> {
        read_titles(&self.out())
    }
}

pub fn config() -> CrawlConfig {
    CrawlConfig {
        item_delay_ms: 0,
        ..CrawlConfig::default()
    }
}

pub fn read_titles(path: &Path) -> Vec<String> {
    let Some(t) = table::read(path).unwrap() else {
        return Vec::new();
    };
    let col = t.column("Title").unwrap();
    t.rows.into_iter().map(|mut r| r.swap_remove(col)).collect()
}

pub const fn pos(target: usize, page: u32, item: u32) -> Position {
    Position { target, page, item }
}
