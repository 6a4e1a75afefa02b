//! Browser-backed extractor and navigator for listing sites described by a
//! JSON [`SiteConfig`].

pub mod puppeteer;

use std::{
    fs::File,
    io::{self, BufReader},
    path::Path,
    sync::{Arc, LazyLock, atomic::AtomicBool},
    time::Duration,
};

use compact_str::CompactString;
use headless_chrome::Tab;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

use crate::{
    crawl::{CrawlConfig, Interrupted, ItemExtractor, PageContext, PageNavigator},
    navigate::Ladder,
    record::{KeySpec, Record},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: CompactString,
    /// CSS selector relative to the row (or detail page); `None` is the row itself.
    #[serde(default)]
    pub selector: Option<String>,
    /// Read this attribute instead of the text content.
    #[serde(default)]
    pub attr: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Constant {
    pub name: CompactString,
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetailSpec {
    /// Link inside the row leading to the detail page.
    pub link: String,
    pub ready: String,
    pub fields: Vec<FieldSpec>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pagination {
    pub next: Option<String>,
    /// Selector of the numbered link to page `{n}`.
    pub page_link: Option<String>,
    /// Query parameter carrying the page number, for direct navigation.
    pub page_param: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub targets: Vec<String>,
    /// Present once the list has rendered.
    pub ready: String,
    pub row: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub detail: Option<DetailSpec>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    pub key: KeySpec,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub crawl: CrawlConfig,
}

const fn default_timeout() -> u64 {
    30
}

impl SiteConfig {
    pub fn load(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(io::Error::other)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

fn parse_selector(s: &str) -> anyhow::Result<Selector> {
    Selector::parse(s).map_err(|e| anyhow::anyhow!("bad selector {s:?}: {e:?}"))
}

pub fn squash(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

struct CompiledField {
    name: CompactString,
    selector: Option<Selector>,
    attr: Option<String>,
}

impl CompiledField {
    fn compile(spec: &FieldSpec) -> anyhow::Result<Self> {
        Ok(Self {
            name: spec.name.clone(),
            selector: spec.selector.as_deref().map(parse_selector).transpose()?,
            attr: spec.attr.clone(),
        })
    }

    fn read(&self, scope: ElementRef<'_>) -> Option<String> {
        let el = match &self.selector {
            Some(sel) => scope.select(sel).next()?,
            None => scope,
        };
        let raw = match &self.attr {
            Some(attr) => el.attr(attr)?.to_owned(),
            None => el.text().collect::<String>(),
        };
        let value = squash(&raw);
        (!value.is_empty()).then_some(value)
    }
}

fn compile_all(specs: &[FieldSpec]) -> anyhow::Result<Vec<CompiledField>> {
    specs.iter().map(CompiledField::compile).collect()
}

fn read_fields(record: &mut Record, fields: &[CompiledField], scope: ElementRef<'_>) {
    for field in fields {
        let value = field.read(scope);
        if value.is_none() {
            tracing::debug!(target: "extract", "{} not found", field.name);
        }
        record.set(field.name.clone(), value);
    }
}

struct Row {
    record: Record,
    link: Option<String>,
}

struct CompiledDetail {
    link: Selector,
    ready: String,
    fields: Vec<CompiledField>,
}

pub struct SiteExtractor {
    tab: Arc<Tab>,
    timeout: Duration,
    ready: String,
    row: Selector,
    fields: Vec<CompiledField>,
    constants: Vec<Constant>,
    detail: Option<CompiledDetail>,
    rows: Vec<Row>,
    stop: Arc<AtomicBool>,
}

impl SiteExtractor {
    pub fn new(tab: Arc<Tab>, site: &SiteConfig) -> anyhow::Result<Self> {
        let detail = site
            .detail
            .as_ref()
            .map(|d| -> anyhow::Result<_> {
                Ok(CompiledDetail {
                    link: parse_selector(&d.link)?,
                    ready: d.ready.clone(),
                    fields: compile_all(&d.fields)?,
                })
            })
            .transpose()?;

        Ok(Self {
            tab,
            timeout: site.timeout(),
            ready: site.ready.clone(),
            row: parse_selector(&site.row)?,
            fields: compile_all(&site.fields)?,
            constants: site.constants.clone(),
            detail,
            rows: Vec::new(),
            stop: Arc::default(),
        })
    }

    /// Waits give up as soon as `stop` is raised.
    #[must_use]
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    fn wait_for(&self, selector: &str) -> anyhow::Result<()> {
        puppeteer::wait_for(&self.tab, selector, self.timeout, &self.stop).map(|_| ())
    }

    fn parse_rows(&self, html: &str) -> Vec<Row> {
        let document = Html::parse_document(html);
        document
            .select(&self.row)
            .map(|row| {
                let mut record = Record::new();
                for c in &self.constants {
                    record.insert(c.name.clone(), c.value.clone());
                }
                read_fields(&mut record, &self.fields, row);
                let link = self.detail.as_ref().and_then(|d| {
                    row.select(&d.link)
                        .next()
                        .and_then(|a| a.attr("href"))
                        .map(ToOwned::to_owned)
                });
                Row { record, link }
            })
            .collect()
    }

    fn visit_detail(&self, href: &str, detail: &CompiledDetail) -> anyhow::Result<Record> {
        let url = puppeteer::absolute_url(&self.tab, href)?;
        let list_url = self.tab.get_url();

        puppeteer::navigate_to(&self.tab, &url)?;
        let scraped = self
            .wait_for(&detail.ready)
            .and_then(|()| self.tab.get_content())
            .map(|html| {
                let document = Html::parse_document(&html);
                let mut record = Record::new();
                read_fields(&mut record, &detail.fields, document.root_element());
                record
            });

        let back = puppeteer::history_back(&self.tab)
            .and_then(|()| self.wait_for(&self.ready));
        if let Err(err) = back {
            tracing::warn!(target: "extract", "history back failed ({err:#}), reloading {list_url}");
            puppeteer::navigate_to(&self.tab, &list_url)?;
            self.wait_for(&self.ready)?;
        }

        scraped
    }
}

impl ItemExtractor for SiteExtractor {
    fn enumerate(&mut self, ctx: &PageContext<'_>) -> anyhow::Result<usize> {
        if let Err(err) = self.wait_for(&self.ready) {
            if is_interrupted(&err) {
                return Err(err);
            }
            puppeteer::ensure_alive(&self.tab)?;
            tracing::warn!(target: "extract", "[Page #{}] list never became ready: {err:#}", ctx.page);
            self.rows.clear();
            return Ok(0);
        }
        let html = match self.tab.get_content() {
            Ok(html) => html,
            Err(err) => {
                puppeteer::ensure_alive(&self.tab)?;
                return Err(err);
            }
        };
        self.rows = self.parse_rows(&html);
        Ok(self.rows.len())
    }

    fn preview(&mut self, _ctx: &PageContext<'_>, item: u32) -> Option<Record> {
        let row = self.rows.get(item.checked_sub(1)? as usize)?;
        Some(row.record.clone())
    }

    fn extract(&mut self, _ctx: &PageContext<'_>, item: u32) -> anyhow::Result<Option<Record>> {
        let Some(row) = item
            .checked_sub(1)
            .and_then(|i| self.rows.get(i as usize))
        else {
            return Ok(None);
        };
        let mut record = row.record.clone();

        if let Some(detail) = &self.detail {
            match &row.link {
                Some(href) => match self.visit_detail(href, detail) {
                    Ok(fields) => record.merge(fields),
                    Err(err) => {
                        puppeteer::ensure_alive(&self.tab)?;
                        return Err(err.context(format!("detail page {href}")));
                    }
                },
                None => {
                    for field in &detail.fields {
                        record.set(field.name.clone(), None);
                    }
                }
            }
        }

        Ok(Some(record))
    }
}

fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<Interrupted>())
}

/// Rewrites (or appends) the `param` query parameter of `url` to `page`.
pub fn with_page_param(url: &str, param: &str, page: u32) -> String {
    let pattern = format!(r"([?&]{}=)[^&#]*", regex::escape(param));
    let Ok(re) = Regex::new(&pattern) else {
        return url.to_owned();
    };
    if re.is_match(url) {
        return re.replace(url, format!("${{1}}{page}")).into_owned();
    }

    let (base, fragment) = url.split_once('#').map_or((url, None), |(b, f)| (b, Some(f)));
    let sep = if base.contains('?') { '&' } else { '?' };
    let mut out = format!("{base}{sep}{param}={page}");
    if let Some(f) = fragment {
        out.push('#');
        out.push_str(f);
    }
    out
}

/// A page to load and how many "next page" steps to take from it.
#[derive(Debug, PartialEq, Eq)]
struct Landing {
    url: String,
    steps: u32,
}

/// Ways to reach `page` of `target`, best first. A saved URL is only trusted to
/// show `page` when the page parameter can be written into it or when it
/// differs from the target itself; otherwise it is page 1 of a site that pages
/// without changing its URL, and the rest has to be clicked.
fn landings(target: &str, page: u32, resume_url: Option<&str>, page_param: Option<&str>) -> Vec<Landing> {
    let from_target = match page_param {
        Some(param) if page > 1 => Landing {
            url: with_page_param(target, param, page),
            steps: 0,
        },
        _ => Landing {
            url: target.to_owned(),
            steps: page - 1,
        },
    };

    let Some(resume) = resume_url else {
        return vec![from_target];
    };
    let resumed = match page_param {
        Some(param) => Landing {
            url: with_page_param(resume, param, page),
            steps: 0,
        },
        None if resume == target => Landing {
            url: resume.to_owned(),
            steps: page - 1,
        },
        None => Landing {
            url: resume.to_owned(),
            steps: 0,
        },
    };

    if resumed == from_target {
        vec![resumed]
    } else {
        vec![resumed, from_target]
    }
}

pub struct SiteNavigator {
    tab: Arc<Tab>,
    timeout: Duration,
    ready: String,
    row: String,
    pagination: Pagination,
    stop: Arc<AtomicBool>,
}

impl SiteNavigator {
    pub fn new(tab: Arc<Tab>, site: &SiteConfig) -> Self {
        Self {
            tab,
            timeout: site.timeout(),
            ready: site.ready.clone(),
            row: site.row.clone(),
            pagination: site.pagination.clone(),
            stop: Arc::default(),
        }
    }

    /// Waits give up as soon as `stop` is raised.
    #[must_use]
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    fn first_row(&self) -> Option<String> {
        let el = self.tab.find_element(&self.row).ok()?;
        puppeteer::outer_html(&el).ok()
    }

    fn direct_url(&self, current: &str, page: u32) -> Option<String> {
        let param = self.pagination.page_param.as_deref()?;
        Some(with_page_param(current, param, page))
    }

    fn ladder(&self, next_page: u32) -> Ladder<'_, Tab> {
        let mut selectors = Vec::new();
        if let Some(link) = &self.pagination.page_link {
            selectors.push(link.replace("{n}", &next_page.to_string()));
        }
        if let Some(next) = &self.pagination.next {
            selectors.push(next.clone());
        }

        let mut ladder = Ladder::new("next-page");
        for selector in &selectors {
            let js = selector.clone();
            ladder = ladder.then("js click", move |tab: &Tab| {
                puppeteer::js_click(&tab.find_element(&js)?)
            });
        }
        for selector in selectors {
            ladder = ladder.then("native click", move |tab: &Tab| {
                puppeteer::native_click(&tab.find_element(&selector)?)
            });
        }
        ladder.then("direct url", move |tab: &Tab| {
            let url = self
                .direct_url(&tab.get_url(), next_page)
                .ok_or_else(|| anyhow::anyhow!("no page parameter configured"))?;
            puppeteer::navigate_to(tab, &url)
        })
    }

    fn land(&mut self, ctx: &PageContext<'_>, landing: &Landing) -> anyhow::Result<()> {
        puppeteer::navigate_to(&self.tab, &landing.url)?;
        puppeteer::wait_for(&self.tab, &self.ready, self.timeout, &self.stop)?;

        let first = ctx.page - landing.steps;
        for page in first..ctx.page {
            let step = PageContext { page, ..*ctx };
            if !self.advance(&step) {
                anyhow::bail!("stuck on page {page} on the way to page {}", ctx.page);
            }
        }
        Ok(())
    }
}

impl PageNavigator for SiteNavigator {
    fn open(&mut self, ctx: &PageContext<'_>, resume_url: Option<&str>) -> anyhow::Result<()> {
        let plan = landings(ctx.target, ctx.page, resume_url, self.pagination.page_param.as_deref());

        let mut last = None;
        for landing in &plan {
            match self.land(ctx, landing) {
                Ok(()) => return Ok(()),
                Err(err) if is_interrupted(&err) => return Err(err),
                Err(err) => {
                    puppeteer::ensure_alive(&self.tab)?;
                    tracing::warn!(target: "navigate", "[#{}] cannot reach page {} via {}: {err:#}", ctx.target_index, ctx.page, landing.url);
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| anyhow::anyhow!("no way to reach page {}", ctx.page)))
    }

    fn advance(&mut self, ctx: &PageContext<'_>) -> bool {
        let before_url = self.tab.get_url();
        let before_row = self.first_row();
        let next_page = ctx.page + 1;

        let moved = |tab: &Tab| {
            tab.find_element(&self.ready).is_ok()
                && (tab.get_url() != before_url || self.first_row() != before_row)
        };

        match self.ladder(next_page).run(&self.tab, self.timeout, moved) {
            Some(strategy) => {
                tracing::info!(target: "navigate", "[#{}] page {} -> {next_page} via {strategy}", ctx.target_index, ctx.page);
                true
            }
            None => false,
        }
    }

    fn current_url(&self) -> Option<String> {
        Some(self.tab.get_url())
    }
}
