use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::sleep,
    time::{Duration, Instant},
};

use headless_chrome::{
    Browser, Element, LaunchOptions, Tab,
    browser::tab::NoElementFound,
    protocol::cdp::DOM,
};
use rand::seq::IndexedRandom;
use serde_json::Value;

use crate::crawl::{Interrupted, SessionLost};

pub const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

pub fn puppeteer(headless: bool, proxy: Option<&str>) -> anyhow::Result<Browser> {
    Browser::new(LaunchOptions {
        args: vec![std::ffi::OsStr::new("--disable-blink-features=AutomationControlled")],
        headless,
        proxy_server: proxy,
        window_size: Some((1920, 1080)),
        idle_browser_timeout: Duration::from_secs(600),
        ..LaunchOptions::default()
    })
}

/// Opens a fresh tab with a random user agent and closes every other tab.
#[allow(clippy::significant_drop_tightening)]
pub fn first_tab(browser: &Browser, timeout: Duration) -> anyhow::Result<Arc<Tab>> {
    let tab = browser.new_tab()?;

    {
        let tabs_guard = browser
            .get_tabs()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        for remain in &*tabs_guard {
            if !Arc::ptr_eq(&tab, remain) {
                remain.close(true)?;
            }
        }
    }

    let user_agent = *USER_AGENTS
        .choose(&mut rand::rng())
        .ok_or_else(|| anyhow::anyhow!("no UA available"))?;
    tracing::info!(target: "puppeteer", "choosing user-agent \x1b[1;36m{user_agent}\x1b[0m ...");

    tab.set_user_agent(user_agent, None, None)?;
    tab.set_default_timeout(timeout);
    Ok(tab)
}

pub fn navigate_to(tab: &Tab, url: &str) -> anyhow::Result<()> {
    tracing::debug!(target: "puppeteer", "navigating to {url}");
    tab.navigate_to(url)?.wait_until_navigated()?;
    Ok(())
}

/// Polls for `selector` until it shows up, `timeout` elapses or `stop` is raised.
pub fn wait_for<'tab>(
    tab: &'tab Tab,
    selector: &str,
    timeout: Duration,
    stop: &AtomicBool,
) -> anyhow::Result<Element<'tab>> {
    const PERIOD: Duration = Duration::from_millis(1832 / 4);

    let deadline = Instant::now() + timeout;
    loop {
        match tab.find_element(selector) {
            Ok(element) => break Ok(element),
            Err(err) => {
                if !err.is::<NoElementFound>() || Instant::now() >= deadline {
                    break Err(err.context(format!("waiting for {selector:?}")));
                }
            }
        }
        if stop.load(Ordering::Acquire) {
            break Err(anyhow::Error::new(Interrupted).context(format!("waiting for {selector:?}")));
        }

        sleep(PERIOD);
    }
}

pub fn outer_html(element: &Element<'_>) -> anyhow::Result<String> {
    element
        .parent
        .call_method(DOM::GetOuterHTML {
            node_id: Some(element.node_id),
            backend_node_id: Some(element.backend_node_id),
            object_id: Some(element.remote_object_id.clone()),
            include_shadow_dom: None,
        })
        .map(|x| x.outer_html)
}

pub fn js_click(element: &Element<'_>) -> anyhow::Result<()> {
    element.call_js_fn(
        "function(){this.scrollIntoView({block:'center'});this.click();}",
        Vec::new(),
        false,
    )?;
    Ok(())
}

pub fn native_click(element: &Element<'_>) -> anyhow::Result<()> {
    element.scroll_into_view()?.click()?;
    Ok(())
}

/// Resolves `href` against the page currently loaded in `tab`.
pub fn absolute_url(tab: &Tab, href: &str) -> anyhow::Result<String> {
    let literal = serde_json::to_string(href)?;
    let ret = tab.evaluate(&format!("new URL({literal}, location.href).href"), false)?;

    match ret.value {
        Some(Value::String(s)) => Ok(s),
        Some(value) => anyhow::bail!("not a string: {value}"),
        None => anyhow::bail!("returned nothing"),
    }
}

pub fn history_back(tab: &Tab) -> anyhow::Result<()> {
    tab.evaluate("history.back()", false)?;
    Ok(())
}

/// Distinguishes a dead session from an ordinary page error.
pub fn ensure_alive(tab: &Tab) -> anyhow::Result<()> {
    tab.evaluate("1", false)
        .map(|_| ())
        .map_err(|err| SessionLost(format!("{err:#}")).into())
}
