use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use url::Url;

use crate::error::{Result, ScrapeError};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub headless: bool,
    pub timeout: Duration,
    pub user_agent: String,
}

/// Hands out one browser session per extraction attempt.
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn open(&self, options: &SessionOptions) -> Result<Box<dyn BrowserSession>>;
}

/// A single page in a browser that runs the upstream's client-side script.
///
/// `close` must be safe to call more than once.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &Url) -> Result<()>;

    /// Waits until `selector` matches; `Ok(false)` when the wait timed out.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool>;

    /// Rendered markup of the current page.
    async fn content(&mut self) -> Result<String>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct ChromeBrowserFactory {
    window_size: Option<(u32, u32)>,
}

impl ChromeBrowserFactory {
    pub fn new() -> Self {
        Self {
            window_size: Some((1920, 1080)),
        }
    }
}

#[async_trait]
impl BrowserFactory for ChromeBrowserFactory {
    async fn open(&self, options: &SessionOptions) -> Result<Box<dyn BrowserSession>> {
        let options = options.clone();
        let window_size = self.window_size;
        let session = tokio::task::spawn_blocking(move || launch(&options, window_size))
            .await
            .map_err(|err| ScrapeError::Browser(format!("launch task: {err}")))??;
        Ok(Box::new(session))
    }
}

fn launch(options: &SessionOptions, window_size: Option<(u32, u32)>) -> Result<ChromeSession> {
    let user_agent_arg = format!("--user-agent={}", options.user_agent);
    let args: Vec<&OsStr> = vec![
        OsStr::new("--disable-blink-features=AutomationControlled"),
        OsStr::new("--disable-dev-shm-usage"),
        OsStr::new("--blink-settings=imagesEnabled=false"),
        OsStr::new(&user_agent_arg),
    ];

    let launch_options = LaunchOptions::default_builder()
        .headless(options.headless)
        .window_size(window_size)
        .idle_browser_timeout(options.timeout.max(Duration::from_secs(30)))
        .args(args)
        .build()
        .map_err(|err| ScrapeError::Browser(format!("launch options: {err}")))?;

    let browser = Browser::new(launch_options)
        .map_err(|err| ScrapeError::Browser(format!("launch chrome: {err}")))?;
    let tab = browser
        .new_tab()
        .map_err(|err| ScrapeError::Browser(format!("open tab: {err}")))?;
    tab.set_default_timeout(options.timeout);

    Ok(ChromeSession {
        browser: Some(browser),
        tab: Some(tab),
    })
}

/// Owns a Chrome process and its single tab. Dropping it without `close`
/// leaves the cleanup to the `Browser` drop, which ends the process.
pub struct ChromeSession {
    browser: Option<Browser>,
    tab: Option<Arc<Tab>>,
}

impl ChromeSession {
    fn tab(&self) -> Result<Arc<Tab>> {
        self.tab
            .clone()
            .ok_or_else(|| ScrapeError::Browser("session already closed".to_string()))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ScrapeError::Browser(format!("browser task: {err}")))?
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &Url) -> Result<()> {
        let tab = self.tab()?;
        let url = url.to_string();
        blocking(move || {
            tab.navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ())
                .map_err(|err| ScrapeError::Network(format!("navigate {url}: {err}")))
        })
        .await
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool> {
        let tab = self.tab()?;
        let selector = selector.to_string();
        blocking(move || {
            Ok(tab
                .wait_for_element_with_custom_timeout(&selector, timeout)
                .is_ok())
        })
        .await
    }

    async fn content(&mut self) -> Result<String> {
        let tab = self.tab()?;
        blocking(move || {
            tab.get_content()
                .map_err(|err| ScrapeError::Browser(format!("read page content: {err}")))
        })
        .await
    }

    async fn close(&mut self) {
        let tab = self.tab.take();
        let browser = self.browser.take();
        if tab.is_none() && browser.is_none() {
            return;
        }
        let _ = tokio::task::spawn_blocking(move || {
            if let Some(tab) = tab {
                if let Err(err) = tab.close(true) {
                    tracing::debug!(?err, "closing tab failed");
                }
            }
            drop(browser);
        })
        .await;
    }
}
