#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use streamhound::app::episode_store::LocalFsEpisodeStore;
use streamhound::app::job_store::{LocalFsProgressStore, ProgressStore};
use streamhound::app::model::{EpisodeLogEntry, ScrapingJob};
use streamhound::app::orchestrator::{Orchestrator, Services};
use streamhound::browser::{BrowserFactory, BrowserSession, SessionOptions};
use streamhound::cache::MemoryCache;
use streamhound::config::{ScraperConfig, parse_base_url};
use streamhound::error::{Result, ScrapeError};

type Routes = Arc<Mutex<HashMap<String, (u16, String)>>>;

/// Upstream site served by `tiny_http` on an ephemeral port.
///
/// Bodies may contain `{base}`, replaced by the site root (with trailing
/// slash) when served. Unknown paths answer 404.
pub struct StubSite {
    pub base_url: String,
    routes: Routes,
    hits: Arc<Mutex<Vec<String>>>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StubSite {
    pub fn start() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}/", server.server_addr());

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = {
            let routes = Arc::clone(&routes);
            let hits = Arc::clone(&hits);
            let base_url = base_url.clone();
            thread::spawn(move || {
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                    let request = match server.recv_timeout(Duration::from_millis(50)) {
                        Ok(Some(req)) => req,
                        Ok(None) => continue,
                        Err(_) => break,
                    };

                    let url = request.url().to_string();
                    hits.lock().unwrap().push(url.clone());
                    let (status, body) = routes
                        .lock()
                        .unwrap()
                        .get(&url)
                        .cloned()
                        .unwrap_or((404, "not found".to_string()));

                    let header = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/html; charset=utf-8"[..],
                    )
                    .expect("content-type header");
                    let response =
                        tiny_http::Response::from_string(body.replace("{base}", &base_url))
                            .with_status_code(status)
                            .with_header(header);
                    let _ = request.respond(response);
                }
            })
        };

        Self {
            base_url,
            routes,
            hits,
            shutdown: shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn route(&self, path_and_query: &str, status: u16, body: &str) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .insert(path_and_query.to_string(), (status, body.to_string()));
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    pub fn hit_count(&self, path_and_query: &str) -> usize {
        self.hits()
            .iter()
            .filter(|h| h.as_str() == path_and_query)
            .count()
    }

    /// Episode page whose player iframe points at `/stream/{stream}`.
    pub fn episode_page(&self, slug: &str, episode: u32, stream: &str) -> &Self {
        self.episode_page_embedding(slug, episode, &format!("{{base}}stream/{stream}"))
    }

    /// Episode page whose player iframe src is `src` verbatim.
    pub fn episode_page_embedding(&self, slug: &str, episode: u32, src: &str) -> &Self {
        self.route(
            &format!("/{slug}-episode-{episode}/"),
            200,
            &format!(
                r#"<!doctype html>
<html>
  <head><title>{slug} episode {episode}</title></head>
  <body>
    <iframe src="https://ads.test/banner"></iframe>
    <div id="pembed"><iframe src="{src}" allowfullscreen></iframe></div>
  </body>
</html>
"#
            ),
        )
    }

    pub fn clean_stream(&self, stream: &str) -> &Self {
        self.route(
            &format!("/stream/{stream}"),
            200,
            r#"<html><body><video src="/media/master.m3u8" controls></video></body></html>"#,
        )
    }

    pub fn guarded_stream(&self, stream: &str) -> &Self {
        self.route(
            &format!("/stream/{stream}"),
            200,
            r#"<html><body><script>
if (window.top !== window.self) { window.top.location = window.self.location; }
</script></body></html>"#,
        )
    }
}

impl Drop for StubSite {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Naruto episodes 1 and 3 exist, episode 2 does not and search finds nothing.
pub fn naruto_site() -> StubSite {
    let site = StubSite::start();
    site.episode_page("naruto", 1, "naruto-1")
        .clean_stream("naruto-1")
        .episode_page("naruto", 3, "naruto-3")
        .clean_stream("naruto-3")
        .route("/?s=Naruto", 200, "<html><body><p>No results</p></body></html>");
    site
}

/// Browser stand-in that "renders" a page with a plain GET.
#[derive(Debug, Default)]
pub struct HttpBrowserFactory {
    pub opened: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl HttpBrowserFactory {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserFactory for HttpBrowserFactory {
    async fn open(&self, options: &SessionOptions) -> Result<Box<dyn BrowserSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|err| ScrapeError::Browser(err.to_string()))?;
        Ok(Box::new(HttpSession {
            client,
            page: None,
            closed: Some(Arc::clone(&self.closed)),
        }))
    }
}

struct HttpSession {
    client: reqwest::Client,
    page: Option<String>,
    closed: Option<Arc<AtomicUsize>>,
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn navigate(&mut self, url: &Url) -> Result<()> {
        let resp = self.client.get(url.clone()).send().await?;
        self.page = Some(resp.text().await?);
        Ok(())
    }

    async fn wait_for(&mut self, _selector: &str, _timeout: Duration) -> Result<bool> {
        Ok(self.page.is_some())
    }

    async fn content(&mut self) -> Result<String> {
        self.page
            .clone()
            .ok_or_else(|| ScrapeError::Browser("no page loaded".to_string()))
    }

    async fn close(&mut self) {
        if let Some(closed) = self.closed.take() {
            closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub fn test_config(base_url: &str, data_dir: &Path) -> ScraperConfig {
    let mut config = ScraperConfig::new(parse_base_url(base_url).expect("stub base url"));
    config.data_dir = data_dir.to_path_buf();
    config.timeout = Duration::from_secs(5);
    config.max_retries = 2;
    config.retry_delay = Duration::ZERO;
    config.episode_delay = Duration::ZERO;
    config
}

/// Local-fs progress store that keeps every job it was asked to save and
/// can be told to reject episode log writes.
#[derive(Debug)]
pub struct RecordingProgressStore {
    inner: LocalFsProgressStore,
    saved: Mutex<Vec<ScrapingJob>>,
    pub fail_entries: AtomicBool,
}

impl RecordingProgressStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            inner: LocalFsProgressStore::new(data_dir),
            saved: Mutex::new(Vec::new()),
            fail_entries: AtomicBool::new(false),
        }
    }

    pub fn saved(&self) -> Vec<ScrapingJob> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressStore for RecordingProgressStore {
    async fn create(&self, job: &ScrapingJob, entries: &[EpisodeLogEntry]) -> anyhow::Result<()> {
        self.inner.create(job, entries).await
    }

    async fn get(&self, job_id: &str) -> anyhow::Result<Option<ScrapingJob>> {
        self.inner.get(job_id).await
    }

    async fn put(&self, job: &ScrapingJob) -> anyhow::Result<()> {
        self.saved.lock().unwrap().push(job.clone());
        self.inner.put(job).await
    }

    async fn latest_for_content(&self, content_id: &str) -> anyhow::Result<Option<ScrapingJob>> {
        self.inner.latest_for_content(content_id).await
    }

    async fn entries(&self, job_id: &str) -> anyhow::Result<Vec<EpisodeLogEntry>> {
        self.inner.entries(job_id).await
    }

    async fn put_entry(&self, entry: &EpisodeLogEntry) -> anyhow::Result<()> {
        if self.fail_entries.load(Ordering::SeqCst) {
            anyhow::bail!("episode log is read-only");
        }
        self.inner.put_entry(entry).await
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub browser: Arc<HttpBrowserFactory>,
    pub cache: Arc<MemoryCache>,
    pub progress: Arc<dyn ProgressStore>,
}

pub fn harness(site: &StubSite, data_dir: &Path) -> Harness {
    harness_with(
        test_config(&site.base_url, data_dir),
        Arc::new(LocalFsProgressStore::new(data_dir)),
    )
}

pub fn harness_with(config: ScraperConfig, progress: Arc<dyn ProgressStore>) -> Harness {
    let data_dir = config.data_dir.clone();
    let browser = Arc::new(HttpBrowserFactory::default());
    let cache = Arc::new(MemoryCache::new());
    let services = Services {
        cache: cache.clone(),
        browser: browser.clone(),
        episodes: Arc::new(LocalFsEpisodeStore::new(data_dir)),
        progress: progress.clone(),
    };
    let orchestrator =
        Arc::new(Orchestrator::new(config, services).expect("build orchestrator"));
    Harness {
        orchestrator,
        browser,
        cache,
        progress,
    }
}
