// Scripted in-memory browser surface shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use pahe_engine::browser::{BrowserSurface, ElementRef, SurfaceProvider};
use pahe_engine::model::DownloadTask;
use pahe_engine::tasks::TaskTracker;

/// What a fake surface should answer with. Unset fields behave as "not on
/// this page".
#[derive(Default, Clone)]
pub struct SurfaceScript {
    pub cookies: HashMap<String, String>,
    pub page_source: String,
    pub current_url: String,
    /// Selector -> element ids present on the page.
    pub elements: HashMap<String, Vec<u64>>,
    pub texts: HashMap<u64, String>,
    pub attributes: HashMap<u64, HashMap<String, String>>,
    pub form_action: Option<String>,
    pub form_data: serde_json::Value,
    pub user_agent: Option<String>,
}

/// One scripted browsing context. Counters let tests assert teardown and
/// single-context invariants.
pub struct FakeSurface {
    script: SurfaceScript,
    pub navigations: Mutex<Vec<String>>,
    pub clicks: AtomicUsize,
    pub close_tab_calls: AtomicUsize,
    pub quit_calls: AtomicUsize,
}

impl FakeSurface {
    pub fn new(script: SurfaceScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            navigations: Mutex::new(Vec::new()),
            clicks: AtomicUsize::new(0),
            close_tab_calls: AtomicUsize::new(0),
            quit_calls: AtomicUsize::new(0),
        })
    }

    pub fn quit_count(&self) -> usize {
        self.quit_calls.load(Ordering::SeqCst)
    }

    pub fn close_tab_count(&self) -> usize {
        self.close_tab_calls.load(Ordering::SeqCst)
    }
}

/// Cloneable handle so tests can keep the surface while the code under test
/// owns the boxed trait object.
pub struct SharedSurface(pub Arc<FakeSurface>);

#[async_trait]
impl BrowserSurface for SharedSurface {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.0.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.0.script.current_url.clone())
    }

    async fn page_source(&self) -> Result<String> {
        Ok(self.0.script.page_source.clone())
    }

    async fn find_elements(&self, selector: &str) -> Result<Vec<ElementRef>> {
        Ok(self
            .0
            .script
            .elements
            .get(selector)
            .map(|ids| ids.iter().map(|id| ElementRef(*id)).collect())
            .unwrap_or_default())
    }

    async fn is_visible(&self, _element: ElementRef) -> Result<bool> {
        Ok(true)
    }

    async fn click(&self, _element: ElementRef) -> Result<()> {
        self.0.clicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>> {
        Ok(self
            .0
            .script
            .attributes
            .get(&element.0)
            .and_then(|attrs| attrs.get(name).cloned()))
    }

    async fn text(&self, element: ElementRef) -> Result<String> {
        Ok(self
            .0
            .script
            .texts
            .get(&element.0)
            .cloned()
            .unwrap_or_default())
    }

    async fn cookies(&self) -> Result<HashMap<String, String>> {
        Ok(self.0.script.cookies.clone())
    }

    async fn run_script(&self, snippet: &str) -> Result<serde_json::Value> {
        if snippet.contains("closest('form')") {
            return Ok(self
                .0
                .script
                .form_action
                .clone()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null));
        }
        if snippet.contains("input[name]") {
            return Ok(self.0.script.form_data.clone());
        }
        if snippet.contains("userAgent") {
            return Ok(self
                .0
                .script
                .user_agent
                .clone()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null));
        }
        Ok(serde_json::Value::Null)
    }

    async fn close_extra_tabs(&self) -> Result<()> {
        self.0.close_tab_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        self.0.quit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-scripted surfaces in order; runs dry when the queue is
/// exhausted so tests catch unexpected extra acquisitions.
pub struct FakeProvider {
    surfaces: Mutex<VecDeque<Arc<FakeSurface>>>,
    pub acquired: AtomicUsize,
}

impl FakeProvider {
    pub fn new(surfaces: Vec<Arc<FakeSurface>>) -> Arc<Self> {
        Arc::new(Self {
            surfaces: Mutex::new(surfaces.into()),
            acquired: AtomicUsize::new(0),
        })
    }

    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SurfaceProvider for FakeProvider {
    async fn acquire(&self) -> Result<Box<dyn BrowserSurface>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let surface = self
            .surfaces
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted surface left"))?;
        Ok(Box::new(SharedSurface(surface)))
    }
}

/// A script whose page passes session minting immediately: the site-ready
/// selector matches and the given cookies are set.
pub fn minted_script(cookies: &[(&str, &str)]) -> SurfaceScript {
    SurfaceScript {
        cookies: cookies
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        elements: HashMap::from([(
            "input[type='search'], input#search, .search".to_string(),
            vec![1],
        )]),
        ..Default::default()
    }
}

/// Poll the tracker until the task goes terminal or the timeout elapses.
pub async fn wait_terminal(
    tracker: &TaskTracker,
    id: &str,
    timeout: Duration,
) -> DownloadTask {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = tracker.get(id).expect("task exists");
        if task.status.is_terminal() {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} did not reach a terminal state in {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
