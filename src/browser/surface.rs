use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// Opaque handle to a DOM element located by `find_elements`. Handles go
/// stale across navigations; callers re-query rather than cache them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementRef(pub u64);

/// Narrow capability interface over one controlled-browser instance.
///
/// Implementations own exactly one browsing context plus whatever
/// process-level resources back it; `quit` must release all of them,
/// including per-instance scratch storage, even when the caller aborts
/// via error.
#[async_trait]
pub trait BrowserSurface: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn page_source(&self) -> Result<String>;

    /// All elements matching a CSS selector, in document order.
    async fn find_elements(&self, selector: &str) -> Result<Vec<ElementRef>>;

    /// Whether the element currently has a clickable point on screen.
    async fn is_visible(&self, element: ElementRef) -> Result<bool>;

    /// Scroll-into-view-then-click, falling back to a JS click when the
    /// native click fails (e.g. target briefly covered by an overlay).
    async fn click(&self, element: ElementRef) -> Result<()>;

    async fn attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>>;

    async fn text(&self, element: ElementRef) -> Result<String>;

    /// All cookies visible to the browsing context, name to value.
    async fn cookies(&self) -> Result<HashMap<String, String>>;

    /// Run a trusted script snippet in page context and return its value.
    async fn run_script(&self, snippet: &str) -> Result<serde_json::Value>;

    /// Close every tab/window except the original browsing context and
    /// return focus to it.
    async fn close_extra_tabs(&self) -> Result<()>;

    /// Tear down the instance and all of its process-level resources.
    /// Idempotent.
    async fn quit(&self) -> Result<()>;
}
