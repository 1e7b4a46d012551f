//! Web tools: web_search (Brave Search API) and fetch_web_page (HTTP + HTML extraction).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{get_bool_arg, get_int_arg, params, require_string};
use super::{ParamSpec, ParamType, Tool, ToolArgs};
use crate::config::{WebConfig, WebSearchConfig};
use crate::error::ToolError;

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const MAX_SEARCH_RESULTS: u32 = 20;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; switchyard/0.1)";

// ── WebSearchTool ───────────────────────────────────────────────────

pub struct WebSearchTool {
    client: Client,
    api_key: String,
    max_results: u32,
    timeout: Duration,
}

impl WebSearchTool {
    pub fn new(client: Client, config: &WebSearchConfig, timeout: Duration) -> Self {
        Self {
            client,
            api_key: config.api_key.clone(),
            max_results: config.max_results.clamp(1, MAX_SEARCH_RESULTS),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct BraveSearchResponse {
    web: Option<BraveWebResults>,
}

#[derive(Deserialize)]
struct BraveWebResults {
    results: Vec<BraveWebResult>,
}

#[derive(Deserialize)]
struct BraveWebResult {
    title: String,
    url: String,
    description: Option<String>,
}

fn format_results(results: &[BraveWebResult]) -> String {
    if results.is_empty() {
        return "No results found.".into();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let desc = r.description.as_deref().unwrap_or("No description");
            format!("{}. {}\n   {}\n   {}", i + 1, r.title, r.url, desc)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web using Brave Search API. Returns titles, URLs, and descriptions."
    }

    fn parameters(&self) -> BTreeMap<String, ParamSpec> {
        params([
            ("query", ParamSpec::required(ParamType::String, "Search query")),
            (
                "count",
                ParamSpec::optional(ParamType::Integer, "Number of results (max: 20)"),
            ),
        ])
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let query = require_string(args, "query")?;
        if query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("'query' is empty".into()));
        }

        if self.api_key.is_empty() {
            return Err(ToolError::Failed(
                "Brave Search API key not configured. Set tools.webSearch.apiKey in config.json"
                    .into(),
            ));
        }

        let count = get_int_arg(args, "count")
            .map(|c| c.clamp(1, MAX_SEARCH_RESULTS as i64) as u32)
            .unwrap_or(self.max_results);

        debug!(query = %query, count, "Performing web search");

        let resp = self
            .client
            .get(BRAVE_ENDPOINT)
            .timeout(self.timeout)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", query.as_str()), ("count", &count.to_string())])
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("search request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ToolError::Failed(format!(
                "search API error ({})",
                resp.status()
            )));
        }

        let data: BraveSearchResponse = resp
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("error parsing search results: {}", e)))?;

        let mut results = data.web.map(|w| w.results).unwrap_or_default();
        results.truncate(count as usize);
        Ok(format_results(&results))
    }
}

// ── WebFetchTool ────────────────────────────────────────────────────

pub struct WebFetchTool {
    client: Client,
    timeout: Duration,
    max_chars: usize,
}

impl WebFetchTool {
    pub fn new(client: Client, config: &WebConfig) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
            max_chars: config.max_chars,
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "fetch_web_page"
    }

    fn description(&self) -> &str {
        "Fetch a web page over HTTP(S) and return its readable text content."
    }

    fn parameters(&self) -> BTreeMap<String, ParamSpec> {
        params([
            ("url", ParamSpec::required(ParamType::String, "URL to fetch")),
            (
                "main_content",
                ParamSpec::optional(
                    ParamType::Boolean,
                    "Prefer the page's main/article region over the whole body (default: true)",
                ),
            ),
        ])
    }

    async fn execute(&self, args: &ToolArgs) -> Result<String, ToolError> {
        let url = require_string(args, "url")?;
        let main_content = get_bool_arg(args, "main_content").unwrap_or(true);

        let parsed = reqwest::Url::parse(url.trim())
            .map_err(|e| ToolError::InvalidArguments(format!("invalid URL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ToolError::InvalidArguments(format!(
                "only http and https URLs can be fetched, got '{}'",
                parsed.scheme()
            )));
        }

        debug!(url = %parsed, main_content, "Fetching web page");

        let resp = self
            .client
            .get(parsed.clone())
            .timeout(self.timeout)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout(self.timeout.as_secs())
                } else {
                    ToolError::Failed(format!("could not reach {}: {}", parsed, e))
                }
            })?;

        if !resp.status().is_success() {
            return Err(ToolError::Failed(format!(
                "{} returned HTTP {}",
                parsed,
                resp.status()
            )));
        }

        let html = resp
            .text()
            .await
            .map_err(|e| ToolError::Failed(format!("error reading response body: {}", e)))?;

        let text = extract_text_from_html(&html, main_content);
        if text.is_empty() {
            return Ok("Could not extract text content from the page.".into());
        }
        Ok(truncate_chars(&text, self.max_chars))
    }
}

/// Extract readable text using the `scraper` crate, skipping non-content
/// elements. With `main_content`, the first non-empty `main` or `article`
/// wins over the full body.
fn extract_text_from_html(html: &str, main_content: bool) -> String {
    use scraper::{ElementRef, Html, Node, Selector};

    fn collect(element: ElementRef, out: &mut String) {
        for child in element.children() {
            match child.value() {
                Node::Text(t) => {
                    out.push_str(t);
                    out.push(' ');
                }
                Node::Element(e) => {
                    if matches!(e.name(), "script" | "style" | "noscript" | "template" | "svg") {
                        continue;
                    }
                    if let Some(el) = ElementRef::wrap(child) {
                        collect(el, out);
                    }
                }
                _ => {}
            }
        }
    }

    let document = Html::parse_document(html);
    let selectors: &[&str] = if main_content {
        &["main", "article", "body"]
    } else {
        &["body"]
    };

    for sel in selectors {
        let Ok(selector) = Selector::parse(sel) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let mut raw = String::new();
            collect(element, &mut raw);
            let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                return text;
            }
        }
    }
    String::new()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!(
            "{}...\n\n(truncated, {} total characters)",
            &text[..end],
            text.chars().count()
        ),
        None => text.to_string(),
    }
}
