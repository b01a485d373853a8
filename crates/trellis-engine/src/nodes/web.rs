use std::sync::OnceLock;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use trellis_core::config::WebConfig;
use trellis_core::{Result, TrellisError};

use crate::config::NodeKind;
use crate::context::Context;
use crate::node::{Node, NodeBase};
use crate::registry::NodeRegistry;

/// What to fetch. A plain string in the context is read as a query.
#[derive(Debug, Default, Deserialize)]
struct WebRequest {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    n: Option<usize>,
}

/// Fetches pages by URL or web search and returns their text:
/// `[{url, content}]`, or `{url, error}` for pages that failed.
pub struct WebNode {
    base: NodeBase,
    source_key: String,
    client: OnceLock<(reqwest::Client, WebConfig)>,
}

impl WebNode {
    pub(crate) fn new(base: NodeBase, source_key: String) -> Self {
        Self {
            base,
            source_key,
            client: OnceLock::new(),
        }
    }

    fn request(&self, ctx: &Context) -> Result<WebRequest> {
        match ctx.get(&self.source_key) {
            Some(Value::String(query)) => Ok(WebRequest {
                query: Some(query),
                ..WebRequest::default()
            }),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| TrellisError::Type(format!("invalid web request: {e}"))),
            None => Err(TrellisError::MissingKey(self.source_key.clone())),
        }
    }
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| TrellisError::Http(format!("{url}: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(TrellisError::Http(format!(
            "{url}: HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )));
    }
    let is_html = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("html"));
    let body = resp
        .text()
        .await
        .map_err(|e| TrellisError::Http(format!("{url}: {e}")))?;
    Ok(if is_html { strip_html_tags(&body) } else { body })
}

impl Node for WebNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn build(&self, registry: &NodeRegistry) -> Result<()> {
        let config = registry.config().web.clone();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TrellisError::Http(format!("Failed to create HTTP client: {e}")))?;
        let _ = self.client.set((client, config));
        Ok(())
    }

    fn run<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let (client, config) = self
                .client
                .get()
                .ok_or_else(|| TrellisError::Http("HTTP client not initialised".into()))?;
            let request = self.request(ctx)?;
            let n = request.n.unwrap_or(config.max_results);

            let mut urls: Vec<String> = request.url.into_iter().collect();
            if let Some(query) = &request.query {
                let search = format!("{}?q={}", config.search_url, urlencoding::encode(query));
                debug!(node = %self.base.name(), query = %query, "searching the web");
                let page = client
                    .get(&search)
                    .send()
                    .await
                    .map_err(|e| TrellisError::Http(format!("search failed: {e}")))?
                    .text()
                    .await
                    .map_err(|e| TrellisError::Http(format!("search failed: {e}")))?;
                urls.extend(parse_search_results(&page, n));
            }
            urls.truncate(n.max(1));

            let pages = join_all(urls.iter().map(|url| fetch_text(client, url))).await;
            let results = urls
                .iter()
                .zip(pages)
                .map(|(url, page)| match page {
                    Ok(text) => json!({"url": url, "content": truncate(&text, config.max_length)}),
                    Err(e) => json!({"url": url, "error": e.to_string()}),
                })
                .collect();
            Ok(Value::Array(results))
        })
    }

    fn kind(&self) -> Result<NodeKind> {
        Ok(NodeKind::Web {
            source_key: self.source_key.clone(),
        })
    }

    fn details(&self) -> Vec<(&'static str, String)> {
        vec![("Input key", self.source_key.clone())]
    }
}

fn result_link() -> &'static Regex {
    static LINK: OnceLock<Regex> = OnceLock::new();
    LINK.get_or_init(|| Regex::new(r#"<a[^>]*class="result__a"[^>]*href="([^"]+)""#).unwrap())
}

/// Target URLs of a DuckDuckGo HTML result page, redirects unwrapped.
pub fn parse_search_results(html: &str, n: usize) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for caps in result_link().captures_iter(html) {
        let href = caps[1].replace("&amp;", "&");
        let url = match href.split_once("uddg=") {
            Some((_, target)) => {
                let target = target.split('&').next().unwrap_or(target);
                match urlencoding::decode(target) {
                    Ok(decoded) => decoded.into_owned(),
                    Err(_) => continue,
                }
            }
            None if href.starts_with("//") => format!("https:{href}"),
            None => href,
        };
        if !urls.contains(&url) {
            urls.push(url);
        }
        if urls.len() >= n {
            break;
        }
    }
    urls
}

/// Plain text of an HTML page.
pub fn strip_html_tags(html: &str) -> String {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    let [script, style, tags, blank] = PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap(),
            Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap(),
            Regex::new(r"<[^>]+>").unwrap(),
            Regex::new(r"\n\s*\n(\s*\n)+").unwrap(),
        ]
    });
    let text = script.replace_all(html, "");
    let text = style.replace_all(&text, "");
    let text = tags.replace_all(&text, "");
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ");
    blank.replace_all(&text, "\n\n").trim().to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}\n\n[truncated at {max_chars} chars]", &text[..end]),
        None => text.to_string(),
    }
}
