use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use super::Tool;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

fn clip_at_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ---------------------------------------------------------------------------
// HTML extraction
// ---------------------------------------------------------------------------

/// Regex-based HTML to text/markdown conversion. Good enough for model
/// consumption; not a DOM parser.
struct TextExtractor {
    script: Regex,
    style: Regex,
    any_tag: Regex,
    anchor: Regex,
    heading: Regex,
    list_item: Regex,
    block_end: Regex,
    line_break: Regex,
    runs_of_spaces: Regex,
    runs_of_newlines: Regex,
}

impl TextExtractor {
    fn new() -> Self {
        Self {
            script: Regex::new(r"(?is)<script[\s\S]*?</script>").unwrap(),
            style: Regex::new(r"(?is)<style[\s\S]*?</style>").unwrap(),
            any_tag: Regex::new(r"<[^>]+>").unwrap(),
            anchor: Regex::new(r#"(?is)<a\s+[^>]*href=["']([^"']+)["'][^>]*>([\s\S]*?)</a>"#)
                .unwrap(),
            heading: Regex::new(r"(?is)<h([1-6])[^>]*>([\s\S]*?)</h[1-6]>").unwrap(),
            list_item: Regex::new(r"(?is)<li[^>]*>([\s\S]*?)</li>").unwrap(),
            block_end: Regex::new(r"(?i)</(p|div|section|article)>").unwrap(),
            line_break: Regex::new(r"(?i)<(br|hr)\s*/?>").unwrap(),
            runs_of_spaces: Regex::new(r"[ \t]+").unwrap(),
            runs_of_newlines: Regex::new(r"\n{3,}").unwrap(),
        }
    }

    /// Plain text: drop scripts/styles, strip every tag, decode entities.
    fn plain_text(&self, html: &str) -> String {
        let body = self.script.replace_all(html, "");
        let body = self.style.replace_all(&body, "");
        let body = self.any_tag.replace_all(&body, "");
        html_escape::decode_html_entities(&body).to_string()
    }

    /// Markdown-ish text: links, headings, and list items keep structure,
    /// everything else collapses to plain text.
    fn markdown(&self, html: &str) -> String {
        let body = self.anchor.replace_all(html, |caps: &regex::Captures| {
            format!("[{}]({})", self.plain_text(&caps[2]), &caps[1])
        });
        let body = self.heading.replace_all(&body, |caps: &regex::Captures| {
            let depth: usize = caps[1].parse().unwrap_or(1);
            format!("\n{} {}\n", "#".repeat(depth), self.plain_text(&caps[2]))
        });
        let body = self.list_item.replace_all(&body, |caps: &regex::Captures| {
            format!("\n- {}", self.plain_text(&caps[1]))
        });
        let body = self.block_end.replace_all(&body, "\n\n");
        let body = self.line_break.replace_all(&body, "\n");

        let flattened = self.plain_text(&body);
        let flattened = self.runs_of_spaces.replace_all(&flattened, " ");
        self.runs_of_newlines
            .replace_all(&flattened, "\n\n")
            .trim()
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// web_search
// ---------------------------------------------------------------------------

/// Web search via the Brave Search API.
pub struct WebSearchTool {
    api_key: String,
    max_results: u32,
}

impl WebSearchTool {
    pub fn new(api_key: String, max_results: u32) -> Self {
        Self {
            api_key,
            max_results,
        }
    }

    fn format_results(query: &str, results: &[serde_json::Value]) -> String {
        let mut out = format!("Results for: {query}\n");
        for (i, hit) in results.iter().enumerate() {
            let field = |key: &str| hit.get(key).and_then(|v| v.as_str()).unwrap_or("");
            out.push_str(&format!(
                "\n{}. {}\n   {}\n   {}",
                i + 1,
                field("title"),
                field("url"),
                field("description")
            ));
        }
        out
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs, and snippets."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "count": {"type": "integer", "description": "Number of results (1-10)", "minimum": 1, "maximum": 10}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let query = match params.get("query").and_then(|q| q.as_str()) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => return Ok("Error: query is required".into()),
        };

        if self.api_key.is_empty() {
            return Ok("Error: BRAVE_API_KEY not configured. Set tools.web.search.apiKey in config.json or BRAVE_API_KEY env var.".into());
        }

        let count = params
            .get("count")
            .and_then(|c| c.as_u64())
            .map(|c| c.min(10) as u32)
            .unwrap_or(self.max_results);

        let resp = reqwest::Client::new()
            .get(BRAVE_ENDPOINT)
            .query(&[("q", &query), ("count", &count.to_string())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        resp.error_for_status_ref()
            .map_err(|e| anyhow::anyhow!("Brave Search API error: {e}"))?;

        let body: serde_json::Value = resp.json().await?;
        match body
            .get("web")
            .and_then(|w| w.get("results"))
            .and_then(|r| r.as_array())
        {
            Some(hits) if !hits.is_empty() => Ok(Self::format_results(&query, hits)),
            _ => Ok(format!("No results for: {query}")),
        }
    }
}

// ---------------------------------------------------------------------------
// web_fetch
// ---------------------------------------------------------------------------

/// Fetch a URL and reduce the response to model-readable text.
pub struct WebFetchTool {
    max_chars: usize,
    extractor: TextExtractor,
}

impl WebFetchTool {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            extractor: TextExtractor::new(),
        }
    }

    fn error_payload(url: &str, error: impl ToString) -> Result<String> {
        Ok(serde_json::to_string_pretty(&serde_json::json!({
            "error": error.to_string(),
            "url": url
        }))?)
    }

    fn looks_like_html(content_type: &str, body: &str) -> bool {
        if content_type.contains("text/html") {
            return true;
        }
        let head = body.trim_start();
        let head = head.get(..head.len().min(256)).unwrap_or("").to_lowercase();
        head.starts_with("<!doctype") || head.starts_with("<html")
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch URL and extract readable content (HTML to markdown/text)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "URL to fetch"},
                "extractMode": {"type": "string", "enum": ["markdown", "text"], "default": "markdown"},
                "maxChars": {"type": "integer", "minimum": 100}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let url = match params.get("url").and_then(|u| u.as_str()) {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => return Ok("Error: url is required".into()),
        };

        if !url.starts_with("http://") && !url.starts_with("https://") {
            let scheme = url.split(':').next().unwrap_or("none");
            return Self::error_payload(&url, format!("Only http/https allowed, got '{scheme}'"));
        }

        let extract_mode = params
            .get("extractMode")
            .and_then(|m| m.as_str())
            .unwrap_or("markdown");
        let max_chars = params
            .get("maxChars")
            .and_then(|m| m.as_u64())
            .map(|m| m as usize)
            .unwrap_or(self.max_chars);

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;

        let resp = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => return Self::error_payload(&url, e),
        };

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = match resp.text().await {
            Ok(t) => t,
            Err(e) => return Self::error_payload(&url, e),
        };

        let (text, extractor) = if content_type.contains("application/json") {
            let formatted = match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
                Err(_) => body,
            };
            (formatted, "json")
        } else if Self::looks_like_html(&content_type, &body) {
            let text = if extract_mode == "text" {
                self.extractor.plain_text(&body)
            } else {
                self.extractor.markdown(&body)
            };
            (text, "html")
        } else {
            (body, "raw")
        };

        let truncated = text.len() > max_chars;
        let text = clip_at_boundary(&text, max_chars);

        Ok(serde_json::to_string_pretty(&serde_json::json!({
            "url": url,
            "finalUrl": final_url,
            "status": status,
            "extractor": extractor,
            "truncated": truncated,
            "length": text.len(),
            "text": text
        }))?)
    }
}
