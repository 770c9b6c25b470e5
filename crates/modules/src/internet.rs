//! Web search and page reading.
//!
//! `search` hits a subscription-keyed web-search API and returns bare
//! title/url pairs. `view_page` fetches a page, reduces it to text, and
//! asks the completion model to extract an answer, so the session model
//! never sees raw HTML.

use async_trait::async_trait;
use murmur_core::error::ModuleError;
use murmur_core::message::{Role, WireMessage};
use murmur_core::module::{
    Capability, CapabilityModule, ModuleContext, ToolReply, arg_str, arg_str_opt,
};
use scraper::{Html, Selector};
use serde_json::{Value, json};
use tracing::debug;

static CAPS: &[Capability] = &[
    Capability::new(
        "search",
        &["query"],
        "Searches the internet for the given query and returns a list of URL results.",
    ),
    Capability::new(
        "view_page",
        &["url", "question"],
        "Gets a natural language answer to the specified question from the given URL. If the question is none, a summary of the page is returned.",
    ),
];

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.4 Safari/605.1.15";
const DEFAULT_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";
const RESULT_COUNT: usize = 5;

/// Page text beyond this many bytes is dropped before prompting.
const MAX_PAGE_TEXT: usize = 60_000;

const EXTRACTOR_PROMPT: &str = "You extract answers to questions from web pages. Do not reply in complete sentences, instead just return the answer and a quote from the page.";

pub struct InternetModule {
    ctx: ModuleContext,
    http: reqwest::Client,
    state: std::sync::Mutex<ApiState>,
}

#[derive(Default)]
struct ApiState {
    api_key: String,
    base_url: String,
}

impl InternetModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            http: reqwest::Client::new(),
            state: std::sync::Mutex::new(ApiState::default()),
        }
    }

    fn api_state(&self) -> (String, String) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.api_key.clone(), state.base_url.clone())
    }

    async fn search(&self, args: &Value) -> Result<Value, ModuleError> {
        let query = arg_str(args, "query")?;
        let (api_key, base_url) = self.api_state();
        if api_key.is_empty() {
            return Ok(json!(
                "Search API key is not set. Ask the user to set it by modifying the configuration file."
            ));
        }

        debug!(query = %query, "Web search");
        let response = self
            .http
            .get(&base_url)
            .query(&[
                ("q", query.as_str()),
                ("count", &RESULT_COUNT.to_string()),
                ("result_filter", "web"),
            ])
            .header("X-Subscription-Token", &api_key)
            .send()
            .await
            .map_err(|e| execution_failed("search", e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Ok(json!(format!("Error: {status} - {body}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| execution_failed("search", e.to_string()))?;
        Ok(Value::Array(parse_search_results(&body)))
    }

    async fn view_page(&self, args: &Value) -> Result<Value, ModuleError> {
        let url = arg_str(args, "url")?;
        let question = arg_str_opt(args, "question")
            .unwrap_or_else(|| "Summarize the content of this page".to_string());

        let response = self
            .http
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| execution_failed("view_page", e.to_string()))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Ok(json!({"error": format!("Failed to fetch page: {status}")}));
        }
        let html = response
            .text()
            .await
            .map_err(|e| execution_failed("view_page", e.to_string()))?;

        let mut text = extract_page_text(&html);
        if text.len() > MAX_PAGE_TEXT {
            let mut cut = MAX_PAGE_TEXT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }

        let prompt = format!("# Page Contents\n{text}\n\n# Question\n{question}\n\n");
        let messages = [
            WireMessage {
                role: Role::System,
                content: EXTRACTOR_PROMPT.to_string(),
            },
            WireMessage {
                role: Role::User,
                content: prompt,
            },
        ];
        let answer = self
            .ctx
            .client
            .complete(&messages)
            .await
            .map_err(|e| execution_failed("view_page", e.to_string()))?;

        Ok(json!({
            "extracted_answer": answer,
            "source": url,
            "note": "Remember to reiterate the answer for the user.",
        }))
    }
}

fn execution_failed(function: &str, reason: String) -> ModuleError {
    ModuleError::ExecutionFailed {
        module: "internet".into(),
        function: function.into(),
        reason,
    }
}

/// Pull `{title, url}` pairs out of a search API response.
fn parse_search_results(body: &Value) -> Vec<Value> {
    body["web"]["results"]
        .as_array()
        .map(|results| {
            results
                .iter()
                .filter_map(|r| {
                    let title = r["title"].as_str()?;
                    let url = r["url"].as_str()?;
                    Some(json!({"title": title, "url": url}))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Reduce a page to readable text: prefer `<main>`, drop script/style and
/// page chrome, keep one line per text node.
fn extract_page_text(html: &str) -> String {
    const EXCLUDED: [&str; 7] = [
        "script", "style", "footer", "nav", "aside", "header", "noscript",
    ];

    let document = Html::parse_document(html);
    let root = ["main", "body", "html"]
        .iter()
        .filter_map(|tag| Selector::parse(tag).ok())
        .find_map(|selector| document.select(&selector).next().map(|el| el.id()));
    let Some(root) = root else {
        return String::new();
    };
    let Some(root) = document.tree.get(root) else {
        return String::new();
    };

    let mut parts = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let chrome = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|el| EXCLUDED.contains(&el.name()))
        });
        if chrome {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    parts.join("\n")
}

#[async_trait]
impl CapabilityModule for InternetModule {
    fn name(&self) -> &'static str {
        "internet"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPS
    }

    async fn setup(&self) {
        let settings = self.ctx.settings.scoped(&self.ctx.user_id, self.name());
        let api = settings.load(
            "search_api",
            json!({"api_key": "", "base_url": DEFAULT_SEARCH_URL}),
        );
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.api_key = api["api_key"].as_str().unwrap_or_default().to_string();
        state.base_url = api["base_url"]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SEARCH_URL)
            .to_string();
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<ToolReply, ModuleError> {
        match function {
            "search" => Ok(ToolReply::value(self.search(&args).await?)),
            "view_page" => Ok(ToolReply::value(self.view_page(&args).await?)),
            other => Err(ModuleError::FunctionNotFound {
                module: "internet".into(),
                function: other.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn search_results_keep_title_and_url_only() {
        let body = json!({
            "web": {
                "results": [
                    {"title": "Result A", "url": "https://a.example", "rank": 1},
                    {"title": "Result B", "url": "https://b.example", "extra": true},
                    {"title": "No url"},
                ],
            },
        });
        let results = parse_search_results(&body);
        assert_eq!(
            results,
            vec![
                json!({"title": "Result A", "url": "https://a.example"}),
                json!({"title": "Result B", "url": "https://b.example"}),
            ]
        );
    }

    #[test]
    fn malformed_search_body_yields_no_results() {
        assert!(parse_search_results(&json!({"web": {}})).is_empty());
        assert!(parse_search_results(&json!({})).is_empty());
    }

    #[test]
    fn page_text_drops_scripts_and_chrome() {
        let html = r#"
            <html><head><title>T</title><style>.x{}</style></head>
            <body>
                <nav>Menu</nav>
                <p>Visible text</p>
                <script>var hidden = 1;</script>
                <footer>Copyright</footer>
            </body></html>
        "#;
        let text = extract_page_text(html);
        assert!(text.contains("Visible text"));
        assert!(!text.contains("Menu"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains("Copyright"));
    }

    #[test]
    fn page_text_prefers_main_content() {
        let html = r#"
            <html><body>
                <div>Sidebar noise</div>
                <main><h1>Article</h1><p>Body copy</p></main>
            </body></html>
        "#;
        let text = extract_page_text(html);
        assert!(text.contains("Article"));
        assert!(text.contains("Body copy"));
        assert!(!text.contains("Sidebar noise"));
    }

    #[tokio::test]
    async fn missing_api_key_reports_configuration_hint() {
        let (ctx, _dir) = testing::context();
        let module = InternetModule::new(ctx);
        module.setup().await;

        let reply = module
            .invoke("search", json!({"query": "rust"}))
            .await
            .unwrap();
        assert!(reply.render().contains("API key is not set"));
    }
}
