// Pawnbutler Core — web tools
// web_fetch: HTTP GET/POST with a hard timeout and a body cap (content is
// truncated with a note, never dropped). web_search: DuckDuckGo HTML
// endpoint, no API key required.
//
// URL policy enforcement happens in the guardian before these execute;
// the tools themselves only enforce transport limits.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use scraper::{Html, Selector};
use serde_json::{json, Value};

use crate::atoms::constants::{WEB_FETCH_BODY_CAP, WEB_FETCH_TIMEOUT_SECS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{truncate_utf8, SafetyLevel};
use crate::tools::ToolDefinition;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub fn fetch_definition() -> ToolDefinition {
    ToolDefinition::new(
        "web_fetch",
        "Fetch a URL over HTTP. Returns status, content type, and the \
         response body (capped at 50 KB).",
        SafetyLevel::Moderate,
        Arc::new(|params, _ctx| Box::pin(async move { execute_fetch(&params).await })),
    )
    .with_validator(Arc::new(|params| {
        match params.get("url").and_then(Value::as_str) {
            Some(u) if u.starts_with("http") => Ok(()),
            Some(_) => Err("'url' must be an http(s) URL".to_string()),
            None => Err("missing 'url' argument".to_string()),
        }
    }))
}

pub fn search_definition() -> ToolDefinition {
    ToolDefinition::new(
        "web_search",
        "Search the web (DuckDuckGo) and return structured results.",
        SafetyLevel::Safe,
        Arc::new(|params, _ctx| Box::pin(async move { execute_search(&params).await })),
    )
    .with_validator(Arc::new(|params| {
        match params.get("query").and_then(Value::as_str) {
            Some(q) if !q.trim().is_empty() => Ok(()),
            _ => Err("missing 'query' argument".to_string()),
        }
    }))
}

// ── web_fetch ──────────────────────────────────────────────────────────

async fn execute_fetch(params: &Value) -> EngineResult<Value> {
    let url = params
        .get("url")
        .and_then(Value::as_str)
        .ok_or("web_fetch: missing 'url' argument")?;
    let method = params
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_uppercase();

    info!("[web] fetch: {} {}", method, url);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(WEB_FETCH_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()?;

    let mut request = match method.as_str() {
        "GET" => client.get(url),
        "POST" => client.post(url),
        "PUT" => client.put(url),
        "DELETE" => client.delete(url),
        "HEAD" => client.head(url),
        other => return Err(format!("web_fetch: unsupported method '{}'", other).into()),
    };

    if let Some(headers) = params.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            if let Some(v) = value.as_str() {
                request = request.header(name, v);
            }
        }
    }
    if let Some(body) = params.get("body") {
        request = match body {
            Value::String(s) => request.body(s.clone()),
            other => request.json(other),
        };
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = response.text().await?;

    let total_bytes = body.len();
    let truncated = total_bytes > WEB_FETCH_BODY_CAP;
    let body = if truncated {
        format!(
            "{}\n... [truncated, {} total bytes]",
            truncate_utf8(&body, WEB_FETCH_BODY_CAP),
            total_bytes
        )
    } else {
        body
    };

    Ok(json!({
        "status": status,
        "contentType": content_type,
        "body": body,
        "truncated": truncated,
    }))
}

// ── web_search ─────────────────────────────────────────────────────────

async fn execute_search(params: &Value) -> EngineResult<Value> {
    let query = params
        .get("query")
        .and_then(Value::as_str)
        .ok_or("web_search: missing 'query' argument")?;
    let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(8) as usize;

    info!("[web] search: '{}' limit={}", query, limit);

    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("q", query)
        .finish();
    let search_url = format!("https://html.duckduckgo.com/html/?{}", encoded);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(WEB_FETCH_TIMEOUT_SECS))
        .user_agent(USER_AGENT)
        .build()?;
    let html = client.get(&search_url).send().await?.text().await?;

    let results = parse_search_results(&html, limit);
    Ok(json!({ "query": query, "results": results }))
}

/// Pull (title, url, snippet) triples out of the DuckDuckGo HTML layout.
fn parse_search_results(html: &str, limit: usize) -> Vec<Value> {
    let document = Html::parse_document(html);
    let result_selector = match Selector::parse(".result") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let title_selector = Selector::parse(".result__a").ok();
    let snippet_selector = Selector::parse(".result__snippet").ok();
    let url_selector = Selector::parse(".result__url").ok();

    let mut results = Vec::new();
    for element in document.select(&result_selector).take(limit) {
        let select_text = |sel: &Option<Selector>| -> String {
            sel.as_ref()
                .and_then(|s| element.select(s).next())
                .map(|e| e.text().collect::<String>().trim().to_string())
                .unwrap_or_default()
        };
        let title = select_text(&title_selector);
        if title.is_empty() {
            continue;
        }
        results.push(json!({
            "title": title,
            "url": select_text(&url_selector),
            "snippet": select_text(&snippet_selector),
        }));
    }
    results
}

// ── Tests ──────────────────────────────────────────────────────────────
