// Outbound HTTP execution

use super::{render_failure, truncate_output, Invoke, InvokeContext};
use crate::error::ErrorKind;
use crate::template::TemplateEngine;
use crate::types::{ExecutionResult, HttpExecution, ToolOutput};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use std::time::Instant;

/// Largest body read when a JSON path has to be extracted from it
const EXTRACT_BODY_LIMIT: usize = 8 * 1024 * 1024;

/// Read at most `cap` bytes of the body; the flag is set when more was on offer
async fn read_capped(
    mut response: reqwest::Response,
    cap: usize,
) -> Result<(Vec<u8>, bool), reqwest::Error> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = cap - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            return Ok((body, true));
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body, false))
}

/// Resolve a dot path (`data.items.0.id`, optional leading `$.`) in a JSON value
pub fn extract_json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);

    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[async_trait::async_trait]
impl Invoke for HttpExecution {
    async fn invoke(&self, params: &Map<String, Value>, ctx: &InvokeContext<'_>) -> ExecutionResult {
        let started = Instant::now();
        let render = |template: &str| TemplateEngine::render(template, params, ctx.env);

        let url = match render(&self.url) {
            Ok(url) => url,
            Err(e) => return render_failure(e, started),
        };

        let mut headers = HeaderMap::new();
        for (name, template) in &self.headers {
            let value = match render(template) {
                Ok(value) => value,
                Err(e) => return render_failure(e, started),
            };
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) else {
                return ExecutionResult::failed(
                    ErrorKind::RenderError,
                    format!("invalid header '{}'", name),
                    ToolOutput::default(),
                    started.elapsed(),
                );
            };
            headers.insert(name, value);
        }

        let body = match self.body.as_deref().map(render).transpose() {
            Ok(body) => body,
            Err(e) => return render_failure(e, started),
        };

        let method = match reqwest::Method::from_bytes(self.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return ExecutionResult::failed(
                    ErrorKind::HttpError,
                    format!("invalid HTTP method '{}'", self.method),
                    ToolOutput::default(),
                    started.elapsed(),
                )
            }
        };

        let mut request = ctx
            .http
            .request(method, &url)
            .headers(headers)
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.body(body);
        }

        let limit = ctx.settings.max_output_bytes;
        // one byte past the limit is enough to know the output gets truncated
        let cap = if self.json_extract_path.is_some() {
            limit.saturating_add(1).max(EXTRACT_BODY_LIMIT)
        } else {
            limit.saturating_add(1)
        };

        // the deadline covers connect, headers and body
        let round_trip = async {
            let response = request.send().await?;
            let status = response.status();
            let body = read_capped(response, cap).await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, (body, overflowed)) = match tokio::time::timeout(self.timeout, round_trip).await {
            Err(_) => {
                return ExecutionResult::failed(
                    ErrorKind::Timeout,
                    format!("timed out after {:.1}s", self.timeout.as_secs_f64()),
                    ToolOutput::default(),
                    started.elapsed(),
                )
            }
            Ok(Err(e)) if e.is_timeout() => {
                return ExecutionResult::failed(
                    ErrorKind::Timeout,
                    e.to_string(),
                    ToolOutput::default(),
                    started.elapsed(),
                )
            }
            Ok(Err(e)) => {
                return ExecutionResult::failed(
                    ErrorKind::HttpError,
                    format!("request failed: {}", e),
                    ToolOutput::default(),
                    started.elapsed(),
                )
            }
            Ok(Ok(response)) => response,
        };

        let text = String::from_utf8_lossy(&body).into_owned();

        if !status.is_success() {
            return ExecutionResult::failed(
                ErrorKind::HttpStatus,
                format!("server responded with {}", status),
                ToolOutput::Text(truncate_output(text, limit)),
                started.elapsed(),
            )
            .with_status(status.as_u16());
        }

        let Some(path) = &self.json_extract_path else {
            return ExecutionResult::ok(ToolOutput::Text(truncate_output(text, limit)), started.elapsed())
                .with_status(status.as_u16());
        };

        if overflowed {
            return ExecutionResult::failed(
                ErrorKind::JsonExtract,
                format!("response is larger than {} bytes", cap),
                ToolOutput::Text(truncate_output(text, limit)),
                started.elapsed(),
            )
            .with_status(status.as_u16());
        }

        let parsed: Value = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                return ExecutionResult::failed(
                    ErrorKind::JsonExtract,
                    format!("response is not JSON: {}", e),
                    ToolOutput::Text(truncate_output(text, limit)),
                    started.elapsed(),
                )
                .with_status(status.as_u16())
            }
        };

        match extract_json_path(&parsed, path) {
            Some(extracted) => {
                ExecutionResult::ok(ToolOutput::Structured(extracted.clone()), started.elapsed())
                    .with_status(status.as_u16())
            }
            None => ExecutionResult::failed(
                ErrorKind::JsonExtract,
                format!("path '{}' not found in response", path),
                ToolOutput::Structured(parsed),
                started.elapsed(),
            )
            .with_status(status.as_u16()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorSettings;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http(method: &str, url: String) -> HttpExecution {
        HttpExecution {
            method: method.to_string(),
            url,
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(5),
            json_extract_path: None,
        }
    }

    async fn run(
        exec: &HttpExecution,
        params: serde_json::Value,
        env: HashMap<String, String>,
    ) -> ExecutionResult {
        let client = reqwest::Client::new();
        let settings = ExecutorSettings::default();
        let ctx = InvokeContext {
            env: &env,
            http: &client,
            settings: &settings,
        };
        exec.invoke(params.as_object().unwrap(), &ctx).await
    }

    #[test]
    fn test_extract_json_path() {
        let value = json!({"data": {"items": [{"id": 7}, {"id": 9}]}});
        assert_eq!(extract_json_path(&value, "data.items.1.id"), Some(&json!(9)));
        assert_eq!(extract_json_path(&value, "$.data.items.0"), Some(&json!({"id": 7})));
        assert_eq!(extract_json_path(&value, "$"), Some(&value));
        assert_eq!(extract_json_path(&value, "data.missing"), None);
        assert_eq!(extract_json_path(&value, "data.items.x"), None);
    }

    #[tokio::test]
    async fn test_get_with_templated_url_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .and(query_param("q", "Oslo"))
            .and(header("authorization", "Bearer secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string("sunny"))
            .mount(&server)
            .await;

        let mut exec = http("GET", format!("{}/weather?q={{{{city}}}}", server.uri()));
        exec.headers
            .insert("Authorization".to_string(), "Bearer ${WEATHER_KEY}".to_string());

        let mut env = HashMap::new();
        env.insert("WEATHER_KEY".to_string(), "secret-key".to_string());

        let result = run(&exec, json!({"city": "Oslo"}), env).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.output, ToolOutput::Text("sunny".to_string()));
        assert_eq!(result.status, Some(200));
    }

    #[tokio::test]
    async fn test_post_body_and_json_extract() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_string(r#"{"query":"rust"}"#))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": {"top": {"title": "The Book"}}})),
            )
            .mount(&server)
            .await;

        let mut exec = http("POST", format!("{}/search", server.uri()));
        exec.body = Some(r#"{"query":"{{q}}"}"#.to_string());
        exec.json_extract_path = Some("results.top".to_string());

        let result = run(&exec, json!({"q": "rust"}), HashMap::new()).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.output, ToolOutput::Structured(json!({"title": "The Book"})));
    }

    #[tokio::test]
    async fn test_missing_extract_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
            .mount(&server)
            .await;

        let mut exec = http("GET", server.uri());
        exec.json_extract_path = Some("b".to_string());

        let result = run(&exec, json!({}), HashMap::new()).await;
        assert_eq!(result.error_kind, Some(ErrorKind::JsonExtract));
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let result = run(&http("GET", server.uri()), json!({}), HashMap::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::HttpStatus));
        assert_eq!(result.status, Some(503));
        assert_eq!(result.output, ToolOutput::Text("down".to_string()));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let mut exec = http("GET", server.uri());
        exec.timeout = Duration::from_millis(300);

        let started = Instant::now();
        let result = run(&exec, json!({}), HashMap::new()).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_large_body_is_cut_at_output_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("y".repeat(100_000)))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let env = HashMap::new();
        let settings = ExecutorSettings {
            max_output_bytes: 64,
            ..Default::default()
        };
        let ctx = InvokeContext {
            env: &env,
            http: &client,
            settings: &settings,
        };
        let result = http("GET", server.uri()).invoke(&Map::new(), &ctx).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(
            result.output,
            ToolOutput::Text(format!("{}\n[output truncated]", "y".repeat(64)))
        );
    }

    #[tokio::test]
    async fn test_read_capped_stops_at_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("z".repeat(10_000)))
            .mount(&server)
            .await;

        let response = reqwest::get(server.uri()).await.unwrap();
        let (body, overflowed) = read_capped(response, 10).await.unwrap();
        assert_eq!(body, b"zzzzzzzzzz");
        assert!(overflowed);

        let response = reqwest::get(server.uri()).await.unwrap();
        let (body, overflowed) = read_capped(response, 10_000).await.unwrap();
        assert_eq!(body.len(), 10_000);
        assert!(!overflowed);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let exec = http("GET", "http://127.0.0.1:1/".to_string());
        let result = run(&exec, json!({}), HashMap::new()).await;
        assert_eq!(result.error_kind, Some(ErrorKind::HttpError));
    }
}
