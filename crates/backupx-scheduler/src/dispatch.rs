//! Outcome dispatch — sends every ExecutionResult to the configured webhook.
//!
//! An empty body template sends a GET; otherwise the rendered body is POSTed,
//! as JSON when it parses as JSON and as a form otherwise.

use async_trait::async_trait;
use backupx_core::config::WebhookConfig;
use backupx_core::error::{BackupError, Result};
use backupx_core::types::{ExecutionResult, run_date_token};
use chrono::Local;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives the outcome of every backup run.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, result: &ExecutionResult) -> Result<()>;
}

/// HTTP webhook with `#{projectName}`, `#{fileName}`, `#{fileSize}` and
/// `#{result}` placeholders in both URL and body.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    request_body: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str, request_body: &str) -> Self {
        Self {
            url: url.trim().to_string(),
            request_body: request_body.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &WebhookConfig) -> Option<Self> {
        if config.url.trim().is_empty() {
            None
        } else {
            Some(Self::new(&config.url, &config.request_body))
        }
    }

    /// URL with placeholder values percent-encoded.
    pub fn render_url(&self, result: &ExecutionResult) -> String {
        substitute(&self.url, result, |v| urlencoding::encode(v).into_owned())
    }

    /// Body with placeholder values inserted verbatim.
    pub fn render_body(&self, result: &ExecutionResult) -> String {
        substitute(&self.request_body, result, str::to_string)
    }

    /// Deliver a simulated successful result.
    pub async fn send_test(&self) -> Result<()> {
        self.notify(&sample_result()).await
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, result: &ExecutionResult) -> Result<()> {
        let url = self.render_url(result);
        let req = if self.request_body.trim().is_empty() {
            self.client.get(&url)
        } else {
            let body = self.render_body(result);
            let content_type = if serde_json::from_str::<serde_json::Value>(&body).is_ok() {
                "application/json"
            } else {
                "application/x-www-form-urlencoded"
            };
            self.client
                .post(&url)
                .header(CONTENT_TYPE, content_type)
                .body(body)
        };

        let resp = req
            .timeout(WEBHOOK_TIMEOUT)
            .send()
            .await
            .map_err(|e| BackupError::Notify(format!("Webhook send failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() >= 300 {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::Notify(format!("Webhook error {status}: {body}")));
        }
        tracing::info!("✅ Webhook notification sent for project {}", result.project);
        Ok(())
    }
}

fn substitute(
    template: &str,
    result: &ExecutionResult,
    encode: impl Fn(&str) -> String,
) -> String {
    let file_name = result.file_name.clone().unwrap_or_default();
    template
        .replace("#{projectName}", &encode(&result.project))
        .replace("#{fileName}", &encode(&file_name))
        .replace("#{fileSize}", &encode(&result.size_label()))
        .replace("#{result}", &encode(result.result_label()))
}

/// Stand-in result used by the webhook test.
pub fn sample_result() -> ExecutionResult {
    ExecutionResult {
        project: "demo".to_string(),
        file_name: Some(format!("demo-{}.sql", run_date_token(&Local::now()))),
        file_size_mb: Some(100),
        success: true,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method, StatusCode, Uri};
    use std::sync::{Arc, Mutex};

    fn result() -> ExecutionResult {
        ExecutionResult {
            project: "my db".into(),
            file_name: Some("db-2026-03-01-02-00.sql".into()),
            file_size_mb: Some(12),
            success: true,
            error: None,
        }
    }

    #[test]
    fn test_render_url_encodes_values() {
        let hook = WebhookNotifier::new(
            "https://hooks.example.com/send?p=#{projectName}&r=#{result}&s=#{fileSize}",
            "",
        );
        assert_eq!(
            hook.render_url(&result()),
            "https://hooks.example.com/send?p=my%20db&r=Success&s=12%20MB"
        );
    }

    #[test]
    fn test_render_url_escapes_reserved_characters() {
        let mut odd = result();
        odd.project = "a&b/é?".into();
        let hook = WebhookNotifier::new("https://x/h?p=#{projectName}", "");
        assert_eq!(hook.render_url(&odd), "https://x/h?p=a%26b%2F%C3%A9%3F");
    }

    #[test]
    fn test_render_body_verbatim() {
        let hook = WebhookNotifier::new(
            "https://hooks.example.com",
            r##"{"text":"#{projectName} #{result}: #{fileName} (#{fileSize})"}"##,
        );
        assert_eq!(
            hook.render_body(&result()),
            r#"{"text":"my db Success: db-2026-03-01-02-00.sql (12 MB)"}"#
        );
    }

    #[test]
    fn test_failed_result_renders_empty_file() {
        let err = BackupError::ExecutionFailed("exit status: 1".into());
        let failed = ExecutionResult::failed("db", &err);
        let hook = WebhookNotifier::new("https://x", "#{result}|#{fileName}|#{fileSize}");
        assert_eq!(hook.render_body(&failed), "Failed||");
    }

    #[test]
    fn test_from_config_requires_url() {
        assert!(WebhookNotifier::from_config(&WebhookConfig::default()).is_none());
        let cfg = WebhookConfig {
            url: "https://hooks.example.com".into(),
            request_body: String::new(),
        };
        assert!(WebhookNotifier::from_config(&cfg).is_some());
    }

    #[derive(Debug, Clone)]
    struct Hit {
        method: String,
        uri: String,
        content_type: String,
        body: String,
    }

    type Hits = Arc<Mutex<Vec<Hit>>>;

    async fn receiver(
        State(hits): State<Hits>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        let failing = uri.path() == "/fail";
        hits.lock().unwrap().push(Hit {
            method: method.to_string(),
            uri: uri.to_string(),
            content_type: headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            body,
        });
        if failing {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    async fn spawn_receiver() -> (String, Hits) {
        let hits: Hits = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().fallback(receiver).with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn test_json_body_is_posted() {
        let (base, hits) = spawn_receiver().await;
        let hook = WebhookNotifier::new(
            &format!("{base}/hook"),
            r##"{"project":"#{projectName}","result":"#{result}"}"##,
        );
        hook.notify(&result()).await.unwrap();

        let hits = hits.lock().unwrap().clone();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].method, "POST");
        assert_eq!(hits[0].content_type, "application/json");
        assert_eq!(hits[0].body, r#"{"project":"my db","result":"Success"}"#);
    }

    #[tokio::test]
    async fn test_plain_body_is_form_encoded() {
        let (base, hits) = spawn_receiver().await;
        let hook = WebhookNotifier::new(&format!("{base}/hook"), "msg=#{result}");
        hook.notify(&result()).await.unwrap();
        let hits = hits.lock().unwrap().clone();
        assert_eq!(hits[0].content_type, "application/x-www-form-urlencoded");
        assert_eq!(hits[0].body, "msg=Success");
    }

    #[tokio::test]
    async fn test_empty_body_sends_get() {
        let (base, hits) = spawn_receiver().await;
        let hook = WebhookNotifier::new(&format!("{base}/hook?name=#{{projectName}}"), "");
        hook.notify(&result()).await.unwrap();

        let hits = hits.lock().unwrap().clone();
        assert_eq!(hits[0].method, "GET");
        assert_eq!(hits[0].uri, "/hook?name=my%20db");
        assert!(hits[0].body.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (base, _hits) = spawn_receiver().await;
        let hook = WebhookNotifier::new(&format!("{base}/fail"), "");
        let err = hook.notify(&result()).await.unwrap_err();
        assert!(matches!(err, BackupError::Notify(_)));
        assert!(err.to_string().contains("500"));
    }
}
