//! Ollama-style HTTP implementation of the local runtime.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use tunnel_common::ModelAdvertisement;

use super::{ModelRuntime, Result, RuntimeError};

/// HTTP client wrapping the local model server.
pub struct HttpRuntime {
    http_client: Client,
    base_url: String,
}

impl HttpRuntime {
    pub fn new(base_url: &str) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn map_error(e: reqwest::Error) -> RuntimeError {
        if e.is_timeout() {
            RuntimeError::Timeout
        } else if e.is_connect() {
            RuntimeError::Unreachable(e.to_string())
        } else {
            RuntimeError::Failed(e.to_string())
        }
    }
}

/// Response from the /api/tags endpoint.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagsModel>,
}

#[derive(Debug, Deserialize)]
struct TagsModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
}

#[async_trait]
impl ModelRuntime for HttpRuntime {
    async fn list_models(&self) -> Result<Vec<ModelAdvertisement>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_error)?;

        if !response.status().is_success() {
            return Err(RuntimeError::Failed(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let tags: TagsResponse = response.json().await.map_err(Self::map_error)?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelAdvertisement {
                model_name: m.name,
                size_bytes: m.size,
                capabilities: vec![],
            })
            .collect())
    }

    async fn invoke(
        &self,
        model_name: &str,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/api/chat", self.base_url);

        // The dispatched payload is opaque; only the target model and the
        // non-streaming flag are pinned here.
        let mut body = match input {
            serde_json::Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        body.insert(
            "model".to_string(),
            serde_json::Value::String(model_name.to_string()),
        );
        body.insert("stream".to_string(), serde_json::Value::Bool(false));

        let response = self
            .http_client
            .post(&url)
            .json(&serde_json::Value::Object(body))
            .send()
            .await
            .map_err(Self::map_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RuntimeError::ModelNotFound(model_name.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Failed(format!("HTTP {}: {}", status, body)));
        }

        response.json().await.map_err(Self::map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_list_models_parses_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    {"name": "llama3.2:3b", "size": 2019393189u64},
                    {"name": "qwen2.5:7b"}
                ]
            })))
            .mount(&server)
            .await;

        let runtime = HttpRuntime::new(&server.uri());
        let models = runtime.list_models().await.unwrap();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].model_name, "llama3.2:3b");
        assert_eq!(models[0].size_bytes, Some(2019393189));
        assert_eq!(models[1].size_bytes, None);
    }

    #[tokio::test]
    async fn test_list_models_unreachable() {
        // Nothing listens here.
        let runtime = HttpRuntime::new("http://127.0.0.1:1");
        let err = runtime.list_models().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_invoke_pins_model_and_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama3.2:3b",
                "stream": false,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "hello"},
                "done": true
            })))
            .mount(&server)
            .await;

        let runtime = HttpRuntime::new(&server.uri());
        let result = runtime
            .invoke(
                "llama3.2:3b",
                &json!({"messages": [{"role": "user", "content": "hi"}]}),
            )
            .await
            .unwrap();

        assert_eq!(result["message"]["content"], json!("hello"));
    }

    #[tokio::test]
    async fn test_invoke_missing_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "model not found"})),
            )
            .mount(&server)
            .await;

        let runtime = HttpRuntime::new(&server.uri());
        let err = runtime.invoke("ghost", &json!({})).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_invoke_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let runtime = HttpRuntime::new(&server.uri());
        let err = runtime.invoke("llama3.2:3b", &json!({})).await.unwrap_err();
        match err {
            RuntimeError::Failed(message) => assert!(message.contains("overloaded")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
