#[cfg(test)]
mod tests {
    use orca_core::OrcaError;
    use orca_llm::{ModelBackend, OllamaBackend, OpenAiBackend, RetryPolicy};
    use serde_json::json;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ollama(server: &MockServer) -> OllamaBackend {
        OllamaBackend::new(server.uri(), "test-model").with_policy(RetryPolicy::immediate())
    }

    async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.map(|r| r.len()).unwrap_or(0)
    }

    // ── Ollama ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_raw_prompt_uses_generate_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "prompt": "complete me",
                "stream": false,
                "options": {"num_predict": 1000}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "completed",
                "done": true
            })))
            .mount(&server)
            .await;

        let text = ollama(&server).generate("complete me").await.unwrap();
        assert_eq!(text, "completed");
    }

    #[tokio::test]
    async fn test_role_prompt_uses_chat_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "hello"},
                "done": true
            })))
            .mount(&server)
            .await;

        let text = ollama(&server)
            .generate("system: be brief\n\nuser: hi\n\nassistant: ")
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_loading_model_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "",
                "done": true,
                "done_reason": "load"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "ready now",
                "done": true
            })))
            .mount(&server)
            .await;

        let text = ollama(&server).generate("p").await.unwrap();
        assert_eq!(text, "ready now");
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn test_loading_budget_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "done": true,
                "done_reason": "load"
            })))
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            load_retries: 2,
            ..RetryPolicy::immediate()
        };
        let backend = OllamaBackend::new(server.uri(), "m").with_policy(policy);
        let err = backend.generate("p").await.unwrap_err();
        assert!(matches!(err, OrcaError::BackendLoading { attempts: 2 }));
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn test_http_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("kaput"))
            .mount(&server)
            .await;

        let err = ollama(&server).generate("p").await.unwrap_err();
        assert!(matches!(err, OrcaError::Backend(ref m) if m.contains("kaput")));
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_error_field_and_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": "model 'x' not found"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "   ",
                "done": true
            })))
            .mount(&server)
            .await;

        let backend = ollama(&server);
        let err = backend.generate("p").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        let err = backend.generate("p").await.unwrap_err();
        assert!(matches!(err, OrcaError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_connection_failures_use_their_own_budget() {
        // Nothing listens on port 9 of localhost.
        let policy = RetryPolicy {
            connect_attempts: 2,
            ..RetryPolicy::immediate()
        };
        let backend = OllamaBackend::new("http://127.0.0.1:9", "m").with_policy(policy);
        let err = backend.generate("p").await.unwrap_err();
        assert!(matches!(err, OrcaError::BackendUnreachable { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_stream_newline_json() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"response\":\"Hel\",\"done\":false}\n",
            "{\"response\":\"lo\",\"done\":false}\n",
            "\n",
            "{\"response\":\"\",\"done\":true}"
        );
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(16);
        ollama(&server).generate_stream("say hello", tx).await.unwrap();
        assert_eq!(collect(rx).await, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_stream_restarts_while_loading() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"done\":true,\"done_reason\":\"load\"}\n"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"message\":{\"content\":\"up\"},\"done\":false}\n{\"done\":true}\n",
            ))
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(16);
        ollama(&server).generate_stream("p", tx).await.unwrap();
        assert_eq!(collect(rx).await, vec!["up"]);
        assert_eq!(request_count(&server).await, 2);
    }

    #[tokio::test]
    async fn test_stream_without_content_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"done\":true}\n"))
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(4);
        let err = ollama(&server).generate_stream("p", tx).await.unwrap_err();
        assert!(matches!(err, OrcaError::EmptyResponse));
        assert!(collect(rx).await.is_empty());
    }

    // ── Hosted ─────────────────────────────────────────────────

    fn hosted(server: &MockServer) -> OpenAiBackend {
        OpenAiBackend::new("sk-test", "gpt-test")
            .with_base_url(server.uri())
            .with_policy(RetryPolicy::immediate())
    }

    #[tokio::test]
    async fn test_hosted_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-test",
                "messages": [{"role": "user", "content": "user: hi\n\nassistant: "}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hey"}}]
            })))
            .mount(&server)
            .await;

        let text = hosted(&server).generate("user: hi\n\nassistant: ").await.unwrap();
        assert_eq!(text, "hey");
    }

    #[tokio::test]
    async fn test_hosted_stream() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"4\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"2\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(16);
        hosted(&server).generate_stream("p", tx).await.unwrap();
        assert_eq!(collect(rx).await, vec!["4", "2"]);
    }

    #[tokio::test]
    async fn test_hosted_rejects_empty_prompt() {
        let server = MockServer::start().await;
        let err = hosted(&server).generate("").await.unwrap_err();
        assert!(matches!(err, OrcaError::Validation(_)));
        assert_eq!(request_count(&server).await, 0);
    }
}
