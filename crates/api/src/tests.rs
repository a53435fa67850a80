#[cfg(test)]
mod tests {
    use crate::session::{self, DisconnectWatch, NeverDisconnects, SessionContext};
    use crate::streaming::SsePayload;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokenflow_common::{
        ChatCompletionChunk, ChatCompletionRequest, CompletionRequest, Error,
        FunctionDefinition, PromptSpec, RawChatMessage, StreamOptions, ToolSpec,
    };
    use tokenflow_runtime::{ActiveRequestRegistry, HandleStats, StubBackend};
    use tokio::sync::mpsc;

    fn ctx_with(stub: Arc<StubBackend>) -> SessionContext {
        SessionContext {
            backend: stub.clone(),
            registry: ActiveRequestRegistry::new(stub),
            http: reqwest::Client::new(),
            model_name: Arc::from("m"),
            fingerprint: Arc::from("fp_test"),
            request_counter: Arc::new(AtomicU64::new(0)),
            tool_parser_override: None,
            log_prompt_input: false,
        }
    }

    fn chat_request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![RawChatMessage::user("2+2=")],
            stream: Some(stream),
            ..Default::default()
        }
    }

    fn completion_request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            model: "m".to_string(),
            prompt: PromptSpec::One(prompt.to_string()),
            suffix: None,
            temperature: None,
            n: None,
            max_tokens: None,
            stop: None,
            stream: None,
            top_p: None,
            top_k: None,
            logprobs: None,
            echo: None,
            presence_penalty: None,
            frequency_penalty: None,
            user: None,
        }
    }

    fn tool_spec(name: &str) -> ToolSpec {
        ToolSpec {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: None,
                parameters: None,
            },
        }
    }

    /// Flips to disconnected after `after` polls.
    struct DisconnectAfter {
        after: usize,
        polls: AtomicUsize,
    }

    impl DisconnectAfter {
        fn new(after: usize) -> Self {
            Self {
                after,
                polls: AtomicUsize::new(0),
            }
        }
    }

    impl DisconnectWatch for DisconnectAfter {
        fn is_disconnected(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) + 1 > self.after
        }
    }

    async fn run_chat_stream(
        ctx: &SessionContext,
        request: ChatCompletionRequest,
        watch: Arc<dyn DisconnectWatch>,
    ) -> Vec<SsePayload> {
        let launched = session::launch_chat(ctx, &request).await.expect("launch");
        let (tx, mut rx) = mpsc::channel(64);
        session::chat_completion_stream(ctx.clone(), request, launched, watch, tx).await;

        let mut payloads = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            payloads.push(payload);
        }
        payloads
    }

    fn chat_chunks(payloads: &[SsePayload]) -> Vec<&ChatCompletionChunk> {
        payloads
            .iter()
            .filter_map(|payload| match payload {
                SsePayload::Chat(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_aggregated_response_scenario() {
        let stub = Arc::new(
            StubBackend::new(["4"]).with_prompt_tokens(5).with_stats(HandleStats {
                prompt_tokens: 5,
                output_tokens: 1,
                total_time: 0.5,
                first_token_time: 0.1,
                speed: 2.0,
            }),
        );
        let ctx = ctx_with(stub.clone());
        let request = chat_request(false);

        let launched = session::launch_chat(&ctx, &request).await.expect("launch");
        let response = session::chat_completion_full(&ctx, &request, launched, &NeverDisconnects)
            .await
            .expect("aggregate");

        assert!(response.id.starts_with("chatcmpl-"));
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.model, "m");
        assert_eq!(response.choices[0].message.content.as_deref(), Some("4"));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.prompt_tokens, 5);
        assert_eq!(response.usage.completion_tokens, 1);
        assert_eq!(response.usage.total_tokens, 6);
        assert_eq!(response.system_fingerprint.as_deref(), Some("fp_test"));

        // Normal completion never aborts, and the registry is drained
        assert_eq!(stub.abort_count(), 0);
        assert!(ctx.registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_usage_total_is_always_the_sum() {
        let stub = Arc::new(StubBackend::new(["a", "b", "c"]).with_prompt_tokens(7));
        let ctx = ctx_with(stub);
        let request = chat_request(false);

        let launched = session::launch_chat(&ctx, &request).await.expect("launch");
        let response = session::chat_completion_full(&ctx, &request, launched, &NeverDisconnects)
            .await
            .expect("aggregate");

        assert_eq!(
            response.usage.total_tokens,
            response.usage.prompt_tokens + response.usage.completion_tokens
        );
        assert_eq!(response.usage.completion_tokens, 3);
    }

    #[tokio::test]
    async fn test_disconnect_mid_aggregation_aborts_exactly_once() {
        let stub = Arc::new(StubBackend::new(["a", "b", "c", "d", "e"]).with_prompt_tokens(3));
        let ctx = ctx_with(stub.clone());
        let request = chat_request(false);

        let launched = session::launch_chat(&ctx, &request).await.expect("launch");
        let watch = DisconnectAfter::new(2);
        let result = session::chat_completion_full(&ctx, &request, launched, &watch).await;

        assert!(matches!(result, Err(Error::Disconnected)));
        assert_eq!(stub.abort_count(), 1);
        assert!(ctx.registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_streaming_chunk_sequence() {
        let stub = Arc::new(StubBackend::new(["He", "llo"]).with_prompt_tokens(5));
        let ctx = ctx_with(stub);

        let payloads = run_chat_stream(&ctx, chat_request(true), Arc::new(NeverDisconnects)).await;
        let chunks = chat_chunks(&payloads);

        // role marker, two content chunks, final chunk
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(chunks[0].usage.is_none());
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("He"));
        assert_eq!(chunks[2].choices[0].delta.content.as_deref(), Some("llo"));
        assert!(chunks[1].choices[0].finish_reason.is_none());

        let last = chunks[3];
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(last.choices[0].delta.is_empty());
        // Usage appears in the final chunk by default
        let usage = last.usage.as_ref().expect("final usage");
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 7);

        assert!(matches!(payloads.last(), Some(SsePayload::Done)));
        assert!(ctx.registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_continuous_usage_is_monotonic() {
        let stub = Arc::new(StubBackend::new(["a", "b", "c"]).with_prompt_tokens(4));
        let ctx = ctx_with(stub);
        let request = ChatCompletionRequest {
            stream_options: Some(StreamOptions {
                include_usage: None,
                continuous_usage_stats: Some(true),
            }),
            ..chat_request(true)
        };

        let payloads = run_chat_stream(&ctx, request, Arc::new(NeverDisconnects)).await;
        let chunks = chat_chunks(&payloads);
        assert_eq!(chunks.len(), 5);

        let mut previous = 0usize;
        for chunk in &chunks {
            let usage = chunk.usage.as_ref().expect("every chunk carries usage");
            assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
            assert!(usage.completion_tokens >= previous);
            previous = usage.completion_tokens;
        }
        assert_eq!(chunks[0].usage.as_ref().map(|u| u.completion_tokens), Some(0));
        assert_eq!(previous, 3);
    }

    #[tokio::test]
    async fn test_usage_suppressed_when_disabled() {
        let stub = Arc::new(StubBackend::new(["a", "b"]).with_prompt_tokens(4));
        let ctx = ctx_with(stub);
        let request = ChatCompletionRequest {
            stream_options: Some(StreamOptions {
                include_usage: Some(false),
                continuous_usage_stats: Some(false),
            }),
            ..chat_request(true)
        };

        let payloads = run_chat_stream(&ctx, request, Arc::new(NeverDisconnects)).await;
        for chunk in chat_chunks(&payloads) {
            assert!(chunk.usage.is_none());
        }
    }

    #[tokio::test]
    async fn test_streaming_disconnect_after_two_deltas() {
        let stub = Arc::new(StubBackend::new(["1", "2", "3", "4", "5"]).with_prompt_tokens(2));
        let ctx = ctx_with(stub.clone());

        let payloads =
            run_chat_stream(&ctx, chat_request(true), Arc::new(DisconnectAfter::new(2))).await;
        let chunks = chat_chunks(&payloads);

        // role marker plus the two deltas that arrived before the disconnect;
        // no final chunk and no terminal sentinel
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("1"));
        assert_eq!(chunks[2].choices[0].delta.content.as_deref(), Some("2"));
        assert!(chunks.iter().all(|c| c.choices[0].finish_reason.is_none()));
        assert!(!payloads.iter().any(|p| matches!(p, SsePayload::Done)));

        assert_eq!(stub.abort_count(), 1);
        assert!(ctx.registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_tool_calls_false_keeps_first_aggregated() {
        let stub = Arc::new(
            StubBackend::new([
                "<tool_call>{\"name\":\"first\",\"arguments\":{}}</tool_call>",
                "<tool_call>{\"name\":\"second\",\"arguments\":{}}</tool_call>",
            ])
            .with_prompt_tokens(2),
        );
        let ctx = ctx_with(stub);
        let request = ChatCompletionRequest {
            tools: Some(vec![tool_spec("first"), tool_spec("second")]),
            parallel_tool_calls: Some(false),
            ..chat_request(false)
        };

        let launched = session::launch_chat(&ctx, &request).await.expect("launch");
        let response = session::chat_completion_full(&ctx, &request, launched, &NeverDisconnects)
            .await
            .expect("aggregate");

        let choice = &response.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let calls = choice.message.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "first");
        assert_eq!(choice.message.content, None);
    }

    #[tokio::test]
    async fn test_parallel_tool_calls_false_keeps_first_streaming() {
        let stub = Arc::new(
            StubBackend::new([
                "<tool_call>{\"name\":\"first\",\"arguments\":{}}</tool_call>",
                "<tool_call>{\"name\":\"second\",\"arguments\":{}}</tool_call>",
            ])
            .with_prompt_tokens(2),
        );
        let ctx = ctx_with(stub);
        let request = ChatCompletionRequest {
            tools: Some(vec![tool_spec("first"), tool_spec("second")]),
            parallel_tool_calls: Some(false),
            ..chat_request(true)
        };

        let payloads = run_chat_stream(&ctx, request, Arc::new(NeverDisconnects)).await;
        let fragments: Vec<_> = chat_chunks(&payloads)
            .iter()
            .flat_map(|chunk| chunk.choices[0].delta.tool_calls.clone())
            .collect();

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].index, 0);
        assert_eq!(
            fragments[0].function.as_ref().and_then(|f| f.name.as_deref()),
            Some("first")
        );
    }

    #[tokio::test]
    async fn test_tool_name_split_across_deltas() {
        let stub = Arc::new(
            StubBackend::new([
                "<tool_call>{\"name\"",
                ":\"f\",\"arguments\":{}}",
                "</tool_call>",
            ])
            .with_prompt_tokens(2),
        );
        let ctx = ctx_with(stub.clone());
        let request = ChatCompletionRequest {
            tools: Some(vec![tool_spec("f")]),
            ..chat_request(true)
        };

        let payloads = run_chat_stream(&ctx, request, Arc::new(NeverDisconnects)).await;
        let chunks = chat_chunks(&payloads);

        // role, the single tool-call chunk once the block closes, final
        assert_eq!(chunks.len(), 3);
        let fragments = &chunks[1].choices[0].delta.tool_calls;
        assert_eq!(fragments.len(), 1);
        let function = fragments[0].function.as_ref().expect("function fragment");
        assert_eq!(function.name.as_deref(), Some("f"));
        assert_eq!(function.arguments.as_deref(), Some("{}"));

        // Completion after the split block cleans up exactly once
        assert!(matches!(payloads.last(), Some(SsePayload::Done)));
        assert_eq!(stub.abort_count(), 0);
        assert!(ctx.registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_frequency_penalty_zero_becomes_one() {
        for (sent, effective) in [
            (None, 1.0f32),
            (Some(0.0), 1.0),
            (Some(0.5), 0.5),
        ] {
            let stub = Arc::new(StubBackend::new(["ok"]).with_prompt_tokens(1));
            let ctx = ctx_with(stub.clone());
            let request = ChatCompletionRequest {
                frequency_penalty: sent,
                ..chat_request(false)
            };

            let launched = session::launch_chat(&ctx, &request).await.expect("launch");
            session::chat_completion_full(&ctx, &request, launched, &NeverDisconnects)
                .await
                .expect("aggregate");

            let params = stub.last_params().expect("recorded launch");
            assert_eq!(params.frequency_penalty, Some(effective), "sent {:?}", sent);
        }
    }

    #[tokio::test]
    async fn test_unparseable_tool_block_returns_raw_content() {
        let stub = Arc::new(
            StubBackend::new(["<tool_call>", "not json", "</tool_call>"]).with_prompt_tokens(1),
        );
        let ctx = ctx_with(stub);
        let request = ChatCompletionRequest {
            tools: Some(vec![tool_spec("f")]),
            ..chat_request(false)
        };

        let launched = session::launch_chat(&ctx, &request).await.expect("launch");
        let response = session::chat_completion_full(&ctx, &request, launched, &NeverDisconnects)
            .await
            .expect("aggregate");

        let choice = &response.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
        assert!(choice.message.tool_calls.is_none());
        assert_eq!(
            choice.message.content.as_deref(),
            Some("<tool_call>not json</tool_call>")
        );
    }

    #[tokio::test]
    async fn test_upstream_error_in_stream_emits_error_frame() {
        let stub = Arc::new(StubBackend::new(["a", "b"]).failing_after(1).with_prompt_tokens(1));
        let ctx = ctx_with(stub.clone());

        let payloads = run_chat_stream(&ctx, chat_request(true), Arc::new(NeverDisconnects)).await;

        let error_frames: Vec<_> = payloads
            .iter()
            .filter(|p| matches!(p, SsePayload::Error(_)))
            .collect();
        assert_eq!(error_frames.len(), 1);
        if let SsePayload::Error(value) = error_frames[0] {
            assert!(value.get("error").is_some());
        }
        // The error frame is followed by the terminal sentinel
        assert!(matches!(payloads.last(), Some(SsePayload::Done)));
        // Errors run cleanup but are not cancellation: no abort
        assert_eq!(stub.abort_count(), 0);
        assert!(ctx.registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_error_aggregated_surfaces_and_cleans_up() {
        let stub = Arc::new(StubBackend::new(["a"]).failing_after(0).with_prompt_tokens(1));
        let ctx = ctx_with(stub.clone());
        let request = chat_request(false);

        let launched = session::launch_chat(&ctx, &request).await.expect("launch");
        let result = session::chat_completion_full(&ctx, &request, launched, &NeverDisconnects).await;

        assert!(matches!(result, Err(Error::Backend(_))));
        assert_eq!(stub.abort_count(), 0);
        assert!(ctx.registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_completion_full_and_echo() {
        let stub = Arc::new(StubBackend::new([" upon", " a time"]));
        let ctx = ctx_with(stub);
        let mut request = completion_request("Once");
        request.echo = Some(true);

        let (launched, prompt) = session::launch_completion(&ctx, &request)
            .await
            .expect("launch");
        let response =
            session::completion_full(&ctx, &request, launched, prompt, &NeverDisconnects)
                .await
                .expect("aggregate");

        assert!(response.id.starts_with("cmpl-"));
        assert_eq!(response.object, "text_completion");
        assert_eq!(response.choices[0].text, "Once upon a time");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        // Prompt tokens come from tokenizing the raw prompt
        assert_eq!(response.usage.prompt_tokens, 4);
        assert_eq!(response.usage.completion_tokens, 2);
        assert_eq!(response.usage.total_tokens, 6);
    }

    #[tokio::test]
    async fn test_completion_length_finish_reason() {
        let stub = Arc::new(StubBackend::new(["a", "b"]));
        let ctx = ctx_with(stub);
        let mut request = completion_request("hi");
        request.max_tokens = Some(2);

        let (launched, prompt) = session::launch_completion(&ctx, &request)
            .await
            .expect("launch");
        let response =
            session::completion_full(&ctx, &request, launched, prompt, &NeverDisconnects)
                .await
                .expect("aggregate");

        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("length"));
    }

    #[tokio::test]
    async fn test_completion_stream_ends_with_done() {
        let stub = Arc::new(StubBackend::new(["x", "y"]));
        let ctx = ctx_with(stub);
        let request = completion_request("go");

        let (launched, prompt) = session::launch_completion(&ctx, &request)
            .await
            .expect("launch");
        let (tx, mut rx) = mpsc::channel(64);
        session::completion_stream(
            ctx.clone(),
            request,
            launched,
            prompt,
            Arc::new(NeverDisconnects),
            tx,
        )
        .await;

        let mut payloads = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            payloads.push(payload);
        }

        let texts: Vec<String> = payloads
            .iter()
            .filter_map(|p| match p {
                SsePayload::Completion(chunk) => Some(chunk.choices[0].text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["x", "y", ""]);
        assert!(matches!(payloads.last(), Some(SsePayload::Done)));
    }

    #[tokio::test]
    async fn test_completion_empty_prompt_rejected() {
        let stub = Arc::new(StubBackend::new(["x"]));
        let ctx = ctx_with(stub.clone());
        let request = completion_request("");

        let result = session::launch_completion(&ctx, &request).await;
        assert!(matches!(result, Err(Error::BadRequest(_))));
        // Rejected before any handle exists
        assert_eq!(stub.launch_count(), 0);
        assert!(ctx.registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_prompt_field_appends_user_turn() {
        let stub = Arc::new(StubBackend::new(["ok"]).with_prompt_tokens(1));
        let ctx = ctx_with(stub.clone());
        let request = ChatCompletionRequest {
            prompt: Some("and this too".to_string()),
            ..chat_request(false)
        };

        let launched = session::launch_chat(&ctx, &request).await.expect("launch");
        session::chat_completion_full(&ctx, &request, launched, &NeverDisconnects)
            .await
            .expect("aggregate");

        let launch = stub.last_launch().expect("recorded launch");
        assert_eq!(launch.messages.len(), 2);
        assert_eq!(launch.messages[1].content.as_deref(), Some("and this too"));
        assert_eq!(launch.messages[1].role, "user");
    }
}
