//! 编排层集成测试：幂等、防抖合并、离线队列耗尽、缓存过期、档位惯性、失败转移

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use switchboard::core::{ErrorKind, RequestPhase};
    use switchboard::gateway::{GatewayEvent, Orchestrator, OrchestratorSettings, Request};
    use switchboard::health::{CircuitStatus, CooldownPolicy, FailureClass, HealthLedger};
    use switchboard::llm::{
        CostTier, EndpointId, IntentClassifier, Message, ProviderEndpoint, ProviderError,
        ProviderRegistry, Role, ScriptedProvider,
    };
    use switchboard::observability::{EventBus, ObservabilityEvent};
    use switchboard::react::ToolLoop;
    use switchboard::tools::{EchoTool, ToolExecutor, ToolRegistry};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    struct FixedIntent(CostTier);

    impl IntentClassifier for FixedIntent {
        fn classify(&self, _messages: &[Message]) -> CostTier {
            self.0
        }
    }

    fn tiers() -> Vec<ProviderEndpoint> {
        vec![
            ProviderEndpoint::new("mock", "small", CostTier::Cheap),
            ProviderEndpoint::new("mock", "medium", CostTier::Standard),
            ProviderEndpoint::new("mock", "large", CostTier::Complex),
        ]
    }

    fn start(
        endpoints: &[ProviderEndpoint],
        providers: Vec<Arc<ScriptedProvider>>,
        intent: Arc<dyn IntentClassifier>,
    ) -> Orchestrator {
        let events = EventBus::default();
        let ledger = Arc::new(HealthLedger::new(endpoints, CooldownPolicy::default(), events.clone()));
        let mut registry = ProviderRegistry::new();
        for p in providers {
            registry.register_arc(p);
        }
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let tool_loop = ToolLoop::new(registry, ledger, ToolExecutor::new(tools, Duration::from_secs(30)))
            .with_intent_classifier(intent);
        let settings = OrchestratorSettings {
            chunk_chars: 0,
            ..OrchestratorSettings::default()
        };
        Orchestrator::start(Arc::new(tool_loop), settings, events, CancellationToken::new())
    }

    fn final_text(events: &[GatewayEvent]) -> Option<String> {
        match events.last()?.outcome()? {
            Ok(text) => Some(text.to_string()),
            Err(_) => None,
        }
    }

    fn model_names(provider: &ScriptedProvider) -> Vec<String> {
        provider
            .calls()
            .iter()
            .map(|id| id.as_str().split(':').nth(1).unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_duplicate_submits_execute_once() {
        let mock = Arc::new(ScriptedProvider::new("mock").with_reply("small", "the answer"));
        let orch = start(&tiers(), vec![mock.clone()], Arc::new(FixedIntent(CostTier::Cheap)));

        let streams: Vec<_> = (0..10)
            .map(|_| orch.submit(Request::new("dup-1", "conv", "question")))
            .collect();
        let results = futures_util::future::join_all(streams.into_iter().map(|s| s.collect_until_terminal())).await;

        for events in &results {
            assert_eq!(final_text(events).as_deref(), Some("the answer"));
        }
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_inputs_coalesce_into_one_request() {
        let mock = Arc::new(ScriptedProvider::new("mock"));
        let orch = start(&tiers(), vec![mock.clone()], Arc::new(FixedIntent(CostTier::Cheap)));

        let a = orch.submit(Request::new("r-a", "conv", "first"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let b = orch.submit(Request::new("r-b", "conv", "second"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let c = orch.submit(Request::new("r-c", "conv", "third"));

        let expected = "Echo from small: first\nsecond\nthird";
        for stream in [a, b, c] {
            let events = stream.collect_until_terminal().await;
            assert_eq!(final_text(&events).as_deref(), Some(expected));
        }
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_providers_exhaust_queue_then_fail() {
        // 端点所属提供方未注册：始终选不到端点
        let endpoints = vec![ProviderEndpoint::new("ghost", "phantom", CostTier::Cheap)];
        let orch = start(&endpoints, vec![], Arc::new(FixedIntent(CostTier::Cheap)));
        let mut bus = orch.events().subscribe();
        let begin = Instant::now();

        let events = orch
            .submit(Request::new("q-1", "conv", "hello"))
            .collect_until_terminal()
            .await;

        assert!(events.iter().any(|e| matches!(
            e,
            GatewayEvent::StatusUpdate { phase: RequestPhase::Queued, .. }
        )));
        match events.last().and_then(|e| e.outcome()) {
            Some(Err(err)) => assert_eq!(err.kind, ErrorKind::QueueExhausted),
            other => panic!("unexpected {:?}", other),
        }
        // 800ms 防抖 + 10s + 60s + 600s
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(670_800), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(700), "{:?}", elapsed);

        let dead = orch.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].item.attempt_count, 3);
        assert_eq!(dead[0].item.payload.request_ids, vec!["q-1".to_string()]);

        let mut saw_dead_letter = false;
        while let Ok(ev) = bus.try_recv() {
            if let ObservabilityEvent::DeadLettered { attempts, .. } = ev {
                assert_eq!(attempts, 3);
                saw_dead_letter = true;
            }
        }
        assert!(saw_dead_letter);

        // 失败结果同样被缓存
        let replay = orch
            .submit(Request::new("q-1", "conv", "hello"))
            .collect_until_terminal()
            .await;
        assert_eq!(replay.len(), 1);
        assert!(matches!(replay[0], GatewayEvent::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_leaves_other_queued_conversations_on_schedule() {
        let endpoints = vec![ProviderEndpoint::new("ghost", "phantom", CostTier::Cheap)];
        let orch = start(&endpoints, vec![], Arc::new(FixedIntent(CostTier::Cheap)));
        let begin = Instant::now();

        let first = orch.submit(Request::new("q-1", "c1", "hello"));
        let second = orch.submit(Request::new("q-1", "c2", "hello"));
        // 两个会话都已排队
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(orch.queued(), 2);

        assert!(orch.cancel("c1"));
        assert_eq!(orch.queued(), 1);
        let first = first.collect_until_terminal().await;
        match first.last().and_then(|e| e.outcome()) {
            Some(Err(err)) => assert_eq!(err.kind, ErrorKind::Cancelled),
            other => panic!("unexpected {:?}", other),
        }
        assert!(begin.elapsed() < Duration::from_secs(2));

        let second = second.collect_until_terminal().await;
        match second.last().and_then(|e| e.outcome()) {
            Some(Err(err)) => assert_eq!(err.kind, ErrorKind::QueueExhausted),
            other => panic!("unexpected {:?}", other),
        }
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(670_800), "{:?}", elapsed);

        let dead = orch.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].item.payload.conversation_id, "c2");
        assert_eq!(dead[0].item.attempt_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_result_expires_after_ttl_and_sweep() {
        let mock = Arc::new(ScriptedProvider::new("mock"));
        let orch = start(&tiers(), vec![mock.clone()], Arc::new(FixedIntent(CostTier::Cheap)));

        orch.submit(Request::new("c-1", "conv", "hi")).collect_until_terminal().await;
        assert_eq!(mock.call_count(), 1);

        tokio::time::sleep(Duration::from_secs(250)).await;
        let replay = orch.submit(Request::new("c-1", "conv", "hi")).collect_until_terminal().await;
        assert_eq!(replay.len(), 1);
        assert_eq!(mock.call_count(), 1);

        // TTL 300s 自完成起算，清扫间隔 30s
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(orch.cache().is_empty());

        orch.submit(Request::new("c-1", "conv", "hi")).collect_until_terminal().await;
        assert_eq!(mock.call_count(), 2);
    }

    /// 第 2 次工具结果之后分档为 complex，其余时候为 cheap
    struct SpikeAtSecondTool;

    impl IntentClassifier for SpikeAtSecondTool {
        fn classify(&self, messages: &[Message]) -> CostTier {
            let tool_results = messages.iter().filter(|m| m.role == Role::Tool).count();
            if tool_results == 2 {
                CostTier::Complex
            } else {
                CostTier::Cheap
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_never_drops_across_five_tool_iterations() {
        let call = |n: u32| format!(r#"{{"tool": "echo", "args": {{"text": "step {}"}}}}"#, n);
        let mock = Arc::new(
            ScriptedProvider::new("mock")
                .with_reply("small", call(1))
                .with_reply("small", call(2))
                .with_reply("large", call(3))
                .with_reply("large", call(4))
                .with_reply("large", call(5))
                .with_reply("large", "all done"),
        );
        let orch = start(&tiers(), vec![mock.clone()], Arc::new(SpikeAtSecondTool));

        let events = orch
            .submit(Request::new("t-1", "conv", "run the steps"))
            .collect_until_terminal()
            .await;
        assert_eq!(final_text(&events).as_deref(), Some("all done"));

        let models = model_names(&mock);
        assert_eq!(models, vec!["small", "small", "large", "large", "large", "large"]);
        let first_large = models.iter().position(|m| m == "large").unwrap();
        assert!(models[first_large..].iter().all(|m| m == "large"));

        let tool_calls = events
            .iter()
            .filter(|e| matches!(e, GatewayEvent::StatusUpdate { detail: Some(d), .. } if d == "calling echo"))
            .count();
        assert_eq!(tool_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_fails_over_to_other_provider() {
        let endpoints = vec![
            ProviderEndpoint::new("alpha", "a-small", CostTier::Cheap),
            ProviderEndpoint::new("alpha", "a-large", CostTier::Complex),
            ProviderEndpoint::new("beta", "b-small", CostTier::Cheap),
        ];
        let alpha = Arc::new(
            ScriptedProvider::new("alpha").with_failure("a-small", ProviderError::from_status(401, "invalid api key")),
        );
        let beta = Arc::new(ScriptedProvider::new("beta").with_reply("b-small", "from beta"));
        let orch = start(&endpoints, vec![alpha.clone(), beta], Arc::new(FixedIntent(CostTier::Cheap)));

        let events = orch
            .submit(Request::new("f-1", "conv", "hi"))
            .collect_until_terminal()
            .await;
        assert_eq!(final_text(&events).as_deref(), Some("from beta"));
        assert_eq!(alpha.call_count(), 1);
        assert!(events.iter().any(|e| matches!(
            e,
            GatewayEvent::StatusUpdate { detail: Some(d), .. } if d == "switching model"
        )));

        let snapshot = orch.ledger_snapshot();
        for record in snapshot.iter().filter(|r| r.endpoint.provider == "alpha") {
            assert_eq!(record.status, CircuitStatus::Open);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_billing_text_beats_rate_limit_status() {
        let endpoints = vec![
            ProviderEndpoint::new("alpha", "a-small", CostTier::Cheap),
            ProviderEndpoint::new("beta", "b-small", CostTier::Cheap),
        ];
        let alpha = Arc::new(ScriptedProvider::new("alpha").with_failure(
            "a-small",
            ProviderError::from_status(429, "You exceeded your current quota, please check your plan"),
        ));
        let beta = Arc::new(ScriptedProvider::new("beta").with_reply("b-small", "ok"));
        let orch = start(&endpoints, vec![alpha.clone(), beta], Arc::new(FixedIntent(CostTier::Cheap)));

        let events = orch
            .submit(Request::new("b-1", "conv", "hi"))
            .collect_until_terminal()
            .await;
        assert_eq!(final_text(&events).as_deref(), Some("ok"));
        // 计费失败不做原地重试
        assert_eq!(alpha.call_count(), 1);

        let record = orch
            .ledger_snapshot()
            .into_iter()
            .find(|r| r.endpoint.id() == EndpointId::new("alpha", "a-small"))
            .unwrap();
        assert_eq!(record.failure_class_history.back(), Some(&FailureClass::Billing));
        let remaining = record.cooldown_until.unwrap().duration_since(Instant::now());
        assert!(remaining > Duration::from_secs(4 * 3600));
        assert!(remaining <= Duration::from_secs(5 * 3600));
    }
}
