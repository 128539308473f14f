//! 工具执行循环
//!
//! Executing：发送上下文 → 解析输出 → 若为工具调用则执行并回填结果 → 下一轮，直到模型给出最终回复；
//! 可选 Reflecting 复查一次。没有轮数上限，请求级墙钟截止时间是唯一的安全阀。
//!
//! 档位惯性：当前端点的档位即「已承诺档位」，请求内只升不降。每轮目标档位为
//! max(重新分档结果, 已承诺档位)；只有升档或失败时才重新选端点，失败转移的候选不低于已承诺档位。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorSection;
use crate::core::{GatewayError, RequestPhase};
use crate::health::{
    CallOutcome, FailureClass, FailureClassifier, HealthLedger, PolicyDecision, RetryAction,
    SelectionOrder,
};
use crate::llm::{
    CostTier, EndpointId, IntentClassifier, Message, ProviderEndpoint, ProviderError,
    ProviderRegistry, Role, TaskClassifier,
};
use crate::react::{build_system_prompt, parse_model_output, LoopEvent, PlannerOutput, Reflector};
use crate::tools::ToolExecutor;

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

pub type LoopEventSender = mpsc::UnboundedSender<LoopEvent>;

fn send_event(tx: Option<&LoopEventSender>, ev: LoopEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 一次循环的输入：已选好的首个端点与初始分档
#[derive(Debug, Clone)]
pub struct LoopInput {
    pub request_id: String,
    pub messages: Vec<Message>,
    pub tier: CostTier,
    pub endpoint: ProviderEndpoint,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub answer: String,
    /// 最终产出答案的端点
    pub endpoint: EndpointId,
    pub iterations: usize,
}

/// 工具执行循环：持有提供方、健康账本、失败分类器、意图分档器与工具执行器
pub struct ToolLoop {
    providers: ProviderRegistry,
    ledger: Arc<HealthLedger>,
    classifier: Arc<FailureClassifier>,
    intent: Arc<dyn IntentClassifier>,
    executor: ToolExecutor,
    reflector: Option<Arc<dyn Reflector>>,
    system_prompt: String,
    request_deadline: Duration,
    call_timeout: Duration,
}

impl ToolLoop {
    pub fn new(providers: ProviderRegistry, ledger: Arc<HealthLedger>, executor: ToolExecutor) -> Self {
        let defaults = OrchestratorSection::default();
        let system_prompt = build_system_prompt(&defaults.system_prompt, executor.registry());
        Self {
            providers,
            ledger,
            classifier: Arc::new(FailureClassifier::default()),
            intent: Arc::new(TaskClassifier::default()),
            executor,
            reflector: None,
            system_prompt,
            request_deadline: defaults.request_deadline(),
            call_timeout: defaults.call_timeout(),
        }
    }

    pub fn from_config(
        providers: ProviderRegistry,
        ledger: Arc<HealthLedger>,
        executor: ToolExecutor,
        classifier: Arc<FailureClassifier>,
        section: &OrchestratorSection,
    ) -> Self {
        Self::new(providers, ledger, executor)
            .with_failure_classifier(classifier)
            .with_system_prompt(&section.system_prompt)
            .with_request_deadline(section.request_deadline())
            .with_call_timeout(section.call_timeout())
    }

    pub fn with_failure_classifier(mut self, classifier: Arc<FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_intent_classifier(mut self, intent: Arc<dyn IntentClassifier>) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_reflector(mut self, reflector: Arc<dyn Reflector>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    /// 基础提示词；工具清单由注册表自动追加
    pub fn with_system_prompt(mut self, base: &str) -> Self {
        self.system_prompt = build_system_prompt(base, self.executor.registry());
        self
    }

    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &Arc<HealthLedger> {
        &self.ledger
    }

    /// 意图分档（CLASSIFYING）
    pub fn classify(&self, messages: &[Message]) -> CostTier {
        self.intent.classify(messages)
    }

    /// 选端点（SELECTING_MODEL）：先试模型提示，再从 preferred 档位逐级向上扫描；
    /// floor 以下的档位与 exclude 中的端点不参与，返回 None 时调用方入队
    pub fn select(
        &self,
        preferred: CostTier,
        hint: Option<&str>,
        floor: Option<CostTier>,
        exclude: &HashSet<EndpointId>,
    ) -> Option<ProviderEndpoint> {
        let candidates: Vec<ProviderEndpoint> = self
            .ledger
            .endpoints()
            .into_iter()
            .filter(|ep| floor.map_or(true, |f| ep.cost_tier >= f))
            .filter(|ep| !exclude.contains(&ep.id()))
            .filter(|ep| self.providers.get(&ep.provider).is_some())
            .collect();

        if let Some(hint) = hint {
            let hinted: Vec<ProviderEndpoint> = candidates
                .iter()
                .filter(|ep| ep.matches_hint(hint))
                .cloned()
                .collect();
            if let Some(ep) = self.ledger.next_available_endpoint(&hinted, SelectionOrder::AsGiven) {
                return Some(ep);
            }
            tracing::debug!(hint = %hint, "Hinted model unavailable, falling back to tier search");
        }

        for tier in CostTier::search_order(preferred) {
            let group: Vec<ProviderEndpoint> = candidates
                .iter()
                .filter(|ep| ep.cost_tier == tier)
                .cloned()
                .collect();
            if group.is_empty() {
                continue;
            }
            if let Some(ep) = self.ledger.next_available_endpoint(&group, SelectionOrder::CheapestFirst) {
                return Some(ep);
            }
        }
        None
    }

    /// 执行循环直到最终回复、失败、超时或取消
    pub async fn run(
        &self,
        input: LoopInput,
        events: Option<&LoopEventSender>,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, GatewayError> {
        let deadline = Instant::now() + self.request_deadline;
        let goal = input
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut context = Vec::with_capacity(input.messages.len() + 1);
        context.push(Message::system(self.system_prompt.clone()));
        context.extend(input.messages);

        let mut endpoint = input.endpoint;
        let mut target = input.tier.max(endpoint.cost_tier);
        send_event(events, LoopEvent::Phase {
            phase: RequestPhase::Executing,
        });
        send_event(events, LoopEvent::ModelSelected {
            endpoint: endpoint.id(),
            tier: endpoint.cost_tier,
        });

        let mut iteration = 0usize;
        let draft = loop {
            if cancel.is_cancelled() {
                tracing::info!(request_id = %input.request_id, iteration, "Request cancelled");
                return Err(GatewayError::Cancelled);
            }

            if iteration > 0 {
                target = self.classify(&context[1..]).max(endpoint.cost_tier);
                if target > endpoint.cost_tier {
                    self.try_upgrade(&mut endpoint, target, events);
                }
            }

            let text = self
                .call_with_failover(&mut endpoint, target, &context, deadline, events)
                .await?;

            match parse_model_output(&text) {
                PlannerOutput::Final(answer) => break answer,
                PlannerOutput::ToolCall(call) => {
                    send_event(events, LoopEvent::ToolCall {
                        tool: call.tool.clone(),
                        args: call.args.clone(),
                    });
                    let result = timeout_at(deadline, self.executor.execute(&call.tool, call.args)).await;
                    let observation = match result {
                        Err(_) => {
                            let id = endpoint.id();
                            self.ledger
                                .report(&id, CallOutcome::Failure(FailureClass::Transient));
                            tracing::warn!(
                                request_id = %input.request_id,
                                endpoint = %id,
                                tool = %call.tool,
                                "Request deadline exceeded while a tool was running"
                            );
                            return Err(GatewayError::Timeout("request deadline exceeded".to_string()));
                        }
                        Ok(Ok(out)) => {
                            send_event(events, LoopEvent::Observation {
                                tool: call.tool.clone(),
                                preview: preview(&out),
                            });
                            out
                        }
                        Ok(Err(e)) => {
                            send_event(events, LoopEvent::ToolFailure {
                                tool: call.tool.clone(),
                                reason: e.to_string(),
                            });
                            format!("Error: {}", e)
                        }
                    };
                    context.push(Message::assistant(text));
                    context.push(Message::tool(format!("{} -> {}", call.tool, observation)));
                }
                PlannerOutput::Malformed(reason) => {
                    tracing::debug!(request_id = %input.request_id, reason = %reason, "Malformed tool call");
                    context.push(Message::assistant(text));
                    context.push(Message::user(format!(
                        "Your previous reply could not be parsed as a tool call ({}). \
                         Reply with one valid JSON tool call or with the final answer.",
                        reason
                    )));
                }
            }
            iteration += 1;
        };

        let answer = match &self.reflector {
            Some(reflector) => {
                self.reflect(reflector.as_ref(), &goal, draft, &endpoint, deadline, events)
                    .await
            }
            None => draft,
        };

        tracing::info!(
            request_id = %input.request_id,
            endpoint = %endpoint.id(),
            iterations = iteration + 1,
            "Tool loop finished"
        );
        Ok(LoopOutcome {
            answer,
            endpoint: endpoint.id(),
            iterations: iteration + 1,
        })
    }

    /// 升档：只考虑高于当前档位的端点；没有可用者则留在当前端点
    fn try_upgrade(&self, endpoint: &mut ProviderEndpoint, target: CostTier, events: Option<&LoopEventSender>) {
        let Some(above) = CostTier::ALL.iter().copied().find(|t| *t > endpoint.cost_tier) else {
            return;
        };
        let none = HashSet::new();
        let upgraded = self
            .select(target, None, Some(above), &none)
            .or_else(|| self.select(above, None, Some(above), &none));
        if let Some(upgraded) = upgraded {
            tracing::info!(
                from = %endpoint.id(),
                to = %upgraded.id(),
                tier = %upgraded.cost_tier,
                "Upgrading model tier"
            );
            send_event(events, LoopEvent::ModelSelected {
                endpoint: upgraded.id(),
                tier: upgraded.cost_tier,
            });
            *endpoint = upgraded;
        }
    }

    /// 对当前端点发起调用；失败时按策略原地重试或转移到不低于已承诺档位的下一个端点
    async fn call_with_failover(
        &self,
        endpoint: &mut ProviderEndpoint,
        target: CostTier,
        context: &[Message],
        deadline: Instant,
        events: Option<&LoopEventSender>,
    ) -> Result<String, GatewayError> {
        let mut tried: HashSet<EndpointId> = HashSet::new();

        loop {
            let id = endpoint.id();
            let attempt = match self.providers.get(&endpoint.provider) {
                None => Err(ProviderError::other(format!(
                    "provider {} is not registered",
                    endpoint.provider
                ))),
                Some(provider) => {
                    let call_deadline = deadline.min(Instant::now() + self.call_timeout);
                    match timeout_at(call_deadline, provider.invoke(endpoint, context)).await {
                        Ok(result) => result,
                        Err(_) if Instant::now() >= deadline => {
                            self.ledger
                                .report(&id, CallOutcome::Failure(FailureClass::Transient));
                            tracing::warn!(endpoint = %id, "Request deadline exceeded during provider call");
                            return Err(GatewayError::Timeout("request deadline exceeded".to_string()));
                        }
                        Err(_) => Err(ProviderError::transient(format!(
                            "call timed out after {}ms",
                            self.call_timeout.as_millis()
                        ))),
                    }
                }
            };

            let err = match attempt {
                Ok(text) => {
                    self.ledger.report(&id, CallOutcome::Success);
                    return Ok(text);
                }
                Err(e) => e,
            };

            let class = self.classifier.classify(&err);
            tracing::warn!(endpoint = %id, class = ?class, error = %err, "Provider call failed");
            let decision = class.and_then(|c| self.ledger.report(&id, CallOutcome::Failure(c)));
            let error = match class {
                Some(c) => c.to_error(err.message.clone()),
                None => GatewayError::Provider(err.message.clone()),
            };

            if let Some(PolicyDecision {
                action: RetryAction::RetrySame { delay },
                ..
            }) = decision
            {
                let resume = Instant::now() + delay;
                if resume < deadline {
                    send_event(events, LoopEvent::Retrying {
                        endpoint: id.clone(),
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep_until(resume).await;
                    continue;
                }
            }

            tried.insert(id.clone());
            send_event(events, LoopEvent::Failover { from: id, class });

            // 目标档位没有候选时，退回已承诺档位及以上
            let committed = endpoint.cost_tier;
            let next = self
                .select(target, None, Some(committed), &tried)
                .or_else(|| self.select(committed, None, Some(committed), &tried));
            match next {
                Some(next) => {
                    tracing::info!(to = %next.id(), tier = %next.cost_tier, "Failing over");
                    send_event(events, LoopEvent::ModelSelected {
                        endpoint: next.id(),
                        tier: next.cost_tier,
                    });
                    *endpoint = next;
                }
                None => return Err(error),
            }
        }
    }

    /// REFLECTING：失败时返回未经反思的草稿
    async fn reflect(
        &self,
        reflector: &dyn Reflector,
        goal: &str,
        draft: String,
        endpoint: &ProviderEndpoint,
        deadline: Instant,
        events: Option<&LoopEventSender>,
    ) -> String {
        send_event(events, LoopEvent::Phase {
            phase: RequestPhase::Reflecting,
        });
        let Some(provider) = self.providers.get(&endpoint.provider) else {
            return draft;
        };
        let id = endpoint.id();
        let call_deadline = deadline.min(Instant::now() + self.call_timeout);

        match timeout_at(call_deadline, reflector.reflect(goal, &draft, provider.as_ref(), endpoint)).await {
            Ok(Ok(reflected)) => {
                self.ledger.report(&id, CallOutcome::Success);
                let changed = reflected != draft;
                send_event(events, LoopEvent::Reflected { changed });
                reflected
            }
            Ok(Err(e)) => {
                if let Some(class) = self.classifier.classify(&e) {
                    self.ledger.report(&id, CallOutcome::Failure(class));
                }
                tracing::warn!(endpoint = %id, error = %e, "Reflection failed, returning unreflected answer");
                draft
            }
            Err(_) => {
                self.ledger
                    .report(&id, CallOutcome::Failure(FailureClass::Transient));
                tracing::warn!(endpoint = %id, "Reflection timed out, returning unreflected answer");
                draft
            }
        }
    }
}
