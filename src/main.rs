//! Switchboard - 行式 stdin 适配器
//!
//! 每行输入作为一次请求提交给编排器，事件流以 JSON 逐行打印到 stdout。
//! - `/cancel`：取消当前会话进行中的请求
//! - `/health`：打印端点健康快照
//!
//! 未配置任何端点时使用脚本化提供方（回显）演示完整流程。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use switchboard::config::{load_config, AppConfig, ProviderKind};
use switchboard::core::shutdown::run_with_graceful_shutdown;
use switchboard::core::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager};
use switchboard::gateway::{Orchestrator, Request};
use switchboard::llm::{CostTier, OpenAiCompatProvider, ProviderEndpoint, ProviderRegistry, ScriptedProvider};
use switchboard::observability;
use switchboard::tools::{ClockTool, EchoTool, ToolRegistry};

fn build_providers(config: &mut AppConfig) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();

    if config.endpoints.is_empty() {
        tracing::warn!("No endpoints configured, falling back to the scripted echo provider");
        config.endpoints = vec![
            ProviderEndpoint::new("scripted", "echo-small", CostTier::Cheap),
            ProviderEndpoint::new("scripted", "echo-medium", CostTier::Standard),
            ProviderEndpoint::new("scripted", "echo-large", CostTier::Complex),
        ];
        providers.register(ScriptedProvider::new("scripted"));
        return providers;
    }

    let mut names: Vec<&str> = config.endpoints.iter().map(|e| e.provider.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    for name in names {
        let section = config.providers.get(name).cloned().unwrap_or_default();
        match section.kind {
            ProviderKind::OpenaiCompatible => providers.register(OpenAiCompatProvider::from_config(name, &section)),
            ProviderKind::Scripted => providers.register(ScriptedProvider::new(name)),
        }
        tracing::info!(provider = name, kind = ?section.kind, "Provider registered");
    }
    providers
}

/// 关闭时报告死信与仍在排队的请求
struct QueueReport {
    orchestrator: Orchestrator,
}

#[async_trait]
impl ShutdownCleanup for QueueReport {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let dead = self.orchestrator.dead_letters();
        for letter in &dead {
            tracing::warn!(
                item_id = %letter.item.id,
                conversation = %letter.item.payload.conversation_id,
                attempts = letter.item.attempt_count,
                reason = %letter.reason,
                "Dead letter"
            );
        }
        tracing::info!(
            dead_letters = dead.len(),
            queued = self.orchestrator.queued(),
            "Queue state at shutdown"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "QueueReport"
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
    }
}

async fn read_requests(orchestrator: Orchestrator, conversation_id: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stdin");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/cancel" => {
                let cancelled = orchestrator.cancel(&conversation_id);
                tracing::info!(cancelled, "Cancel requested");
            }
            "/health" => {
                for record in orchestrator.ledger_snapshot() {
                    println!(
                        "{} status={:?} failures={} history={:?}",
                        record.endpoint.id(),
                        record.status,
                        record.consecutive_failures,
                        record.failure_class_history
                    );
                }
            }
            text => {
                let request = Request::new(uuid::Uuid::new_v4().to_string(), conversation_id.clone(), text);
                let mut stream = orchestrator.submit(request);
                tokio::spawn(async move {
                    while let Some(event) = stream.next().await {
                        let done = event.is_terminal();
                        print_json(&event);
                        if done {
                            break;
                        }
                    }
                });
            }
        }
    }
    // 输入结束：留出时间让最后一批请求走完防抖窗口与执行
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = load_config(config_path).context("Failed to load configuration")?;
    let providers = build_providers(&mut config);

    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools.register(ClockTool);

    let manager = Arc::new(ShutdownManager::new());
    let orchestrator = Orchestrator::from_config(&config, providers, tools, manager.token())
        .context("Failed to start orchestrator")?;

    let mut events = orchestrator.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(event = ?event, "Observability event");
        }
    });

    let mut coordinator = ShutdownCoordinator::new(manager);
    coordinator.register(QueueReport {
        orchestrator: orchestrator.clone(),
    });

    tracing::info!(
        app = %config.app.name,
        conversation = %config.app.conversation_id,
        endpoints = config.endpoints.len(),
        "Switchboard ready, reading requests from stdin"
    );

    let app = read_requests(orchestrator, config.app.conversation_id.clone());
    run_with_graceful_shutdown(app, &coordinator).await;
    Ok(())
}
