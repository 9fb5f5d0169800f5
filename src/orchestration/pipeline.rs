//! 编排入口：校验输入 → 意图分类 → 调度 → 合成
//!
//! 整个请求共享一个截止时间（timeout_seconds），由同一个取消作用域贯穿到每次外部调用；
//! 超时只返回「超时」回复，不做部分结果合成。任何错误都经 [`ReplyPolicy`] 变成固定回复。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestrationSettings;
use crate::core::{reply, OrchestratorError, ReplyPolicy};
use crate::orchestration::{Dispatcher, IntentClassifier, ResponseSynthesizer};

pub struct OrchestrationPipeline {
    classifier: IntentClassifier,
    dispatcher: Dispatcher,
    synthesizer: ResponseSynthesizer,
    settings: OrchestrationSettings,
    replies: ReplyPolicy,
}

impl OrchestrationPipeline {
    pub fn new(
        classifier: IntentClassifier,
        dispatcher: Dispatcher,
        synthesizer: ResponseSynthesizer,
        settings: OrchestrationSettings,
    ) -> Self {
        Self {
            classifier,
            dispatcher,
            synthesizer,
            settings: settings.validated(),
            replies: ReplyPolicy::new(),
        }
    }

    pub fn settings(&self) -> &OrchestrationSettings {
        &self.settings
    }

    /// 处理一条用户消息，总是返回可直接展示给用户的文本
    pub async fn process_user_message(
        &self,
        query: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> String {
        let query = query.trim();
        if query.is_empty() {
            return reply::EMPTY_MESSAGE_REPLY.to_string();
        }
        if query.chars().count() > self.settings.max_message_length {
            return reply::too_long_reply(self.settings.max_message_length);
        }

        tracing::info!(session_id, "Processing message: {}", query);

        match self.run(query, session_id, cancel).await {
            Ok(answer) => {
                tracing::info!(session_id, "Response ready");
                answer
            }
            Err(e) => self.replies.reply_for(&e).to_string(),
        }
    }

    /// 已校验输入上的编排主流程；错误交由调用方映射
    pub async fn run(
        &self,
        query: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let deadline = Instant::now() + Duration::from_secs(self.settings.timeout_seconds);
        let scope = cancel.child_token();

        let work = async {
            tracing::info!("Step 1: Analyzing intent...");
            let intents = self.classifier.classify(query, &scope).await;
            tracing::info!(
                "Detected {} intent(s): {}",
                intents.len(),
                intents
                    .iter()
                    .map(|i| i.kind.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            tracing::info!(
                "Step 2: Executing agents (parallel={})...",
                self.settings.enable_parallel_execution
            );
            let responses = self
                .dispatcher
                .execute(intents, session_id, deadline, &scope)
                .await?;

            tracing::info!("Step 3: Synthesizing response...");
            self.synthesizer.synthesize(query, &responses, &scope).await
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            r = tokio::time::timeout_at(deadline, work) => match r {
                Ok(inner) => inner,
                Err(_) => Err(OrchestratorError::Timeout { seconds: self.settings.timeout_seconds }),
            },
        };

        // 丢弃未完成的外部调用
        scope.cancel();
        result
    }
}
