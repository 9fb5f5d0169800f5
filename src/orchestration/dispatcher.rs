//! 调度器：按意图列表执行能力
//!
//! - 截断：超过 max_agent_calls 的意图直接丢弃（只记 warn）
//! - 并行模式每个意图一个 tokio 任务，全部结束后按原顺序汇总；串行模式逐个等待
//! - 单分支的任何失败（能力报错、无对应能力、panic）都转成 `success=false` 的响应，不影响兄弟分支
//! - 唯一向外传播的分支错误是「需要登录」：串行模式立即停止，并行模式等已启动的分支结束后返回
//! - 截止时间到达：取消并中止所有仍在运行的分支，整体返回 Timeout，不保留部分结果

use std::sync::{Arc, Mutex};
use std::time::Instant as StdInstant;

use futures_util::future::join_all;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{TokenCache, TokenCacheError};
use crate::capabilities::CapabilityError;
use crate::config::OrchestrationSettings;
use crate::core::OrchestratorError;
use crate::orchestration::{
    AgentResponse, CapabilityRegistry, ExecutionPlan, ExecutionStep, Intent, TraceStep,
};

/// 分支结果：Err 只可能是需要登录
type BranchResult = Result<AgentResponse, OrchestratorError>;

/// 截断到前 max 个意图，返回被丢弃的数量
pub fn truncate_intents(intents: &mut Vec<Intent>, max: usize) -> usize {
    if intents.len() > max {
        let dropped = intents.len() - max;
        tracing::warn!("Truncating intents from {} to {}", intents.len(), max);
        intents.truncate(max);
        dropped
    } else {
        0
    }
}

/// 单个分支的执行器；可克隆进 tokio 任务
#[derive(Clone)]
struct BranchRunner {
    registry: Arc<CapabilityRegistry>,
    tokens: Option<Arc<dyn TokenCache>>,
}

impl BranchRunner {
    async fn run(
        self,
        step_id: usize,
        intent: Intent,
        session_id: String,
        cancel: CancellationToken,
    ) -> BranchResult {
        let Some(capability) = self.registry.resolve(&intent.kind) else {
            tracing::warn!(kind = %intent.kind, "No capability registered for intent");
            return Ok(AgentResponse::unhandled(intent.kind));
        };

        let source = capability.name().to_string();
        let trace = TraceStep::started(step_id, &source, &intent.kind);
        tracing::debug!(trace = ?trace, "branch");
        let started = StdInstant::now();

        let credential = if capability.requires_credential() {
            match self.credential(&session_id, &cancel).await {
                Ok(token) => Some(token),
                Err(CredentialFailure::Login(e)) => return Err(e),
                Err(CredentialFailure::Branch(message)) => {
                    let response = AgentResponse::failure(&source, intent.kind.clone(), message);
                    return Ok(finish(response, trace, started));
                }
            }
        } else {
            None
        };

        let result = capability
            .answer(&intent.query, credential.as_deref(), &cancel)
            .await;

        let response = match result {
            Ok(content) => AgentResponse::success(&source, intent.kind.clone(), content),
            Err(CapabilityError::Unauthorized(reason)) => {
                tracing::warn!(kind = %intent.kind, %reason, "Capability rejected credential");
                return Err(OrchestratorError::Unauthorized(reason));
            }
            Err(e) => {
                tracing::error!(kind = %intent.kind, error = %e, "Error executing agent for intent");
                AgentResponse::failure(&source, intent.kind.clone(), e.to_string())
            }
        };
        Ok(finish(response, trace, started))
    }

    async fn credential(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CredentialFailure> {
        let Some(tokens) = &self.tokens else {
            return Err(CredentialFailure::Login(OrchestratorError::Credential(
                TokenCacheError::SessionTokenMissing,
            )));
        };
        match tokens.get(session_id, cancel).await {
            Ok(token) => Ok(token),
            Err(e @ (TokenCacheError::SessionTokenMissing | TokenCacheError::ReAuthRequired)) => {
                Err(CredentialFailure::Login(OrchestratorError::Credential(e)))
            }
            Err(other) => Err(CredentialFailure::Branch(other.to_string())),
        }
    }
}

enum CredentialFailure {
    Login(OrchestratorError),
    Branch(String),
}

fn finish(response: AgentResponse, trace: TraceStep, started: StdInstant) -> AgentResponse {
    let duration_ms = started.elapsed().as_millis() as u64;
    let trace = trace.finish(duration_ms, response.error.clone());
    let audit = serde_json::to_string(&trace).unwrap_or_default();
    tracing::info!(trace = %audit, "branch");
    response.with_metadata("duration_ms", duration_ms)
}

/// 任务异常结束（panic / 被中止）时的兜底响应
fn join_failure(intent: &Intent, err: JoinError) -> AgentResponse {
    let message = if err.is_panic() {
        "capability panicked".to_string()
    } else {
        "capability task cancelled".to_string()
    };
    tracing::error!(kind = %intent.kind, %message, "Branch task did not complete");
    AgentResponse::failure(intent.kind.as_str(), intent.kind.clone(), message)
}

pub struct Dispatcher {
    runner: BranchRunner,
    max_agent_calls: usize,
    parallel: bool,
    timeout_seconds: u64,
}

impl Dispatcher {
    /// tokens 为 None 时，所有需要委托令牌的意图都按「需要登录」处理
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        tokens: Option<Arc<dyn TokenCache>>,
        settings: &OrchestrationSettings,
    ) -> Self {
        Self {
            runner: BranchRunner { registry, tokens },
            max_agent_calls: settings.max_agent_calls.max(1),
            parallel: settings.enable_parallel_execution,
            timeout_seconds: settings.timeout_seconds,
        }
    }

    pub fn plan(&self, intents: &[Intent]) -> ExecutionPlan {
        let steps = intents
            .iter()
            .enumerate()
            .map(|(step_id, intent)| ExecutionStep {
                step_id,
                capability: self
                    .runner
                    .registry
                    .resolve(&intent.kind)
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                intent: intent.clone(),
            })
            .collect();
        ExecutionPlan::new(steps, self.parallel)
    }

    /// 执行意图列表；输出与（截断后的）输入一一对应、顺序一致
    pub async fn execute(
        &self,
        mut intents: Vec<Intent>,
        session_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<AgentResponse>, OrchestratorError> {
        truncate_intents(&mut intents, self.max_agent_calls);

        let plan = self.plan(&intents);
        tracing::debug!(
            plan = %serde_json::to_string(&plan).unwrap_or_default(),
            "Executing plan"
        );
        tracing::info!(
            plan_id = %plan.plan_id,
            "Executing {} agent(s) (parallel={})",
            intents.len(),
            self.parallel
        );

        let branch_cancel = cancel.child_token();
        let aborts: Mutex<Vec<AbortHandle>> = Mutex::new(Vec::new());

        let run = async {
            if self.parallel {
                self.run_parallel(&intents, session_id, &branch_cancel, &aborts)
                    .await
            } else {
                self.run_sequential(&intents, session_id, &branch_cancel, &aborts)
                    .await
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            r = tokio::time::timeout_at(deadline, run) => match r {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::Timeout { seconds: self.timeout_seconds }),
            },
        };

        if outcome.is_err() {
            branch_cancel.cancel();
            if let Ok(handles) = aborts.lock() {
                for handle in handles.iter() {
                    handle.abort();
                }
            }
        }
        outcome
    }

    async fn run_parallel(
        &self,
        intents: &[Intent],
        session_id: &str,
        cancel: &CancellationToken,
        aborts: &Mutex<Vec<AbortHandle>>,
    ) -> Result<Vec<AgentResponse>, OrchestratorError> {
        let handles: Vec<_> = intents
            .iter()
            .enumerate()
            .map(|(step_id, intent)| {
                let handle = tokio::spawn(self.runner.clone().run(
                    step_id,
                    intent.clone(),
                    session_id.to_string(),
                    cancel.clone(),
                ));
                if let Ok(mut list) = aborts.lock() {
                    list.push(handle.abort_handle());
                }
                handle
            })
            .collect();

        let joined = join_all(handles).await;

        let mut responses = Vec::with_capacity(joined.len());
        for (intent, result) in intents.iter().zip(joined) {
            match result {
                Ok(Ok(response)) => responses.push(response),
                Ok(Err(login)) => return Err(login),
                Err(join_err) => responses.push(join_failure(intent, join_err)),
            }
        }
        Ok(responses)
    }

    async fn run_sequential(
        &self,
        intents: &[Intent],
        session_id: &str,
        cancel: &CancellationToken,
        aborts: &Mutex<Vec<AbortHandle>>,
    ) -> Result<Vec<AgentResponse>, OrchestratorError> {
        let mut responses = Vec::with_capacity(intents.len());
        for (step_id, intent) in intents.iter().enumerate() {
            let handle = tokio::spawn(self.runner.clone().run(
                step_id,
                intent.clone(),
                session_id.to_string(),
                cancel.clone(),
            ));
            if let Ok(mut list) = aborts.lock() {
                list.push(handle.abort_handle());
            }
            match handle.await {
                Ok(Ok(response)) => responses.push(response),
                Ok(Err(login)) => return Err(login),
                Err(join_err) => responses.push(join_failure(intent, join_err)),
            }
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capability;
    use crate::orchestration::IntentKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 记录被调用的查询，按配置延迟后返回
    struct FakeCapability {
        name: &'static str,
        delay: Duration,
        fail: Option<CapabilityError>,
        needs_token: bool,
        calls: Mutex<Vec<String>>,
        tokens_seen: Mutex<Vec<Option<String>>>,
    }

    impl FakeCapability {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                delay: Duration::ZERO,
                fail: None,
                needs_token: false,
                calls: Mutex::new(Vec::new()),
                tokens_seen: Mutex::new(Vec::new()),
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self, err: CapabilityError) -> Self {
            self.fail = Some(err);
            self
        }

        fn with_token(mut self) -> Self {
            self.needs_token = true;
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Capability for FakeCapability {
        fn name(&self) -> &str {
            self.name
        }

        fn requires_credential(&self) -> bool {
            self.needs_token
        }

        async fn answer(
            &self,
            query: &str,
            credential: Option<&str>,
            cancel: &CancellationToken,
        ) -> Result<String, CapabilityError> {
            self.calls.lock().unwrap().push(query.to_string());
            self.tokens_seen
                .lock()
                .unwrap()
                .push(credential.map(String::from));
            tokio::select! {
                _ = cancel.cancelled() => return Err(CapabilityError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(format!("{}: {}", self.name, query)),
            }
        }
    }

    struct PanickingCapability;

    #[async_trait]
    impl Capability for PanickingCapability {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn answer(
            &self,
            _query: &str,
            _credential: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<String, CapabilityError> {
            panic!("capability blew up");
        }
    }

    /// 固定返回某个结果的令牌缓存
    struct StaticTokens {
        result: Result<String, TokenCacheError>,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl TokenCache for StaticTokens {
        async fn store(&self, _session_id: &str, _credential: crate::auth::CachedCredential) {}

        async fn get(
            &self,
            _session_id: &str,
            _cancel: &CancellationToken,
        ) -> Result<String, TokenCacheError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }

        async fn evict(&self, _session_id: &str) -> bool {
            false
        }

        async fn status(&self, _session_id: &str) -> crate::auth::CredentialState {
            crate::auth::CredentialState::Valid
        }
    }

    fn settings(max: usize, parallel: bool, timeout: u64) -> OrchestrationSettings {
        OrchestrationSettings {
            max_agent_calls: max,
            timeout_seconds: timeout,
            enable_parallel_execution: parallel,
            ..OrchestrationSettings::default()
        }
    }

    fn deadline(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_truncates_to_first_n_in_order() {
        let general = Arc::new(FakeCapability::new("general"));
        let registry = Arc::new(
            CapabilityRegistry::new().register(IntentKind::GeneralKnowledge, general.clone()),
        );
        let dispatcher = Dispatcher::new(registry, None, &settings(2, false, 30));

        let intents = (0..5).map(|i| Intent::general(format!("q{i}"))).collect();
        let responses = dispatcher
            .execute(intents, "s", deadline(30), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(general.calls(), vec!["q0", "q1"]);
    }

    #[test]
    fn test_truncate_intents_reports_dropped() {
        let mut intents: Vec<Intent> = (0..7).map(|i| Intent::general(format!("q{i}"))).collect();
        assert_eq!(truncate_intents(&mut intents, 5), 2);
        assert_eq!(intents.len(), 5);
        assert_eq!(intents[4].query, "q4");
        assert_eq!(truncate_intents(&mut intents, 5), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_preserves_input_order() {
        let slow = Arc::new(FakeCapability::new("slow").delayed(Duration::from_millis(300)));
        let fast = Arc::new(FakeCapability::new("fast").delayed(Duration::from_millis(10)));
        let registry = Arc::new(
            CapabilityRegistry::new()
                .register(IntentKind::Email, slow)
                .register(IntentKind::GeneralKnowledge, fast),
        );
        let dispatcher = Dispatcher::new(registry, None, &settings(5, true, 30));

        let intents = vec![
            Intent::new(IntentKind::Email, "first"),
            Intent::general("second"),
        ];
        let responses = dispatcher
            .execute(intents, "s", deadline(30), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(responses[0].content, "slow: first");
        assert_eq!(responses[1].content, "fast: second");
        assert!(responses[0].metadata.as_ref().unwrap().contains_key("duration_ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_wall_clock_is_max_not_sum() {
        let cap = Arc::new(FakeCapability::new("c").delayed(Duration::from_secs(2)));
        let registry = Arc::new(
            CapabilityRegistry::new()
                .register(IntentKind::GeneralKnowledge, cap.clone())
                .register(IntentKind::People, cap),
        );
        let intents = vec![
            Intent::general("a"),
            Intent::new(IntentKind::People, "b"),
            Intent::general("c"),
        ];

        let parallel = Dispatcher::new(registry.clone(), None, &settings(5, true, 30));
        let start = Instant::now();
        parallel
            .execute(intents.clone(), "s", deadline(30), &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));

        let sequential = Dispatcher::new(registry, None, &settings(5, false, 30));
        let start = Instant::now();
        sequential
            .execute(intents, "s", deadline(30), &CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_branch_failure_is_isolated() {
        let broken = Arc::new(
            FakeCapability::new("broken")
                .failing(CapabilityError::Unavailable("503".into())),
        );
        let ok = Arc::new(FakeCapability::new("ok"));
        let registry = Arc::new(
            CapabilityRegistry::new()
                .register(IntentKind::Files, broken)
                .register(IntentKind::GeneralKnowledge, ok),
        );
        let dispatcher = Dispatcher::new(registry, None, &settings(5, true, 30));

        let responses = dispatcher
            .execute(
                vec![Intent::new(IntentKind::Files, "deck"), Intent::general("rust")],
                "s",
                deadline(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!responses[0].success);
        assert_eq!(responses[0].content, "Error: Service unavailable: 503");
        assert!(responses[1].success);
    }

    #[tokio::test]
    async fn test_unknown_kind_yields_unhandled_response() {
        let registry = Arc::new(CapabilityRegistry::new());
        let dispatcher = Dispatcher::new(registry, None, &settings(5, true, 30));
        let responses = dispatcher
            .execute(
                vec![Intent::new(IntentKind::Unknown("Weather".into()), "rain?")],
                "s",
                deadline(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].success);
        assert_eq!(responses[0].source, "unknown");
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let ok = Arc::new(FakeCapability::new("ok"));
        let registry = Arc::new(
            CapabilityRegistry::new()
                .register(IntentKind::People, Arc::new(PanickingCapability))
                .register(IntentKind::GeneralKnowledge, ok),
        );
        for parallel in [true, false] {
            let dispatcher = Dispatcher::new(registry.clone(), None, &settings(5, parallel, 30));
            let responses = dispatcher
                .execute(
                    vec![Intent::new(IntentKind::People, "who"), Intent::general("what")],
                    "s",
                    deadline(30),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert!(!responses[0].success);
            assert!(responses[1].success);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_branches_and_times_out() {
        let slow = Arc::new(FakeCapability::new("slow").delayed(Duration::from_secs(60)));
        let registry = Arc::new(
            CapabilityRegistry::new().register(IntentKind::GeneralKnowledge, slow),
        );
        let dispatcher = Dispatcher::new(registry, None, &settings(5, true, 5));

        let err = dispatcher
            .execute(
                vec![Intent::general("a"), Intent::general("b")],
                "s",
                deadline(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { seconds: 5 }));
    }

    #[tokio::test]
    async fn test_credential_is_passed_to_capability() {
        let calendar = Arc::new(FakeCapability::new("calendar").with_token());
        let registry = Arc::new(
            CapabilityRegistry::new().register(IntentKind::Calendar, calendar.clone()),
        );
        let tokens: Arc<dyn TokenCache> = Arc::new(StaticTokens {
            result: Ok("bearer-123".into()),
            gets: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(registry, Some(tokens), &settings(5, true, 30));

        let responses = dispatcher
            .execute(
                vec![Intent::new(IntentKind::Calendar, "tomorrow")],
                "s",
                deadline(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(responses[0].success);
        assert_eq!(
            calendar.tokens_seen.lock().unwrap().clone(),
            vec![Some("bearer-123".to_string())]
        );
    }

    #[tokio::test]
    async fn test_missing_token_short_circuits_sequential() {
        let calendar = Arc::new(FakeCapability::new("calendar").with_token());
        let general = Arc::new(FakeCapability::new("general"));
        let registry = Arc::new(
            CapabilityRegistry::new()
                .register(IntentKind::Calendar, calendar.clone())
                .register(IntentKind::GeneralKnowledge, general.clone()),
        );
        let tokens: Arc<dyn TokenCache> = Arc::new(StaticTokens {
            result: Err(TokenCacheError::SessionTokenMissing),
            gets: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(registry, Some(tokens), &settings(5, false, 30));

        let err = dispatcher
            .execute(
                vec![Intent::new(IntentKind::Calendar, "tomorrow"), Intent::general("docker")],
                "s",
                deadline(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.requires_login());
        assert!(calendar.calls().is_empty());
        assert!(general.calls().is_empty(), "later branches must not start");
    }

    #[tokio::test]
    async fn test_unauthorized_in_parallel_waits_for_siblings() {
        let email = Arc::new(
            FakeCapability::new("email")
                .with_token()
                .failing(CapabilityError::Unauthorized("401".into())),
        );
        let general = Arc::new(FakeCapability::new("general"));
        let registry = Arc::new(
            CapabilityRegistry::new()
                .register(IntentKind::Email, email)
                .register(IntentKind::GeneralKnowledge, general.clone()),
        );
        let tokens: Arc<dyn TokenCache> = Arc::new(StaticTokens {
            result: Ok("t".into()),
            gets: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(registry, Some(tokens), &settings(5, true, 30));

        let err = dispatcher
            .execute(
                vec![Intent::new(IntentKind::Email, "inbox"), Intent::general("docker")],
                "s",
                deadline(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Unauthorized(_)));
        assert_eq!(general.calls(), vec!["docker"]);
    }

    #[tokio::test]
    async fn test_refresh_failure_stays_in_branch() {
        let files = Arc::new(FakeCapability::new("files").with_token());
        let registry = Arc::new(CapabilityRegistry::new().register(IntentKind::Files, files));
        let tokens: Arc<dyn TokenCache> = Arc::new(StaticTokens {
            result: Err(TokenCacheError::RefreshFailed("dns".into())),
            gets: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(registry, Some(tokens), &settings(5, true, 30));

        let responses = dispatcher
            .execute(
                vec![Intent::new(IntentKind::Files, "deck")],
                "s",
                deadline(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!responses[0].success);
        assert!(responses[0].content.starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_caller_cancel_is_distinct_from_timeout() {
        let slow = Arc::new(FakeCapability::new("slow").delayed(Duration::from_secs(60)));
        let registry = Arc::new(
            CapabilityRegistry::new().register(IntentKind::GeneralKnowledge, slow),
        );
        let dispatcher = Dispatcher::new(registry, None, &settings(5, true, 30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = dispatcher
            .execute(vec![Intent::general("a")], "s", deadline(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }
}
