//! 计划执行器
//!
//! 步骤严格顺序执行，每步状态机：Pending → Executing → {Success | Failed}，Failed 可回到 Executing，
//! 最多 maxRetries 次。每次尝试：导出 env、执行 pre、执行主命令（轮询式完成检测）、先评估失败判定
//! 再评估成功判定（无成功判定时走默认检测）。首次失败后交给恢复引擎，恢复无果再尝试声明的替代命令，
//! 之后是普通重试。maxTotalTime 是整个计划的硬上限。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::recovery::{AttemptRunner, RecoveryEngine};
use crate::core::AgentError;
use crate::plan::criteria::{default_success, evaluate_all, FsProbe, SessionProbe};
use crate::plan::types::*;
use crate::plan::validation::validate_plan;
use crate::session::runner::{shell_quote, CompletionKind};
use crate::session::{CommandRunner, PollingConfig, SessionAdapter};

/// 执行器参数
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// env / pre 等准备命令的超时
    pub default_timeout: Duration,
    /// resourceBusy 恢复前的等待
    pub busy_wait: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            busy_wait: Duration::from_secs(2),
        }
    }
}

/// 计划执行器
pub struct PlanExecutor {
    runner: CommandRunner,
    recovery: RecoveryEngine,
    config: ExecutorConfig,
    /// 为 None 时通过会话执行 `test` 探测
    probe: Option<Arc<dyn FsProbe>>,
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl PlanExecutor {
    pub fn new(session: Arc<dyn SessionAdapter>, polling: PollingConfig, config: ExecutorConfig) -> Self {
        Self {
            runner: CommandRunner::new(session, polling),
            recovery: RecoveryEngine::new(config.busy_wait),
            config,
            probe: None,
        }
    }

    /// 替换文件系统探测（例如本地会话使用 LocalProbe）
    pub fn with_probe(mut self, probe: Arc<dyn FsProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    /// 执行整个计划；计划非法（空步骤、空命令、危险命令）时返回错误，其余结局都体现在结果状态里
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<PlanExecutionResult, AgentError> {
        validate_plan(plan)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let start_time = Utc::now();
        let started = Instant::now();
        let deadline = started + plan.max_total_duration();
        tracing::info!(run_id = %run_id, title = %plan.title, steps = plan.steps.len(), "executing plan");

        let ctx = StepContext {
            executor: self,
            cancel,
        };
        let mut step_results = Vec::new();
        let run = tokio::time::timeout_at(deadline, ctx.run_steps(plan, &mut step_results)).await;

        let (status, error) = match run {
            Ok(Ok(())) => (None, None),
            Ok(Err(AgentError::Cancelled)) => (Some(PlanStatus::Cancelled), Some("Cancelled by user".to_string())),
            Ok(Err(e)) => (Some(PlanStatus::Failed), Some(e.to_string())),
            Err(_) => (
                Some(PlanStatus::TimedOut),
                Some(format!("Plan exceeded maxTotalTime of {}s", plan.max_total_time)),
            ),
        };

        let mut global_success = Vec::new();
        let mut global_failure = Vec::new();
        let status = match status {
            Some(status) => status,
            None => {
                let finals = final_results(plan, &step_results);
                let all_succeeded = finals.len() == plan.steps.len() && finals.iter().all(|r| r.succeeded());
                let output = finals.iter().map(|r| r.output.as_str()).collect::<Vec<_>>().join("\n");
                let exit_code = if all_succeeded {
                    0
                } else {
                    step_results.last().map(|r| r.exit_code).unwrap_or(-1)
                };
                let probe = ctx.probe();
                global_failure = evaluate_all(&plan.global_failure_criteria, "global-failure", &output, exit_code, probe.get()).await;
                global_success = evaluate_all(&plan.global_success_criteria, "global-success", &output, exit_code, probe.get()).await;

                if all_succeeded
                    && !global_failure.iter().any(|r| r.passed)
                    && global_success.iter().all(|r| r.passed)
                {
                    PlanStatus::Completed
                } else {
                    PlanStatus::Failed
                }
            }
        };

        let result = PlanExecutionResult {
            run_id,
            plan_title: plan.title.clone(),
            status,
            step_results,
            global_success_criteria_results: global_success,
            global_failure_criteria_results: global_failure,
            error,
            start_time,
            end_time: Utc::now(),
            duration: elapsed_ms(started),
        };
        match status {
            PlanStatus::Completed => tracing::info!(run_id = %result.run_id, duration_ms = result.duration, "plan completed"),
            _ => tracing::warn!(run_id = %result.run_id, status = ?status, error = ?result.error, "plan did not complete"),
        }
        Ok(result)
    }
}

/// 每个步骤的最终结果（按计划顺序，未执行的步骤缺席）
fn final_results<'a>(plan: &ExecutionPlan, results: &'a [StepExecutionResult]) -> Vec<&'a StepExecutionResult> {
    plan.steps
        .iter()
        .filter_map(|step| results.iter().rev().find(|r| r.step_id == step.id))
        .collect()
}

/// 一次计划运行的上下文（同时是恢复引擎使用的步骤执行原语）
struct StepContext<'a> {
    executor: &'a PlanExecutor,
    cancel: &'a CancellationToken,
}

/// 探测器：借用的会话探测或共享的外部探测
enum ProbeRef<'a> {
    Session(SessionProbe<'a>),
    Shared(Arc<dyn FsProbe>),
}

impl ProbeRef<'_> {
    fn get(&self) -> &dyn FsProbe {
        match self {
            ProbeRef::Session(p) => p,
            ProbeRef::Shared(p) => p.as_ref(),
        }
    }
}

impl<'a> StepContext<'a> {
    fn probe(&self) -> ProbeRef<'a> {
        match &self.executor.probe {
            Some(probe) => ProbeRef::Shared(probe.clone()),
            None => ProbeRef::Session(SessionProbe::new(&self.executor.runner, self.cancel.clone())),
        }
    }

    async fn run_steps(
        &self,
        plan: &ExecutionPlan,
        results: &mut Vec<StepExecutionResult>,
    ) -> Result<(), AgentError> {
        for (index, step) in plan.steps.iter().enumerate() {
            tracing::info!(step = %step.id, index = index + 1, total = plan.steps.len(), command = %step.command, "executing step");
            if !self.run_step(step, plan.max_retries, results).await? {
                tracing::warn!(step = %step.id, "step failed after retries and recovery, stopping plan");
                break;
            }
        }
        Ok(())
    }

    /// 执行单步（含重试、恢复与替代命令），返回是否最终成功
    async fn run_step(
        &self,
        step: &PlanStep,
        max_retries: u32,
        results: &mut Vec<StepExecutionResult>,
    ) -> Result<bool, AgentError> {
        for retry in 0..=max_retries {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let mut result = self.attempt(step, &step.command, step.timeout(), retry).await?;
            if result.succeeded() {
                results.push(result);
                return Ok(true);
            }
            tracing::warn!(step = %step.id, retry, exit_code = result.exit_code, error = ?result.error, "step attempt failed");

            if retry > 0 {
                results.push(result);
                continue;
            }

            let recovery = self.executor.recovery.recover(step, &result, self).await?;
            let recovered = recovery.last().filter(|r| r.succeeded()).cloned();
            result.recovery_attempts = recovery;
            results.push(result);
            if let Some(recovered) = recovered {
                results.push(recovered);
                return Ok(true);
            }

            for alternative in step.alternatives.iter().flatten() {
                tracing::info!(step = %step.id, command = %alternative, "trying declared alternative");
                let mut alt = self.attempt(step, alternative, step.timeout(), retry).await?;
                if alt.succeeded() {
                    alt.final_recovery_strategy = Some(RecoveryStrategy::CommandAlternatives);
                    results.push(alt);
                    return Ok(true);
                }
                if let Some(failed) = results.last_mut() {
                    failed.recovery_attempts.push(alt);
                }
            }
        }
        Ok(false)
    }

    /// 导出 env 并执行 pre（每次尝试前都执行）
    async fn prepare_step(&self, step: &PlanStep) -> Result<(), AgentError> {
        for (key, value) in step.env.iter().flatten() {
            if !is_env_key(key) {
                tracing::warn!(key = %key, "skipping invalid environment variable name");
                continue;
            }
            self.prepare(&format!("export {key}={}", shell_quote(value))).await?;
        }
        for command in step.pre.iter().flatten() {
            self.prepare(command).await?;
        }
        Ok(())
    }

    fn describe_failure(
        outcome_kind: CompletionKind,
        timeout: Duration,
        failure_results: &[CriterionResult],
        success_results: &[CriterionResult],
    ) -> Option<String> {
        let mut reasons = Vec::new();
        match outcome_kind {
            CompletionKind::TimedOut => reasons.push(format!("Command timed out after {}s", timeout.as_secs())),
            CompletionKind::Stuck => reasons.push("Command stuck: no output change, partial output returned".to_string()),
            _ => {}
        }
        if let Some(hit) = failure_results.iter().find(|r| r.passed) {
            reasons.push(format!("Failure criterion matched: {} ({})", hit.description, hit.message));
        }
        if let Some(miss) = success_results.iter().find(|r| !r.passed) {
            reasons.push(format!("Success criterion not met: {} ({})", miss.description, miss.message));
        }
        (!reasons.is_empty()).then(|| reasons.join("; "))
    }
}

#[async_trait]
impl<'a> AttemptRunner for StepContext<'a> {
    async fn attempt(
        &self,
        step: &PlanStep,
        command: &str,
        timeout: Duration,
        retry_count: u32,
    ) -> Result<StepExecutionResult, AgentError> {
        let start_time = Utc::now();
        let started = Instant::now();
        self.prepare_step(step).await?;

        let outcome = self.executor.runner.run(command, timeout, self.cancel).await?;
        let probe = self.probe();
        let failure_results = evaluate_all(
            &step.failure_criteria,
            &format!("{}-failure", step.id),
            &outcome.output,
            outcome.exit_code,
            probe.get(),
        )
        .await;
        let success_results = if step.success_criteria.is_empty() {
            let mut r = default_success(command, &outcome.output, outcome.exit_code, probe.get()).await;
            r.criterion_id = format!("{}-default", step.id);
            vec![r]
        } else {
            evaluate_all(
                &step.success_criteria,
                &format!("{}-success", step.id),
                &outcome.output,
                outcome.exit_code,
                probe.get(),
            )
            .await
        };

        let failed_by_criterion = failure_results.iter().any(|r| r.passed);
        let passed = !failed_by_criterion && success_results.iter().all(|r| r.passed);
        let error = if passed {
            None
        } else {
            Self::describe_failure(outcome.completion, timeout, &failure_results, &success_results)
        };

        Ok(StepExecutionResult {
            step_id: step.id.clone(),
            status: if passed { StepStatus::Success } else { StepStatus::Failed },
            command: command.to_string(),
            output: outcome.output,
            error,
            exit_code: outcome.exit_code,
            start_time,
            end_time: Utc::now(),
            duration: elapsed_ms(started),
            success_criteria_results: success_results,
            failure_criteria_results: failure_results,
            retry_count,
            recovery_attempts: Vec::new(),
            final_recovery_strategy: None,
        })
    }

    async fn prepare(&self, command: &str) -> Result<(), AgentError> {
        match self
            .executor
            .runner
            .run(command, self.executor.config.default_timeout, self.cancel)
            .await
        {
            Ok(outcome) if outcome.exit_code != 0 => {
                tracing::warn!(command = %command, exit_code = outcome.exit_code, "preparation command failed");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "preparation command failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::builder::PlanBuilder;
    use crate::session::{MockReply, MockSession};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn polling() -> PollingConfig {
        PollingConfig {
            poll_interval: Duration::from_millis(10),
            stable_checks: 3,
            stuck_timeout: Duration::from_millis(300),
            clear_between_commands: true,
        }
    }

    fn executor(session: Arc<MockSession>) -> PlanExecutor {
        PlanExecutor::new(
            session,
            polling(),
            ExecutorConfig {
                default_timeout: Duration::from_secs(5),
                busy_wait: Duration::from_millis(10),
            },
        )
    }

    fn exit0() -> Criterion {
        Criterion::new(CriterionType::ExitCode, "0")
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let session = Arc::new(MockSession::new(|cmd: &str| MockReply::ok(format!("ran {cmd}"))));
        let plan = PlanBuilder::new("ok")
            .step("1", "echo one")
            .success(exit0())
            .step("2", "echo two")
            .success(Criterion::new(CriterionType::ContainsText, "RAN ECHO TWO"))
            .global_success(Criterion::new(CriterionType::ContainsText, "ran echo one"))
            .build();

        let result = executor(session).execute(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, PlanStatus::Completed);
        assert_eq!(result.step_results.len(), 2);
        assert!(result.global_success_criteria_results[0].passed);
    }

    #[tokio::test]
    async fn test_failing_step_is_retried_then_plan_fails() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::fail("nope", 1)));
        let plan = PlanBuilder::new("fail")
            .max_retries(2)
            .step("1", "false")
            .success(exit0())
            .step("2", "echo never")
            .build();

        let result = executor(session.clone()).execute(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, PlanStatus::Failed);
        assert_eq!(result.step_results.len(), 3);
        assert_eq!(
            result.step_results.iter().map(|r| r.retry_count).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(!session.sent_commands().contains(&"echo never".to_string()));
    }

    #[tokio::test]
    async fn test_failure_criteria_take_precedence() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::ok("done with warning")));
        let plan = PlanBuilder::new("warn")
            .max_retries(0)
            .step("1", "build")
            .success(exit0())
            .failure(Criterion::new(CriterionType::ContainsText, "warning"))
            .build();

        let result = executor(session).execute(&plan, &CancellationToken::new()).await.unwrap();
        let first = &result.step_results[0];
        assert_eq!(first.status, StepStatus::Failed);
        assert!(first.success_criteria_results[0].passed);
        assert!(first.error.as_deref().unwrap().contains("Failure criterion matched"));
    }

    #[tokio::test]
    async fn test_missing_directory_recovery() {
        let created = Arc::new(AtomicBool::new(false));
        let flag = created.clone();
        let session = Arc::new(MockSession::new(move |cmd: &str| match cmd {
            "mkdir -p /tmp/x" => {
                flag.store(true, Ordering::SeqCst);
                MockReply::ok("")
            }
            "rm /tmp/x/y.txt" if flag.load(Ordering::SeqCst) => MockReply::ok(""),
            "rm /tmp/x/y.txt" => MockReply::fail("rm: cannot remove '/tmp/x/y.txt': No such file or directory", 1),
            _ => MockReply::ok(""),
        }));
        let plan = PlanBuilder::new("recover")
            .max_retries(1)
            .step("1", "rm /tmp/x/y.txt")
            .success(exit0())
            .build();

        let result = executor(session).execute(&plan, &CancellationToken::new()).await.unwrap();
        assert!(created.load(Ordering::SeqCst));
        assert_eq!(result.status, PlanStatus::Completed);
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(result.step_results[0].recovery_attempts.len(), 1);
        let last = result.step_results.last().unwrap();
        assert!(last.succeeded());
        assert_eq!(last.final_recovery_strategy, Some(RecoveryStrategy::CreateDirectory));
    }

    #[tokio::test]
    async fn test_declared_alternative_after_failed_recovery() {
        let session = Arc::new(MockSession::new(|cmd: &str| match cmd {
            "fetch-data" => MockReply::fail("upstream returned garbage", 3),
            _ => MockReply::ok("fetched"),
        }));
        let plan = PlanBuilder::new("alt")
            .step("1", "fetch-data")
            .success(exit0())
            .alternatives(["fetch-data --mirror"])
            .build();

        let result = executor(session).execute(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, PlanStatus::Completed);
        let last = result.step_results.last().unwrap();
        assert_eq!(last.command, "fetch-data --mirror");
        assert_eq!(last.final_recovery_strategy, Some(RecoveryStrategy::CommandAlternatives));
    }

    #[tokio::test]
    async fn test_env_and_pre_run_before_command() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::ok("")));
        let plan = PlanBuilder::new("env")
            .step("1", "make")
            .env("LANG", "C")
            .env("bad key", "x")
            .pre("cd /srv/app")
            .success(exit0())
            .build();

        executor(session.clone()).execute(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            session.sent_commands(),
            vec!["export LANG='C'".to_string(), "cd /srv/app".to_string(), "make".to_string()]
        );
    }

    #[tokio::test]
    async fn test_default_detection_probes_session() {
        let session = Arc::new(MockSession::new(|cmd: &str| match cmd {
            "test -e '/tmp/out.txt'" => MockReply::ok(""),
            _ => MockReply::ok(""),
        }));
        let plan = PlanBuilder::new("probe").step("1", "echo hi > /tmp/out.txt").build();

        let result = executor(session.clone()).execute(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, PlanStatus::Completed);
        assert!(session.sent_commands().contains(&"test -e '/tmp/out.txt'".to_string()));
        assert_eq!(result.step_results[0].success_criteria_results[0].criterion_id, "1-default");
    }

    #[tokio::test]
    async fn test_global_failure_criterion_fails_plan() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::ok("FATAL: config missing")));
        let plan = PlanBuilder::new("global")
            .step("1", "start")
            .success(exit0())
            .global_failure(Criterion::new(CriterionType::ContainsText, "fatal"))
            .build();

        let result = executor(session).execute(&plan, &CancellationToken::new()).await.unwrap();
        assert!(result.step_results[0].succeeded());
        assert_eq!(result.status, PlanStatus::Failed);
        assert!(result.global_failure_criteria_results[0].passed);
    }

    #[tokio::test]
    async fn test_max_total_time_aborts_plan() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::hang()));
        let mut plan = PlanBuilder::new("slow")
            .step("1", "sleep 100")
            .success(exit0())
            .build();
        plan.max_total_time = 1;
        let mut polling = polling();
        polling.stuck_timeout = Duration::from_secs(60);
        let exec = PlanExecutor::new(session, polling, ExecutorConfig::default());

        let result = exec.execute(&plan, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, PlanStatus::TimedOut);
        assert!(result.error.unwrap().contains("maxTotalTime"));
    }

    #[tokio::test]
    async fn test_dangerous_plan_is_rejected() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::ok("")));
        let plan = PlanBuilder::new("bad").step("1", "sudo rm -rf /").build();
        let err = executor(session.clone()).execute(&plan, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::DangerousCommand(_)));
        assert!(session.sent_commands().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_plan() {
        let session = Arc::new(MockSession::new(|_: &str| MockReply::hang()));
        let plan = PlanBuilder::new("cancel").step("1", "sleep 100").build();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = executor(session).execute(&plan, &cancel).await.unwrap();
        assert_eq!(result.status, PlanStatus::Cancelled);
    }
}
