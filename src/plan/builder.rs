//! 计划构建器
//!
//! 提供流畅的 API 来手写计划；步骤级方法作用于最近一次 step() 添加的步骤。

use crate::plan::types::*;

/// 计划构建器
pub struct PlanBuilder {
    plan: ExecutionPlan,
}

impl PlanBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            plan: ExecutionPlan {
                title: title.into(),
                description: String::new(),
                steps: Vec::new(),
                global_success_criteria: Vec::new(),
                global_failure_criteria: Vec::new(),
                max_total_time: 600,
                max_retries: 2,
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.plan.description = description.into();
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.plan.max_retries = retries;
        self
    }

    /// 整个计划的墙钟上限（秒）
    pub fn max_total_time(mut self, secs: u64) -> Self {
        self.plan.max_total_time = secs;
        self
    }

    /// 添加步骤
    pub fn step(mut self, id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        self.plan.steps.push(PlanStep {
            title: format!("Step {id}"),
            id,
            description: String::new(),
            command: command.into(),
            success_criteria: Vec::new(),
            failure_criteria: Vec::new(),
            expected_output: None,
            timeout_seconds: DEFAULT_STEP_TIMEOUT_SECS,
            env: None,
            pre: None,
            alternatives: None,
        });
        self
    }

    fn last_step(&mut self) -> Option<&mut PlanStep> {
        self.plan.steps.last_mut()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        if let Some(step) = self.last_step() {
            step.title = title.into();
        }
        self
    }

    pub fn success(mut self, criterion: Criterion) -> Self {
        if let Some(step) = self.last_step() {
            step.success_criteria.push(criterion);
        }
        self
    }

    pub fn failure(mut self, criterion: Criterion) -> Self {
        if let Some(step) = self.last_step() {
            step.failure_criteria.push(criterion);
        }
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        if let Some(step) = self.last_step() {
            step.timeout_seconds = secs;
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(step) = self.last_step() {
            step.env.get_or_insert_with(Default::default).insert(key.into(), value.into());
        }
        self
    }

    pub fn pre(mut self, command: impl Into<String>) -> Self {
        if let Some(step) = self.last_step() {
            step.pre.get_or_insert_with(Vec::new).push(command.into());
        }
        self
    }

    pub fn alternatives<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(step) = self.last_step() {
            step.alternatives
                .get_or_insert_with(Vec::new)
                .extend(commands.into_iter().map(Into::into));
        }
        self
    }

    pub fn global_success(mut self, criterion: Criterion) -> Self {
        self.plan.global_success_criteria.push(criterion);
        self
    }

    pub fn global_failure(mut self, criterion: Criterion) -> Self {
        self.plan.global_failure_criteria.push(criterion);
        self
    }

    pub fn build(self) -> ExecutionPlan {
        self.plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_methods_apply_to_last_step() {
        let plan = PlanBuilder::new("demo")
            .max_retries(1)
            .step("1", "mkdir -p /tmp/a")
            .success(Criterion::new(CriterionType::ExitCode, "0"))
            .step("2", "ls /tmp/a")
            .env("LANG", "C")
            .pre("cd /tmp")
            .timeout_secs(5)
            .build();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].success_criteria.len(), 1);
        assert!(plan.steps[0].env.is_none());
        assert_eq!(plan.steps[1].timeout_seconds, 5);
        assert_eq!(plan.steps[1].pre.as_deref(), Some(&["cd /tmp".to_string()][..]));
        assert_eq!(plan.max_retries, 1);
    }
}
