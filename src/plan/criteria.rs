//! 判定评估器
//!
//! evaluate(criterion, output, exit_code, probe) 对同一输入总给出同一结果；文件系统相关的判定
//! 委托给 FsProbe（远程会话通过 `test -f|-d|-e` 探测，本地会话直接查文件系统）。
//! 步骤未声明任何成功判定时，走 default_success 的启发式检测。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::plan::types::{Criterion, CriterionResult, CriterionType};
use crate::session::runner::shell_quote;
use crate::session::CommandRunner;

/// 探测的路径类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
    Any,
}

impl PathKind {
    fn test_flag(&self) -> &'static str {
        match self {
            PathKind::File => "-f",
            PathKind::Directory => "-d",
            PathKind::Any => "-e",
        }
    }
}

/// 文件系统探测
#[async_trait]
pub trait FsProbe: Send + Sync {
    async fn exists(&self, path: &str, kind: PathKind) -> bool;
}

/// 单引号转义；`~/` 开头的路径展开为 "$HOME"/...
pub fn shell_quote_path(path: &str) -> String {
    if path == "~" {
        "\"$HOME\"".to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("\"$HOME\"/{}", shell_quote(rest))
    } else {
        shell_quote(path)
    }
}

/// 通过会话执行 `test` 命令探测（退出码 0 即存在）
pub struct SessionProbe<'a> {
    runner: &'a CommandRunner,
    cancel: CancellationToken,
    timeout: Duration,
}

impl<'a> SessionProbe<'a> {
    pub fn new(runner: &'a CommandRunner, cancel: CancellationToken) -> Self {
        Self {
            runner,
            cancel,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl<'a> FsProbe for SessionProbe<'a> {
    async fn exists(&self, path: &str, kind: PathKind) -> bool {
        let command = format!("test {} {}", kind.test_flag(), shell_quote_path(path.trim()));
        match self.runner.run(&command, self.timeout, &self.cancel).await {
            Ok(outcome) => outcome.exit_code == 0,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "filesystem probe failed");
                false
            }
        }
    }
}

/// 本地会话直接查文件系统
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalProbe;

#[async_trait]
impl FsProbe for LocalProbe {
    async fn exists(&self, path: &str, kind: PathKind) -> bool {
        let path = path.trim();
        let expanded = match (path.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => std::path::Path::new(&home).join(rest),
            _ => std::path::PathBuf::from(path),
        };
        match tokio::fs::metadata(&expanded).await {
            Ok(meta) => match kind {
                PathKind::File => meta.is_file(),
                PathKind::Directory => meta.is_dir(),
                PathKind::Any => true,
            },
            Err(_) => false,
        }
    }
}

const ACTUAL_PREVIEW_CHARS: usize = 200;

fn preview(output: &str) -> String {
    let mut s: String = output.chars().take(ACTUAL_PREVIEW_CHARS).collect();
    if output.chars().count() > ACTUAL_PREVIEW_CHARS {
        s.push_str("...");
    }
    s
}

fn result(
    criterion: &Criterion,
    actual: impl Into<String>,
    passed: bool,
    message: impl Into<String>,
) -> CriterionResult {
    CriterionResult {
        criterion_id: criterion.kind.to_string(),
        description: criterion.description.clone(),
        kind: criterion.kind,
        expected_value: criterion.value.clone(),
        actual_value: actual.into(),
        passed,
        message: message.into(),
    }
}

fn regex_result(criterion: &Criterion, output: &str, want_match: bool) -> CriterionResult {
    match Regex::new(&criterion.value) {
        Ok(re) => {
            let matched = re.is_match(output);
            let passed = matched == want_match;
            let message = if matched {
                format!("Pattern /{}/ matched output", criterion.value)
            } else {
                format!("Pattern /{}/ did not match output", criterion.value)
            };
            result(criterion, preview(output), passed, message)
        }
        Err(e) => result(criterion, preview(output), false, format!("Invalid regex: {e}")),
    }
}

async fn probe_result(
    criterion: &Criterion,
    probe: &dyn FsProbe,
    kind: PathKind,
    want_exists: bool,
) -> CriterionResult {
    let exists = probe.exists(&criterion.value, kind).await;
    let actual = if exists { "exists" } else { "missing" };
    let message = format!("{} {}", criterion.value, actual);
    result(criterion, actual, exists == want_exists, message)
}

const ERROR_WORDS: &[&str] = &["error", "failed", "permission denied"];

/// 评估单条判定
pub async fn evaluate(
    criterion: &Criterion,
    output: &str,
    exit_code: i32,
    probe: &dyn FsProbe,
) -> CriterionResult {
    let lower = output.to_lowercase();
    let expected = criterion.value.to_lowercase();
    match criterion.kind {
        CriterionType::ContainsText | CriterionType::NotContainsText => {
            let found = lower.contains(&expected);
            let want = criterion.kind == CriterionType::ContainsText;
            let message = if found {
                format!("Output contains \"{}\"", criterion.value)
            } else {
                format!("Output does not contain \"{}\"", criterion.value)
            };
            result(criterion, preview(output), found == want, message)
        }
        CriterionType::ExitCode => {
            let actual = exit_code.to_string();
            let passed = actual == criterion.value.trim();
            let message = if passed {
                format!("Exit code {actual} as expected")
            } else {
                format!("Exit code mismatch: expected {}, got {actual}", criterion.value.trim())
            };
            result(criterion, actual, passed, message)
        }
        CriterionType::FileExists => probe_result(criterion, probe, PathKind::File, true).await,
        CriterionType::FileNotExists => probe_result(criterion, probe, PathKind::File, false).await,
        CriterionType::DirectoryExists => probe_result(criterion, probe, PathKind::Directory, true).await,
        CriterionType::DirectoryNotExists => {
            probe_result(criterion, probe, PathKind::Directory, false).await
        }
        CriterionType::FileCreated | CriterionType::FileModified => {
            probe_result(criterion, probe, PathKind::Any, true).await
        }
        CriterionType::RegexMatch | CriterionType::ExpectedPattern => regex_result(criterion, output, true),
        CriterionType::RegexNotMatch => regex_result(criterion, output, false),
        CriterionType::OutputLength => {
            let actual = output.chars().count().to_string();
            let passed = actual == criterion.value.trim();
            let message = format!("Output length {actual}, expected {}", criterion.value.trim());
            result(criterion, actual, passed, message)
        }
        CriterionType::OutputEmpty | CriterionType::OutputNotEmpty => {
            let empty = output.trim().is_empty();
            let want_empty = criterion.kind == CriterionType::OutputEmpty;
            let message = if empty { "Output is empty" } else { "Output is not empty" };
            result(criterion, preview(output), empty == want_empty, message)
        }
        CriterionType::CommandSucceeded | CriterionType::ProcessCompleted => {
            let passed = exit_code == 0;
            result(criterion, exit_code.to_string(), passed, format!("Exit code {exit_code}"))
        }
        CriterionType::ContentAdded => {
            let passed = !output.trim().is_empty() && output.chars().count() > 10;
            let message = format!("Output has {} characters", output.chars().count());
            result(criterion, preview(output), passed, message)
        }
        CriterionType::NoErrors => {
            let hit = ERROR_WORDS.iter().find(|w| lower.contains(*w));
            let passed = hit.is_none() && exit_code == 0;
            let message = match hit {
                Some(word) => format!("Output mentions \"{word}\""),
                None if exit_code != 0 => format!("Exit code {exit_code}"),
                None => "No errors detected".to_string(),
            };
            result(criterion, preview(output), passed, message)
        }
    }
}

/// 依次评估一组判定，criterion_id 为 `{prefix}-{序号}`
pub async fn evaluate_all(
    criteria: &[Criterion],
    prefix: &str,
    output: &str,
    exit_code: i32,
    probe: &dyn FsProbe,
) -> Vec<CriterionResult> {
    let mut results = Vec::with_capacity(criteria.len());
    for (i, criterion) in criteria.iter().enumerate() {
        let mut r = evaluate(criterion, output, exit_code, probe).await;
        r.criterion_id = format!("{prefix}-{}", i + 1);
        results.push(r);
    }
    results
}

static REDIRECT_TARGET_RE: OnceLock<Regex> = OnceLock::new();

/// 从命令中解析将被创建的路径：重定向目标，或 touch/mkdir 的最后一个非选项参数
pub fn creation_target(command: &str) -> Option<String> {
    let re = REDIRECT_TARGET_RE
        .get_or_init(|| Regex::new(r#"(?:^|[^0-9&>])>>?\s*([^\s&|;<>]+)"#).unwrap());
    if let Some(cap) = re.captures_iter(command).last() {
        return Some(cap[1].trim_matches(|c| c == '"' || c == '\'').to_string());
    }
    let mut words = command.split_whitespace();
    match words.next() {
        Some("touch") | Some("mkdir") => words
            .filter(|w| !w.starts_with('-'))
            .last()
            .map(|w| w.trim_matches(|c| c == '"' || c == '\'').to_string()),
        _ => None,
    }
}

fn is_creation_shaped(command: &str) -> bool {
    command.contains('>')
        || command
            .split_whitespace()
            .any(|w| w == "touch" || w == "mkdir")
}

/// 无显式成功判定时的默认检测
pub async fn default_success(
    command: &str,
    output: &str,
    exit_code: i32,
    probe: &dyn FsProbe,
) -> CriterionResult {
    let base = command.split_whitespace().next().unwrap_or("");
    let criterion = Criterion::new(CriterionType::CommandSucceeded, "")
        .with_description("default success detection");

    if is_creation_shaped(command) {
        if let Some(target) = creation_target(command) {
            let exists = probe.exists(&target, PathKind::Any).await;
            let message = if exists {
                format!("Target {target} exists")
            } else {
                format!("Target {target} was not created")
            };
            let mut r = result(&criterion, if exists { "exists" } else { "missing" }, exists, message);
            r.expected_value = target;
            return r;
        }
    }

    let (passed, message) = match base {
        "cd" | "mkdir" => (exit_code == 0, format!("Exit code {exit_code}")),
        "ls" | "cat" | "find" => (
            exit_code == 0 && !output.trim().is_empty(),
            format!("Exit code {exit_code}, {} output characters", output.trim().chars().count()),
        ),
        _ => {
            let has_error = output.to_lowercase().contains("error");
            (
                exit_code == 0 && !has_error,
                if has_error {
                    "Output mentions \"error\"".to_string()
                } else {
                    format!("Exit code {exit_code}")
                },
            )
        }
    };
    result(&criterion, exit_code.to_string(), passed, message)
}
