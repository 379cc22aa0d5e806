//! 提示符尾部识别
//!
//! 两组有序正则：远程会话（user@host:path$、裸 $/#/>、[venv] $ 之类的环境前缀）与本地会话
//! （zsh 的 %、❯、➜ 等）。按顺序匹配，第一条命中即为提示符；匹配起点之前的内容就是命令输出。

use std::sync::OnceLock;

use regex::Regex;

/// 远程会话的提示符尾部（顺序即优先级）
const REMOTE_PROMPT_PATTERNS: &[&str] = &[
    // (venv) user@host:~/dir$   [env] root@box:/#
    r"(?:\([^()\r\n]+\)|\[[^\[\]\r\n]+\])[ \t]*[\w.\-]+@[\w.\-]+:[^\r\n]*[$#][ \t]*$",
    // user@host:~/dir$
    r"[\w.\-]+@[\w.\-]+:[^\r\n]*[$#][ \t]*$",
    // [venv] $   (venv) #
    r"(?:^|\n)[ \t]*(?:\([^()\r\n]+\)|\[[^\[\]\r\n]+\])[ \t]*[$#>][ \t]*$",
    // bash-5.1$
    r"(?:^|\n)[ \t]*(?:bash|sh|zsh)(?:-[\d.]+)?[$#][ \t]*$",
    // 裸提示符 $ # >
    r"(?:^|\n)[ \t]*[$#>][ \t]*$",
];

/// 本地会话的提示符尾部
const LOCAL_PROMPT_PATTERNS: &[&str] = &[
    // user@MacBook ~ %   user@host dir $
    r"[\w.\-]+@[\w.\-]+[ :][^\r\n]*[%$#][ \t]*$",
    // ➜  project git:(main) ✗
    r"(?:^|\n)[ \t]*➜[^\r\n]*$",
    // starship / pure：❯
    r"(?:^|\n)[^\r\n]*❯[ \t]*$",
    // (venv) %
    r"(?:^|\n)[ \t]*(?:\([^()\r\n]+\)|\[[^\[\]\r\n]+\])[^\r\n]*[%$#>][ \t]*$",
    // 裸提示符 % $ # >
    r"(?:^|\n)[ \t]*[%$#>][ \t]*$",
];

static REMOTE_SET: OnceLock<Vec<Regex>> = OnceLock::new();
static LOCAL_SET: OnceLock<Vec<Regex>> = OnceLock::new();

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
}

/// 一次成功的提示符匹配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMatch {
    /// 提示符在被检查文本中的起始字节偏移
    pub start: usize,
    /// 命中的提示符文本
    pub prompt: String,
}

/// 按会话类型选择的提示符匹配器
#[derive(Debug, Clone, Copy)]
pub struct PromptMatcher {
    patterns: &'static [Regex],
}

impl PromptMatcher {
    /// local 由 SessionAdapter::is_local_session 提供
    pub fn for_session(local: bool) -> Self {
        let patterns = if local {
            LOCAL_SET.get_or_init(|| compile(LOCAL_PROMPT_PATTERNS))
        } else {
            REMOTE_SET.get_or_init(|| compile(REMOTE_PROMPT_PATTERNS))
        };
        Self {
            patterns: patterns.as_slice(),
        }
    }

    /// 依序检查，返回第一条命中的提示符尾部
    pub fn find(&self, text: &str) -> Option<PromptMatch> {
        self.patterns.iter().find_map(|re| {
            re.find(text).map(|m| {
                // (?:^|\n) 前缀会把换行吃进匹配里，提示符本身从换行之后开始
                let start = if text[m.start()..].starts_with('\n') {
                    m.start() + 1
                } else {
                    m.start()
                };
                PromptMatch {
                    start,
                    prompt: text[start..m.end()].to_string(),
                }
            })
        })
    }
}

/// 从提示符命中位置切出命令输出
pub fn output_before(text: &str, found: &PromptMatch) -> String {
    text[..found.start].trim().to_string()
}
