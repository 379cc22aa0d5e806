//! ANSI 转义序列清洗
//!
//! 覆盖 CSI（颜色、光标移动）、OSC（窗口标题，BEL 或 ST 结尾）与两字节 ESC 序列；残留 BEL 一并去掉。

use std::sync::OnceLock;

use regex::Regex;

static ANSI_RE: OnceLock<Regex> = OnceLock::new();

fn ansi_regex() -> &'static Regex {
    ANSI_RE.get_or_init(|| {
        Regex::new(
            r"\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)|\x1B\[[0-?]*[ -/]*[@-~]|\x1B[@-Z\\-_]|\x07",
        )
        .unwrap()
    })
}

/// 去掉文本中的全部 ANSI 转义序列
pub fn strip_ansi(text: &str) -> String {
    if !text.contains('\x1B') && !text.contains('\x07') {
        return text.to_string();
    }
    ansi_regex().replace_all(text, "").into_owned()
}
