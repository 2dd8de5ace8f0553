//! Parsing of the judge (verifier) reply.
//!
//! The judge reply carries two independent signals: a `Status: PASS|FAIL`
//! line and an explicit `EXIT_SIGNAL: true|false` line. Only both together
//! (PASS and `true`) count as a pass; anything ambiguous is a failure.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::Verdict;

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bstatus[*_`]*\s*:\s*[*_`]*\s*(PASS|FAIL)\b")
        .expect("status regex is valid")
});

static EXIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)EXIT_SIGNAL[*_`]*\s*:\s*[*_`]*\s*(true|false)\b")
        .expect("exit signal regex is valid")
});

/// Parsed judge verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JudgeVerdict {
    /// `Pass` only when both signals agree; otherwise `Fail`.
    pub status: Verdict,
    /// Explicit continue signal; `true` only alongside a pass.
    pub exit: bool,
}

impl JudgeVerdict {
    pub const FAIL: JudgeVerdict = JudgeVerdict {
        status: Verdict::Fail,
        exit: false,
    };

    pub fn is_pass(&self) -> bool {
        self.status == Verdict::Pass && self.exit
    }
}

/// Parse a judge reply. The last occurrence of each signal wins, so a reply
/// that quotes the instructions before answering is read by its answer.
pub fn parse_verdict(text: &str) -> JudgeVerdict {
    let status = STATUS_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().eq_ignore_ascii_case("pass"));
    let exit = EXIT_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().eq_ignore_ascii_case("true"));

    match (status, exit) {
        (Some(true), Some(true)) => JudgeVerdict {
            status: Verdict::Pass,
            exit: true,
        },
        _ => JudgeVerdict::FAIL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_with_exit_signal_is_pass() {
        let verdict = parse_verdict("Looks good.\n\nStatus: PASS\nEXIT_SIGNAL: true\n");
        assert_eq!(
            verdict,
            JudgeVerdict {
                status: Verdict::Pass,
                exit: true
            }
        );
        assert!(verdict.is_pass());
    }

    #[test]
    fn pass_without_exit_signal_is_fail() {
        assert_eq!(parse_verdict("Status: PASS\n"), JudgeVerdict::FAIL);
    }

    #[test]
    fn pass_with_false_exit_signal_is_fail() {
        assert_eq!(
            parse_verdict("Status: PASS\nEXIT_SIGNAL: false\n"),
            JudgeVerdict::FAIL
        );
    }

    #[test]
    fn fail_status_ignores_exit_signal() {
        assert_eq!(
            parse_verdict("Status: FAIL\nEXIT_SIGNAL: true\n"),
            JudgeVerdict::FAIL
        );
    }

    #[test]
    fn unrelated_content_is_fail() {
        assert_eq!(parse_verdict(""), JudgeVerdict::FAIL);
        assert_eq!(parse_verdict("all done, ship it"), JudgeVerdict::FAIL);
        assert_eq!(parse_verdict("status of PASS is unclear"), JudgeVerdict::FAIL);
    }

    #[test]
    fn tolerates_markdown_emphasis_and_case() {
        let verdict = parse_verdict("- **Status:** pass\n`EXIT_SIGNAL: TRUE`\n");
        assert!(verdict.is_pass());
    }

    #[test]
    fn status_mid_line_counts() {
        let verdict = parse_verdict("Verified the gate log. Status: PASS\nEXIT_SIGNAL: true\n");
        assert!(verdict.is_pass());
    }

    #[test]
    fn last_occurrence_wins() {
        let text = "Reply with Status: PASS and EXIT_SIGNAL: true when done.\n\
                    Status: PASS\nEXIT_SIGNAL: true\n\
                    Re-checked the gate log.\nStatus: FAIL\nEXIT_SIGNAL: false\n";
        assert_eq!(parse_verdict(text), JudgeVerdict::FAIL);
    }
}
