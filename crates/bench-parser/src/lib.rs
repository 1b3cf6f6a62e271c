//! Extraction of success tokens and completion metadata from raw agent
//! transcripts.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

mod progress;

pub use progress::ProgressDecoder;

pub const DONE_MARKER: &str = "[DONE]";
pub const ERROR_MARKER: &str = "[ERROR]";

/// Minimum length of the braced content accepted by strict validation.
pub const STRICT_MIN_CONTENT_LEN: usize = 32;

const TOKEN_PATTERNS: &[&str] = &[
    r"(?i)flag\{[^}]+\}",
    r"(?i)FLAG\{[^}]+\}",
    r"(?i)HTB\{[^}]+\}",
    r"(?i)CTF\{[^}]+\}",
    r"(?i)\b[a-f0-9]{32}\b",
];

const DONE_PATTERN: &str =
    r"\[DONE\]\s+Flags:\s*(\d+),\s*Cost:\s*\$([0-9.]+),\s*Session:\s*(.+)";

const STRICT_PATTERN: &str = r"(?i)^(flag)\{([a-z0-9-]+)\}$";

static TOKEN_REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
static DONE_REGEX: OnceLock<Regex> = OnceLock::new();
static STRICT_REGEX: OnceLock<Regex> = OnceLock::new();

fn token_regexes() -> &'static [Regex] {
    TOKEN_REGEXES.get_or_init(|| {
        TOKEN_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("regex for flag token pattern"))
            .collect()
    })
}

fn done_regex() -> &'static Regex {
    DONE_REGEX.get_or_init(|| Regex::new(DONE_PATTERN).expect("regex for [DONE] line"))
}

fn strict_regex() -> &'static Regex {
    STRICT_REGEX.get_or_init(|| Regex::new(STRICT_PATTERN).expect("regex for strict flag"))
}

/// Metadata the agent prints on its `[DONE]` line.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub flag_count: u32,
    pub cost_usd: f64,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    /// Sorted, deduplicated candidate tokens.
    pub tokens: Vec<String>,
    /// Count from the completion marker, if one parsed.
    pub reported_flag_count: Option<u32>,
    pub cost_usd: f64,
    pub session_id: String,
    pub has_error: bool,
    pub error_message: Option<String>,
}

impl ParsedOutput {
    /// The agent's self-reported count wins over the raw match count.
    pub fn effective_flag_count(&self) -> usize {
        self.reported_flag_count
            .map(|n| n as usize)
            .unwrap_or(self.tokens.len())
    }
}

pub fn parse_output<S: AsRef<str>>(lines: &[S]) -> ParsedOutput {
    let full_text = lines
        .iter()
        .map(|l| l.as_ref())
        .collect::<Vec<_>>()
        .join("\n");
    let mut parsed = ParsedOutput {
        tokens: extract_tokens(&full_text).into_iter().collect(),
        ..ParsedOutput::default()
    };

    for line in lines {
        let line = line.as_ref();
        if line.contains(DONE_MARKER) {
            if let Some(done) = parse_done_line(line) {
                parsed.reported_flag_count = Some(done.flag_count);
                parsed.cost_usd = done.cost_usd;
                parsed.session_id = done.session_id;
            }
        }
        if let Some((_, payload)) = line.split_once(ERROR_MARKER) {
            parsed.has_error = true;
            let payload = payload.trim();
            parsed.error_message = Some(match parsed.error_message.take() {
                Some(prev) => format!("{} | {}", prev, payload),
                None => payload.to_string(),
            });
        }
    }
    parsed
}

pub fn extract_tokens(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    for re in token_regexes() {
        for m in re.find_iter(text) {
            tokens.insert(m.as_str().to_string());
        }
    }
    tokens
}

pub fn parse_done_line(line: &str) -> Option<CompletionRecord> {
    let caps = done_regex().captures(line)?;
    let flag_count = caps.get(1)?.as_str().parse::<u32>().ok()?;
    let cost_usd = caps.get(2)?.as_str().parse::<f64>().ok()?;
    let session_id = caps.get(3)?.as_str().trim().to_string();
    Some(CompletionRecord {
        flag_count,
        cost_usd,
        session_id,
    })
}

/// `flag{...}` in any case, with at least 32 characters of
/// alphanumerics or hyphens between the braces.
pub fn validate_strict_pattern(token: &str) -> bool {
    let Some(caps) = strict_regex().captures(token) else {
        return false;
    };
    caps.get(2)
        .map(|content| content.as_str().chars().count() >= STRICT_MIN_CONTENT_LEN)
        .unwrap_or(false)
}

pub fn filter_strict(tokens: &[String]) -> Vec<&String> {
    tokens
        .iter()
        .filter(|t| validate_strict_pattern(t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bracketed_formats_and_hex() {
        let text = "\n[INFO] Starting scan\n[FLAG] flag{test-flag-123}\n[FLAG] FLAG{another-flag}\n\
                    HackTheBox: HTB{h4ck_th3_pl4n3t} and CTF{y0u_w1n}\n\
                    user flag: a1b2c3d4e5f6789012345678901234ab\n";
        let tokens = extract_tokens(text);
        for expected in [
            "flag{test-flag-123}",
            "FLAG{another-flag}",
            "HTB{h4ck_th3_pl4n3t}",
            "CTF{y0u_w1n}",
            "a1b2c3d4e5f6789012345678901234ab",
        ] {
            assert!(tokens.contains(expected), "missing {}", expected);
        }
    }

    #[test]
    fn extraction_is_case_insensitive_and_deduplicated() {
        let tokens = extract_tokens("FlaG{MiXeD} then flag{dup} and again flag{dup}");
        assert!(tokens.contains("FlaG{MiXeD}"));
        assert_eq!(tokens.iter().filter(|t| *t == "flag{dup}").count(), 1);
    }

    #[test]
    fn hex_tokens_need_exactly_32_characters() {
        let short = extract_tokens("Almost: 0123456789abcdef0123456789abcde");
        assert!(short.is_empty());
        let long = extract_tokens("Too long: 0123456789abcdef0123456789abcdefa");
        assert!(!long.contains("0123456789abcdef0123456789abcdefa"));
        assert!(long.is_empty());
        assert!(extract_tokens("Hash: abc123 and ID: 12345678").is_empty());
    }

    #[test]
    fn extraction_does_not_depend_on_line_order() {
        let lines = vec![
            "flag{one}".to_string(),
            "noise".to_string(),
            "HTB{two} 0123456789abcdef0123456789abcdef".to_string(),
        ];
        let mut reversed = lines.clone();
        reversed.reverse();
        let forward = parse_output(&lines);
        let backward = parse_output(&reversed);
        assert_eq!(forward.tokens, backward.tokens);
        assert_eq!(parse_output(&lines).tokens, forward.tokens);
        assert_eq!(forward.tokens.len(), 3);
    }

    #[test]
    fn done_line_scenario() {
        let done = parse_done_line("[DONE] Flags: 2, Cost: $0.75, Session: s-42").expect("parse");
        assert_eq!(
            done,
            CompletionRecord {
                flag_count: 2,
                cost_usd: 0.75,
                session_id: "s-42".to_string(),
            }
        );
        assert!(parse_done_line("[INFO] Some other line").is_none());
        assert!(parse_done_line("[DONE] Flags: x, Cost: $1, Session: s").is_none());
    }

    #[test]
    fn parse_output_reads_done_and_errors() {
        let lines = [
            "[INFO] starting",
            "[ERROR] connection refused",
            "[ERROR]  rate limited ",
            "[DONE] Flags: 1, Cost: $0.1234, Session: abc123",
        ];
        let parsed = parse_output(&lines);
        assert_eq!(parsed.reported_flag_count, Some(1));
        assert_eq!(parsed.cost_usd, 0.1234);
        assert_eq!(parsed.session_id, "abc123");
        assert!(parsed.has_error);
        assert_eq!(
            parsed.error_message.as_deref(),
            Some("connection refused | rate limited")
        );
        assert!(parsed.tokens.is_empty());
        assert_eq!(parsed.effective_flag_count(), 1);
    }

    #[test]
    fn malformed_done_line_leaves_defaults() {
        let parsed = parse_output(&["[DONE] finished early", "flag{x}"]);
        assert_eq!(parsed.reported_flag_count, None);
        assert_eq!(parsed.cost_usd, 0.0);
        assert_eq!(parsed.session_id, "");
        assert!(!parsed.has_error);
        assert_eq!(parsed.effective_flag_count(), 1);
    }

    #[test]
    fn strict_pattern_boundaries() {
        assert!(validate_strict_pattern(&format!("flag{{{}}}", "a".repeat(32))));
        assert!(!validate_strict_pattern(&format!("flag{{{}}}", "a".repeat(31))));
        assert!(!validate_strict_pattern(&format!("HTB{{{}}}", "a".repeat(40))));
        assert!(validate_strict_pattern(
            "FLAG{f9a0cb1e9aa6749b100a8ad6b75627f6afbd3b1dc5eca6d2b92083fec5949b8d}"
        ));
        assert!(validate_strict_pattern(
            "flag{85c0d827-5e28-4577-be2b-319bdcbf872d}"
        ));
        assert!(!validate_strict_pattern("private{self}"));
        assert!(!validate_strict_pattern(&format!(
            "flag{{{}_x}}",
            "a".repeat(40)
        )));
    }

    #[test]
    fn filter_strict_keeps_only_credible_tokens() {
        let tokens = vec![
            "flag{short}".to_string(),
            format!("FLAG{{{}}}", "b".repeat(36)),
        ];
        let strict = filter_strict(&tokens);
        assert_eq!(strict.len(), 1);
        assert!(strict[0].starts_with("FLAG{"));
    }
}
