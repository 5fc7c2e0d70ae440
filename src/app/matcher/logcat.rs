use regex::Regex;
use std::sync::OnceLock;

/// One `logcat -v threadtime` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogcatLine<'a> {
    pub timestamp: Option<&'a str>,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub level: Option<char>,
    pub tag: Option<&'a str>,
    pub message: &'a str,
}

fn threadtime_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"^(?P<ts>\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3})\s+(?:\S+\s+)?(?P<pid>\d+)\s+(?P<tid>\d+)\s+(?P<level>[VDIWEFA])\s+(?P<tag>[^:]*?)\s*:\s?(?P<msg>.*)$",
        )
        .expect("logcat regex should compile")
    })
}

/// Splits a threadtime row into its fields. Anything else is kept whole as
/// the message so matchers still see it.
pub fn parse_logcat_line(line: &str) -> LogcatLine<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(caps) = threadtime_regex().captures(line) else {
        return LogcatLine {
            timestamp: None,
            pid: None,
            tid: None,
            level: None,
            tag: None,
            message: line,
        };
    };
    let field = |name: &str| caps.name(name).map(|m| m.as_str());
    LogcatLine {
        timestamp: field("ts"),
        pid: field("pid").and_then(|value| value.parse().ok()),
        tid: field("tid").and_then(|value| value.parse().ok()),
        level: field("level").and_then(|value| value.chars().next()),
        tag: field("tag"),
        message: field("msg").unwrap_or(""),
    }
}
