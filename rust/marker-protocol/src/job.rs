// marker-protocol: job upload format

use crate::COMPLETE_OK;

/// Fixed tail emitted for a job the device has never described. The final
/// `""` is a sentinel position and is never transmitted.
pub const DEFAULT_TAIL: [&str; 16] = [
    "0.1", "0.0", "0.0", "<NUL>", "<NUL>", "<NUL>", "0", "0.0", "0.0", "0.0", "0.0", "0.0",
    "0.0", "N", "1", "\"\"",
];

/// The job parameters the controller models explicitly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFields {
    pub size: f64,
    pub direction: i32,
    pub speed: i32,
    pub start_x: f64,
    pub start_y: f64,
    pub pitch_x: f64,
    pub pitch_y: f64,
    pub character_string: String,
}

/// A job reply decoded from the marker, with the unmodeled tail tokens
/// preserved for round-tripping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedJob {
    pub fields: JobFields,
    pub tail: Vec<String>,
}

/// Decode the bytes captured before (or around) a GET_JOB completion.
///
/// The marker answers `%J{n}_B` with two logical segments; on the raw read
/// path they arrive in one buffer separated by an embedded `0x1F`. The body
/// segment is the one carrying the job header (`%J{n}_B` echo or bare
/// `J {n}`), ties broken by underscore count; header tokens are skipped and
/// the remaining fields read by position. Missing numerics default to zero.
pub fn parse_get_job(raw: &[u8]) -> ParsedJob {
    let segments: Vec<String> = raw
        .split(|&b| b == COMPLETE_OK)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .filter(|s| !s.trim().is_empty())
        .collect();
    let Some(body) = pick_body(&segments) else {
        return ParsedJob::default();
    };
    parse_body(body)
}

/// Choose the body segment: prefer segments carrying a job header, break
/// ties (and the headerless case) by the largest underscore count.
fn pick_body(segments: &[String]) -> Option<&str> {
    let underscores = |s: &str| s.matches('_').count();
    segments
        .iter()
        .filter(|s| has_job_header(s))
        .max_by_key(|s| underscores(s))
        .or_else(|| segments.iter().max_by_key(|s| underscores(s)))
        .map(String::as_str)
}

/// Scan for `%J<spaces><digits>` (the `%` and the `_B` suffix are both
/// optional — device captures vary between the echoed command and a bare
/// `J {n}` header).
fn has_job_header(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'J' {
            continue;
        }
        if i > 0 && bytes[i - 1].is_ascii_alphanumeric() {
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && bytes[j] == b' ' {
            j += 1;
        }
        let digits_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > digits_start {
            return true;
        }
    }
    false
}

fn parse_body(body: &str) -> ParsedJob {
    let tokens: Vec<&str> = body.split('_').collect();

    // Skip the header: `J {n}` is one token, an echoed `%J{n}_B` is two.
    let mut start = 0;
    if let Some(first) = tokens.first() {
        let stripped = first.trim_start_matches(|c| c == '%' || c == ' ');
        if stripped.starts_with('J') {
            start = 1;
            if tokens.get(1).is_some_and(|t| t.trim() == "B") {
                start = 2;
            }
        }
    }

    let num = |idx: usize| -> f64 {
        tokens
            .get(start + idx)
            .and_then(|t| t.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    let fields = JobFields {
        size: num(0),
        direction: num(1) as i32,
        speed: num(2) as i32,
        start_x: num(3),
        start_y: num(4),
        pitch_x: num(5),
        pitch_y: num(6),
        character_string: extract_character_string(&tokens),
    };

    // Tail: everything between the numeric fields and the character string.
    let cs_idx = character_string_index(&tokens);
    let tail_start = (start + 7).min(tokens.len());
    let tail_end = cs_idx.unwrap_or(tokens.len()).max(tail_start);
    let tail = tokens[tail_start..tail_end]
        .iter()
        .map(|t| (*t).to_string())
        .collect();

    ParsedJob { fields, tail }
}

fn character_string_index(tokens: &[&str]) -> Option<usize> {
    tokens
        .iter()
        .rposition(|t| !t.is_empty() && *t != "\"\"")
}

/// Last non-empty token, with the trailing `""` sentinel and surrounding
/// quotes removed.
fn extract_character_string(tokens: &[&str]) -> String {
    let Some(idx) = character_string_index(tokens) else {
        return String::new();
    };
    let mut token = tokens[idx];
    if token.len() >= 2 && token.ends_with("\"\"") && token != "\"\"" {
        token = &token[..token.len() - 2];
    }
    token.trim_matches('"').to_string()
}
