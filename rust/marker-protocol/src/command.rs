// marker-protocol: command builders

use std::fmt;

use crate::job::{JobFields, DEFAULT_TAIL};
use crate::tokens::{encode_tokens, ensure_even_before_cr};
use crate::{ProtocolError, ProtocolResult, DEFAULT_COMPLETION_CODES};

/// Marker operation families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Home,
    Reset,
    SetJob,
    GetJob,
    StartJob,
    SetSequence,
    StartSequence,
    MoveAxis,
    ToggleEcho,
}

/// How the caller waits on the marker after transmitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitMode {
    /// Wait for a completion byte only.
    #[default]
    AwaitCode,
    /// Accumulate payload bytes until a completion byte arrives.
    CollectUntilCode,
    /// Enqueue the frame and return immediately.
    FireAndForget,
}

/// Motion axes addressable by `%P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    /// Inclusive travel limits in millimetres.
    pub fn range(self) -> (f64, f64) {
        match self {
            Axis::X => (-80.0, 80.0),
            Axis::Y => (-30.0, 30.0),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
        }
    }
}

/// An immutable, fully framed marker command.
#[derive(Debug, Clone)]
pub struct MarkerCommand {
    pub kind: CommandKind,
    pub bytes: Vec<u8>,
    pub wait_mode: WaitMode,
    pub expected_codes: Vec<u8>,
    /// Hints for timeout policy: job index and payload text length.
    pub job_number: Option<u32>,
    pub text_len: usize,
}

impl MarkerCommand {
    fn framed(kind: CommandKind, text: &str) -> ProtocolResult<Self> {
        let bytes = ensure_even_before_cr(encode_tokens(text)?);
        Ok(Self {
            kind,
            bytes,
            wait_mode: WaitMode::AwaitCode,
            expected_codes: DEFAULT_COMPLETION_CODES.to_vec(),
            job_number: None,
            text_len: 0,
        })
    }

    /// `%H<CR>` — return the marking head to its home position.
    pub fn home() -> Self {
        Self::framed(CommandKind::Home, "%H<CR>").expect("static HOME template encodes")
    }

    /// Single byte `0x1D`, no terminator. Completes with `0x87`.
    pub fn reset() -> Self {
        Self {
            kind: CommandKind::Reset,
            bytes: vec![0x1D],
            wait_mode: WaitMode::AwaitCode,
            expected_codes: DEFAULT_COMPLETION_CODES.to_vec(),
            job_number: None,
            text_len: 0,
        }
    }

    /// Build HOME or RESET from a configured template string.
    pub fn builtin(kind: CommandKind, template: &str) -> ProtocolResult<Self> {
        let mut cmd = Self::framed(kind, template)?;
        cmd.wait_mode = WaitMode::AwaitCode;
        Ok(cmd)
    }

    /// `%J{n}_N<CR>` — start marking job `n`.
    pub fn start_job(n: u32) -> ProtocolResult<Self> {
        let mut cmd = Self::framed(CommandKind::StartJob, &format!("%J{n}_N<CR>"))?;
        cmd.job_number = Some(n);
        Ok(cmd)
    }

    /// `%S{n}_N<CR>` — start sequence `n`.
    pub fn start_sequence(n: u32) -> ProtocolResult<Self> {
        let mut cmd = Self::framed(CommandKind::StartSequence, &format!("%S{n}_N<CR>"))?;
        cmd.job_number = Some(n);
        Ok(cmd)
    }

    /// `%J{n}_B<CR>` — ask the marker to report job `n`; the reply payload is
    /// collected until a completion byte.
    pub fn get_job(n: u32) -> ProtocolResult<Self> {
        let mut cmd = Self::framed(CommandKind::GetJob, &format!("%J{n}_B<CR>"))?;
        cmd.wait_mode = WaitMode::CollectUntilCode;
        cmd.job_number = Some(n);
        Ok(cmd)
    }

    /// `%S{n}_{s}<CR>` — store a sequence command string.
    pub fn set_sequence(n: u32, command_string: &str) -> ProtocolResult<Self> {
        let mut cmd =
            Self::framed(CommandKind::SetSequence, &format!("%S{n}_{command_string}<CR>"))?;
        cmd.job_number = Some(n);
        cmd.text_len = command_string.len();
        Ok(cmd)
    }

    /// `%E_{0|1}<CR>` — toggle character echo on the marker side.
    pub fn toggle_echo(enabled: bool) -> ProtocolResult<Self> {
        let flag = if enabled { 1 } else { 0 };
        Self::framed(CommandKind::ToggleEcho, &format!("%E_{flag}<CR>"))
    }

    /// `%P_{axis}{v:.1}<CR>` — jog an axis to an absolute position.
    /// Values outside the axis travel range are rejected before any bytes
    /// are produced.
    pub fn move_axis(axis: Axis, value: f64) -> ProtocolResult<Self> {
        let (min, max) = axis.range();
        if !value.is_finite() || value < min || value > max {
            return Err(ProtocolError::AxisOutOfRange {
                axis,
                value,
                min,
                max,
            });
        }
        Self::framed(CommandKind::MoveAxis, &format!("%P_{axis}{value:.1}<CR>"))
    }

    /// `%J{n:03}_{body}<CR>` — download a job definition.
    ///
    /// The body is the underscore-joined echo format the device expects:
    /// size, direction, speed, start/pitch coordinates at one decimal, then
    /// the 16-token round-trip tail (final `""` sentinel never emitted),
    /// then the quoted character string followed by `""`. Underscores in the
    /// text become spaces and whitespace runs collapse to one space.
    pub fn set_job(n: u32, fields: &JobFields, cached_tail: Option<&[String]>) -> ProtocolResult<Self> {
        let text = normalize_text(&fields.character_string);
        let mut parts: Vec<String> = vec![
            format!("{:.1}", fields.size),
            format!("{}", fields.direction),
            format!("{}", fields.speed),
            format!("{:.1}", fields.start_x),
            format!("{:.1}", fields.start_y),
            format!("{:.1}", fields.pitch_x),
            format!("{:.1}", fields.pitch_y),
        ];
        parts.extend(tail_tokens(cached_tail));
        let body = parts.join("_");
        let mut cmd = Self::framed(
            CommandKind::SetJob,
            &format!("%J{n:03}_{body}_\"{text}\"\"\"<CR>"),
        )?;
        cmd.job_number = Some(n);
        cmd.text_len = text.len();
        Ok(cmd)
    }
}

/// Replace underscores with spaces and collapse whitespace runs.
pub fn normalize_text(text: &str) -> String {
    text.replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pick the tail tokens to emit: a cached device tail when it is plausible,
/// else the fixed default. The trailing `""` sentinel is never transmitted.
fn tail_tokens(cached: Option<&[String]>) -> Vec<String> {
    match cached {
        Some(tail) if tail.len() == DEFAULT_TAIL.len() => {
            tail[..tail.len() - 1].to_vec()
        }
        Some(tail) if tail.len() == DEFAULT_TAIL.len() - 1 => tail.to_vec(),
        _ => DEFAULT_TAIL[..DEFAULT_TAIL.len() - 1]
            .iter()
            .map(|t| (*t).to_string())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{COMPLETE_OK, COMPLETE_RESET};

    #[test]
    fn home_frame_is_padded_even() {
        let cmd = MarkerCommand::home();
        assert_eq!(cmd.bytes, [0x25, 0x48, 0x0A, 0x0D]);
        assert_eq!(cmd.wait_mode, WaitMode::AwaitCode);
    }

    #[test]
    fn reset_is_single_byte() {
        let cmd = MarkerCommand::reset();
        assert_eq!(cmd.bytes, [0x1D]);
        assert!(cmd.expected_codes.contains(&COMPLETE_RESET));
    }

    #[test]
    fn start_job_frame() {
        // even length already, no padding byte
        let cmd = MarkerCommand::start_job(7).expect("build");
        assert_eq!(cmd.bytes, b"%J7_N\r");
        assert_eq!(cmd.bytes.len() % 2, 0);

        // odd length, LF inserted before CR
        let cmd = MarkerCommand::start_job(12).expect("build");
        assert_eq!(cmd.bytes, b"%J12_N\n\r");
    }

    #[test]
    fn get_job_collects_payload() {
        let cmd = MarkerCommand::get_job(20).expect("build");
        assert_eq!(cmd.wait_mode, WaitMode::CollectUntilCode);
        assert!(cmd.bytes.ends_with(b"\r"));
        assert_eq!(cmd.bytes.len() % 2, 0);
    }

    #[test]
    fn move_axis_rejects_out_of_range() {
        let err = MarkerCommand::move_axis(Axis::X, 120.0).expect_err("must fail");
        assert!(err.to_string().contains("X value out of range"));

        let err = MarkerCommand::move_axis(Axis::Y, -30.1).expect_err("must fail");
        assert!(err.to_string().contains("Y value out of range"));
    }

    #[test]
    fn move_axis_formats_one_decimal() {
        let cmd = MarkerCommand::move_axis(Axis::X, 12.25).expect("build");
        let text = String::from_utf8_lossy(&cmd.bytes).into_owned();
        assert!(text.starts_with("%P_X12.2") || text.starts_with("%P_X12.3"));
    }

    #[test]
    fn toggle_echo_frames() {
        assert!(MarkerCommand::toggle_echo(true)
            .expect("build")
            .bytes
            .starts_with(b"%E_1"));
        assert!(MarkerCommand::toggle_echo(false)
            .expect("build")
            .bytes
            .starts_with(b"%E_0"));
    }

    #[test]
    fn set_job_body_layout() {
        let fields = JobFields {
            size: 2.3,
            direction: 0,
            speed: 500,
            start_x: 33.5,
            start_y: 10.0,
            pitch_x: 2.2,
            pitch_y: 0.0,
            character_string: "ABC".to_string(),
        };
        let cmd = MarkerCommand::set_job(20, &fields, None).expect("build");
        let text = String::from_utf8_lossy(&cmd.bytes).into_owned();
        assert!(text.starts_with("%J020_2.3_0_500_33.5_10.0_2.2_0.0_"));
        assert!(text.contains("_\"ABC\"\"\""), "quoted text then sentinel: {text}");
        assert!(cmd.bytes.ends_with(b"\r"));
        assert_eq!(cmd.bytes.len() % 2, 0);
        // default tail minus sentinel
        assert_eq!(text.matches("<NUL>").count(), 0, "tokens resolved in-stream");
        assert_eq!(cmd.bytes.iter().filter(|&&b| b == 0x00).count(), 3);
    }

    #[test]
    fn set_job_normalizes_text() {
        let fields = JobFields {
            character_string: "AB_CD   EF".to_string(),
            ..JobFields::default()
        };
        let cmd = MarkerCommand::set_job(1, &fields, None).expect("build");
        let text = String::from_utf8_lossy(&cmd.bytes).into_owned();
        assert!(text.contains("\"AB CD EF\""));
    }

    #[test]
    fn set_job_uses_cached_tail() {
        let tail: Vec<String> = (0..16).map(|i| format!("t{i}")).collect();
        let fields = JobFields::default();
        let cmd = MarkerCommand::set_job(1, &fields, Some(&tail)).expect("build");
        let text = String::from_utf8_lossy(&cmd.bytes).into_owned();
        assert!(text.contains("_t0_"));
        assert!(text.contains("_t14_"), "first fifteen tokens emitted");
        assert!(!text.contains("_t15"), "sentinel position dropped");
    }

    #[test]
    fn default_codes_cover_both_completions() {
        let cmd = MarkerCommand::home();
        assert_eq!(cmd.expected_codes, vec![COMPLETE_OK, COMPLETE_RESET]);
    }
}
