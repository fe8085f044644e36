// marker-bridge: request envelope dispatch
//
// Decodes the JSON request envelope into the closed command set, applies
// the Ready and connectivity gates, runs marker operations through the
// coordinator, and shapes the reply. Unknown commands get an error reply,
// never undefined behavior.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use marker_protocol::{parse_get_job, tokens, Axis, CommandKind, MarkerCommand};

use crate::config::{is_valid_log_level, BridgeConfig};
use crate::coordinator::{Coordinator, OpSource, OperationResult};
use crate::error::{BridgeError, BridgeResult};
use crate::logging::{self, LevelHandle};
use crate::marker_link::MarkerLink;
use crate::modbus::ModbusClient;
use crate::plc::READY_INDEX;
use crate::store::{iso_now, JobStore};
use crate::timeouts::TimeoutPolicy;

/// Incoming request envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub target_device: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Bare `{"read": true}` health probe.
    #[serde(default)]
    pub read: Option<bool>,
}

/// Outgoing reply envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    #[serde(rename = "CorrelationId")]
    pub correlation_id: String,
    #[serde(rename = "IsError")]
    pub is_error: bool,
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
    #[serde(rename = "Message")]
    pub message: Value,
}

impl Reply {
    pub fn ok(correlation_id: &str, message: Value) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            is_error: false,
            error_message: String::new(),
            message,
        }
    }

    pub fn err(correlation_id: &str, error: impl ToString) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            is_error: true,
            error_message: error.to_string(),
            message: json!({}),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BuiltinPayload {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SetJobPayload {
    #[serde(rename = "JobNumber", alias = "index", default)]
    job_number: Option<u32>,
    #[serde(rename = "CharacterString", alias = "text", default)]
    character_string: Option<String>,
    #[serde(rename = "JobName", default)]
    job_name: Option<String>,
    #[serde(rename = "Size", default)]
    size: Option<f64>,
    #[serde(rename = "Speed", default)]
    speed: Option<i32>,
    #[serde(rename = "Direction", default)]
    direction: Option<i32>,
    #[serde(rename = "StartX", default)]
    start_x: Option<f64>,
    #[serde(rename = "StartY", default)]
    start_y: Option<f64>,
    #[serde(rename = "PitchX", default)]
    pitch_x: Option<f64>,
    #[serde(rename = "PitchY", default)]
    pitch_y: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct IndexPayload {
    #[serde(rename = "index", alias = "JobNumber", default)]
    index: Option<u32>,
    #[serde(rename = "commandString", default)]
    command_string: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MoveAxisPayload {
    #[serde(default)]
    axis: Option<String>,
    #[serde(default)]
    value: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ToggleEchoPayload {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    state: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SetLogLevelPayload {
    #[serde(default)]
    level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DryRunRegistersPatch {
    #[serde(default)]
    ready: Option<u16>,
    #[serde(default)]
    home: Option<u16>,
    #[serde(default)]
    reset: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct DryRunPayload {
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    registers: Option<DryRunRegistersPatch>,
}

/// Handles decoded request envelopes.
pub struct BridgeService {
    config: parking_lot::RwLock<BridgeConfig>,
    config_path: Option<PathBuf>,
    link: Arc<MarkerLink>,
    modbus: Arc<ModbusClient>,
    coordinator: Arc<Coordinator>,
    store: Arc<dyn JobStore>,
    timeouts: TimeoutPolicy,
    log_handle: Option<LevelHandle>,
}

impl BridgeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BridgeConfig,
        config_path: Option<PathBuf>,
        link: Arc<MarkerLink>,
        modbus: Arc<ModbusClient>,
        coordinator: Arc<Coordinator>,
        store: Arc<dyn JobStore>,
        log_handle: Option<LevelHandle>,
    ) -> Self {
        let timeouts = TimeoutPolicy::new(config.timeouts.clone());
        Self {
            config: parking_lot::RwLock::new(config),
            config_path,
            link,
            modbus,
            coordinator,
            store,
            timeouts,
            log_handle,
        }
    }

    /// Dispatch one request envelope to its handler.
    pub async fn handle(&self, envelope: Envelope) -> Reply {
        let corr = envelope
            .message_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if envelope.read == Some(true) {
            return Reply::ok(&corr, json!({"note": "background reader running"}));
        }

        let command = envelope
            .command
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_ascii_uppercase();
        debug!(%command, correlation = %corr, "request received");

        let payload = envelope.payload.clone();
        match command.as_str() {
            "BUILTIN_COMMAND" => self.builtin_command(&corr, payload).await,
            "SET_JOB" => self.set_job(&corr, payload).await,
            "GET_JOB" => self.get_job(&corr, payload).await,
            "START_JOB" => self.start_job(&corr, payload).await,
            "SET_SEQUENCE" => self.set_sequence(&corr, payload).await,
            "GET_SEQUENCE" => Reply::err(
                &corr,
                "GET_SEQUENCE is not supported; the device does not report single sequences",
            ),
            "START_SEQUENCE" => self.start_sequence(&corr, payload).await,
            "MOVE_AXIS" => self.move_axis(&corr, payload).await,
            "TOGGLE_ECHO" => self.toggle_echo(&corr, payload).await,
            "GET_READY_STATUS" => self.get_ready_status(&corr).await,
            "GET_POSITION" => self.get_position(&corr).await,
            "SET_LOG_LEVEL" => self.set_log_level(&corr, payload),
            "SET_DRY_RUN_STATE" => self.set_dry_run_state(&corr, payload),
            "GET_DRY_RUN_STATE" => self.get_dry_run_state(&corr),
            other => Reply::err(&corr, BridgeError::UnknownCommand(other.to_string())),
        }
    }

    // ---- marker operations -------------------------------------------------

    async fn builtin_command(&self, corr: &str, payload: Value) -> Reply {
        let payload: BuiltinPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let state = payload.state.unwrap_or_default();
        if let Err(e) = self.ensure_marker_available() {
            return Reply::err(corr, e);
        }

        let kind = match state.as_str() {
            "rt_home" => CommandKind::Home,
            "sw_reset" => CommandKind::Reset,
            other => return Reply::err(corr, format!("Unknown builtin state '{other}'")),
        };
        let cmd = match self.builtin_from_template(kind) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::err(corr, e),
        };
        let sent = json!({
            "ascii": tokens::token_string(&cmd.bytes),
            "hex": tokens::hex_string(&cmd.bytes),
        });
        self.exec_for_reply(corr, &cmd, json!({"state": state, "Sent": sent}))
            .await
    }

    /// Builtin frames honor the configured template strings, falling back
    /// to the canonical builders when a template is absent or malformed.
    fn builtin_from_template(&self, kind: CommandKind) -> BridgeResult<MarkerCommand> {
        let name = match kind {
            CommandKind::Home => "HOME",
            _ => "RESET",
        };
        let template = {
            let config = self.config.read();
            config
                .devices
                .software_command
                .templates
                .get(name)
                .cloned()
        };
        match template {
            Some(template) => Ok(MarkerCommand::builtin(kind, &template)?),
            None if kind == CommandKind::Home => Ok(MarkerCommand::home()),
            None => Ok(MarkerCommand::reset()),
        }
    }

    async fn set_job(&self, corr: &str, payload: Value) -> Reply {
        let payload: SetJobPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let n = payload.job_number.unwrap_or(1);
        let text = payload
            .character_string
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            return Reply::err(corr, "CharacterString/text is required");
        }
        if let Err(e) = self.ensure_ready().await {
            return Reply::err(corr, e);
        }
        if let Err(e) = self.ensure_marker_available() {
            return Reply::err(corr, e);
        }

        // persist the model before anything goes on the wire
        let stored = match self.persist_set_job(n, &text, &payload).await {
            Ok(record) => record,
            Err(e) => return Reply::err(corr, format!("SET_JOB error: {e}")),
        };

        let tail = (!stored.raw_tail.is_empty()).then_some(stored.raw_tail.as_slice());
        let cmd = match MarkerCommand::set_job(n, &stored.fields(), tail) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::err(corr, BridgeError::from(e)),
        };
        self.exec_for_reply(corr, &cmd, json!({"Id": stored.id, "JobNumber": n}))
            .await
    }

    async fn persist_set_job(
        &self,
        n: u32,
        text: &str,
        payload: &SetJobPayload,
    ) -> BridgeResult<crate::store::JobRecord> {
        let id = self.store.ensure_job_id(n).await?;
        let mut record = self.store.get_job(n).await?.unwrap_or_default();
        record.id = id;
        record.job_number = n;
        record.character_string = text.to_string();
        if let Some(name) = &payload.job_name {
            record.job_name = name.clone();
        }
        if let Some(v) = payload.size {
            record.size = v;
        }
        if let Some(v) = payload.speed {
            record.speed = v;
        }
        if let Some(v) = payload.direction {
            record.direction = v;
        }
        if let Some(v) = payload.start_x {
            record.start_x = v;
        }
        if let Some(v) = payload.start_y {
            record.start_y = v;
        }
        if let Some(v) = payload.pitch_x {
            record.pitch_x = v;
        }
        if let Some(v) = payload.pitch_y {
            record.pitch_y = v;
        }
        record.last_run_at = iso_now();
        self.store.put_job(n, record.clone()).await?;
        self.store.get_job(n).await.map(|r| r.unwrap_or(record))
    }

    async fn get_job(&self, corr: &str, payload: Value) -> Reply {
        let payload: IndexPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let n = payload.index.unwrap_or(1);
        if let Err(e) = self.ensure_marker_available() {
            return Reply::err(corr, e);
        }
        let cmd = match MarkerCommand::get_job(n) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::err(corr, BridgeError::from(e)),
        };
        let timeout = self.timeouts.for_command(&cmd);

        if self.link.dry_run_active() {
            // run the choreography for real, answer from the cache
            let result = self.coordinator.execute(&cmd, timeout, OpSource::Ui).await;
            if let OperationResult::Timeout { last_code, .. } = result {
                return Reply::err(corr, timeout_message(timeout, last_code));
            }
            return match self.refresh_job_record(n, None).await {
                Ok(record) => json_reply(corr, &record),
                Err(e) => Reply::err(corr, format!("GET_JOB error: {e}")),
            };
        }

        let result = self.coordinator.execute(&cmd, timeout, OpSource::Ui).await;
        let payload_bytes = match result {
            OperationResult::Ok { payload, .. } => payload.unwrap_or_default(),
            OperationResult::Timeout { last_code, .. } => {
                return Reply::err(corr, timeout_message(timeout, last_code));
            }
            OperationResult::DeviceError { reason } => return Reply::err(corr, reason),
            OperationResult::RelayError { messages } => {
                return Reply::err(corr, BridgeError::Relay(messages));
            }
        };

        // Fallback: some firmware revisions interleave the two reply
        // segments in a way the demultiplexed path cannot attribute.
        // Re-issue the request with the reader suspended and read raw.
        let payload_bytes = if payload_bytes.is_empty() && self.link.is_connected() {
            debug!(job = n, "empty GET_JOB payload; retrying on the raw path");
            match self
                .coordinator
                .execute_raw_collect(&cmd, timeout, OpSource::Ui)
                .await
            {
                OperationResult::Ok { payload, .. } => payload.unwrap_or_default(),
                OperationResult::Timeout { last_code, .. } => {
                    return Reply::err(corr, timeout_message(timeout, last_code));
                }
                OperationResult::DeviceError { reason } => return Reply::err(corr, reason),
                OperationResult::RelayError { messages } => {
                    return Reply::err(corr, BridgeError::Relay(messages));
                }
            }
        } else {
            payload_bytes
        };

        let parsed = parse_get_job(&payload_bytes);
        match self.refresh_job_record(n, Some(parsed)).await {
            Ok(record) => json_reply(corr, &record),
            Err(e) => Reply::err(corr, format!("GET_JOB error: {e}")),
        }
    }

    /// Merge a device reply (or nothing, on the dry-run path) over the
    /// cached record, preserving Id and CreatedAt, and persist the result.
    async fn refresh_job_record(
        &self,
        n: u32,
        parsed: Option<marker_protocol::ParsedJob>,
    ) -> BridgeResult<crate::store::JobRecord> {
        let id = self.store.ensure_job_id(n).await?;
        let mut record = self.store.get_job(n).await?.unwrap_or_default();
        record.id = id;
        record.job_number = n;
        if let Some(parsed) = parsed {
            record.apply_fields(&parsed.fields);
            if !parsed.tail.is_empty() {
                record.raw_tail = parsed.tail;
            }
        }
        record.last_run_at = iso_now();
        self.store.put_job(n, record.clone()).await?;
        self.store.get_job(n).await.map(|r| r.unwrap_or(record))
    }

    async fn start_job(&self, corr: &str, payload: Value) -> Reply {
        let payload: IndexPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let n = payload.index.unwrap_or(1);
        if let Err(e) = self.ensure_ready().await {
            return Reply::err(corr, e);
        }
        if let Err(e) = self.ensure_marker_available() {
            return Reply::err(corr, e);
        }
        let cmd = match MarkerCommand::start_job(n) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::err(corr, BridgeError::from(e)),
        };
        self.exec_for_reply(corr, &cmd, json!({"index": n})).await
    }

    async fn set_sequence(&self, corr: &str, payload: Value) -> Reply {
        let payload: IndexPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let idx = payload.index.unwrap_or(1);
        let command_string = payload.command_string.unwrap_or_default().trim().to_string();
        if command_string.is_empty() {
            return Reply::err(corr, "payload.commandString is required");
        }
        if let Err(e) = self.ensure_ready().await {
            return Reply::err(corr, e);
        }
        if let Err(e) = self.ensure_marker_available() {
            return Reply::err(corr, e);
        }
        if let Err(e) = self.store.put_sequence(idx, &command_string).await {
            return Reply::err(corr, format!("SET_SEQUENCE error: {e}"));
        }
        let cmd = match MarkerCommand::set_sequence(idx, &command_string) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::err(corr, BridgeError::from(e)),
        };
        self.exec_for_reply(corr, &cmd, json!({"index": idx})).await
    }

    async fn start_sequence(&self, corr: &str, payload: Value) -> Reply {
        let payload: IndexPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let idx = payload.index.unwrap_or(1);
        if let Err(e) = self.ensure_ready().await {
            return Reply::err(corr, e);
        }
        if let Err(e) = self.ensure_marker_available() {
            return Reply::err(corr, e);
        }
        let cmd = match MarkerCommand::start_sequence(idx) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::err(corr, BridgeError::from(e)),
        };
        self.exec_for_reply(corr, &cmd, json!({"index": idx})).await
    }

    async fn move_axis(&self, corr: &str, payload: Value) -> Reply {
        let payload: MoveAxisPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let axis = match payload.axis.as_deref().map(str::to_ascii_uppercase).as_deref() {
            Some("X") => Axis::X,
            Some("Y") => Axis::Y,
            other => {
                return Reply::err(corr, format!("payload.axis must be X or Y, got {other:?}"))
            }
        };
        let Some(value) = payload.value else {
            return Reply::err(corr, "payload.value is required");
        };
        // range check happens before any gate: nothing is transmitted for a
        // bad value even when the marker is offline
        let cmd = match MarkerCommand::move_axis(axis, value) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::err(corr, BridgeError::from(e)),
        };
        if let Err(e) = self.ensure_marker_available() {
            return Reply::err(corr, e);
        }
        self.exec_for_reply(corr, &cmd, json!({"axis": axis.to_string(), "value": value}))
            .await
    }

    async fn toggle_echo(&self, corr: &str, payload: Value) -> Reply {
        let payload: ToggleEchoPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let enabled = payload
            .enabled
            .or(payload.state.map(|v| v != 0))
            .unwrap_or(true);
        if let Err(e) = self.ensure_marker_available() {
            return Reply::err(corr, e);
        }
        let cmd = match MarkerCommand::toggle_echo(enabled) {
            Ok(cmd) => cmd,
            Err(e) => return Reply::err(corr, BridgeError::from(e)),
        };
        self.exec_for_reply(corr, &cmd, json!({"enabled": enabled})).await
    }

    // ---- PLC queries -------------------------------------------------------

    async fn get_ready_status(&self, corr: &str) -> Reply {
        match self.read_plc().await {
            Ok(values) => {
                let ready = values.get(READY_INDEX).copied().unwrap_or(0) != 0;
                Reply::ok(corr, json!({"isReady": ready}))
            }
            Err(_) => Reply::err(corr, "Read timeout/CRC error"),
        }
    }

    async fn get_position(&self, corr: &str) -> Reply {
        let (x_index, y_index, scale) = {
            let config = self.config.read();
            let pos = &config.app.position;
            (pos.x_index, pos.y_index, pos.scale)
        };
        match self.read_plc().await {
            Ok(values) => {
                let at = |i: usize| f64::from(values.get(i).copied().unwrap_or(0)) * scale;
                Reply::ok(corr, json!({"X": at(x_index), "Y": at(y_index)}))
            }
            Err(_) => Reply::err(corr, "Read timeout/CRC error"),
        }
    }

    // ---- runtime settings --------------------------------------------------

    fn set_log_level(&self, corr: &str, payload: Value) -> Reply {
        let payload: SetLogLevelPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let level = payload.level.unwrap_or_default().to_ascii_lowercase();
        if !is_valid_log_level(&level) {
            return Reply::err(corr, format!("Invalid level '{level}'"));
        }
        if let Some(handle) = &self.log_handle {
            if let Err(e) = logging::set_level(handle, &level) {
                return Reply::err(corr, e);
            }
        }
        {
            let mut config = self.config.write();
            config.logging.level = level.clone();
        }
        self.save_config();
        info!(%level, "log level changed");
        Reply::ok(corr, json!({"level": level}))
    }

    fn set_dry_run_state(&self, corr: &str, payload: Value) -> Reply {
        let payload: DryRunPayload = match parse_payload(payload) {
            Ok(p) => p,
            Err(msg) => return Reply::err(corr, msg),
        };
        let device = payload.device.unwrap_or_default().to_ascii_uppercase();
        match device.as_str() {
            "SOFTWARE_COMMAND" => {
                if let Some(enabled) = payload.enabled {
                    self.link.set_dry_run(enabled);
                    let mut config = self.config.write();
                    config.devices.software_command.dry_run = enabled;
                }
            }
            "BOARD_RELAY" => {
                if payload.enabled == Some(false) && self.modbus.is_dry_run() {
                    return Reply::err(
                        corr,
                        "BOARD_RELAY cannot leave dry-run at runtime; restart without --dry-run-relay",
                    );
                }
                if payload.enabled == Some(true) && !self.modbus.is_dry_run() {
                    return Reply::err(
                        corr,
                        "BOARD_RELAY cannot enter dry-run at runtime; restart with --dry-run-relay",
                    );
                }
                if let Some(patch) = payload.registers {
                    let mut pairs = Vec::new();
                    if let Some(v) = patch.ready {
                        pairs.push((0usize, v));
                    }
                    if let Some(v) = patch.home {
                        pairs.push((1usize, v));
                    }
                    if let Some(v) = patch.reset {
                        pairs.push((2usize, v));
                    }
                    if let Err(e) = self.modbus.patch_dry_run_registers(&pairs) {
                        return Reply::err(corr, e);
                    }
                }
            }
            other => return Reply::err(corr, format!("Unknown device '{other}'")),
        }
        self.save_config();
        self.get_dry_run_state(corr)
    }

    fn get_dry_run_state(&self, corr: &str) -> Reply {
        Reply::ok(
            corr,
            json!({
                "SOFTWARE_COMMAND": self.link.is_dry_run(),
                "BOARD_RELAY": self.modbus.is_dry_run(),
            }),
        )
    }

    // ---- shared plumbing ---------------------------------------------------

    async fn exec_for_reply(&self, corr: &str, cmd: &MarkerCommand, ok_message: Value) -> Reply {
        let timeout = self.timeouts.for_command(cmd);
        match self.coordinator.execute(cmd, timeout, OpSource::Ui).await {
            OperationResult::Ok { relay_errors, .. } if relay_errors.is_empty() => {
                Reply::ok(corr, ok_message)
            }
            OperationResult::Ok { relay_errors, .. } => {
                // the marker finished, but the UI must not treat this as
                // silently OK
                warn!(errors = ?relay_errors, "operation completed with relay errors");
                Reply::err(corr, BridgeError::Relay(relay_errors))
            }
            OperationResult::Timeout { last_code, .. } => {
                Reply::err(corr, timeout_message(timeout, last_code))
            }
            OperationResult::DeviceError { reason } => Reply::err(corr, reason),
            OperationResult::RelayError { messages } => {
                Reply::err(corr, BridgeError::Relay(messages))
            }
        }
    }

    fn ensure_marker_available(&self) -> BridgeResult<()> {
        if self.link.is_dry_run() || self.link.is_connected() {
            Ok(())
        } else {
            Err(BridgeError::NotConnected(
                "SOFTWARE_COMMAND COM is not connected (dry_run=false)".into(),
            ))
        }
    }

    async fn ensure_ready(&self) -> BridgeResult<()> {
        let values = self
            .read_plc()
            .await
            .map_err(|e| BridgeError::NotReady(format!("PLC read failed: {e}")))?;
        if values.get(READY_INDEX).copied().unwrap_or(0) != 0 {
            Ok(())
        } else {
            Err(BridgeError::NotReady("Ready input is low".into()))
        }
    }

    async fn read_plc(&self) -> BridgeResult<Vec<u16>> {
        let read = {
            let config = self.config.read();
            config.devices.board_relay.read_settings.clone()
        };
        self.modbus
            .read_holding_registers(read.start_address, read.num_registers)
            .await
    }

    fn save_config(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        let config = self.config.read().clone();
        if let Err(e) = config.save(path) {
            warn!(error = %e, "config save failed");
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned + Default>(payload: Value) -> Result<T, String> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload).map_err(|e| format!("invalid payload: {e}"))
}

fn json_reply(corr: &str, record: &crate::store::JobRecord) -> Reply {
    match serde_json::to_value(record) {
        Ok(value) => Reply::ok(corr, value),
        Err(e) => Reply::err(corr, BridgeError::InternalInvariant(e.to_string())),
    }
}

fn timeout_message(timeout: Duration, last_code: Option<u8>) -> String {
    let ms = timeout.as_millis();
    match last_code {
        Some(code) => format!("Timeout {ms} ms (lastCode=0x{code:02X})"),
        None => format!("Timeout {ms} ms (lastCode=None)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::relay::RelaySequencer;
    use crate::store::JsonFileStore;

    struct Fixture {
        service: BridgeService,
        modbus: Arc<ModbusClient>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let mut cfg = BridgeConfig::default();
        cfg.devices.board_relay.dry_run = true;
        cfg.devices.board_relay.dry_run_state.ready = 1;
        cfg.devices.software_command.dry_run = true;
        cfg.devices.software_command.dry_run_complete_ms = 20;

        let link = MarkerLink::open(&cfg.devices.software_command, cfg.print_mode()).expect("link");
        let modbus = Arc::new(ModbusClient::dry_run(&cfg.devices.board_relay));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&link),
            RelaySequencer::new(Arc::clone(&modbus)),
        ));
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JsonFileStore::open(dir.path().join("job_store.json")));
        let service = BridgeService::new(
            cfg,
            None,
            link,
            Arc::clone(&modbus),
            coordinator,
            store,
            None,
        );
        Fixture {
            service,
            modbus,
            _dir: dir,
        }
    }

    fn request(command: &str, payload: Value) -> Envelope {
        Envelope {
            message_id: Some(format!("msg-{command}")),
            command: Some(command.to_string()),
            payload,
            ..Envelope::default()
        }
    }

    #[tokio::test]
    async fn unknown_command_is_an_error_reply() {
        let f = fixture();
        let reply = f.service.handle(request("FROBNICATE", json!({}))).await;
        assert!(reply.is_error);
        assert!(reply.error_message.contains("unknown command 'FROBNICATE'"));
        assert_eq!(reply.correlation_id, "msg-FROBNICATE");
    }

    #[tokio::test]
    async fn health_probe_answers_without_command() {
        let f = fixture();
        let envelope = Envelope {
            read: Some(true),
            ..Envelope::default()
        };
        let reply = f.service.handle(envelope).await;
        assert!(!reply.is_error);
        assert_eq!(reply.message["note"], "background reader running");
    }

    #[tokio::test]
    async fn builtin_home_reports_sent_frame() {
        let f = fixture();
        let reply = f
            .service
            .handle(request("BUILTIN_COMMAND", json!({"state": "rt_home"})))
            .await;
        assert!(!reply.is_error, "error: {}", reply.error_message);
        assert_eq!(reply.message["state"], "rt_home");
        assert_eq!(reply.message["Sent"]["hex"], "25 48 0A 0D");
        assert_eq!(reply.message["Sent"]["ascii"], "%H<LF><CR>");
    }

    #[tokio::test]
    async fn builtin_reset_completes() {
        let f = fixture();
        let reply = f
            .service
            .handle(request("BUILTIN_COMMAND", json!({"state": "sw_reset"})))
            .await;
        assert!(!reply.is_error, "error: {}", reply.error_message);
    }

    #[tokio::test]
    async fn unknown_builtin_state_rejected() {
        let f = fixture();
        let reply = f
            .service
            .handle(request("BUILTIN_COMMAND", json!({"state": "warp_drive"})))
            .await;
        assert!(reply.is_error);
        assert!(reply.error_message.contains("Unknown builtin state"));
    }

    #[tokio::test]
    async fn move_axis_out_of_range_transmits_nothing() {
        let f = fixture();
        let reply = f
            .service
            .handle(request("MOVE_AXIS", json!({"axis": "X", "value": 120.0})))
            .await;
        assert!(reply.is_error);
        assert!(reply.error_message.contains("X value out of range"));
        assert!(
            f.modbus.relay_write_log().is_empty(),
            "no operation was started"
        );
    }

    #[tokio::test]
    async fn move_axis_in_range_executes() {
        let f = fixture();
        let reply = f
            .service
            .handle(request("MOVE_AXIS", json!({"axis": "Y", "value": -12.5})))
            .await;
        assert!(!reply.is_error, "error: {}", reply.error_message);
        assert_eq!(reply.message["axis"], "Y");
    }

    #[tokio::test]
    async fn set_job_then_get_job_round_trips() {
        let f = fixture();
        let set = f
            .service
            .handle(request(
                "SET_JOB",
                json!({
                    "JobNumber": 20, "CharacterString": "ABC", "Size": 2.3,
                    "Speed": 500, "StartX": 33.5, "StartY": 10.0,
                    "PitchX": 2.2, "PitchY": 0.0, "Direction": 0
                }),
            ))
            .await;
        assert!(!set.is_error, "error: {}", set.error_message);
        let id = set.message["Id"].as_str().expect("id assigned").to_string();
        assert_eq!(id.len(), 24);
        assert_eq!(set.message["JobNumber"], 20);

        let get = f
            .service
            .handle(request("GET_JOB", json!({"JobNumber": 20})))
            .await;
        assert!(!get.is_error, "error: {}", get.error_message);
        assert_eq!(get.message["Id"], id.as_str(), "Id is stable");
        assert_eq!(get.message["CharacterString"], "ABC");
        assert_eq!(get.message["Size"], 2.3);
        assert_eq!(get.message["Speed"], 500);
        assert_eq!(get.message["StartX"], 33.5);
        let created = get.message["CreatedAt"].as_str().expect("created");
        let last_run = get.message["LastRunAt"].as_str().expect("last run");
        assert!(last_run >= created);
    }

    #[tokio::test]
    async fn set_job_requires_text() {
        let f = fixture();
        let reply = f
            .service
            .handle(request("SET_JOB", json!({"JobNumber": 3})))
            .await;
        assert!(reply.is_error);
        assert!(reply.error_message.contains("CharacterString"));
    }

    #[tokio::test]
    async fn not_ready_gates_job_commands() {
        let f = fixture();
        f.modbus.patch_dry_run_registers(&[(0, 0)]).expect("patch");
        let reply = f
            .service
            .handle(request(
                "SET_JOB",
                json!({"JobNumber": 1, "CharacterString": "X"}),
            ))
            .await;
        assert!(reply.is_error);
        assert!(reply.error_message.contains("NOT_READY"));

        let reply = f
            .service
            .handle(request("START_JOB", json!({"index": 1})))
            .await;
        assert!(reply.is_error);
        assert!(reply.error_message.contains("NOT_READY"));
    }

    #[tokio::test]
    async fn sequences_persist_and_start() {
        let f = fixture();
        let reply = f
            .service
            .handle(request(
                "SET_SEQUENCE",
                json!({"index": 2, "commandString": "J1 J2"}),
            ))
            .await;
        assert!(!reply.is_error, "error: {}", reply.error_message);
        assert_eq!(reply.message["index"], 2);

        let reply = f
            .service
            .handle(request("START_SEQUENCE", json!({"index": 2})))
            .await;
        assert!(!reply.is_error, "error: {}", reply.error_message);

        let reply = f.service.handle(request("GET_SEQUENCE", json!({}))).await;
        assert!(reply.is_error, "GET_SEQUENCE has no device support");
    }

    #[tokio::test]
    async fn ready_status_and_position() {
        let f = fixture();
        f.modbus
            .patch_dry_run_registers(&[(0, 1), (1, 250)])
            .expect("patch");
        let reply = f.service.handle(request("GET_READY_STATUS", json!({}))).await;
        assert_eq!(reply.message["isReady"], true);

        let reply = f.service.handle(request("GET_POSITION", json!({}))).await;
        assert!(!reply.is_error);
        // defaults: x_index 0, y_index 1, scale 0.01
        assert_eq!(reply.message["X"], 0.01);
        assert_eq!(reply.message["Y"], 2.5);
    }

    #[tokio::test]
    async fn set_log_level_validates() {
        let f = fixture();
        let reply = f
            .service
            .handle(request("SET_LOG_LEVEL", json!({"level": "verbose"})))
            .await;
        assert!(reply.is_error);
        assert!(reply.error_message.contains("Invalid level"));

        let reply = f
            .service
            .handle(request("SET_LOG_LEVEL", json!({"level": "debug"})))
            .await;
        assert!(!reply.is_error);
        assert_eq!(reply.message["level"], "debug");
    }

    #[tokio::test]
    async fn dry_run_state_round_trip() {
        let f = fixture();
        let reply = f.service.handle(request("GET_DRY_RUN_STATE", json!({}))).await;
        assert_eq!(reply.message["SOFTWARE_COMMAND"], true);
        assert_eq!(reply.message["BOARD_RELAY"], true);

        let reply = f
            .service
            .handle(request(
                "SET_DRY_RUN_STATE",
                json!({"device": "BOARD_RELAY", "registers": {"home": 1}}),
            ))
            .await;
        assert!(!reply.is_error, "error: {}", reply.error_message);
        let values = f.modbus.read_holding_registers(129, 8).await.expect("read");
        assert_eq!(values[1], 1);

        let reply = f
            .service
            .handle(request(
                "SET_DRY_RUN_STATE",
                json!({"device": "BOARD_RELAY", "enabled": false}),
            ))
            .await;
        assert!(reply.is_error, "cannot leave relay dry-run at runtime");
    }

    #[tokio::test]
    async fn correlation_id_generated_when_missing() {
        let f = fixture();
        let envelope = Envelope {
            command: Some("GET_READY_STATUS".to_string()),
            ..Envelope::default()
        };
        let reply = f.service.handle(envelope).await;
        assert!(!reply.correlation_id.is_empty());
    }
}
