//! In-memory cache of the printer's last-known state.
//!
//! The printer only ever sends partial deltas on `device/{sn}/report`; this
//! struct is the field-wise last-writer-wins merge of every delta seen since
//! the last disconnect.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Printer-reported gcode state. Kept as a plain string in the wire messages
/// (the printer is free to add new ones), but well-known values get their own
/// variant so match arms stay exhaustive where it matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcodeState {
    Idle,
    Prepare,
    Slicing,
    Running,
    Pause,
    Finish,
    Failed,
    Init,
    Offline,
    Unknown,
}

impl GcodeState {
    fn parse(s: &str) -> Self {
        match s {
            "IDLE" => Self::Idle,
            "PREPARE" => Self::Prepare,
            "SLICING" => Self::Slicing,
            "RUNNING" => Self::Running,
            "PAUSE" => Self::Pause,
            "FINISH" => Self::Finish,
            "FAILED" => Self::Failed,
            "INIT" => Self::Init,
            "OFFLINE" => Self::Offline,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Prepare => "PREPARE",
            Self::Slicing => "SLICING",
            Self::Running => "RUNNING",
            Self::Pause => "PAUSE",
            Self::Finish => "FINISH",
            Self::Failed => "FAILED",
            Self::Init => "INIT",
            Self::Offline => "OFFLINE",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_printing(self, include_paused: bool) -> bool {
        match self {
            Self::Running | Self::Prepare | Self::Slicing => true,
            Self::Pause => include_paused,
            _ => false,
        }
    }

    pub fn is_prepare_or_slicing(self) -> bool {
        matches!(self, Self::Prepare | Self::Slicing)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, Self::Pause)
    }
}

/// Classification of `print_error`. Most error codes aren't mapped; they fall
/// back to `Unknown` rather than being treated as "no error".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintError {
    FilamentRunOut,
    Unknown,
}

/// Codes that map to `FilamentRunOut` (hex 07008011/07018011/07028011/07038011/07FF8011,
/// one per AMS slot plus the "any slot" wildcard).
const FILAMENT_RUN_OUT_CODES: [i64; 5] = [117473297, 117539089, 117604881, 117670673, 134184977];

/// Codes the printer reports that are informational, not actual errors
/// (includes the "push filament in" prompt during manual loading).
const NOT_AN_ERROR_CODES: [i64; 4] = [83918896, 50364434, 83935249, 134184967];

#[derive(Debug, Clone, Default)]
pub struct PrinterState {
    pub gcode_state: Option<GcodeState>,
    pub stage_current: Option<i64>,
    pub layer_num: Option<i64>,
    pub total_layer_num: Option<i64>,
    pub subtask_name: Option<String>,
    pub project_id: Option<String>,
    pub mc_percent: Option<f64>,
    pub nozzle_temper: Option<f64>,
    pub nozzle_target_temper: Option<f64>,
    pub bed_temper: Option<f64>,
    pub bed_target_temper: Option<f64>,
    pub mc_remaining_time: Option<i64>,
    pub print_error: Option<i64>,
    pub rtsp_url: Option<String>,
    pub chamber_light: Option<bool>,
    last_remaining_update: Option<Instant>,
}

impl PrinterState {
    /// Merge a partial `print` delta into the cached state. Absent keys keep
    /// their previous value; only keys actually present in `delta` are
    /// touched.
    pub fn on_update(&mut self, delta: &Value) {
        if let Some(s) = delta.get("gcode_state").and_then(Value::as_str) {
            self.gcode_state = Some(GcodeState::parse(s));
        }
        if let Some(v) = delta.get("stg_cur").and_then(Value::as_i64) {
            self.stage_current = Some(v);
        }
        if let Some(v) = delta.get("layer_num").and_then(Value::as_i64) {
            self.layer_num = Some(v);
        }
        if let Some(v) = delta.get("total_layer_num").and_then(Value::as_i64) {
            self.total_layer_num = Some(v);
        }
        if let Some(s) = delta.get("subtask_name").and_then(Value::as_str) {
            self.subtask_name = Some(s.to_string());
        }
        if let Some(s) = delta.get("project_id").and_then(Value::as_str) {
            self.project_id = Some(s.to_string());
        }
        if let Some(v) = delta.get("mc_percent").and_then(Value::as_f64) {
            self.mc_percent = Some(v);
        }
        if let Some(v) = delta.get("nozzle_temper").and_then(Value::as_f64) {
            self.nozzle_temper = Some(v);
        }
        if let Some(v) = delta.get("nozzle_target_temper").and_then(Value::as_f64) {
            self.nozzle_target_temper = Some(v);
        }
        if let Some(v) = delta.get("bed_temper").and_then(Value::as_f64) {
            self.bed_temper = Some(v);
        }
        if let Some(v) = delta.get("bed_target_temper").and_then(Value::as_f64) {
            self.bed_target_temper = Some(v);
        }
        if let Some(v) = delta.get("print_error").and_then(Value::as_i64) {
            self.print_error = Some(v);
        }
        if let Some(ipcam) = delta.get("ipcam") {
            if let Some(s) = ipcam.get("rtsp_url").and_then(Value::as_str) {
                self.rtsp_url = Some(s.to_string());
            }
        }
        if let Some(lights) = delta.get("lights_report").and_then(Value::as_array) {
            for light in lights {
                if light.get("node").and_then(Value::as_str) == Some("chamber_light") {
                    if let Some(mode) = light.get("mode").and_then(Value::as_str) {
                        self.chamber_light = Some(mode == "on");
                    }
                }
            }
        }

        // mc_remaining_time has its own wall-clock anchor: only rebase it
        // when the value actually changes, so GetContinuousRemainingSec can
        // extrapolate seconds between Bambu's once-a-minute updates.
        if let Some(v) = delta.get("mc_remaining_time").and_then(Value::as_i64) {
            if self.mc_remaining_time != Some(v) {
                self.mc_remaining_time = Some(v);
                self.last_remaining_update = Some(Instant::now());
            }
        }
    }

    /// A sub-minute countdown derived from the last `mc_remaining_time`
    /// update. Bambu only reports whole minutes, so we extrapolate the
    /// seconds elapsed since that update was received. Returns `None` if
    /// remaining time has never been reported.
    pub fn continuous_remaining_sec(&mut self) -> Option<i64> {
        let remaining_min = self.mc_remaining_time?;
        let last_update = self.last_remaining_update?;

        if self.is_prepare_or_slicing() {
            // The printer holds remaining time constant during prep/slicing;
            // rebase now so resuming to RUNNING doesn't snap to a stale offset.
            self.last_remaining_update = Some(Instant::now());
            return Some(remaining_min * 60);
        }

        let elapsed = last_update.elapsed().as_secs() as i64;
        Some((remaining_min * 60 - elapsed).max(0))
    }

    pub fn get_printer_error(&self) -> Option<PrintError> {
        let code = self.print_error?;
        if code == 0 {
            return None;
        }
        if NOT_AN_ERROR_CODES.contains(&code) {
            return None;
        }
        if FILAMENT_RUN_OUT_CODES.contains(&code) {
            return Some(PrintError::FilamentRunOut);
        }
        Some(PrintError::Unknown)
    }

    pub fn is_printing(&self, include_paused: bool) -> bool {
        self.gcode_state
            .map(|s| s.is_printing(include_paused))
            .unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.gcode_state.map(GcodeState::is_paused).unwrap_or(false)
    }

    pub fn is_prepare_or_slicing(&self) -> bool {
        self.gcode_state
            .map(GcodeState::is_prepare_or_slicing)
            .unwrap_or(false)
    }

    /// Filename with its extension stripped, or `None` if unknown.
    pub fn file_name_no_extension(&self) -> Option<String> {
        let name = self.subtask_name.as_ref()?;
        match name.rfind('.') {
            Some(pos) => Some(name[..pos].to_string()),
            None => Some(name.clone()),
        }
    }

    /// A stable identifier for the current print, or `None` if either half
    /// of the pair is missing. Stays the same across reconnects as long as
    /// the printer keeps reporting the same project/file.
    pub fn print_cookie(&self) -> Option<String> {
        let project_id = self.project_id.as_ref().filter(|s| !s.is_empty())?;
        let file_name = self.file_name_no_extension().filter(|s| !s.is_empty())?;
        Some(format!("{project_id}-{file_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_updates_keep_untouched_fields() {
        let mut state = PrinterState::default();
        state.on_update(&serde_json::json!({"gcode_state": "RUNNING", "layer_num": 3}));
        state.on_update(&serde_json::json!({"mc_percent": 50.0}));

        assert_eq!(state.gcode_state, Some(GcodeState::Running));
        assert_eq!(state.layer_num, Some(3));
        assert_eq!(state.mc_percent, Some(50.0));
    }

    #[test]
    fn print_cookie_requires_both_fields() {
        let mut state = PrinterState::default();
        assert_eq!(state.print_cookie(), None);
        state.on_update(&serde_json::json!({"project_id": "p1"}));
        assert_eq!(state.print_cookie(), None);
        state.on_update(&serde_json::json!({"subtask_name": "cube.3mf"}));
        assert_eq!(state.print_cookie().as_deref(), Some("p1-cube"));
    }

    #[test]
    fn filament_run_out_is_classified() {
        let mut state = PrinterState::default();
        state.on_update(&serde_json::json!({"print_error": 117473297}));
        assert_eq!(state.get_printer_error(), Some(PrintError::FilamentRunOut));
    }

    #[test]
    fn informational_codes_are_not_errors() {
        let mut state = PrinterState::default();
        state.on_update(&serde_json::json!({"print_error": 83918896}));
        assert_eq!(state.get_printer_error(), None);
    }

    #[test]
    fn remaining_time_holds_steady_during_prepare() {
        let mut state = PrinterState::default();
        state.on_update(&serde_json::json!({"gcode_state": "PREPARE", "mc_remaining_time": 5}));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(state.continuous_remaining_sec(), Some(300));
    }
}
