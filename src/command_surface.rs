//! Command surface (C7): the thin, synchronous-feeling async API that
//! composes a `PrinterState` snapshot (C1) and print-record durations (C4)
//! into the status record the HTTP surface exposes, plus the pause / resume
//! / cancel / light command wrappers around C2's publish.

use serde::Serialize;

use crate::model::{stage_description, GcodeState, PrintError, PrinterState, WARMING_UP_STAGES};
use crate::records::PrintRecordStore;

#[derive(Debug, Clone, Serialize)]
pub struct LightStatus {
    pub name: &'static str,
    pub on: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: &'static str,
    pub sub_state: Option<&'static str>,
    pub layer_num: Option<i64>,
    pub total_layer_num: Option<i64>,
    pub duration_sec: Option<i64>,
    pub progress: Option<f64>,
    pub time_left_sec: Option<i64>,
    pub nozzle_temper: Option<f64>,
    pub nozzle_target_temper: Option<f64>,
    pub bed_temper: Option<f64>,
    pub bed_target_temper: Option<f64>,
    pub lights: Vec<LightStatus>,
    pub filename: Option<String>,
    pub error: Option<String>,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Build the job-status record for a printer. Takes `state` by `&mut` only
/// because `continuous_remaining_sec` rebases its wall-clock anchor as a
/// side effect of being read.
pub async fn get_job_status(state: &mut PrinterState, records: &PrintRecordStore) -> JobStatus {
    let printer_error = state.get_printer_error();

    let mut job_state = match state.gcode_state {
        None | Some(GcodeState::Idle) | Some(GcodeState::Init) | Some(GcodeState::Offline)
        | Some(GcodeState::Unknown) => "idle",
        Some(GcodeState::Running) | Some(GcodeState::Slicing) => {
            if state
                .stage_current
                .map(|s| WARMING_UP_STAGES.contains(&s))
                .unwrap_or(false)
            {
                "warmingup"
            } else {
                "printing"
            }
        }
        Some(GcodeState::Prepare) => "warmingup",
        Some(GcodeState::Pause) => "paused",
        Some(GcodeState::Finish) => {
            if state.total_layer_num.unwrap_or(0) > 0 {
                "complete"
            } else {
                "idle"
            }
        }
        Some(GcodeState::Failed) => "cancelled",
    };

    let error = match printer_error {
        Some(PrintError::FilamentRunOut) => {
            job_state = "error";
            Some("Filament runout".to_string())
        }
        Some(PrintError::Unknown) => {
            job_state = "error";
            Some(format!(
                "Unknown printer error (code {})",
                state.print_error.unwrap_or_default()
            ))
        }
        None => None,
    };

    let sub_state = state.stage_current.and_then(stage_description);

    let duration_sec = match state.print_cookie() {
        Some(cookie) => records.get_or_none(&cookie).await.map(|record| {
            record
                .final_duration_sec
                .unwrap_or_else(|| (chrono::Utc::now().timestamp() - record.local_start_time_sec).max(0))
        }),
        None => None,
    };

    let lights = state
        .chamber_light
        .map(|on| vec![LightStatus { name: "chamber", on }])
        .unwrap_or_default();

    JobStatus {
        state: job_state,
        sub_state,
        layer_num: state.layer_num,
        total_layer_num: state.total_layer_num,
        duration_sec,
        progress: state.mc_percent,
        time_left_sec: state.continuous_remaining_sec(),
        nozzle_temper: state.nozzle_temper.map(round2),
        nozzle_target_temper: state.nozzle_target_temper.map(round2),
        bed_temper: state.bed_temper.map(round2),
        bed_target_temper: state.bed_target_temper.map(round2),
        lights,
        filename: state.file_name_no_extension(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> std::path::PathBuf {
        use rand::Rng;
        let suffix: u64 = rand::thread_rng().gen();
        std::env::temp_dir().join(format!("bambu-command-surface-test-{suffix}"))
    }

    #[tokio::test]
    async fn running_with_warmup_stage_is_warmingup() {
        let dir = tempdir();
        let records = PrintRecordStore::new(dir.clone());
        let mut state = PrinterState::default();
        state.on_update(&serde_json::json!({"gcode_state": "RUNNING", "stg_cur": 7}));

        let status = get_job_status(&mut state, &records).await;
        assert_eq!(status.state, "warmingup");

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn filament_error_overrides_state() {
        let dir = tempdir();
        let records = PrintRecordStore::new(dir.clone());
        let mut state = PrinterState::default();
        state.on_update(&serde_json::json!({"gcode_state": "PAUSE", "print_error": 117473297}));

        let status = get_job_status(&mut state, &records).await;
        assert_eq!(status.state, "error");
        assert_eq!(status.error.as_deref(), Some("Filament runout"));

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn finish_with_no_layers_is_idle_not_complete() {
        let dir = tempdir();
        let records = PrintRecordStore::new(dir.clone());
        let mut state = PrinterState::default();
        state.on_update(&serde_json::json!({"gcode_state": "FINISH"}));

        let status = get_job_status(&mut state, &records).await;
        assert_eq!(status.state, "idle");

        tokio::fs::remove_dir_all(dir).await.ok();
    }
}
