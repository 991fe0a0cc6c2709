//! State transition detection (C3): turns the raw stream of printer state
//! updates into the high-level lifecycle events everything else (UI,
//! notifications, the HTTP surface) actually cares about, and keeps the
//! per-print duration bookkeeping in `PrintRecord` up to date.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::model::{GcodeState, PrintError, PrinterState};
use crate::records::{PrintRecord, PrintRecordStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Start { cookie: String, filename: Option<String> },
    Resume { filename: Option<String> },
    Paused,
    FilamentChange,
    UserInteractionNeeded,
    Failed { filename: Option<String> },
    Complete { filename: Option<String> },
    Progress { percent: f64 },
}

pub struct StateTranslator {
    records: PrintRecordStore,
    last_gcode_state: Option<GcodeState>,
    current_record: Option<PrintRecord>,
}

impl StateTranslator {
    pub fn new(records: PrintRecordStore) -> Self {
        Self {
            records,
            last_gcode_state: None,
            current_record: None,
        }
    }

    /// The report-topic message has already been merged into `state`;
    /// `print_delta` is the raw `print` sub-object so we can read fields
    /// (like `mc_percent`) that aren't tracked as transitions themselves.
    pub async fn on_message(
        &mut self,
        print_delta: &Value,
        state: &PrinterState,
        is_first_sync: bool,
    ) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        let current = state.gcode_state;
        let was_printing_incl_paused = self
            .last_gcode_state
            .map(|s| s.is_printing(true))
            .unwrap_or(false);

        if is_first_sync {
            self.restore_if_needed(state).await;
        }

        let last = self.last_gcode_state;
        if last.is_none() {
            // Very first observed state this session: record silently.
            self.last_gcode_state = current;
            return events;
        }

        if current != last {
            self.on_transition(last, current, state, &mut events).await;
            self.last_gcode_state = current;
        }

        let is_printing_incl_paused_now = current.map(|s| s.is_printing(true)).unwrap_or(false);
        if was_printing_incl_paused && !is_printing_incl_paused_now {
            self.finalize_duration().await;
        }

        if !is_first_sync && self.current_record.is_some() && !state.is_prepare_or_slicing() {
            if let Some(percent) = print_delta.get("mc_percent").and_then(Value::as_f64) {
                events.push(LifecycleEvent::Progress { percent });
            }
        }

        events
    }

    /// Called when the upstream session drops; the next connection's first
    /// message should be treated as "first observed" again so recovery
    /// logic (not a fresh Start event) runs.
    pub fn on_disconnect(&mut self) {
        self.last_gcode_state = None;
    }

    async fn on_transition(
        &mut self,
        last: Option<GcodeState>,
        current: Option<GcodeState>,
        state: &PrinterState,
        events: &mut Vec<LifecycleEvent>,
    ) {
        let filename = state.file_name_no_extension();
        let is_printing_strict_now = current.map(|s| s.is_printing(false)).unwrap_or(false);

        if is_printing_strict_now && last == Some(GcodeState::Pause) {
            events.push(LifecycleEvent::Resume { filename });
            return;
        }

        let was_printing_strict_before = last.map(|s| s.is_printing(false)).unwrap_or(false);
        if is_printing_strict_now && !was_printing_strict_before {
            let cookie = state.print_cookie();
            if let Some(cookie) = cookie {
                self.start_record(&cookie).await;
                events.push(LifecycleEvent::Start { cookie, filename });
            }
            return;
        }

        match current {
            Some(GcodeState::Pause) => match state.get_printer_error() {
                Some(PrintError::FilamentRunOut) => events.push(LifecycleEvent::FilamentChange),
                Some(PrintError::Unknown) => events.push(LifecycleEvent::UserInteractionNeeded),
                None => events.push(LifecycleEvent::Paused),
            },
            Some(GcodeState::Failed) => events.push(LifecycleEvent::Failed { filename }),
            Some(GcodeState::Finish) => events.push(LifecycleEvent::Complete { filename }),
            _ => {}
        }
    }

    async fn start_record(&mut self, cookie: &str) {
        let needs_new = match &self.current_record {
            Some(record) if record.print_cookie == cookie => false,
            _ => true,
        };
        if needs_new {
            let record = match self.records.get_or_none(cookie).await {
                Some(record) => record,
                None => self.records.create_new(cookie).await,
            };
            self.current_record = Some(record);
        }
    }

    async fn finalize_duration(&mut self) {
        if let Some(record) = &mut self.current_record {
            if record.final_duration_sec.is_none() {
                let elapsed = chrono::Utc::now().timestamp() - record.local_start_time_sec;
                record.final_duration_sec = Some(elapsed.max(0));
                self.records.save(record).await;
                debug!(cookie = %record.print_cookie, elapsed, "print finished, duration recorded");
            }
        }
    }

    /// Synchronize the tracked print record with a print already in
    /// progress when we connect (or reconnect) mid-print, without firing a
    /// Start event for it.
    async fn restore_if_needed(&mut self, state: &PrinterState) {
        let is_printing = state.is_printing(true);
        let Some(cookie) = state.print_cookie() else {
            return;
        };
        if !is_printing {
            return;
        }
        let record = match self.records.get_or_none(&cookie).await {
            Some(record) => record,
            None => self.records.create_new(&cookie).await,
        };
        self.current_record = Some(record);
    }

    pub fn current_record(&self) -> Option<&PrintRecord> {
        self.current_record.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tempdir() -> PathBuf {
        use rand::Rng;
        let suffix: u64 = rand::thread_rng().gen();
        std::env::temp_dir().join(format!("bambu-translator-test-{suffix}"))
    }

    fn state_with(gcode_state: &str, extra: Value) -> PrinterState {
        let mut state = PrinterState::default();
        let mut obj = extra.as_object().cloned().unwrap_or_default();
        obj.insert("gcode_state".into(), Value::String(gcode_state.into()));
        state.on_update(&Value::Object(obj));
        state
    }

    #[tokio::test]
    async fn s1_resume_after_restored_pause() {
        let dir = tempdir();
        let mut translator = StateTranslator::new(PrintRecordStore::new(dir.clone()));

        let first = state_with(
            "PAUSE",
            serde_json::json!({"mc_percent": 42, "project_id": "p1", "subtask_name": "cube.3mf"}),
        );
        let delta1 = serde_json::json!({"gcode_state": "PAUSE", "mc_percent": 42});
        let events1 = translator.on_message(&delta1, &first, true).await;
        assert!(events1.is_empty(), "first full sync should not emit Start");
        assert!(translator.current_record().is_some());

        let second = state_with(
            "RUNNING",
            serde_json::json!({"mc_percent": 43, "project_id": "p1", "subtask_name": "cube.3mf"}),
        );
        let delta2 = serde_json::json!({"gcode_state": "RUNNING", "mc_percent": 43});
        let events2 = translator.on_message(&delta2, &second, false).await;
        assert_eq!(
            events2,
            vec![LifecycleEvent::Resume {
                filename: Some("cube".to_string())
            }]
        );

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn s2_filament_run_out_classified() {
        let dir = tempdir();
        let mut translator = StateTranslator::new(PrintRecordStore::new(dir.clone()));

        let idle = state_with("IDLE", serde_json::json!({}));
        translator.on_message(&serde_json::json!({}), &idle, false).await;

        let paused = state_with("PAUSE", serde_json::json!({"print_error": 117473297}));
        let events = translator
            .on_message(&serde_json::json!({"print_error": 117473297}), &paused, false)
            .await;
        assert_eq!(events, vec![LifecycleEvent::FilamentChange]);

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn start_then_complete_records_duration() {
        let dir = tempdir();
        let mut translator = StateTranslator::new(PrintRecordStore::new(dir.clone()));

        let idle = state_with("IDLE", serde_json::json!({}));
        translator.on_message(&serde_json::json!({}), &idle, false).await;

        let running = state_with(
            "RUNNING",
            serde_json::json!({"project_id": "p1", "subtask_name": "cube.3mf"}),
        );
        let events = translator.on_message(&serde_json::json!({}), &running, false).await;
        assert_eq!(
            events,
            vec![LifecycleEvent::Start {
                cookie: "p1-cube".to_string(),
                filename: Some("cube".to_string())
            }]
        );

        let finish = state_with(
            "FINISH",
            serde_json::json!({"project_id": "p1", "subtask_name": "cube.3mf"}),
        );
        let events = translator.on_message(&serde_json::json!({}), &finish, false).await;
        assert_eq!(
            events,
            vec![LifecycleEvent::Complete {
                filename: Some("cube".to_string())
            }]
        );
        assert!(translator.current_record().unwrap().final_duration_sec.is_some());

        tokio::fs::remove_dir_all(dir).await.ok();
    }

    #[tokio::test]
    async fn prepare_to_running_does_not_duplicate_start() {
        let dir = tempdir();
        let mut translator = StateTranslator::new(PrintRecordStore::new(dir.clone()));

        let idle = state_with("IDLE", serde_json::json!({}));
        translator.on_message(&serde_json::json!({}), &idle, false).await;

        let prepare = state_with(
            "PREPARE",
            serde_json::json!({"project_id": "p1", "subtask_name": "cube.3mf"}),
        );
        let events = translator.on_message(&serde_json::json!({}), &prepare, false).await;
        assert_eq!(events.len(), 1);

        let running = state_with(
            "RUNNING",
            serde_json::json!({"project_id": "p1", "subtask_name": "cube.3mf"}),
        );
        let events = translator.on_message(&serde_json::json!({}), &running, false).await;
        assert!(events.is_empty(), "prepare->running is still printing, no second Start");

        tokio::fs::remove_dir_all(dir).await.ok();
    }
}
