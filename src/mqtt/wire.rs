//! Wire types for the Bambu Lab printer MQTT API: the JSON payloads carried
//! on `device/{sn}/report` and `device/{sn}/request`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ==========================================================================
// Main Message Types
// ==========================================================================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    Print(Print),
    Info(Info),
    System(SystemReport),
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Print {
    pub print: PrintData,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintData {
    // Print state
    pub gcode_state: Option<GcodeState>,
    #[serde(
        default,
        serialize_with = "option_u32_as_str_se",
        deserialize_with = "option_u32_as_str_de"
    )]
    pub gcode_file_prepare_percent: Option<u32>,
    pub project_id: Option<String>,
    pub subtask_name: Option<String>,
    pub layer_num: Option<i32>,
    pub total_layer_num: Option<i32>,

    // Command/response fields
    pub command: Option<String>,
    pub param: Option<String>,
    pub sequence_id: Option<String>,

    pub reason: Option<String>,
    pub result: Option<String>,

    pub device: Option<PrintDevice>,
    pub ipcam: Option<PrintIpcam>,
    pub lights_report: Option<Vec<LightReport>>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintIpcam {
    pub rtsp_url: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightReport {
    pub node: String,
    pub mode: String,
}

// ==========================================================================
// Device Info (Nozzle, Extruder)
// ==========================================================================

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDevice {
    pub extruder: Option<PrintDeviceExtruder>,
    #[serde(default, deserialize_with = "ignore_errors")]
    pub nozzle: Option<PrintDeviceNozzle>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDeviceExtruder {
    pub info: Vec<PrintDeviceExtruderInfo>,
    pub state: Option<i32>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDeviceExtruderInfo {
    pub id: i32,
    pub snow: i32,
    pub spre: i32,
    pub star: i32,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDeviceNozzle {
    pub info: Vec<PrintDeviceNozzleInfo>,
    pub exist: Option<i32>,
    pub state: Option<i32>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDeviceNozzleInfo {
    pub id: i32,
    pub diameter: f32,
    #[serde(rename = "type")]
    pub nozzle_type: String,
}

// ==========================================================================
// Gcode State
// ==========================================================================

#[derive(Deserialize, Serialize, Debug, PartialEq, Clone, Copy, Default)]
#[allow(clippy::upper_case_acronyms)]
pub enum GcodeState {
    #[default]
    Unknown,
    INIT,
    IDLE,
    SLICING,
    PREPARE,
    RUNNING,
    FINISH,
    FAILED,
    PAUSE,
    OFFLINE,
    #[serde(other)]
    Unsupported,
}

// ==========================================================================
// Commands
// ==========================================================================

/// Push all state command
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAllCommand {
    pub pushing: PushAll,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAll {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
}

impl PushAllCommand {
    pub fn new() -> Self {
        Self {
            pushing: PushAll {
                command: String::from("pushall"),
                sequence_id: Some(String::from("0")),
            },
        }
    }
}

/// Get version command
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetVersionCommand {
    pub info: GetVersion,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetVersion {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
}

impl GetVersionCommand {
    pub fn new() -> Self {
        Self {
            info: GetVersion {
                command: String::from("get_version"),
                sequence_id: Some(String::from("0")),
            },
        }
    }
}

/// Pause/resume/cancel are all the same `print` envelope with a different
/// `command` string and no other fields.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintControlCommand {
    pub print: PrintControl,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintControl {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    pub sequence_id: String,
}

impl PrintControlCommand {
    pub fn pause() -> Self {
        Self::new("pause")
    }

    pub fn resume() -> Self {
        Self::new("resume")
    }

    pub fn cancel() -> Self {
        Self::new("stop")
    }

    fn new(command: &str) -> Self {
        Self {
            print: PrintControl {
                command: command.to_string(),
                param: None,
                sequence_id: "0".to_string(),
            },
        }
    }
}

/// Chamber light control, sent under the `system` topic key rather than
/// `print`. Shape is community-reverse-engineered, not firmware-verified —
/// see DESIGN.md.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChamberLightCommand {
    pub system: SetChamberLight,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetChamberLight {
    pub sequence_id: String,
    pub command: String,
    pub led_node: String,
    pub led_mode: String,
    pub led_on_time: u32,
    pub led_off_time: u32,
    pub loop_times: u32,
    pub interval_time: u32,
}

impl SetChamberLightCommand {
    pub fn new(on: bool) -> Self {
        Self {
            system: SetChamberLight {
                sequence_id: "0".to_string(),
                command: "ledctrl".to_string(),
                led_node: "chamber_light".to_string(),
                led_mode: if on { "on" } else { "off" }.to_string(),
                led_on_time: 500,
                led_off_time: 500,
                loop_times: 1,
                interval_time: 1000,
            },
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemReport {
    pub system: serde_json::Value,
}

// ==========================================================================
// Info Response
// ==========================================================================

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub info: InfoData,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoData {
    pub command: String,
    pub sequence_id: String,
    pub module: Vec<InfoModule>,
    pub result: Option<String>,
    pub reason: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoModule {
    pub name: String,
    pub project_name: Option<String>,
    pub product_name: Option<String>,
    pub sw_ver: String,
    pub hw_ver: String,
    pub sn: String,
    pub flag: Option<i32>,
    pub loader_ver: Option<String>,
    pub ota_ver: Option<String>,
}

// ==========================================================================
// Serde Helpers
// ==========================================================================

fn option_u32_as_str_se<S>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(v) => serializer.serialize_str(&v.to_string()),
        None => serializer.serialize_none(),
    }
}

fn option_u32_as_str_de<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let option: Option<String> = Option::deserialize(deserializer)?;
    option
        .as_deref()
        .map(|s| s.parse::<u32>().map_err(serde::de::Error::custom))
        .transpose()
}

fn ignore_errors<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(T::deserialize(deserializer).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_all_command() {
        let cmd = PushAllCommand::new();
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("pushall"));
    }

    #[test]
    fn test_pause_resume_cancel_commands() {
        let pause = serde_json::to_string(&PrintControlCommand::pause()).unwrap();
        assert!(pause.contains("\"command\":\"pause\""));

        let resume = serde_json::to_string(&PrintControlCommand::resume()).unwrap();
        assert!(resume.contains("\"command\":\"resume\""));

        let cancel = serde_json::to_string(&PrintControlCommand::cancel()).unwrap();
        assert!(cancel.contains("\"command\":\"stop\""));
    }

    #[test]
    fn test_chamber_light_command() {
        let on = serde_json::to_string(&SetChamberLightCommand::new(true)).unwrap();
        assert!(on.contains("\"led_mode\":\"on\""));
        assert!(on.contains("\"loop_times\":1"));
        assert!(on.contains("\"interval_time\":1000"));

        let off = serde_json::to_string(&SetChamberLightCommand::new(false)).unwrap();
        assert!(off.contains("\"led_mode\":\"off\""));
    }
}
