//! Printer identity derived from the `info`/`get_version` response.
//!
//! The printer doesn't report its own model name directly; it reports a
//! list of onboard modules (mainboard, AMS, airduct, ...) each carrying a
//! vendor hardware-version code. The CPU family and printer model are both
//! inferred from those codes, the same way the mainboard module is used to
//! fingerprint the machine on first connect.

use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrinterCpu {
    #[default]
    Unknown,
    Esp32,
    Rv1126,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrinterModel {
    #[default]
    Unknown,
    X1C,
    X1E,
    P1P,
    P1S,
    A1,
    A1Mini,
}

impl PrinterModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::X1C => "X1 Carbon",
            Self::X1E => "X1E",
            Self::P1P => "P1P",
            Self::P1S => "P1S",
            Self::A1 => "A1",
            Self::A1Mini => "A1 Mini",
        }
    }
}

/// Mainboard hw_ver -> model, for machines built on the RV1126 SoC (the X1
/// family; these carry the onboard vision/AI pipeline). Unlike ESP32, the
/// hw_ver alone disambiguates the model.
const RV1126_MODEL_MAP: &[(&str, PrinterModel)] =
    &[("AP05", PrinterModel::X1C), ("AP02", PrinterModel::X1E)];

/// (hw_ver, project_name) -> model, for machines built on the ESP32 SoC (the
/// P1/A1 family). ESP32 mainboards are shared across models, so project_name
/// is needed to tell them apart.
const ESP32_MODEL_MAP: &[(&str, &str, PrinterModel)] = &[
    ("AP04", "C11", PrinterModel::P1P),
    ("AP04", "C12", PrinterModel::P1S),
    ("AP05", "N1", PrinterModel::A1Mini),
    ("AP05", "N2S", PrinterModel::A1),
    ("AP07", "N1", PrinterModel::A1Mini),
];

#[derive(Debug, Clone, Default)]
pub struct PrinterVersion {
    pub cpu: PrinterCpu,
    pub model: PrinterModel,
    /// From the `ota` module's `sw_ver` — the version the updater reports,
    /// which is what's shown in the slicer's "printer info" panel.
    pub software_version: Option<String>,
    /// From the `mc` module's `sn` — the mainboard's own serial, which can
    /// differ from the printer's externally-printed serial.
    pub serial_number: Option<String>,
    /// From the mainboard module (`esp32`/`rv1126`)'s `hw_ver`.
    pub hardware_version: Option<String>,
    pub modules: Vec<(String, String)>,
    unknown_model_logged: bool,
}

impl PrinterVersion {
    /// Parse the `module` array of an `info`/`get_version` push. `ota` gives
    /// the software version, `mc` the mainboard serial, and the mainboard
    /// entry (`esp32` or `rv1126`) the CPU family, hardware version and
    /// model; every other module is recorded verbatim for diagnostics.
    pub fn on_update(&mut self, info: &Value) {
        let Some(modules) = info.get("module").and_then(Value::as_array) else {
            return;
        };

        self.modules.clear();
        for module in modules {
            let name = module.get("name").and_then(Value::as_str).unwrap_or("");
            let hw_ver = module.get("hw_ver").and_then(Value::as_str).unwrap_or("");
            self.modules.push((name.to_string(), hw_ver.to_string()));

            match name {
                "ota" => {
                    if let Some(sw_ver) = module.get("sw_ver").and_then(Value::as_str) {
                        self.software_version = Some(sw_ver.to_string());
                    }
                }
                "mc" => {
                    if let Some(sn) = module.get("sn").and_then(Value::as_str) {
                        self.serial_number = Some(sn.to_string());
                    }
                }
                "esp32" => {
                    self.cpu = PrinterCpu::Esp32;
                    self.hardware_version = Some(hw_ver.to_string());
                    let project_name = module
                        .get("project_name")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    self.model = Self::lookup_esp32(hw_ver, project_name);
                }
                "rv1126" => {
                    self.cpu = PrinterCpu::Rv1126;
                    self.hardware_version = Some(hw_ver.to_string());
                    self.model = Self::lookup_rv1126(hw_ver);
                }
                _ => {}
            }
        }

        if self.model == PrinterModel::Unknown && !self.unknown_model_logged {
            self.unknown_model_logged = true;
            warn!(cpu = ?self.cpu, "could not resolve printer model from module list");
        }
    }

    fn lookup_rv1126(hw_ver: &str) -> PrinterModel {
        RV1126_MODEL_MAP
            .iter()
            .find(|(prefix, _)| hw_ver.starts_with(prefix))
            .map(|(_, model)| *model)
            .unwrap_or(PrinterModel::Unknown)
    }

    fn lookup_esp32(hw_ver: &str, project_name: &str) -> PrinterModel {
        ESP32_MODEL_MAP
            .iter()
            .find(|(hw, project, _)| hw_ver.starts_with(hw) && project_name == *project)
            .map(|(_, _, model)| *model)
            .unwrap_or(PrinterModel::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esp32_mainboard_resolves_model_via_project_name() {
        let mut version = PrinterVersion::default();
        version.on_update(&serde_json::json!({
            "module": [
                {"name": "ota", "sw_ver": "01.08.00.00"},
                {"name": "mc", "sn": "01S00A000000000"},
                {"name": "esp32", "hw_ver": "AP05", "project_name": "N2S", "sw_ver": "01.08.00.00"},
                {"name": "ams", "hw_ver": "AMS01", "sw_ver": "00.00.06.26"},
            ]
        }));

        assert_eq!(version.cpu, PrinterCpu::Esp32);
        assert_eq!(version.model, PrinterModel::A1);
        assert_eq!(version.software_version.as_deref(), Some("01.08.00.00"));
        assert_eq!(version.serial_number.as_deref(), Some("01S00A000000000"));
        assert_eq!(version.hardware_version.as_deref(), Some("AP05"));
        assert_eq!(version.modules.len(), 4);
    }

    #[test]
    fn rv1126_mainboard_resolves_model_from_hw_ver_alone() {
        let mut version = PrinterVersion::default();
        version.on_update(&serde_json::json!({
            "module": [{"name": "rv1126", "hw_ver": "AP02", "sw_ver": "1.0"}]
        }));

        assert_eq!(version.cpu, PrinterCpu::Rv1126);
        assert_eq!(version.model, PrinterModel::X1E);
    }

    #[test]
    fn unrecognized_combination_is_unknown_model() {
        let mut version = PrinterVersion::default();
        version.on_update(&serde_json::json!({
            "module": [{"name": "esp32", "hw_ver": "AP04", "project_name": "ZZZ", "sw_ver": "1.0"}]
        }));

        assert_eq!(version.cpu, PrinterCpu::Esp32);
        assert_eq!(version.model, PrinterModel::Unknown);
    }
}
