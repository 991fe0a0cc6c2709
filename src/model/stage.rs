//! `stage_current` -> human-readable sub-state, for the job-status surface.
//!
//! The printer reports a numeric micro-state underneath the coarser
//! `gcode_state`; this table is the full mapping we know of.

const STAGE_TABLE: &[(i64, &str)] = &[
    (1, "Auto Bed Leveling"),
    (2, "Heatbed Preheating"),
    (3, "Sweeping XY Mech Mode"),
    (4, "Changing Filament"),
    (5, "M400 Pause"),
    (6, "Paused due to Filament Runout"),
    (7, "Heating Hotend"),
    (8, "Calibrating Extrusion"),
    (9, "Scanning Bed Surface"),
    (10, "Inspecting First Layer"),
    (11, "Identifying Build Plate Type"),
    (12, "Calibrating Micro Lidar"),
    (13, "Homing Toolhead"),
    (14, "Cleaning Nozzle Tip"),
    (15, "Checking Extruder Temperature"),
    (16, "Paused by User"),
    (17, "Paused due to Front Cover Falling"),
    (18, "Calibrating Micro Lidar"),
    (19, "Calibrating Extrusion Flow"),
    (20, "Paused due to Nozzle Temperature Malfunction"),
    (21, "Paused due to Heatbed Temperature Malfunction"),
    (22, "Filament Unloading"),
    (23, "Paused due to Skipped Step"),
    (24, "Filament Loading"),
    (25, "Calibrating Motor Noise"),
    (26, "Paused due to AMS Lost"),
    (27, "Paused due to Low Speed of Heat Break Fan"),
    (28, "Paused due to Chamber Temperature Control Error"),
    (29, "Cooling Chamber"),
    (30, "Paused by the G-code Inserted by User"),
    (31, "Motor Noise Calibration"),
    (32, "Paused due to Nozzle Filament Covered Detected"),
    (33, "Paused due to Cutter Error"),
    (34, "Paused due to First Layer Error"),
    (35, "Paused due to Nozzle Clogging"),
];

/// `stage_current` codes that mean the printer is warming up rather than
/// actually printing yet, consulted by the job-status state mapping.
pub const WARMING_UP_STAGES: [i64; 2] = [2, 7];

pub fn stage_description(stage_current: i64) -> Option<&'static str> {
    STAGE_TABLE
        .iter()
        .find(|(code, _)| *code == stage_current)
        .map(|(_, desc)| *desc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_stage_resolves() {
        assert_eq!(stage_description(10), Some("Inspecting First Layer"));
    }

    #[test]
    fn unknown_stage_is_none() {
        assert_eq!(stage_description(999), None);
    }

    #[test]
    fn warming_up_stages_are_bed_and_nozzle_preheat() {
        assert_eq!(WARMING_UP_STAGES, [2, 7]);
    }
}
