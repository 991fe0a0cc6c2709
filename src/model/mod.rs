mod stage;
mod state;
mod version;

pub use stage::{stage_description, WARMING_UP_STAGES};
pub use state::{GcodeState, PrintError, PrinterState};
pub use version::{PrinterCpu, PrinterModel, PrinterVersion};
