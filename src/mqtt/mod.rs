mod client;
pub mod wire;

pub use client::{
    BambuMqttClient, CommandReply, PrinterCommand, PrinterConfig, PrinterEvent, RediscoverFn,
};
