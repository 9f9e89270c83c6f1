mod tests;
mod logging_config;
pub mod config;

pub use config::{
    Config, ConfigError, PrinterConfig, RecognitionConfig, RegionConfig, ServerConfig,
    TagRuleConfig, UpstreamConfig,
};
pub use logging_config::LoggingConfig;

use clap::Parser;

/// Command line arguments of the print SCP.
#[derive(Debug, Parser)]
#[command(name = "printscp", about = "DICOM Basic Grayscale Print SCP with upstream relay")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "printscp.toml")]
    pub config: String,
}
