//! Runtime bootstrap: tracing subscriber and metric descriptions.

pub mod error;
pub mod telemetry;

use std::path::Path;

use crate::config::{self, Settings};

use self::error::InfraError;

/// Load settings and install the tracing subscriber they describe.
pub fn bootstrap(config_file: Option<&Path>) -> Result<Settings, InfraError> {
    let settings = config::load(config_file)?;
    telemetry::init(&settings.logging)?;
    Ok(settings)
}
