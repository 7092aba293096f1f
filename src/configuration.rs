use std::fs::File;
use std::io::BufReader;

use serde::Deserialize;
use tracing::debug;

use crate::cde::cdeint::CdeintOptions;
use crate::cdeerror::{CdeError, CdeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    #[default]
    NaturalCubic,
    Linear,
    SmoothstepLinear,
}

/// Synthetic spiral data driven by the binary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpiralSettings {
    pub batch: usize,
    pub length: usize,
    pub hidden: usize,
    pub width: usize,
    pub path: PathKind,
    /// Every `missing_every`-th sample of channel 1 is dropped; 0 keeps all.
    pub missing_every: usize,
}

impl Default for SpiralSettings {
    fn default() -> Self {
        SpiralSettings {
            batch: 4,
            length: 32,
            hidden: 4,
            width: 16,
            path: PathKind::NaturalCubic,
            missing_every: 0,
        }
    }
}

impl SpiralSettings {
    fn validate(&self) -> CdeResult<()> {
        if self.batch == 0 || self.hidden == 0 || self.width == 0 {
            return Err(CdeError::invalid_option(
                "spiral",
                "batch, hidden and width must be positive",
            ));
        }
        if self.length < 4 {
            return Err(CdeError::invalid_option("spiral.length", "must be >= 4"));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigurationJsonProp {
    #[serde(default)]
    cdeint: CdeintOptions,
    #[serde(default)]
    spiral: SpiralSettings,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Configuration {
    options: CdeintOptions,
    spiral: SpiralSettings,
}

impl Configuration {
    pub fn new(options: CdeintOptions) -> Configuration {
        Configuration {
            options,
            spiral: SpiralSettings::default(),
        }
    }

    pub fn options(&self) -> &CdeintOptions {
        &self.options
    }

    pub fn spiral(&self) -> &SpiralSettings {
        &self.spiral
    }

    pub fn from_reader(file_path: &str) -> CdeResult<Configuration> {
        let file = File::open(file_path)?;
        let reader = BufReader::new(file);
        let json_prop: ConfigurationJsonProp = serde_json::from_reader(reader)?;
        debug!(file_path, "configuration loaded");
        Configuration::from_json_prop(json_prop)
    }

    pub fn from_json(json: &str) -> CdeResult<Configuration> {
        let json_prop: ConfigurationJsonProp = serde_json::from_str(json)?;
        Configuration::from_json_prop(json_prop)
    }

    fn from_json_prop(json_prop: ConfigurationJsonProp) -> CdeResult<Configuration> {
        json_prop.cdeint.validate()?;
        json_prop.spiral.validate()?;
        Ok(Configuration {
            options: json_prop.cdeint,
            spiral: json_prop.spiral,
        })
    }
}
