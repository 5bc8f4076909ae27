//! Host settings: the resolved os/arch/toolchain values the core reads.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Arbitrary string settings handed to drivers alongside the host
/// triple; drivers interpret the keys.
pub type TargetSettings = BTreeMap<String, String>;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct HostSettings {
    pub os: String,
    pub arch: String,
    pub compiler: Option<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        HostSettings {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            compiler: None,
        }
    }
}

impl HostSettings {
    pub fn detect() -> Self {
        Self::default()
    }

    /// Apply overrides from a TOML document; absent keys keep their
    /// detected values.
    pub fn with_overrides(mut self, toml_text: &str) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Overrides {
            os: Option<String>,
            arch: Option<String>,
            compiler: Option<String>,
        }
        let overrides: Overrides = toml::from_str(toml_text)
            .map_err(|err| Error::Settings(err.to_string()))?;
        if let Some(os) = overrides.os {
            self.os = os;
        }
        if let Some(arch) = overrides.arch {
            self.arch = arch;
        }
        if let Some(compiler) = overrides.compiler {
            self.compiler = Some(compiler);
        }
        Ok(self)
    }

    /// Flatten into driver-facing settings.
    pub fn to_target_settings(&self) -> TargetSettings {
        let mut settings = TargetSettings::new();
        settings.insert("os".into(), self.os.clone());
        settings.insert("arch".into(), self.arch.clone());
        if let Some(compiler) = &self.compiler {
            settings.insert("compiler".into(), compiler.clone());
        }
        settings
    }
}
