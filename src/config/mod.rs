use std::error::Error;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use log::warn;

use crate::Result;

pub const DEFAULT_RESCALING_FREQUENCY: usize = 100;
pub const DEFAULT_EXTRA_BUFFER_COUNT: usize = 100;

/// Raised at set up time when the tree, the data and the models do not fit together.
pub struct ConfigurationError {
    pub(crate) message: String,
}

impl fmt::Debug for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ConfigurationError {}

/// When partial likelihoods get rescaled to avoid numerical underflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescalingScheme {
    /// Never rescale.
    None,
    /// Recompute scale factors on every evaluation.
    Always,
    /// Recompute scale factors periodically once scaling is in use.
    Dynamic,
    /// Recompute scale factors on every evaluation after the first underflow.
    Delayed,
    /// Leave scaling to the compute backend.
    Auto,
    /// Resolved to [`RescalingScheme::Dynamic`].
    Default,
}

impl fmt::Display for RescalingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RescalingScheme::None => "none",
            RescalingScheme::Always => "always",
            RescalingScheme::Dynamic => "dynamic",
            RescalingScheme::Delayed => "delayed",
            RescalingScheme::Auto => "auto",
            RescalingScheme::Default => "default",
        };
        write!(f, "{}", text)
    }
}

impl FromStr for RescalingScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_lowercase().as_str() {
            "none" => RescalingScheme::None,
            "always" => RescalingScheme::Always,
            "dynamic" => RescalingScheme::Dynamic,
            "delayed" => RescalingScheme::Delayed,
            "auto" => RescalingScheme::Auto,
            "default" => RescalingScheme::Default,
            _ => bail!(ConfigurationError {
                message: format!("Unknown rescaling scheme: {}", s)
            }),
        })
    }
}

/// Preferred compute resources, in order. Resource 0 is the CPU reference backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceSelection {
    pub preferred: Vec<usize>,
}

impl ResourceSelection {
    pub fn cpu() -> Self {
        ResourceSelection { preferred: vec![0] }
    }

    pub fn first(&self) -> usize {
        self.preferred.first().copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LikelihoodConfig {
    pub rescaling: RescalingScheme,
    pub rescaling_frequency: usize,
    pub delay_rescaling_until_underflow: bool,
    pub use_ambiguities: bool,
    pub resource: ResourceSelection,
    pub extra_buffer_count: usize,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        LikelihoodConfig {
            rescaling: RescalingScheme::Dynamic,
            rescaling_frequency: DEFAULT_RESCALING_FREQUENCY,
            delay_rescaling_until_underflow: true,
            use_ambiguities: false,
            resource: ResourceSelection::cpu(),
            extra_buffer_count: DEFAULT_EXTRA_BUFFER_COUNT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LikelihoodConfigBuilder {
    rescaling: Option<RescalingScheme>,
    rescaling_frequency: Option<usize>,
    delay_rescaling_until_underflow: Option<bool>,
    use_ambiguities: bool,
    resource: Option<ResourceSelection>,
    extra_buffer_count: Option<usize>,
}

impl LikelihoodConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rescaling(mut self, scheme: RescalingScheme) -> Self {
        self.rescaling = Some(scheme);
        self
    }

    pub fn rescaling_frequency(mut self, frequency: usize) -> Self {
        self.rescaling_frequency = Some(frequency);
        self
    }

    pub fn delay_rescaling_until_underflow(mut self, delay: bool) -> Self {
        self.delay_rescaling_until_underflow = Some(delay);
        self
    }

    pub fn use_ambiguities(mut self, use_ambiguities: bool) -> Self {
        self.use_ambiguities = use_ambiguities;
        self
    }

    pub fn resource(mut self, resource: ResourceSelection) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn extra_buffer_count(mut self, count: usize) -> Self {
        self.extra_buffer_count = Some(count);
        self
    }

    /// Resolves the defaults: `Default` becomes `Dynamic`, `Delayed` always delays rescaling
    /// until the first underflow and a frequency below one falls back to the default.
    pub fn build(self) -> LikelihoodConfig {
        let defaults = LikelihoodConfig::default();
        let rescaling = match self.rescaling.unwrap_or(defaults.rescaling) {
            RescalingScheme::Default => RescalingScheme::Dynamic,
            scheme => scheme,
        };
        let rescaling_frequency = match self.rescaling_frequency {
            Some(0) => {
                warn!(
                    "Rescaling frequency must be at least 1, using {} instead.",
                    DEFAULT_RESCALING_FREQUENCY
                );
                DEFAULT_RESCALING_FREQUENCY
            }
            Some(frequency) => frequency,
            None => defaults.rescaling_frequency,
        };
        let delay_rescaling_until_underflow = rescaling == RescalingScheme::Delayed
            || self
                .delay_rescaling_until_underflow
                .unwrap_or(defaults.delay_rescaling_until_underflow);
        let extra_buffer_count = match self.extra_buffer_count {
            Some(0) | None => defaults.extra_buffer_count,
            Some(count) => count,
        };
        LikelihoodConfig {
            rescaling,
            rescaling_frequency,
            delay_rescaling_until_underflow,
            use_ambiguities: self.use_ambiguities,
            resource: self.resource.unwrap_or(defaults.resource),
            extra_buffer_count,
        }
    }
}

#[cfg(test)]
mod tests;
