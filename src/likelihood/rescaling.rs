use log::{info, warn};

use crate::config::{LikelihoodConfig, RescalingScheme};

/// Number of consecutive evaluations that recompute scale factors in each dynamic period.
pub const RESCALE_TIMES: usize = 1;
const UNDERFLOW_MESSAGE_INTERVAL: usize = 1000;

/// How the current evaluation uses scale factors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scaling {
    pub use_scale_factors: bool,
    pub recompute: bool,
    pub auto: bool,
}

/// Decides when partials get rescaled and whether an underflowing evaluation is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RescalingController {
    scheme: RescalingScheme,
    frequency: usize,
    delay_until_underflow: bool,
    ever_underflowed: bool,
    use_scale_factors: bool,
    recompute: bool,
    use_auto_scaling: bool,
    count: usize,
    count_inner: usize,
    underflow_messages: usize,
}

impl RescalingController {
    pub fn new(config: &LikelihoodConfig, backend_auto_scaling: bool) -> Self {
        let mut scheme = match config.rescaling {
            RescalingScheme::Default => RescalingScheme::Dynamic,
            scheme => scheme,
        };
        let mut use_auto_scaling = false;
        if scheme == RescalingScheme::Auto {
            if backend_auto_scaling {
                use_auto_scaling = true;
            } else {
                warn!("Compute backend has no automatic scaling, using dynamic rescaling instead.");
                scheme = RescalingScheme::Dynamic;
            }
        }
        RescalingController {
            scheme,
            frequency: config.rescaling_frequency.max(1),
            delay_until_underflow: config.delay_rescaling_until_underflow
                || scheme == RescalingScheme::Delayed,
            ever_underflowed: false,
            use_scale_factors: false,
            recompute: false,
            use_auto_scaling,
            count: 0,
            count_inner: 0,
            underflow_messages: 0,
        }
    }

    pub fn scheme(&self) -> RescalingScheme {
        self.scheme
    }

    pub fn frequency(&self) -> usize {
        self.frequency
    }

    pub fn delays_until_underflow(&self) -> bool {
        self.delay_until_underflow
    }

    pub fn ever_underflowed(&self) -> bool {
        self.ever_underflowed
    }

    pub fn scaling(&self) -> Scaling {
        Scaling {
            use_scale_factors: self.use_scale_factors,
            recompute: self.recompute,
            auto: self.use_auto_scaling,
        }
    }

    /// Sets up scaling for a new evaluation. Returns true when every partial has to be
    /// recomputed because the scale factors are renewed across the whole tree.
    pub fn begin_evaluation(&mut self) -> bool {
        self.recompute = false;
        let mut invalidate_all = false;
        if !self.delay_until_underflow || self.ever_underflowed {
            match self.scheme {
                RescalingScheme::Always | RescalingScheme::Delayed => {
                    self.use_scale_factors = true;
                    self.recompute = true;
                }
                RescalingScheme::Dynamic => {
                    self.use_scale_factors = true;
                    if self.count > self.frequency {
                        self.count = 0;
                        self.count_inner = 0;
                    }
                    if self.count_inner < RESCALE_TIMES {
                        self.recompute = true;
                        invalidate_all = true;
                        self.count_inner += 1;
                    }
                    self.count += 1;
                }
                _ => {}
            }
        }
        invalidate_all
    }

    /// Records a non-finite log-likelihood. Returns true when the evaluation should be run
    /// again with freshly computed scale factors.
    pub fn underflow(&mut self, first_attempt: bool) -> bool {
        self.ever_underflowed = true;
        let retry = first_attempt
            && match self.scheme {
                RescalingScheme::Dynamic | RescalingScheme::Delayed => true,
                RescalingScheme::Always => self.delay_until_underflow,
                _ => false,
            };
        if !retry {
            return false;
        }
        if self.underflow_messages % UNDERFLOW_MESSAGE_INTERVAL == 0 {
            if self.underflow_messages > 0 {
                info!(
                    "Underflow calculating likelihood ({} messages not shown).",
                    self.underflow_messages
                );
            } else {
                info!("Underflow calculating likelihood. Attempting a rescaling...");
            }
        }
        self.underflow_messages += 1;
        self.use_scale_factors = true;
        self.recompute = true;
        true
    }
}

impl std::fmt::Display for RescalingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scheme {
            RescalingScheme::None => write!(f, "no rescaling"),
            RescalingScheme::Dynamic => write!(
                f,
                "dynamic rescaling (every {} evaluations{})",
                self.frequency,
                if self.delay_until_underflow {
                    ", delayed until first underflow"
                } else {
                    ""
                }
            ),
            RescalingScheme::Auto => write!(f, "automatic rescaling by the backend"),
            scheme => write!(
                f,
                "{} rescaling{}",
                scheme,
                if self.delay_until_underflow {
                    " (delayed until first underflow)"
                } else {
                    ""
                }
            ),
        }
    }
}
