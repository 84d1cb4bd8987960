use std::path::Path;
use std::time::Duration;

use serde::{de, Deserialize, Deserializer};

use crate::{Result, ToeError};

/// Configuration of an [`OffloadManager`](crate::OffloadManager).
///
/// Durations are written in milliseconds when loaded from TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToeConfig {
    /// Number of entries in the connection table.
    pub max_connections: usize,
    /// Hardware channel of the first table entry. Lower channels belong to
    /// the host path.
    pub first_channel: u32,
    /// Shared dispatcher channel passed to `receive` and `reclaim_transmitted`.
    pub dma_channel: u32,
    /// Receive budget of a single dispatcher activation.
    pub rx_poll_budget: usize,
    /// Fixed receive charge per queued segment. `None` charges the payload length.
    pub rx_charge_per_segment: Option<usize>,

    /// Delay before a removed entry returns to the free list. `None` frees
    /// immediately.
    #[serde(deserialize_with = "opt_millis")]
    pub deferred_free: Option<Duration>,
    #[serde(deserialize_with = "millis")]
    pub rtt_sample_interval: Duration,
    #[serde(deserialize_with = "opt_millis")]
    pub persist_interval: Option<Duration>,
    #[serde(deserialize_with = "opt_millis")]
    pub keepalive_interval: Option<Duration>,

    pub max_mss: u16,
    pub window: WindowPolicyConfig,
}

impl Default for ToeConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            first_channel: 2,
            dma_channel: 0,
            rx_poll_budget: 64,
            rx_charge_per_segment: None,

            deferred_free: None,
            rtt_sample_interval: Duration::from_millis(100),
            persist_interval: Some(Duration::from_millis(200)),
            keepalive_interval: None,

            max_mss: 1460,
            window: WindowPolicyConfig::default(),
        }
    }
}

impl ToeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg = toml::from_str::<ToeConfig>(s).map_err(|e| {
            log::error!(target: "inet-toe/config", "error parsing configuration: {e}");
            ToeError::Config(e.to_string())
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|e| {
            log::error!(target: "inet-toe/config", "error reading {}: {e}", path.display());
            ToeError::Config(format!("{}: {e}", path.display()))
        })?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ToeError::Config("max_connections must be non-zero".into()));
        }
        if self.rx_poll_budget == 0 {
            return Err(ToeError::Config("rx_poll_budget must be non-zero".into()));
        }
        if self.first_channel.checked_add(self.max_connections as u32).is_none() {
            return Err(ToeError::Config("channel range overflows".into()));
        }
        self.window.validate()
    }
}

/// Occupancy thresholds of the receive window step function.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowPolicyConfig {
    /// Window ceiling as a multiple of the socket receive buffer.
    pub ceiling_multiplier: u32,
    /// Steps ordered by strictly descending ratio.
    pub steps: Vec<WindowStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowStep {
    /// Lower bound of occupancy / ceiling for this step.
    pub occupancy_ratio: f64,
    /// The advertised window is `rcvbuf / divisor`. Zero closes the window.
    pub divisor: u32,
}

impl WindowStep {
    pub const fn new(occupancy_ratio: f64, divisor: u32) -> Self {
        Self {
            occupancy_ratio,
            divisor,
        }
    }
}

impl Default for WindowPolicyConfig {
    fn default() -> Self {
        Self {
            ceiling_multiplier: 4,
            steps: vec![
                WindowStep::new(1.0, 0),
                WindowStep::new(0.5, 32),
                WindowStep::new(0.25, 8),
                WindowStep::new(0.125, 4),
            ],
        }
    }
}

impl WindowPolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ceiling_multiplier == 0 {
            return Err(ToeError::Config("ceiling_multiplier must be non-zero".into()));
        }
        if self.steps.is_empty() {
            return Err(ToeError::Config("window policy needs at least one step".into()));
        }
        for step in &self.steps {
            if !step.occupancy_ratio.is_finite() || step.occupancy_ratio <= 0.0 {
                return Err(ToeError::Config(format!(
                    "invalid occupancy ratio {}",
                    step.occupancy_ratio
                )));
            }
        }
        if self
            .steps
            .windows(2)
            .any(|w| w[0].occupancy_ratio <= w[1].occupancy_ratio)
        {
            return Err(ToeError::Config(
                "window steps must be sorted by descending occupancy ratio".into(),
            ));
        }
        Ok(())
    }
}

fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

fn opt_millis<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = Option::<u64>::deserialize(deserializer)?;
    match ms {
        Some(0) => Err(de::Error::custom("duration must be non-zero, omit the key to disable")),
        other => Ok(other.map(Duration::from_millis)),
    }
}
