use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Named network-quality profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Reliable,
    Flaky,
    Unstable,
    Chaos,
}

impl Preset {
    /// `(drop_rate, max_delay_ms)`, `None` when injection is off.
    pub fn parameters(self) -> Option<(f64, u64)> {
        match self {
            Preset::Reliable => None,
            Preset::Flaky => Some((0.05, 200)),
            Preset::Unstable => Some((0.15, 500)),
            Preset::Chaos => Some((0.30, 1000)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown network preset: {0}")]
pub struct UnknownPreset(pub String);

impl FromStr for Preset {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RELIABLE" => Ok(Preset::Reliable),
            "FLAKY" => Ok(Preset::Flaky),
            "UNSTABLE" => Ok(Preset::Unstable),
            "CHAOS" => Ok(Preset::Chaos),
            other => Err(UnknownPreset(other.to_string())),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Preset::Reliable => "RELIABLE",
            Preset::Flaky => "FLAKY",
            Preset::Unstable => "UNSTABLE",
            Preset::Chaos => "CHAOS",
        };
        write!(f, "{}", name)
    }
}

/// Packet-drop and latency shim placed in front of outbound sends.
///
/// Settings live in atomics so the injector can be reconfigured while send
/// tasks are in flight. The drop rate is stored as the bit pattern of an `f64`.
#[derive(Debug, Default)]
pub struct FaultInjector {
    enabled: AtomicBool,
    drop_rate_bits: AtomicU64,
    max_delay_ms: AtomicU64,
}

static GLOBAL: OnceLock<Arc<FaultInjector>> = OnceLock::new();

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance. Components take an `Arc<FaultInjector>` so tests
    /// can hand them a private one instead.
    pub fn global() -> Arc<FaultInjector> {
        GLOBAL.get_or_init(|| Arc::new(FaultInjector::new())).clone()
    }

    pub fn enable(&self, drop_rate: f64, max_delay_ms: u64) {
        let drop_rate = if drop_rate.is_nan() {
            0.0
        } else {
            drop_rate.clamp(0.0, 1.0)
        };

        self.drop_rate_bits.store(drop_rate.to_bits(), Ordering::SeqCst);
        self.max_delay_ms.store(max_delay_ms, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);

        tracing::info!(
            "Fault injection enabled: drop_rate={:.2} max_delay={}ms",
            drop_rate,
            max_delay_ms
        );
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("Fault injection disabled");
    }

    pub fn set_preset(&self, preset: Preset) {
        match preset.parameters() {
            Some((drop_rate, max_delay_ms)) => self.enable(drop_rate, max_delay_ms),
            None => self.disable(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn drop_rate(&self) -> f64 {
        f64::from_bits(self.drop_rate_bits.load(Ordering::SeqCst))
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms.load(Ordering::SeqCst)
    }

    /// Bernoulli trial against the configured drop rate.
    pub fn should_drop(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        rand::thread_rng().gen_bool(self.drop_rate())
    }

    /// Uniform delay in `[0, max_delay_ms]`.
    pub fn sample_delay(&self) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }
        let max = self.max_delay_ms();
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Runs the drop trial, then sleeps for a sampled delay.
    /// Returns `false` when the message should be treated as lost.
    pub async fn simulate_send(&self, label: &str) -> bool {
        if self.should_drop() {
            tracing::debug!("[fault] dropped {}", label);
            return false;
        }

        let delay = self.sample_delay();
        if !delay.is_zero() {
            tracing::trace!("[fault] delaying {} by {:?}", label, delay);
            tokio::time::sleep(delay).await;
        }
        true
    }

    pub fn status(&self) -> String {
        if self.is_enabled() {
            format!(
                "ENABLED (drop={:.0}%, max_delay={}ms)",
                self.drop_rate() * 100.0,
                self.max_delay_ms()
            )
        } else {
            "DISABLED".to_string()
        }
    }
}
