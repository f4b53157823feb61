//! Capture method and adaptive capture rate.

use std::sync::atomic::{AtomicU32, Ordering};

use relaycast_capture::CaptureMethod;
use relaycast_ipc::{InstanceConfig, Tally, MAX_FRAME_RATE};

/// Tuning of the adaptive capture rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveRatePolicy {
    /// Rate kept while nobody is receiving.
    pub keepalive_rate: u32,

    /// Divisor applied to the configured rate while receivers are connected
    /// but not showing the stream.
    pub connected_divisor: u32,
}

impl Default for AdaptiveRatePolicy {
    fn default() -> Self {
        Self {
            keepalive_rate: 1,
            connected_divisor: 3,
        }
    }
}

/// Sinks that are running and able to take frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveOutputs {
    pub network: bool,
    pub encoder: bool,
}

/// Frames per second the instance should deliver.
///
/// Zero when nothing shows the frames and no live sink consumes them.
/// Tally-driven throttling only applies while the network sink runs.
pub fn target_rate(
    config: &InstanceConfig,
    live: LiveOutputs,
    tally: Tally,
    policy: &AdaptiveRatePolicy,
) -> u32 {
    if !config.display && !config.preview && !live.network && !live.encoder {
        return 0;
    }

    let rate = config.frame_rate;
    if !config.adaptive_rate || !live.network {
        return rate;
    }

    let keepalive = policy.keepalive_rate.min(rate);
    match tally {
        Tally::Unconnected => keepalive,
        Tally::Connected => (rate / policy.connected_divisor.max(1)).max(keepalive),
        Tally::Preview | Tally::Program => rate,
    }
}

/// Picks how the host delivers frames.
///
/// On-screen content can only be captured by subscription; off-screen content
/// is painted at the requested rate.
pub fn select_method(config: &InstanceConfig) -> CaptureMethod {
    if config.display {
        CaptureMethod::Subscription
    } else {
        CaptureMethod::Paint
    }
}

/// Paint rate requested from the host for a target rate.
pub fn paint_rate(target: u32) -> u32 {
    target.min(MAX_FRAME_RATE)
}

/// Source and target rate shared between the controller and the pipeline.
#[derive(Debug, Default)]
pub struct RateState {
    source: AtomicU32,
    target: AtomicU32,
}

impl RateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate at which the host produces frames.
    pub fn source(&self) -> u32 {
        self.source.load(Ordering::Acquire)
    }

    /// Rate at which frames are forwarded.
    pub fn target(&self) -> u32 {
        self.target.load(Ordering::Acquire)
    }

    pub fn store(&self, source: u32, target: u32) {
        self.source.store(source, Ordering::Release);
        self.target.store(target, Ordering::Release);
    }
}
