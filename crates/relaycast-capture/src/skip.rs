//! Frame-skip bookkeeping for subscription capture.

/// Decides which captured frames are forwarded to hit a target rate.
///
/// Uses an error accumulator so that over any run the number of forwarded
/// frames is within one frame of `captured * target / source`.
#[derive(Debug, Clone)]
pub struct FrameSkipper {
    source_rate: u32,
    target_rate: u32,
    credit: u64,
}

impl FrameSkipper {
    /// Create a skipper for frames arriving at `source_rate`.
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            source_rate,
            target_rate,
            credit: 0,
        }
    }

    /// Updates the rates; the accumulator restarts.
    pub fn set_rates(&mut self, source_rate: u32, target_rate: u32) {
        if self.source_rate == source_rate && self.target_rate == target_rate {
            return;
        }
        self.source_rate = source_rate;
        self.target_rate = target_rate;
        self.credit = 0;
    }

    /// Source rate in frames per second.
    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    /// Target rate in frames per second.
    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Frames discarded between two forwarded frames, rounded down.
    ///
    /// `None` when nothing is forwarded.
    pub fn skip_threshold(&self) -> Option<u32> {
        if self.target_rate == 0 {
            return None;
        }
        Some((self.source_rate / self.target_rate).saturating_sub(1))
    }

    /// Records one captured frame and returns true if it must be forwarded.
    pub fn should_forward(&mut self) -> bool {
        if self.target_rate == 0 {
            return false;
        }
        if self.target_rate >= self.source_rate {
            return true;
        }

        self.credit += u64::from(self.target_rate);
        if self.credit >= u64::from(self.source_rate) {
            self.credit -= u64::from(self.source_rate);
            true
        } else {
            false
        }
    }
}
