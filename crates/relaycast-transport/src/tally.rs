//! Tally derivation.

use relaycast_ipc::Tally;

/// Raw presence information read from the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TallyFlags {
    pub connections: u32,
    pub program: bool,
    pub preview: bool,
}

impl TallyFlags {
    pub fn new(connections: u32, program: bool, preview: bool) -> Self {
        Self {
            connections,
            program,
            preview,
        }
    }

    /// Tally by priority: program, preview, connected, unconnected.
    pub fn tally(self) -> Tally {
        Tally::from_flags(self.connections, self.program, self.preview)
    }
}

/// Tracks the tally and reports transitions only.
#[derive(Debug, Clone, Default)]
pub struct TallyTracker {
    current: Tally,
}

impl TallyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Tally {
        self.current
    }

    /// Feeds a poll result; returns the new tally if it changed.
    pub fn update(&mut self, flags: TallyFlags) -> Option<Tally> {
        let next = flags.tally();
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_sequence() {
        let mut tracker = TallyTracker::new();
        let polls = [
            TallyFlags::new(0, false, false),
            TallyFlags::new(1, false, false),
            TallyFlags::new(1, false, true),
            TallyFlags::new(1, true, false),
        ];

        let changes: Vec<Tally> = polls.iter().filter_map(|f| tracker.update(*f)).collect();
        assert_eq!(
            changes,
            vec![Tally::Connected, Tally::Preview, Tally::Program]
        );
        assert_eq!(tracker.current(), Tally::Program);
    }

    #[test]
    fn test_repeated_polls_notify_once() {
        let mut tracker = TallyTracker::new();
        let flags = TallyFlags::new(3, false, true);
        assert_eq!(tracker.update(flags), Some(Tally::Preview));
        assert_eq!(tracker.update(flags), None);
        assert_eq!(tracker.update(TallyFlags::new(2, false, true)), None);
        assert_eq!(tracker.update(TallyFlags::default()), Some(Tally::Unconnected));
    }
}
