//! One-shot crash recovery for the encoder process.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use tracing::{debug, warn};

#[cfg(unix)]
const SIGNAL_ILLEGAL_INSTRUCTION: i32 = libc::SIGILL;
#[cfg(not(unix))]
const SIGNAL_ILLEGAL_INSTRUCTION: i32 = 4;

/// Windows exit code of a process killed by an illegal instruction.
const STATUS_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;

/// How the encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitKind {
    /// Classifies an exit status.
    pub fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return Self::Success;
        }
        if let Some(code) = status.code() {
            return Self::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }

        Self::Unknown
    }

    /// Returns true for the crash a CPU-incompatible encoder build produces.
    pub fn is_illegal_instruction(self) -> bool {
        match self {
            Self::Signal(signal) => signal == SIGNAL_ILLEGAL_INSTRUCTION,
            Self::Code(code) => code as u32 == STATUS_ILLEGAL_INSTRUCTION,
            Self::Success | Self::Unknown => false,
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("exit code 0"),
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Unknown => f.write_str("unknown status"),
        }
    }
}

/// What to do after the encoder exited unexpectedly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Relaunch with this binary.
    Restart(PathBuf),

    /// Give up; the message is shown to the user.
    Fatal(String),
}

/// Crash state of one encoder sink.
///
/// An illegal-instruction crash earns exactly one relaunch with an alternate
/// binary. Every other unexpected exit, and any second crash, is fatal.
#[derive(Debug, Clone)]
pub struct CrashSupervisor {
    binary: PathBuf,
    fallback_attempted: bool,
}

impl CrashSupervisor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            fallback_attempted: false,
        }
    }

    /// Binary the encoder is (re)launched with.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn fallback_attempted(&self) -> bool {
        self.fallback_attempted
    }

    /// Decides how to react to an unexpected exit.
    ///
    /// `locate` is asked for an alternate binary at most once per sink.
    pub fn on_unexpected_exit<F>(&mut self, exit: ExitKind, locate: F) -> RecoveryAction
    where
        F: FnOnce(&Path) -> Option<PathBuf>,
    {
        if !exit.is_illegal_instruction() {
            return RecoveryAction::Fatal(format!("encoder exited unexpectedly ({exit})"));
        }
        if self.fallback_attempted {
            return RecoveryAction::Fatal(format!(
                "encoder {} crashed with an illegal instruction ({exit}) after fallback",
                self.binary.display()
            ));
        }

        self.fallback_attempted = true;
        match locate(&self.binary) {
            Some(alternate) if alternate != self.binary => {
                warn!(
                    "Encoder {} crashed ({}), falling back to {}",
                    self.binary.display(),
                    exit,
                    alternate.display()
                );
                self.binary = alternate.clone();
                RecoveryAction::Restart(alternate)
            }
            _ => RecoveryAction::Fatal(format!(
                "encoder {} crashed with an illegal instruction ({exit}) and no alternate encoder was found",
                self.binary.display()
            )),
        }
    }
}

/// Finds another installed binary of the same name on the search path.
pub fn locate_alternate(current: &Path) -> Option<PathBuf> {
    let name = current.file_name()?;
    let resolved = which::which(current)
        .ok()
        .and_then(|p| p.canonicalize().ok())
        .or_else(|| current.canonicalize().ok());

    let candidates = which::which_all(name).ok()?;
    for candidate in candidates {
        let canonical = candidate.canonicalize().unwrap_or_else(|_| candidate.clone());
        if Some(&canonical) != resolved.as_ref() {
            debug!("Alternate encoder candidate: {}", candidate.display());
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const SIGILL: ExitKind = ExitKind::Signal(SIGNAL_ILLEGAL_INSTRUCTION);

    #[test]
    fn test_one_restart_then_fatal() {
        let mut supervisor = CrashSupervisor::new("/opt/bundled/ffmpeg");
        let lookups = Cell::new(0);
        let locate = |_: &Path| {
            lookups.set(lookups.get() + 1);
            Some(PathBuf::from("/usr/bin/ffmpeg"))
        };

        assert_eq!(
            supervisor.on_unexpected_exit(SIGILL, locate),
            RecoveryAction::Restart(PathBuf::from("/usr/bin/ffmpeg"))
        );
        assert!(supervisor.fallback_attempted());
        assert_eq!(supervisor.binary(), Path::new("/usr/bin/ffmpeg"));

        let second = supervisor.on_unexpected_exit(SIGILL, locate);
        assert!(matches!(second, RecoveryAction::Fatal(_)));
        assert_eq!(lookups.get(), 1);
    }

    #[test]
    fn test_missing_alternate_is_fatal() {
        let mut supervisor = CrashSupervisor::new("ffmpeg");
        assert!(matches!(
            supervisor.on_unexpected_exit(SIGILL, |_| None),
            RecoveryAction::Fatal(_)
        ));

        // The single attempt is spent even though nothing was found.
        assert!(matches!(
            supervisor.on_unexpected_exit(SIGILL, |_| Some(PathBuf::from("/usr/bin/ffmpeg"))),
            RecoveryAction::Fatal(_)
        ));
    }

    #[test]
    fn test_same_binary_is_not_an_alternate() {
        let mut supervisor = CrashSupervisor::new("/usr/bin/ffmpeg");
        assert!(matches!(
            supervisor.on_unexpected_exit(SIGILL, |p| Some(p.to_path_buf())),
            RecoveryAction::Fatal(_)
        ));
    }

    #[test]
    fn test_other_exits_are_fatal_without_lookup() {
        let mut supervisor = CrashSupervisor::new("ffmpeg");
        for exit in [ExitKind::Success, ExitKind::Code(1), ExitKind::Signal(9), ExitKind::Unknown] {
            let action = supervisor.on_unexpected_exit(exit, |_| panic!("no lookup expected"));
            assert!(matches!(action, RecoveryAction::Fatal(_)));
        }
        assert!(!supervisor.fallback_attempted());
    }

    #[test]
    fn test_windows_illegal_instruction_code() {
        assert!(ExitKind::Code(0xC000_001Du32 as i32).is_illegal_instruction());
        assert!(!ExitKind::Code(1).is_illegal_instruction());
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_kind_from_status() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(0)), ExitKind::Success);
        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(1 << 8)), ExitKind::Code(1));
        assert_eq!(ExitKind::from_status(ExitStatus::from_raw(libc::SIGILL)), SIGILL);
    }
}
