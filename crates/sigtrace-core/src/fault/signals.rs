//! Fatal signals the fault handler can intercept.

use std::fmt;
use std::str::FromStr;

#[cfg(unix)]
use nix::sys::signal::{SigHandler, Signal};
use smallvec::SmallVec;

use crate::error::{BacktraceError, Result};

/// A fatal signal that can be routed through the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSignal
{
    Segv,
    Abrt,
    Fpe,
    Bus,
    Ill,
    Trap,
    Sys,
}

impl FaultSignal
{
    /// Every signal the handler supports, in canonical order.
    pub const ALL: [FaultSignal; 7] = [
        FaultSignal::Segv,
        FaultSignal::Abrt,
        FaultSignal::Fpe,
        FaultSignal::Bus,
        FaultSignal::Ill,
        FaultSignal::Trap,
        FaultSignal::Sys,
    ];

    /// Signals handled when no explicit list is given.
    pub const DEFAULTS: [FaultSignal; 4] = [FaultSignal::Segv, FaultSignal::Abrt, FaultSignal::Fpe, FaultSignal::Bus];

    pub const fn name(self) -> &'static str
    {
        match self {
            FaultSignal::Segv => "SIGSEGV",
            FaultSignal::Abrt => "SIGABRT",
            FaultSignal::Fpe => "SIGFPE",
            FaultSignal::Bus => "SIGBUS",
            FaultSignal::Ill => "SIGILL",
            FaultSignal::Trap => "SIGTRAP",
            FaultSignal::Sys => "SIGSYS",
        }
    }

    #[cfg(unix)]
    pub const fn signal(self) -> Signal
    {
        match self {
            FaultSignal::Segv => Signal::SIGSEGV,
            FaultSignal::Abrt => Signal::SIGABRT,
            FaultSignal::Fpe => Signal::SIGFPE,
            FaultSignal::Bus => Signal::SIGBUS,
            FaultSignal::Ill => Signal::SIGILL,
            FaultSignal::Trap => Signal::SIGTRAP,
            FaultSignal::Sys => Signal::SIGSYS,
        }
    }

    /// Signal number on this platform.
    #[cfg(unix)]
    pub fn number(self) -> i32
    {
        self.signal() as i32
    }

    /// Position in [`FaultSignal::ALL`].
    pub(crate) const fn slot(self) -> usize
    {
        self as usize
    }

    #[cfg(unix)]
    pub fn from_number(number: i32) -> Option<Self>
    {
        Self::ALL.into_iter().find(|signal| signal.number() == number)
    }

    /// Send this signal to the calling thread.
    #[cfg(unix)]
    pub fn raise(self) -> Result<()>
    {
        nix::sys::signal::raise(self.signal())?;
        Ok(())
    }

    /// Reset this signal to its default disposition.
    ///
    /// Call before arming the fault handler so that, once reported, the
    /// signal terminates the process instead of reaching a handler that may
    /// resume execution.
    #[cfg(unix)]
    pub fn reset_to_default(self) -> Result<()>
    {
        // SAFETY: installs SIG_DFL, which runs no code in this process
        unsafe { nix::sys::signal::signal(self.signal(), SigHandler::SigDfl) }?;
        Ok(())
    }
}

impl fmt::Display for FaultSignal
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

impl FromStr for FaultSignal
{
    type Err = BacktraceError;

    /// Accepts `SIGSEGV` as well as `SEGV`, in any case.
    fn from_str(value: &str) -> Result<Self>
    {
        let trimmed = value.trim();
        let upper = trimmed.to_ascii_uppercase();
        let name = if upper.starts_with("SIG") { upper } else { format!("SIG{upper}") };
        Self::ALL
            .into_iter()
            .find(|signal| signal.name() == name)
            .ok_or_else(|| BacktraceError::UnknownSignal(trimmed.to_string()))
    }
}

/// Ordered, duplicate-free set of fault signals, stored inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSet
{
    signals: SmallVec<[FaultSignal; 8]>,
}

impl SignalSet
{
    pub fn new() -> Self
    {
        Self {
            signals: SmallVec::new(),
        }
    }

    pub fn defaults() -> Self
    {
        FaultSignal::DEFAULTS.into_iter().collect()
    }

    pub fn all() -> Self
    {
        FaultSignal::ALL.into_iter().collect()
    }

    /// Parse a list of signal names. Fails on the first unknown name.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self>
    {
        names.iter().map(|name| name.as_ref().parse::<FaultSignal>()).collect()
    }

    /// Insert a signal, keeping first-insertion order. Returns `false` when it
    /// was already present.
    pub fn insert(&mut self, signal: FaultSignal) -> bool
    {
        if self.contains(signal) {
            return false;
        }
        self.signals.push(signal);
        true
    }

    pub fn contains(&self, signal: FaultSignal) -> bool
    {
        self.signals.contains(&signal)
    }

    pub fn len(&self) -> usize
    {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.signals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = FaultSignal> + '_
    {
        self.signals.iter().copied()
    }

    pub fn names(&self) -> Vec<&'static str>
    {
        self.iter().map(FaultSignal::name).collect()
    }
}

impl Default for SignalSet
{
    fn default() -> Self
    {
        Self::defaults()
    }
}

impl FromIterator<FaultSignal> for SignalSet
{
    fn from_iter<I: IntoIterator<Item = FaultSignal>>(iter: I) -> Self
    {
        let mut set = SignalSet::new();
        for signal in iter {
            set.insert(signal);
        }
        set
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_accepts_short_and_long_names()
    {
        assert_eq!("SIGSEGV".parse::<FaultSignal>().unwrap(), FaultSignal::Segv);
        assert_eq!("abrt".parse::<FaultSignal>().unwrap(), FaultSignal::Abrt);
        assert_eq!(" sigbus ".parse::<FaultSignal>().unwrap(), FaultSignal::Bus);
    }

    #[test]
    fn test_parse_rejects_unknown_names()
    {
        let err = "SIGUSR1".parse::<FaultSignal>().unwrap_err();
        assert!(matches!(err, BacktraceError::UnknownSignal(name) if name == "SIGUSR1"));
        assert!(SignalSet::parse(&["SIGSEGV", "SIGWINCH"]).is_err());
    }

    #[test]
    fn test_set_keeps_order_without_duplicates()
    {
        let set = SignalSet::parse(&["SIGFPE", "SIGSEGV", "SIGFPE", "segv"]).unwrap();
        assert_eq!(set.names(), vec!["SIGFPE", "SIGSEGV"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_defaults_are_a_subset_of_all()
    {
        let all = SignalSet::all();
        assert_eq!(all.len(), 7);
        assert!(SignalSet::defaults().iter().all(|signal| all.contains(signal)));
        assert_eq!(SignalSet::default().names(), vec!["SIGSEGV", "SIGABRT", "SIGFPE", "SIGBUS"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_numbers_round_trip()
    {
        for signal in FaultSignal::ALL {
            assert_eq!(FaultSignal::from_number(signal.number()), Some(signal));
            assert_eq!(FaultSignal::ALL[signal.slot()], signal);
        }
        assert_eq!(FaultSignal::Segv.number(), libc::SIGSEGV);
        assert_eq!(FaultSignal::from_number(libc::SIGUSR1), None);
    }
}
