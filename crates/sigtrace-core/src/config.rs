//! # Fault Handler Configuration
//!
//! Built in code with the builder methods, or read from the environment:
//!
//! | Variable               | Meaning                                         |
//! |------------------------|-------------------------------------------------|
//! | `SIGTRACE_SIGNALS`     | Comma-separated signal names (`SIGSEGV,SIGBUS`) |
//! | `SIGTRACE_REPORT_PATH` | File that crash reports are appended to         |
//! | `SIGTRACE_ALT_STACK`   | `1` to run the handler on an alternate stack    |

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{BacktraceError, Result};
use crate::fault::{FaultSignal, SignalSet};

pub const SIGNALS_ENV: &str = "SIGTRACE_SIGNALS";
pub const REPORT_PATH_ENV: &str = "SIGTRACE_REPORT_PATH";
pub const ALT_STACK_ENV: &str = "SIGTRACE_ALT_STACK";

/// What the fault handler intercepts and where reports go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultHandlerConfig
{
    pub signals: SignalSet,
    /// Reports are appended here in addition to stderr
    pub report_path: Option<PathBuf>,
    /// Run the handler on a dedicated stack so stack overflows can be reported
    pub use_alt_stack: bool,
}

impl Default for FaultHandlerConfig
{
    fn default() -> Self
    {
        Self {
            signals: SignalSet::defaults(),
            report_path: None,
            use_alt_stack: true,
        }
    }
}

impl FaultHandlerConfig
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn with_signals(mut self, signals: SignalSet) -> Self
    {
        self.signals = signals;
        self
    }

    /// Replace the signal set with the named signals.
    pub fn with_signal_names<S: AsRef<str>>(self, names: &[S]) -> Result<Self>
    {
        Ok(self.with_signals(SignalSet::parse(names)?))
    }

    pub fn with_signal(mut self, signal: FaultSignal) -> Self
    {
        self.signals.insert(signal);
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self
    {
        self.report_path = Some(path.into());
        self
    }

    pub fn with_alt_stack(mut self, enabled: bool) -> Self
    {
        self.use_alt_stack = enabled;
        self
    }

    pub fn report_path(&self) -> Option<&Path>
    {
        self.report_path.as_deref()
    }

    /// Defaults overridden by the `SIGTRACE_*` environment variables.
    ///
    /// ## Errors
    ///
    /// [`BacktraceError::UnknownSignal`] when `SIGTRACE_SIGNALS` names an
    /// unsupported signal.
    pub fn from_env() -> Result<Self>
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self>
    {
        let mut config = Self::default();

        if let Some(value) = lookup(SIGNALS_ENV) {
            let names: Vec<&str> = value.split(',').map(str::trim).filter(|name| !name.is_empty()).collect();
            if !names.is_empty() {
                config.signals = SignalSet::parse(&names)?;
            }
        }

        if let Some(path) = lookup(REPORT_PATH_ENV).filter(|path| !path.is_empty()) {
            config.report_path = Some(PathBuf::from(path));
        }

        if let Some(value) = lookup(ALT_STACK_ENV) {
            config.use_alt_stack = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(BacktraceError::Initialization(format!(
                        "invalid {ALT_STACK_ENV} value: {other}"
                    )))
                }
            };
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>
    {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults()
    {
        let config = FaultHandlerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, FaultHandlerConfig::default());
        assert_eq!(config.signals.names(), vec!["SIGSEGV", "SIGABRT", "SIGFPE", "SIGBUS"]);
        assert!(config.report_path().is_none());
        assert!(config.use_alt_stack);
    }

    #[test]
    fn test_environment_overrides()
    {
        let config = FaultHandlerConfig::from_lookup(lookup(&[
            (SIGNALS_ENV, "SIGILL, sigtrap,,"),
            (REPORT_PATH_ENV, "/tmp/crash.log"),
            (ALT_STACK_ENV, "0"),
        ]))
        .unwrap();

        assert_eq!(config.signals.names(), vec!["SIGILL", "SIGTRAP"]);
        assert_eq!(config.report_path(), Some(Path::new("/tmp/crash.log")));
        assert!(!config.use_alt_stack);
    }

    #[test]
    fn test_environment_rejects_bad_values()
    {
        let err = FaultHandlerConfig::from_lookup(lookup(&[(SIGNALS_ENV, "SIGSEGV,SIGHUP")])).unwrap_err();
        assert!(matches!(err, BacktraceError::UnknownSignal(name) if name == "SIGHUP"));

        assert!(FaultHandlerConfig::from_lookup(lookup(&[(ALT_STACK_ENV, "maybe")])).is_err());
    }

    #[test]
    fn test_builder()
    {
        let config = FaultHandlerConfig::new()
            .with_signals(SignalSet::new())
            .with_signal(FaultSignal::Bus)
            .with_signal(FaultSignal::Bus)
            .with_report_path("/var/tmp/report")
            .with_alt_stack(false);

        assert_eq!(config.signals.names(), vec!["SIGBUS"]);
        assert_eq!(config.report_path(), Some(Path::new("/var/tmp/report")));
        assert!(!config.use_alt_stack);
    }
}
