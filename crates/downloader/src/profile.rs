//! Profile kinds served under `/debug/pprof/`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Path prefix of the remote profiling endpoints.
pub const PPROF_PATH_PREFIX: &str = "/debug/pprof/";

/// A diagnostic profile kind.
///
/// `Unknown` is a sentinel and never a valid request input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProfileType {
    #[default]
    Unknown,
    Heap,
    Cpu,
    Block,
    Trace,
    Allocations,
    Mutex,
    Goroutine,
    ThreadCreate,
}

impl ProfileType {
    /// Every requestable profile kind, in registry order.
    pub const ALL: [Self; 8] = [
        Self::Heap,
        Self::Cpu,
        Self::Block,
        Self::Trace,
        Self::Allocations,
        Self::Mutex,
        Self::Goroutine,
        Self::ThreadCreate,
    ];

    /// Map a registry index to a profile kind.
    ///
    /// Index 0 and anything out of range map to `Unknown`.
    pub fn from_index(index: i64) -> Self {
        usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(Self::Unknown)
    }

    /// Endpoint name under `/debug/pprof/`.
    pub const fn endpoint(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::Heap => Some("heap"),
            Self::Cpu => Some("profile"),
            Self::Block => Some("block"),
            Self::Trace => Some("trace"),
            Self::Allocations => Some("allocs"),
            Self::Mutex => Some("mutex"),
            Self::Goroutine => Some("goroutine"),
            Self::ThreadCreate => Some("threadcreate"),
        }
    }

    /// Full request path, or an error for `Unknown`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedProfile` for [`ProfileType::Unknown`].
    pub fn path(self) -> Result<String> {
        self.endpoint()
            .map(|endpoint| format!("{PPROF_PATH_PREFIX}{endpoint}"))
            .ok_or(Error::UnsupportedProfile { profile: self })
    }

    /// Command-line name of the kind.
    pub const fn flag_name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Heap => "heap",
            Self::Cpu => "cpu",
            Self::Block => "block",
            Self::Trace => "trace",
            Self::Allocations => "mem-allocs",
            Self::Mutex => "mutex",
            Self::Goroutine => "goroutine",
            Self::ThreadCreate => "thread-create",
        }
    }

    /// Whether the server samples over a window bounded by `seconds`.
    pub const fn supports_duration(self) -> bool {
        matches!(self, Self::Cpu | Self::Trace)
    }

    /// File extension conventionally used for saved profiles.
    pub const fn file_extension(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            _ => "pprof",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag_name())
    }
}

impl FromStr for ProfileType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.flag_name() == wanted || kind.endpoint() == Some(wanted.as_str()))
            .ok_or_else(|| Error::config_error(format!("unknown profile type '{s}'")))
    }
}
