//! Request options for profile downloads.

use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

/// Highest `debug` level the pprof handlers understand.
pub const MAX_DEBUG_LEVEL: u8 = 2;

/// A mutation of the outgoing profile request.
///
/// Options are applied in the order given; the first failure aborts the
/// download before any request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOption {
    /// Bound the sampling window. Sub-second durations leave the server
    /// default in place.
    Duration(Duration),
    /// Ask for the text rendering at the given level.
    Debug(u8),
    /// Run a garbage collection before taking a heap sample.
    GarbageCollect,
}

impl DownloadOption {
    /// Apply this option to a request URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOption` when a debug level exceeds
    /// [`MAX_DEBUG_LEVEL`]. The URL is left untouched in that case.
    pub fn apply(&self, url: &mut Url) -> Result<()> {
        match *self {
            Self::Duration(duration) => {
                let seconds = duration.as_secs();
                if seconds > 0 {
                    set_query_param(url, "seconds", &seconds.to_string());
                }
                Ok(())
            }
            Self::Debug(level) if level > MAX_DEBUG_LEVEL => Err(Error::invalid_option(
                "debug",
                format!("level {level} exceeds {MAX_DEBUG_LEVEL}"),
            )),
            Self::Debug(level) => {
                set_query_param(url, "debug", &level.to_string());
                Ok(())
            }
            Self::GarbageCollect => {
                set_query_param(url, "gc", "1");
                Ok(())
            }
        }
    }
}

/// Apply options in order, stopping at the first failure.
///
/// # Errors
///
/// Returns the first option's error. Options before it stay applied.
pub fn apply_options(url: &mut Url, options: &[DownloadOption]) -> Result<()> {
    options.iter().try_for_each(|option| option.apply(url))
}

/// Set a query parameter, replacing any existing value for the key.
fn set_query_param(url: &mut Url, key: &str, value: &str) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    pairs.extend_pairs(retained);
    pairs.append_pair(key, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> std::result::Result<Url, url::ParseError> {
        Url::parse("http://127.0.0.1:4000/debug/pprof/profile")
    }

    #[test]
    fn test_duration_zero_adds_nothing() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut url = base()?;
        DownloadOption::Duration(Duration::ZERO).apply(&mut url)?;
        assert_eq!(url.query(), None);
        Ok(())
    }

    #[test]
    fn test_duration_sets_whole_seconds() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut url = base()?;
        DownloadOption::Duration(Duration::from_secs(30)).apply(&mut url)?;
        assert_eq!(url.query(), Some("seconds=30"));

        let mut url = base()?;
        DownloadOption::Duration(Duration::from_secs(600)).apply(&mut url)?;
        assert_eq!(url.query(), Some("seconds=600"));
        Ok(())
    }

    #[test]
    fn test_sub_second_duration_adds_nothing() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let mut url = base()?;
        DownloadOption::Duration(Duration::from_millis(10)).apply(&mut url)?;
        assert_eq!(url.query(), None);
        Ok(())
    }

    #[test]
    fn test_repeated_key_replaces_value() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut url = base()?;
        apply_options(
            &mut url,
            &[
                DownloadOption::Duration(Duration::from_secs(5)),
                DownloadOption::GarbageCollect,
                DownloadOption::Duration(Duration::from_secs(7)),
            ],
        )?;
        assert_eq!(url.query(), Some("gc=1&seconds=7"));
        Ok(())
    }

    #[test]
    fn test_debug_level_bounds() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut url = base()?;
        DownloadOption::Debug(2).apply(&mut url)?;
        assert_eq!(url.query(), Some("debug=2"));

        let err = DownloadOption::Debug(3).apply(&mut url);
        assert!(matches!(err, Err(Error::InvalidOption { .. })));
        Ok(())
    }

    #[test]
    fn test_first_failure_stops_remaining_options()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut url = base()?;
        let result = apply_options(
            &mut url,
            &[
                DownloadOption::GarbageCollect,
                DownloadOption::Debug(9),
                DownloadOption::Duration(Duration::from_secs(30)),
            ],
        );
        assert!(result.is_err());
        // No rollback of options applied before the failure.
        assert_eq!(url.query(), Some("gc=1"));
        Ok(())
    }
}
