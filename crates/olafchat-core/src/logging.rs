//! Logging helpers that keep identifiers readable and key material out of
//! log output.

use std::fmt;

/// A wrapper that redacts its contents when displayed.
pub struct Redacted<T>(pub T);

impl<T: fmt::Display> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: fmt::Debug> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Shorten a fingerprint for log lines, keeping the first and last four
/// characters.
///
/// Full fingerprints are 44 characters of base64; log lines only need
/// enough to correlate events.
pub struct ShortFingerprint<'a>(pub &'a str);

impl<'a> fmt::Display for ShortFingerprint<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "{}", s)
        }
    }
}

impl<'a> fmt::Debug for ShortFingerprint<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Display a byte slice as its length only.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
