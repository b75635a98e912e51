//! Bounded, non-allocating status/error types and decode/encode option bitflags.
//!
//! The hot decode/encode paths never allocate on the success path and never
//! allocate to report failure either: [`Status`] stores its message inline in
//! a fixed-size buffer, the same contract `hpb_Status` makes in the original
//! source (127 bytes, no heap allocation).

use core::fmt;

/// Maximum inline message length, matching the original `hpb_Status` bound.
pub const STATUS_MAX_MESSAGE: usize = 127;

/// A bounded, stack-only status message.
///
/// Never allocates. Longer messages are truncated at [`STATUS_MAX_MESSAGE`]
/// bytes; this is a diagnostic aid, not a data channel, so truncation is
/// silent.
#[derive(Clone, Copy)]
pub struct Status {
    len: u8,
    buf: [u8; STATUS_MAX_MESSAGE],
}

impl Status {
    pub const fn ok() -> Self {
        Status {
            len: 0,
            buf: [0; STATUS_MAX_MESSAGE],
        }
    }

    pub fn new(msg: &str) -> Self {
        let mut buf = [0u8; STATUS_MAX_MESSAGE];
        let bytes = msg.as_bytes();
        let n = bytes.len().min(STATUS_MAX_MESSAGE);
        buf[..n].copy_from_slice(&bytes[..n]);
        Status { len: n as u8, buf }
    }

    pub fn message(&self) -> &str {
        // Safety: we only ever copy valid UTF-8 in from `&str` in `new`.
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }

    pub fn is_ok(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Status").field(&self.message()).finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::ok()
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Status {}

/// Outcome of a call to [`crate::decode::decode_message`].
///
/// `MissingRequired` and `UnlinkedSubMessage` are "semantic but recoverable":
/// the message was populated as far as it could be and the status is purely
/// advisory, per §7 of the design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    Malformed,
    OutOfMemory,
    BadUtf8,
    MaxDepthExceeded,
    MissingRequired,
    UnlinkedSubMessage,
}

impl DecodeStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, DecodeStatus::Ok)
    }

    /// True for statuses where the message was nonetheless fully populated.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            DecodeStatus::Ok | DecodeStatus::MissingRequired | DecodeStatus::UnlinkedSubMessage
        )
    }
}

impl fmt::Display for DecodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecodeStatus::Ok => "ok",
            DecodeStatus::Malformed => "malformed input",
            DecodeStatus::OutOfMemory => "out of memory",
            DecodeStatus::BadUtf8 => "invalid utf-8 in string field",
            DecodeStatus::MaxDepthExceeded => "maximum recursion depth exceeded",
            DecodeStatus::MissingRequired => "missing required field(s)",
            DecodeStatus::UnlinkedSubMessage => "unlinked sub-message",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeStatus {}

/// Outcome of a call to [`crate::encode::encode_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    Ok,
    OutOfMemory,
    MaxDepthExceeded,
    MissingRequired,
}

impl EncodeStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, EncodeStatus::Ok)
    }
}

impl fmt::Display for EncodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncodeStatus::Ok => "ok",
            EncodeStatus::OutOfMemory => "out of memory",
            EncodeStatus::MaxDepthExceeded => "maximum recursion depth exceeded",
            EncodeStatus::MissingRequired => "missing required field(s)",
        };
        f.write_str(s)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EncodeStatus {}

/// `?`-friendly conversion from the bounded status enums to `anyhow::Error`,
/// for application code that wants one error type across decode/encode/IO
/// rather than matching on [`DecodeStatus`]/[`EncodeStatus`] everywhere.
#[cfg(feature = "std")]
pub trait StatusExt: Sized {
    fn into_result(self) -> anyhow::Result<()>;
}

#[cfg(feature = "std")]
impl StatusExt for DecodeStatus {
    fn into_result(self) -> anyhow::Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(anyhow::Error::new(self))
        }
    }
}

#[cfg(feature = "std")]
impl StatusExt for EncodeStatus {
    fn into_result(self) -> anyhow::Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(anyhow::Error::new(self))
        }
    }
}

const DEFAULT_MAX_DEPTH: u32 = 100;

/// Decode option bits (§6): low 16 bits are flags, high 16 bits are the max
/// recursion depth (0 means "use the default of 100").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions(u32);

impl DecodeOptions {
    pub const ALIAS_STRING: u32 = 1 << 0;
    pub const CHECK_REQUIRED: u32 = 1 << 1;
    pub const EXPERIMENTAL_ALLOW_UNLINKED: u32 = 1 << 2;

    pub const fn new() -> Self {
        DecodeOptions(0)
    }

    #[must_use]
    pub const fn with_alias_string(mut self) -> Self {
        self.0 |= Self::ALIAS_STRING;
        self
    }

    #[must_use]
    pub const fn with_check_required(mut self) -> Self {
        self.0 |= Self::CHECK_REQUIRED;
        self
    }

    #[must_use]
    pub const fn with_allow_unlinked(mut self) -> Self {
        self.0 |= Self::EXPERIMENTAL_ALLOW_UNLINKED;
        self
    }

    #[must_use]
    pub const fn with_max_depth(mut self, depth: u16) -> Self {
        self.0 = (self.0 & 0xffff) | ((depth as u32) << 16);
        self
    }

    pub const fn alias_string(self) -> bool {
        self.0 & Self::ALIAS_STRING != 0
    }

    pub const fn check_required(self) -> bool {
        self.0 & Self::CHECK_REQUIRED != 0
    }

    pub const fn allow_unlinked(self) -> bool {
        self.0 & Self::EXPERIMENTAL_ALLOW_UNLINKED != 0
    }

    pub const fn max_depth(self) -> u32 {
        let d = self.0 >> 16;
        if d == 0 { DEFAULT_MAX_DEPTH } else { d }
    }
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode option bits (§6), mirroring [`DecodeOptions`]'s flag/depth split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions(u32);

impl EncodeOptions {
    pub const DETERMINISTIC: u32 = 1 << 0;
    pub const SKIP_UNKNOWN: u32 = 1 << 1;
    pub const CHECK_REQUIRED: u32 = 1 << 2;

    pub const fn new() -> Self {
        EncodeOptions(0)
    }

    #[must_use]
    pub const fn with_deterministic(mut self) -> Self {
        self.0 |= Self::DETERMINISTIC;
        self
    }

    #[must_use]
    pub const fn with_skip_unknown(mut self) -> Self {
        self.0 |= Self::SKIP_UNKNOWN;
        self
    }

    #[must_use]
    pub const fn with_check_required(mut self) -> Self {
        self.0 |= Self::CHECK_REQUIRED;
        self
    }

    #[must_use]
    pub const fn with_max_depth(mut self, depth: u16) -> Self {
        self.0 = (self.0 & 0xffff) | ((depth as u32) << 16);
        self
    }

    pub const fn deterministic(self) -> bool {
        self.0 & Self::DETERMINISTIC != 0
    }

    pub const fn skip_unknown(self) -> bool {
        self.0 & Self::SKIP_UNKNOWN != 0
    }

    pub const fn check_required(self) -> bool {
        self.0 & Self::CHECK_REQUIRED != 0
    }

    pub const fn max_depth(self) -> u32 {
        let d = self.0 >> 16;
        if d == 0 { DEFAULT_MAX_DEPTH } else { d }
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_truncates_long_messages() {
        let long = "x".repeat(500);
        let s = Status::new(&long);
        assert_eq!(s.message().len(), STATUS_MAX_MESSAGE);
    }

    #[test]
    fn decode_options_default_depth() {
        let o = DecodeOptions::new();
        assert_eq!(o.max_depth(), 100);
        let o = o.with_max_depth(5);
        assert_eq!(o.max_depth(), 5);
        assert!(!o.alias_string());
        let o = o.with_alias_string();
        assert!(o.alias_string());
        assert_eq!(o.max_depth(), 5);
    }

    #[test]
    fn encode_options_bits_independent() {
        let o = EncodeOptions::new()
            .with_deterministic()
            .with_check_required();
        assert!(o.deterministic());
        assert!(o.check_required());
        assert!(!o.skip_unknown());
    }

    #[cfg(feature = "std")]
    #[test]
    fn status_ext_converts_to_anyhow() {
        assert!(DecodeStatus::Ok.into_result().is_ok());
        let err = DecodeStatus::Malformed.into_result().unwrap_err();
        assert_eq!(err.to_string(), "malformed input");

        assert!(EncodeStatus::Ok.into_result().is_ok());
        let err = EncodeStatus::OutOfMemory.into_result().unwrap_err();
        assert_eq!(err.to_string(), "out of memory");
    }
}
