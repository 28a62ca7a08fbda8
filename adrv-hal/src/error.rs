use std::ops::Range;

use tracing::warn;

/// What the caller should do to get the device back into a known-good state
/// after an [`Error`].
///
/// Every error maps to exactly one action through
/// [`Error::recovery_action`]. The variants are ordered by severity, so the
/// more drastic of two actions can be picked with [`Ord::max`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecoveryAction {
    /// An argument or input file was bad. Fix it and call again; the device
    /// has not been disturbed.
    CheckParam,
    /// The register interface was left in an odd mode (e.g. SPI streaming).
    /// Reset the interface before issuing further register traffic.
    ResetInterface,
    /// A co-processor feature reported a failure. Re-initialize that
    /// feature (calibration, DSP block) before using it again.
    ResetFeature,
    /// The device is in an unknown state. Reset and re-initialize it.
    ResetDevice,
}

impl core::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CheckParam => f.write_str("check parameters"),
            Self::ResetInterface => f.write_str("reset interface"),
            Self::ResetFeature => f.write_str("reset feature"),
            Self::ResetDevice => f.write_str("reset device"),
        }
    }
}

/// An error from operating the transceiver.
///
/// Errors fall in a handful of groups:
///
/// - `Io` means a host file operation failed. Nothing was sent to the device
///   unless the error came out of a dump or image load after streaming began.
/// - `AddressRange`, `ValueRange`, `InvalidParameter` and `State` mean the
///   arguments to a function, or the order of calls, were wrong.
/// - `FileSize`, `Checksum`, `BadMagic`, `FormatRevision`, `GainTableFormat`,
///   `GainTableOrder` and `ProfileField` mean an input file was malformed.
/// - `Firmware`, `LookupTableRejected` and `CpuException` come from the
///   on-chip processors.
/// - `Timeout` means a bounded poll ran out of attempts.
/// - `Interface` and `ReturnData` mean the register interface failed or
///   returned nonsense.
///
/// Use [`Error::recovery_action`] to decide how to recover.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying OS I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The provided address is out of range.
    #[error("Address (0x{addr:x}) out of range (0x{:x}..0x{:x})", .range.start, .range.end)]
    #[allow(missing_docs)]
    AddressRange { range: Range<u32>, addr: u32 },

    /// The provided argument value is out of range.
    #[error("Value ({val}) out of range ({}..{})", .range.start, .range.end)]
    #[allow(missing_docs)]
    ValueRange { range: Range<u32>, val: u32 },

    /// Some argument to a function is invalid in a way not easily expressed as
    /// a range.
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(&'static str),

    /// The operation isn't allowed in the device's current state.
    #[error("Invalid state: {0}")]
    State(&'static str),

    /// A binary file has the wrong size.
    #[error("{what}: size {size} rejected, {reason}")]
    #[allow(missing_docs)]
    FileSize {
        what: &'static str,
        size: u64,
        reason: &'static str,
    },

    /// A checksum didn't match.
    #[error("{what}: checksum mismatch (expected 0x{expected:08x}, got 0x{actual:08x})")]
    #[allow(missing_docs)]
    Checksum {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    /// A file's magic number is wrong.
    #[error("Bad magic number (expected 0x{expected:08x}, got 0x{actual:08x})")]
    #[allow(missing_docs)]
    BadMagic { expected: u32, actual: u32 },

    /// A file's format revision isn't supported.
    #[error("Unsupported format revision {actual} (expected {expected})")]
    #[allow(missing_docs)]
    FormatRevision { expected: u32, actual: u32 },

    /// A gain-table CSV line couldn't be parsed.
    #[error("Gain table line {line}: {reason}")]
    #[allow(missing_docs)]
    GainTableFormat { line: usize, reason: &'static str },

    /// Gain-table indices are not in ascending order. `row` is the first
    /// offending data row.
    #[error("Gain indices not in ascending order at row {row} (expected {expected}, found {found})")]
    #[allow(missing_docs)]
    GainTableOrder { row: usize, expected: u16, found: u8 },

    /// A device profile field couldn't be read or held an illegal value.
    #[error("Profile field '{field}' at offset 0x{offset:x} is unreadable or invalid")]
    #[allow(missing_docs)]
    ProfileField { field: &'static str, offset: u32 },

    /// The co-processor completed a command with an error status.
    #[error(
        "Co-processor error: opcode 0x{opcode:02x}, object 0x{object_id:02x}, status 0x{status:02x}"
    )]
    #[allow(missing_docs)]
    Firmware {
        opcode: u8,
        object_id: u8,
        status: u8,
    },

    /// The co-processor rejected a radio-sequencer lookup table. Its copy no
    /// longer matches the loaded program.
    #[error("Co-processor rejected the sequencer lookup table (status 0x{status:02x})")]
    #[allow(missing_docs)]
    LookupTableRejected { status: u8 },

    /// A processor on the device has taken an exception.
    #[error("Processor exception (code 0x{code:08x})")]
    #[allow(missing_docs)]
    CpuException { code: u32 },

    /// A bounded poll timed out.
    #[error("Timed out waiting for {what}")]
    #[allow(missing_docs)]
    Timeout {
        what: &'static str,
        action: RecoveryAction,
    },

    /// The register interface failed.
    #[error("Register interface failure: {0}")]
    Interface(&'static str),

    /// Data returned from the device didn't make any sense.
    #[error("Invalid return data")]
    ReturnData,
}

impl Error {
    /// How the caller should recover from this error.
    pub fn recovery_action(&self) -> RecoveryAction {
        use Error::*;
        match self {
            Io(_)
            | AddressRange { .. }
            | ValueRange { .. }
            | InvalidParameter(_)
            | State(_)
            | FileSize { .. }
            | Checksum { .. }
            | BadMagic { .. }
            | FormatRevision { .. }
            | GainTableFormat { .. }
            | GainTableOrder { .. }
            | ProfileField { .. } => RecoveryAction::CheckParam,
            Interface(_) | ReturnData => RecoveryAction::ResetInterface,
            Firmware { .. } => RecoveryAction::ResetFeature,
            CpuException { .. } | LookupTableRejected { .. } => RecoveryAction::ResetDevice,
            Timeout { action, .. } => *action,
        }
    }

    pub(crate) fn value_range(range: Range<u32>, val: impl Into<u32>) -> Self {
        Self::ValueRange {
            range,
            val: val.into(),
        }
    }
}

/// Combine the outcome of an operation with the outcome of its cleanup.
///
/// The first error wins: a cleanup failure is only surfaced if the operation
/// itself succeeded, otherwise it is logged and dropped.
pub(crate) fn keep_first<T>(
    primary: Result<T, Error>,
    cleanup: Result<(), Error>,
) -> Result<T, Error> {
    match (primary, cleanup) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(c)) => {
            warn!("cleanup failed after earlier error ({e}): {c}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let r: Result<(), Error> = keep_first(
            Err(Error::InvalidParameter("primary")),
            Err(Error::Interface("cleanup")),
        );
        assert!(matches!(r, Err(Error::InvalidParameter("primary"))));

        let r: Result<u8, Error> = keep_first(Ok(3), Err(Error::Interface("cleanup")));
        assert!(matches!(r, Err(Error::Interface(_))));

        let r: Result<u8, Error> = keep_first(Ok(3), Ok(()));
        assert_eq!(r.unwrap(), 3);
    }

    #[test]
    fn severity_ordering() {
        assert!(RecoveryAction::ResetDevice > RecoveryAction::ResetInterface);
        assert_eq!(
            RecoveryAction::CheckParam.max(RecoveryAction::ResetFeature),
            RecoveryAction::ResetFeature
        );
        let e = Error::Timeout {
            what: "test",
            action: RecoveryAction::ResetDevice,
        };
        assert_eq!(e.recovery_action(), RecoveryAction::ResetDevice);
        let e = Error::Firmware {
            opcode: 0x0a,
            object_id: 1,
            status: 2,
        };
        assert_eq!(e.recovery_action(), RecoveryAction::ResetFeature);
    }
}
