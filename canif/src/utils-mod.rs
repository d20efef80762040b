/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
*/

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed error taxonomy for the CAN interface API.
///
/// Every public operation reports one of these kinds; the companion
/// [`can_strerror`] function returns a static description. Netlink
/// "mismatch" kinds are distinct from the matching call-failure kinds
/// so callers can tell "kernel rejected the request" apart from
/// "kernel accepted it but the read-back disagrees".
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanErrorKind {
    // argument/state
    IfaceIndex,

    // netlink
    NlGetState,
    NlStart,
    NlStop,
    NlStateMismatch,
    NlSetBitrate,
    NlBitrateMismatch,
    NlRestart,
    NlSetRestartMs,
    NlGetRestartMs,
    NlRestartMsMismatch,
    NlSetCtrlMode,
    NlGetCtrlMode,
    NlCtrlModeMismatch,
    NlGetDevStats,
    NlSetBitTiming,
    NlGetBitTiming,
    NlBitTimingMismatch,
    NlGetBerrCounter,
    NlCreateLink,
    NlDeleteLink,

    // transmit socket
    TxSocketCreate,
    TxSocketWrite,
    TxSocketBind,
    TxRetryLater,
    IncompleteFrame,
    NetworkDown,

    // receive socket
    RxSocketCreate,
    RxSocketBind,

    // socket options, tagged by the option that failed
    SetSockOptRawFilter,
    SetSockOptErrFilter,
    SetSockOptFdFrames,
    SetSockOptTimestamp,
    SetSockOptSndBuf,
    GetSockOptSndBuf,
    SetSockOptRcvBuf,
    GetSockOptRcvBuf,

    MtuQuery,
    NotCanFd,
    ThreadCreate,
    DroppedFrames,

    // handler registry
    RxCallbackNotFound,
    RxCallbackAlreadyRegistered,
    ErrCallbackNotFound,
    ErrCallbackAlreadyRegistered,
}

/// Returns the static description string for an error kind.
pub fn can_strerror(kind: CanErrorKind) -> &'static str {
    use CanErrorKind::*;
    match kind {
        IfaceIndex => "Interface index error",

        NlGetState => "Get netlink interface state",
        NlStart => "Start interface",
        NlStop => "Stop interface",
        NlStateMismatch => "Netlink state set does not match value read",
        NlSetBitrate => "Set interface bitrate",
        NlBitrateMismatch => "Bitrate value set does not match value read",
        NlRestart => "Restart interface error",
        NlSetRestartMs => "Set restart ms error",
        NlGetRestartMs => "Get restart ms error",
        NlRestartMsMismatch => "Restart ms value set does not match value read",
        NlSetCtrlMode => "Set ctrl mode error",
        NlGetCtrlMode => "Get ctrl mode error",
        NlCtrlModeMismatch => "Ctrl mode value set does not match value read",
        NlGetDevStats => "Get device statistics error",
        NlSetBitTiming => "Set bit timing error",
        NlGetBitTiming => "Get bit timing error",
        NlBitTimingMismatch => "Bit timing value set does not match value read",
        NlGetBerrCounter => "Get bit error counter error",
        NlCreateLink => "Create link error",
        NlDeleteLink => "Delete link error",

        TxSocketCreate => "Socket create error",
        TxSocketWrite => "Socket write error",
        TxSocketBind => "Socket bind error",
        TxRetryLater => "TX retry later",
        IncompleteFrame => "Incomplete TX frame",
        NetworkDown => "CAN network is down",

        RxSocketCreate => "RX socket create error",
        RxSocketBind => "RX socket bind error",

        SetSockOptRawFilter => "setsockopt CAN_RAW_FILTER error",
        SetSockOptErrFilter => "setsockopt CAN_RAW_ERR_FILTER error",
        SetSockOptFdFrames => "setsockopt CAN_RAW_FD_FRAMES error",
        SetSockOptTimestamp => "setsockopt SO_TIMESTAMP error",
        SetSockOptSndBuf => "setsockopt SO_SNDBUF error",
        GetSockOptSndBuf => "getsockopt SO_SNDBUF error",
        SetSockOptRcvBuf => "setsockopt SO_RCVBUF error",
        GetSockOptRcvBuf => "getsockopt SO_RCVBUF error",

        MtuQuery => "ioctl SIOCGIFMTU error",
        NotCanFd => "Interface is not CAN FD capable",
        ThreadCreate => "Dispatch thread create error",
        DroppedFrames => "Dropped frames",

        RxCallbackNotFound => "RX callback not found",
        RxCallbackAlreadyRegistered => "RX callback already registered",
        ErrCallbackNotFound => "Error callback not found",
        ErrCallbackAlreadyRegistered => "Error callback already registered",
    }
}

impl fmt::Display for CanErrorKind {
    fn fmt(&self, format: &mut fmt::Formatter) -> fmt::Result {
        write!(format, "{}", can_strerror(*self))
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CanError {
    kind: CanErrorKind,
    info: String,
}

impl Clone for CanError {
    fn clone(&self) -> CanError {
        CanError { kind: self.kind, info: self.info.clone() }
    }
}

pub trait MakeError<T> {
    fn make(kind: CanErrorKind, msg: T) -> CanError;
}

impl MakeError<&str> for CanError {
    fn make(kind: CanErrorKind, msg: &str) -> CanError {
        CanError { kind, info: msg.to_string() }
    }
}

impl MakeError<String> for CanError {
    fn make(kind: CanErrorKind, msg: String) -> CanError {
        CanError { kind, info: msg }
    }
}

impl CanError {
    pub fn new<T>(kind: CanErrorKind, msg: T) -> CanError
    where
        CanError: MakeError<T>,
    {
        Self::make(kind, msg)
    }

    #[must_use]
    pub fn get_kind(&self) -> CanErrorKind {
        self.kind
    }

    #[must_use]
    pub fn get_info(&self) -> String {
        self.info.clone()
    }
}

impl fmt::Display for CanError {
    fn fmt(&self, format: &mut fmt::Formatter) -> fmt::Result {
        write!(format, "error:{} info:{}", can_strerror(self.kind), self.info)
    }
}

impl fmt::Debug for CanError {
    fn fmt(&self, format: &mut fmt::Formatter) -> fmt::Result {
        write!(format, "error:{:?} info:{}", self.kind, self.info)
    }
}

impl std::error::Error for CanError {}

/// Asynchronous condition detected by the dispatch thread.
///
/// These are never returned from an API call; they are fanned out to
/// every registered error handler of the interface.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanEvent {
    /// Kernel reported receive-queue overflow; payload is the number of
    /// frames dropped since the previous report on the same socket.
    DroppedFrames(u32),
    /// An error-flagged frame arrived; payload is the raw arbitration id
    /// including the error class bits.
    ErrorFrame(u32),
    /// ENETDOWN observed while draining a socket.
    NetworkDown,
    /// The readiness wait failed; payload is the errno value.
    WaitError(i32),
}

impl fmt::Display for CanEvent {
    fn fmt(&self, format: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CanEvent::DroppedFrames(count) => write!(format, "dropped-frames count:{}", count),
            CanEvent::ErrorFrame(canid) => write!(format, "error-frame canid:{:#x}", canid),
            CanEvent::NetworkDown => write!(format, "network-down"),
            CanEvent::WaitError(errno) => write!(format, "wait-error errno:{}", errno),
        }
    }
}

// strerror-like rendering of the calling thread errno
pub(crate) fn get_perror() -> String {
    std::io::Error::last_os_error().to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strerror_distinct_mismatch_kinds() {
        // a verification mismatch is never the same kind as the call failing
        assert_ne!(CanErrorKind::NlSetBitrate, CanErrorKind::NlBitrateMismatch);
        assert_ne!(CanErrorKind::NlSetRestartMs, CanErrorKind::NlRestartMsMismatch);
        assert_ne!(CanErrorKind::NlSetCtrlMode, CanErrorKind::NlCtrlModeMismatch);
        assert_ne!(CanErrorKind::NlSetBitTiming, CanErrorKind::NlBitTimingMismatch);
        assert_ne!(
            can_strerror(CanErrorKind::NlSetBitrate),
            can_strerror(CanErrorKind::NlBitrateMismatch)
        );
    }

    #[test]
    fn error_display_carries_kind_and_info() {
        let error = CanError::new(CanErrorKind::TxRetryLater, "txqueue full");
        assert_eq!(error.get_kind(), CanErrorKind::TxRetryLater);
        let text = format!("{}", error);
        assert!(text.contains("TX retry later"));
        assert!(text.contains("txqueue full"));
    }

    #[test]
    fn retry_later_is_not_a_write_error() {
        assert_ne!(CanErrorKind::TxRetryLater, CanErrorKind::TxSocketWrite);
        assert_ne!(CanErrorKind::TxRetryLater, CanErrorKind::IncompleteFrame);
    }
}
