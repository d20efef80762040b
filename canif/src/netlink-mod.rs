/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/can.html#the-can-networking-subsystem
 *    linux/can/netlink.h
 *
*/
use bitflags::bitflags;
use std::fmt;
use std::fmt::Debug;
use std::mem;
use std::os::raw::c_int;
use std::ptr;

use neli::consts::nl::{NlType, NlmF, NlmFFlags};
use neli::consts::rtnl::{Arphrd, Iff, IffFlags, Ifla, IflaInfo, RtAddrFamily, Rtm, RtaType};
use neli::consts::socket::NlFamily;
use neli::err::NlError;
use neli::nl::{NlPayload, Nlmsghdr};
use neli::rtnl::{Ifinfomsg, Rtattr};
use neli::socket::NlSocketHandle;
use neli::types::RtBuffer;
use neli::{FromBytes, Size, ToBytes};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::iface::CanIf;
use crate::prelude::*;
use crate::sockcan::resolve_ifindex;

/// IFLA_CAN_* attribute types from linux/can/netlink.h, missing from
/// neli 0.6 (which only ships `Ifla`/`IflaInfo`).
#[neli::neli_enum(serialized_type = "libc::c_ushort")]
pub enum IflaCan {
    BitTiming = 1,
    CtrlMode = 5,
    RestartMs = 6,
    Restart = 7,
    DataBitTiming = 9,
}

impl RtaType for IflaCan {}

/// Bit-timing parameters, mirror of `struct can_bittiming` from
/// linux/can/netlink.h (missing from the libc crate). When only
/// `bitrate` is set the kernel computes the remaining segments from the
/// controller constants.
#[repr(C)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, ToBytes)]
pub struct CanBitTiming {
    pub bitrate: u32,
    pub sample_point: u32,
    pub tq: u32,
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
    pub sjw: u32,
    pub brp: u32,
}

impl Size for CanBitTiming {
    fn unpadded_size(&self) -> usize {
        mem::size_of::<CanBitTiming>()
    }
}

/// Controller mode pair, mirror of `struct can_ctrlmode`. Only the bits
/// set in `mask` are applied; `flags` carries their new values.
#[repr(C)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, ToBytes)]
pub struct CanCtrlMode {
    pub mask: u32,
    pub flags: u32,
}

impl Size for CanCtrlMode {
    fn unpadded_size(&self) -> usize {
        mem::size_of::<CanCtrlMode>()
    }
}

bitflags! {
    // CAN_CTRLMODE_* from linux/can/netlink.h
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct CanCtrlModeFlag: u32 {
        const LOOPBACK = 0x01;
        const LISTEN_ONLY = 0x02;
        const TRIPLE_SAMPLING = 0x04;
        const ONE_SHOT = 0x08;
        const BERR_REPORTING = 0x10;
        const FD = 0x20;
        const PRESUME_ACK = 0x40;
        const FD_NON_ISO = 0x80;
        const CC_LEN8_DLC = 0x100;
    }
}

/// Controller operational state as reported through IFLA_CAN_STATE.
#[repr(u32)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CanState {
    ErrorActive,
    ErrorWarning,
    ErrorPassive,
    BusOff,
    Stopped,
    Sleeping,
}

impl TryFrom<u32> for CanState {
    type Error = CanError;

    fn try_from(value: u32) -> Result<Self, CanError> {
        use CanState::*;
        match value {
            0 => Ok(ErrorActive),
            1 => Ok(ErrorWarning),
            2 => Ok(ErrorPassive),
            3 => Ok(BusOff),
            4 => Ok(Stopped),
            5 => Ok(Sleeping),
            _ => Err(CanError::new(
                CanErrorKind::NlGetState,
                format!("unknown can state value:{}", value),
            )),
        }
    }
}

impl fmt::Display for CanState {
    fn fmt(&self, format: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            CanState::ErrorActive => "error-active",
            CanState::ErrorWarning => "error-warning",
            CanState::ErrorPassive => "error-passive",
            CanState::BusOff => "bus-off",
            CanState::Stopped => "stopped",
            CanState::Sleeping => "sleeping",
        };
        write!(format, "{}", label)
    }
}

/// Transmit/receive error counters, mirror of `struct can_berr_counter`.
#[repr(C)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CanBerrCounter {
    pub txerr: u16,
    pub rxerr: u16,
}

/// Lifetime device counters, mirror of `struct can_device_stats`
/// (delivered as IFLA_INFO_XSTATS).
#[repr(C)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CanDeviceStats {
    pub bus_error: u32,
    pub error_warning: u32,
    pub error_passive: u32,
    pub bus_off: u32,
    pub arbitration_lost: u32,
    pub restarts: u32,
}

/// Snapshot of everything one RTM_GETLINK round-trip reports about a
/// CAN link. Fields are `None` when the kernel did not include the
/// attribute (virtual links carry no controller data at all).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone)]
pub struct CanLinkInfo {
    pub is_up: bool,
    pub mtu: Option<u32>,
    pub kind: Option<String>,
    pub state: Option<CanState>,
    pub bit_timing: Option<CanBitTiming>,
    pub data_bit_timing: Option<CanBitTiming>,
    pub ctrl_mode: Option<CanCtrlMode>,
    pub restart_ms: Option<u32>,
    pub berr_counter: Option<CanBerrCounter>,
    pub device_stats: Option<CanDeviceStats>,
}

fn nl_err(kind: CanErrorKind, err: impl fmt::Display) -> CanError {
    CanError::new(kind, format!("{}", err))
}

fn read_struct<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < mem::size_of::<T>() {
        None
    } else {
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}

fn read_u32(bytes: &[u8]) -> Option<u32> {
    read_struct::<u32>(bytes)
}

/// Walks a run of packed `struct nlattr` entries, yielding the attribute
/// type and its payload. Entries are 4-byte aligned; the length field
/// covers the 4-byte header.
struct NlaIter<'a> {
    bytes: &'a [u8],
}

impl<'a> NlaIter<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        NlaIter { bytes }
    }
}

impl<'a> Iterator for NlaIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<(u16, &'a [u8])> {
        if self.bytes.len() < 4 {
            return None;
        }
        let nla_len = u16::from_ne_bytes([self.bytes[0], self.bytes[1]]) as usize;
        let nla_type = u16::from_ne_bytes([self.bytes[2], self.bytes[3]]);
        if nla_len < 4 || nla_len > self.bytes.len() {
            return None;
        }
        let payload = &self.bytes[4..nla_len];
        let advance = (nla_len + 3) & !3;
        self.bytes = if advance >= self.bytes.len() {
            &[]
        } else {
            &self.bytes[advance..]
        };
        Some((nla_type, payload))
    }
}

// IFLA_INFO_* and IFLA_CAN_* raw values, needed by the manual walker
const INFO_KIND: u16 = 1;
const INFO_DATA: u16 = 2;
const INFO_XSTATS: u16 = 3;
const CAN_BITTIMING: u16 = 1;
const CAN_STATE: u16 = 4;
const CAN_CTRLMODE: u16 = 5;
const CAN_RESTART_MS: u16 = 6;
const CAN_BERR_COUNTER: u16 = 8;
const CAN_DATA_BITTIMING: u16 = 9;

fn parse_linkinfo(bytes: &[u8], out: &mut CanLinkInfo) {
    for (nla_type, payload) in NlaIter::new(bytes) {
        match nla_type {
            INFO_KIND => {
                let name: Vec<u8> =
                    payload.iter().copied().take_while(|byte| *byte != 0).collect();
                out.kind = String::from_utf8(name).ok();
            }
            INFO_DATA => parse_can_data(payload, out),
            INFO_XSTATS => out.device_stats = read_struct::<CanDeviceStats>(payload),
            _ => {}
        }
    }
}

fn parse_can_data(bytes: &[u8], out: &mut CanLinkInfo) {
    for (nla_type, payload) in NlaIter::new(bytes) {
        match nla_type {
            CAN_BITTIMING => out.bit_timing = read_struct::<CanBitTiming>(payload),
            CAN_STATE => {
                out.state = read_u32(payload).and_then(|raw| CanState::try_from(raw).ok());
            }
            CAN_CTRLMODE => out.ctrl_mode = read_struct::<CanCtrlMode>(payload),
            CAN_RESTART_MS => out.restart_ms = read_u32(payload),
            CAN_BERR_COUNTER => out.berr_counter = read_struct::<CanBerrCounter>(payload),
            CAN_DATA_BITTIMING => out.data_bit_timing = read_struct::<CanBitTiming>(payload),
            _ => {}
        }
    }
}

/// One-shot rtnetlink client for a single link. Created per operation;
/// the interface index is resolved from the name each time so a
/// recreated link is picked up transparently.
pub(crate) struct CanNetlink {
    ifindex: c_int,
}

impl CanNetlink {
    pub(crate) fn open(ifname: &str, kind: CanErrorKind) -> Result<CanNetlink, CanError> {
        // resolve_ifindex already reports CanErrorKind::IfaceIndex, keep
        // the operation kind for the log line only
        let ifindex = resolve_ifindex(ifname).map_err(|error| {
            log::debug!("netlink open [{:?}]: {}", kind, error);
            error
        })?;
        Ok(CanNetlink { ifindex: ifindex as c_int })
    }

    fn open_route_socket() -> Result<NlSocketHandle, NlError> {
        let pid = unsafe { libc::getpid() } as u32;
        // no multicast groups, notifications are not wanted here
        let sock = NlSocketHandle::connect(NlFamily::Route, Some(pid), &[])?;
        Ok(sock)
    }

    fn send_and_read_ack<T, P>(sock: &mut NlSocketHandle, msg: Nlmsghdr<T, P>) -> Result<(), NlError>
    where
        T: NlType + Debug,
        P: ToBytes + Debug,
    {
        sock.send(msg)?;

        // a kernel error reply surfaces as Err from recv itself
        if let Some(Nlmsghdr {
            nl_payload: NlPayload::Ack(_),
            ..
        }) = sock.recv()?
        {
            Ok(())
        } else {
            Err(NlError::NoAck)
        }
    }

    fn send_info_msg(
        msg_type: Rtm,
        info: Ifinfomsg,
        additional_flags: &[NlmF],
    ) -> Result<(), NlError> {
        let mut nl = Self::open_route_socket()?;
        let hdr = Nlmsghdr::new(
            None,
            msg_type,
            {
                let mut flags = NlmFFlags::new(&[NlmF::Request, NlmF::Ack]);
                for flag in additional_flags {
                    flags.set(flag);
                }
                flags
            },
            None,
            None,
            NlPayload::Payload(info),
        );
        Self::send_and_read_ack(&mut nl, hdr)
    }

    pub(crate) fn bring_up(&self, kind: CanErrorKind) -> Result<(), CanError> {
        let info = Ifinfomsg::up(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.ifindex,
            RtBuffer::new(),
        );
        Self::send_info_msg(Rtm::Newlink, info, &[]).map_err(|error| nl_err(kind, error))
    }

    pub(crate) fn bring_down(&self, kind: CanErrorKind) -> Result<(), CanError> {
        let info = Ifinfomsg::down(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.ifindex,
            RtBuffer::new(),
        );
        Self::send_info_msg(Rtm::Newlink, info, &[]).map_err(|error| nl_err(kind, error))
    }

    /// Pushes one IFLA_CAN_* attribute wrapped in
    /// IFLA_LINKINFO { IFLA_INFO_KIND "can", IFLA_INFO_DATA { attr } }.
    /// The kernel rejects this while the link is up (EBUSY) except for
    /// restart requests.
    pub(crate) fn set_can_attr<P>(
        &self,
        attr_type: IflaCan,
        payload: P,
        kind: CanErrorKind,
    ) -> Result<(), CanError>
    where
        P: Size + ToBytes + Debug,
    {
        let build = || -> Result<Ifinfomsg, NlError> {
            let mut data = Rtattr::new(None, IflaInfo::Data, Vec::<u8>::new())?;
            data.add_nested_attribute(&Rtattr::new(None, attr_type, payload)?)?;

            let mut linkinfo = Rtattr::new(None, Ifla::Linkinfo, Vec::<u8>::new())?;
            linkinfo.add_nested_attribute(&Rtattr::new(None, IflaInfo::Kind, "can")?)?;
            linkinfo.add_nested_attribute(&data)?;

            let mut buffer = RtBuffer::new();
            buffer.push(linkinfo);
            Ok(Ifinfomsg::new(
                RtAddrFamily::Unspecified,
                Arphrd::Netrom,
                self.ifindex,
                IffFlags::empty(),
                IffFlags::empty(),
                buffer,
            ))
        };
        let info = build().map_err(|error| nl_err(kind, error))?;
        Self::send_info_msg(Rtm::Newlink, info, &[]).map_err(|error| nl_err(kind, error))
    }

    /// One RTM_GETLINK round-trip, parsed into [`CanLinkInfo`].
    pub(crate) fn query(&self, kind: CanErrorKind) -> Result<CanLinkInfo, CanError> {
        let info = Ifinfomsg::new(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            self.ifindex,
            IffFlags::empty(),
            IffFlags::empty(),
            RtBuffer::new(),
        );

        let mut nl = Self::open_route_socket().map_err(|error| nl_err(kind, error))?;
        let hdr = Nlmsghdr::new(
            None,
            Rtm::Getlink,
            NlmFFlags::new(&[NlmF::Request]),
            None,
            None,
            NlPayload::Payload(info),
        );
        nl.send(hdr).map_err(|error| nl_err(kind, error))?;

        let reply = nl
            .recv::<'_, Rtm, Ifinfomsg>()
            .map_err(|error| nl_err(kind, error))?
            .ok_or_else(|| CanError::new(kind, "empty getlink reply"))?;

        let payload = reply
            .get_payload()
            .map_err(|error| nl_err(kind, error))?;

        let mut out = CanLinkInfo::default();
        out.is_up = payload.ifi_flags.contains(&Iff::Up);
        for attr in payload.rtattrs.iter() {
            match attr.rta_type {
                Ifla::Mtu => out.mtu = read_u32(attr.rta_payload.as_ref()),
                Ifla::Linkinfo => parse_linkinfo(attr.rta_payload.as_ref(), &mut out),
                _ => {}
            }
        }
        Ok(out)
    }
}

/// Creates a virtual CAN link. Requires CAP_NET_ADMIN and the vcan
/// kernel module.
pub fn create_vcan(name: &str) -> Result<(), CanError> {
    let kind = CanErrorKind::NlCreateLink;
    if name.len() >= libc::IFNAMSIZ {
        return Err(CanError::new(kind, format!("{}: name too long", name)));
    }
    let build = || -> Result<Ifinfomsg, NlError> {
        let mut buffer = RtBuffer::new();
        buffer.push(Rtattr::new(None, Ifla::Ifname, name)?);
        let mut linkinfo = Rtattr::new(None, Ifla::Linkinfo, Vec::<u8>::new())?;
        linkinfo.add_nested_attribute(&Rtattr::new(None, IflaInfo::Kind, "vcan")?)?;
        buffer.push(linkinfo);
        Ok(Ifinfomsg::new(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            0,
            IffFlags::empty(),
            IffFlags::empty(),
            buffer,
        ))
    };
    let info = build().map_err(|error| nl_err(kind, error))?;
    CanNetlink::send_info_msg(Rtm::Newlink, info, &[NlmF::Create, NlmF::Excl])
        .map_err(|error| nl_err(kind, error))?;

    // the link must exist by the time this returns
    resolve_ifindex(name)
        .map(|_| ())
        .map_err(|error| nl_err(kind, error))
}

/// Deletes a link by name (any kind, not only vcan).
pub fn delete_link(name: &str) -> Result<(), CanError> {
    let kind = CanErrorKind::NlDeleteLink;
    let netlink = CanNetlink::open(name, kind)?;
    let info = Ifinfomsg::new(
        RtAddrFamily::Unspecified,
        Arphrd::Netrom,
        netlink.ifindex,
        IffFlags::empty(),
        IffFlags::empty(),
        RtBuffer::new(),
    );
    CanNetlink::send_info_msg(Rtm::Dellink, info, &[]).map_err(|error| nl_err(kind, error))
}

// only error-active counts as a healthy bring-up; a controller coming
// back degraded (warning, passive, bus-off) fails verification
fn check_started(name: &str, info: &CanLinkInfo) -> Result<(), CanError> {
    match info.state {
        Some(CanState::ErrorActive) => Ok(()),
        Some(state) => Err(CanError::new(
            CanErrorKind::NlStateMismatch,
            format!("{}: state after start:{}", name, state),
        )),
        None if info.is_up => Ok(()),
        None => Err(CanError::new(
            CanErrorKind::NlStateMismatch,
            format!("{}: not up after start", name),
        )),
    }
}

// Verified configuration operations. Every setter is write-then-verify:
// the value is pushed, read back through RTM_GETLINK, and a disagreement
// reports a *Mismatch kind distinct from the call-failure kind.
impl CanIf {
    /// Reports everything the kernel knows about the link.
    pub fn get_link_info(&self) -> Result<CanLinkInfo, CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlGetState)?;
        netlink.query(CanErrorKind::NlGetState)
    }

    /// Reports the controller state. Virtual links carry no state
    /// attribute and report an error here.
    pub fn get_state(&self) -> Result<CanState, CanError> {
        let info = self.get_link_info()?;
        info.state.ok_or_else(|| {
            CanError::new(CanErrorKind::NlGetState, format!("{}: no can state", self.name))
        })
    }

    pub fn get_bit_timing(&self) -> Result<CanBitTiming, CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlGetBitTiming)?;
        let info = netlink.query(CanErrorKind::NlGetBitTiming)?;
        info.bit_timing.ok_or_else(|| {
            CanError::new(
                CanErrorKind::NlGetBitTiming,
                format!("{}: no bit timing attribute", self.name),
            )
        })
    }

    pub fn get_ctrl_mode(&self) -> Result<CanCtrlMode, CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlGetCtrlMode)?;
        let info = netlink.query(CanErrorKind::NlGetCtrlMode)?;
        info.ctrl_mode.ok_or_else(|| {
            CanError::new(
                CanErrorKind::NlGetCtrlMode,
                format!("{}: no ctrl mode attribute", self.name),
            )
        })
    }

    pub fn get_restart_ms(&self) -> Result<u32, CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlGetRestartMs)?;
        let info = netlink.query(CanErrorKind::NlGetRestartMs)?;
        info.restart_ms.ok_or_else(|| {
            CanError::new(
                CanErrorKind::NlGetRestartMs,
                format!("{}: no restart-ms attribute", self.name),
            )
        })
    }

    pub fn get_berr_counter(&self) -> Result<CanBerrCounter, CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlGetBerrCounter)?;
        let info = netlink.query(CanErrorKind::NlGetBerrCounter)?;
        info.berr_counter.ok_or_else(|| {
            CanError::new(
                CanErrorKind::NlGetBerrCounter,
                format!("{}: no berr-counter attribute", self.name),
            )
        })
    }

    pub fn get_dev_stats(&self) -> Result<CanDeviceStats, CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlGetDevStats)?;
        let info = netlink.query(CanErrorKind::NlGetDevStats)?;
        info.device_stats.ok_or_else(|| {
            CanError::new(
                CanErrorKind::NlGetDevStats,
                format!("{}: no device statistics", self.name),
            )
        })
    }

    /// Sets the arbitration bitrate. The link must be down. On success
    /// the value is retained and re-applied by [`CanIf::init`].
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlSetBitrate)?;
        let timing = CanBitTiming { bitrate, ..Default::default() };
        netlink.set_can_attr(IflaCan::BitTiming, timing, CanErrorKind::NlSetBitrate)?;
        if !self.cfg.nl_verify {
            self.cfg.bitrate = bitrate;
            return Ok(());
        }

        let readback = netlink.query(CanErrorKind::NlSetBitrate)?;
        match readback.bit_timing {
            Some(timing) if timing.bitrate == bitrate => {
                self.cfg.bitrate = bitrate;
                Ok(())
            }
            other => Err(CanError::new(
                CanErrorKind::NlBitrateMismatch,
                format!("requested:{} read:{:?}", bitrate, other.map(|t| t.bitrate)),
            )),
        }
    }

    /// Sets the CAN-FD data-phase bitrate. The link must be down and the
    /// controller FD capable.
    pub fn set_data_bitrate(&mut self, dbitrate: u32) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlSetBitrate)?;
        let timing = CanBitTiming { bitrate: dbitrate, ..Default::default() };
        netlink.set_can_attr(IflaCan::DataBitTiming, timing, CanErrorKind::NlSetBitrate)?;
        if !self.cfg.nl_verify {
            self.cfg.dbitrate = dbitrate;
            return Ok(());
        }

        let readback = netlink.query(CanErrorKind::NlSetBitrate)?;
        match readback.data_bit_timing {
            Some(timing) if timing.bitrate == dbitrate => {
                self.cfg.dbitrate = dbitrate;
                Ok(())
            }
            other => Err(CanError::new(
                CanErrorKind::NlBitrateMismatch,
                format!("requested data:{} read:{:?}", dbitrate, other.map(|t| t.bitrate)),
            )),
        }
    }

    /// Applies explicit bit-timing segments. When `timing.bitrate` is
    /// nonzero the verification compares the computed bitrate, otherwise
    /// the raw segment values.
    pub fn set_bit_timing(&mut self, timing: CanBitTiming) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlSetBitTiming)?;
        netlink.set_can_attr(IflaCan::BitTiming, timing, CanErrorKind::NlSetBitTiming)?;
        if !self.cfg.nl_verify {
            self.cfg.bit_timing = Some(timing);
            return Ok(());
        }

        let readback = netlink
            .query(CanErrorKind::NlGetBitTiming)?
            .bit_timing
            .ok_or_else(|| {
                CanError::new(CanErrorKind::NlGetBitTiming, "no bit timing attribute")
            })?;

        let matches = if timing.bitrate != 0 {
            readback.bitrate == timing.bitrate
        } else {
            readback.tq == timing.tq
                && readback.prop_seg == timing.prop_seg
                && readback.phase_seg1 == timing.phase_seg1
                && readback.phase_seg2 == timing.phase_seg2
                && readback.sjw == timing.sjw
                && readback.brp == timing.brp
        };
        if matches {
            self.cfg.bit_timing = Some(timing);
            Ok(())
        } else {
            Err(CanError::new(
                CanErrorKind::NlBitTimingMismatch,
                format!("requested:{:?} read:{:?}", timing, readback),
            ))
        }
    }

    /// Applies explicit data-phase bit-timing segments (CAN-FD links).
    pub fn set_data_bit_timing(&mut self, timing: CanBitTiming) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlSetBitTiming)?;
        netlink.set_can_attr(IflaCan::DataBitTiming, timing, CanErrorKind::NlSetBitTiming)?;
        if !self.cfg.nl_verify {
            self.cfg.data_bit_timing = Some(timing);
            return Ok(());
        }

        let readback = netlink
            .query(CanErrorKind::NlGetBitTiming)?
            .data_bit_timing
            .ok_or_else(|| {
                CanError::new(CanErrorKind::NlGetBitTiming, "no data bit timing attribute")
            })?;

        let matches = if timing.bitrate != 0 {
            readback.bitrate == timing.bitrate
        } else {
            readback.tq == timing.tq
                && readback.prop_seg == timing.prop_seg
                && readback.phase_seg1 == timing.phase_seg1
                && readback.phase_seg2 == timing.phase_seg2
                && readback.sjw == timing.sjw
                && readback.brp == timing.brp
        };
        if matches {
            self.cfg.data_bit_timing = Some(timing);
            Ok(())
        } else {
            Err(CanError::new(
                CanErrorKind::NlBitTimingMismatch,
                format!("requested data:{:?} read:{:?}", timing, readback),
            ))
        }
    }

    /// Sets/clears controller mode bits. Only the bits in `mask` are
    /// touched; verification compares the read-back flags under the same
    /// mask.
    pub fn set_ctrl_mode(
        &mut self,
        mask: CanCtrlModeFlag,
        flags: CanCtrlModeFlag,
    ) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlSetCtrlMode)?;
        let mode = CanCtrlMode { mask: mask.bits(), flags: flags.bits() };
        netlink.set_can_attr(IflaCan::CtrlMode, mode, CanErrorKind::NlSetCtrlMode)?;
        if !self.cfg.nl_verify {
            self.cfg.ctrl_mask = mask;
            self.cfg.ctrl_flags = flags;
            return Ok(());
        }

        let readback = netlink
            .query(CanErrorKind::NlGetCtrlMode)?
            .ctrl_mode
            .ok_or_else(|| {
                CanError::new(CanErrorKind::NlGetCtrlMode, "no ctrl mode attribute")
            })?;
        if readback.flags & mask.bits() == flags.bits() & mask.bits() {
            self.cfg.ctrl_mask = mask;
            self.cfg.ctrl_flags = flags;
            Ok(())
        } else {
            Err(CanError::new(
                CanErrorKind::NlCtrlModeMismatch,
                format!(
                    "mask:{:#x} requested:{:#x} read:{:#x}",
                    mask.bits(),
                    flags.bits(),
                    readback.flags
                ),
            ))
        }
    }

    /// Sets the automatic restart delay (0 disables automatic restart).
    pub fn set_restart_ms(&mut self, restart_ms: u32) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlSetRestartMs)?;
        netlink.set_can_attr(IflaCan::RestartMs, restart_ms, CanErrorKind::NlSetRestartMs)?;
        if !self.cfg.nl_verify {
            self.cfg.restart_ms = restart_ms;
            return Ok(());
        }

        let readback = netlink
            .query(CanErrorKind::NlGetRestartMs)?
            .restart_ms
            .ok_or_else(|| {
                CanError::new(CanErrorKind::NlGetRestartMs, "no restart-ms attribute")
            })?;
        if readback == restart_ms {
            self.cfg.restart_ms = restart_ms;
            Ok(())
        } else {
            Err(CanError::new(
                CanErrorKind::NlRestartMsMismatch,
                format!("requested:{} read:{}", restart_ms, readback),
            ))
        }
    }

    /// Requests a manual bus-off recovery. The kernel only accepts this
    /// when the link is up, in bus-off, and automatic restart is
    /// disabled. The controller must come back error-active.
    pub fn restart(&self) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlRestart)?;
        netlink.set_can_attr(IflaCan::Restart, 1u32, CanErrorKind::NlRestart)?;
        if !self.cfg.nl_verify {
            return Ok(());
        }

        let state = netlink
            .query(CanErrorKind::NlGetState)?
            .state
            .ok_or_else(|| CanError::new(CanErrorKind::NlGetState, "no can state"))?;
        if state == CanState::ErrorActive {
            Ok(())
        } else {
            Err(CanError::new(
                CanErrorKind::NlStateMismatch,
                format!("state after restart:{}", state),
            ))
        }
    }

    /// Brings the link up and verifies the controller reached
    /// error-active. Links without controller state reporting (vcan)
    /// are verified through the interface up flag instead.
    pub fn start(&self) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlStart)?;
        netlink.bring_up(CanErrorKind::NlStart)?;
        if !self.cfg.nl_verify {
            return Ok(());
        }

        let info = netlink.query(CanErrorKind::NlGetState)?;
        check_started(&self.name, &info)
    }

    /// Brings the link down and verifies it reached the stopped state.
    pub fn stop(&self) -> Result<(), CanError> {
        let netlink = CanNetlink::open(&self.name, CanErrorKind::NlStop)?;
        netlink.bring_down(CanErrorKind::NlStop)?;
        if !self.cfg.nl_verify {
            return Ok(());
        }

        let info = netlink.query(CanErrorKind::NlGetState)?;
        match info.state {
            Some(CanState::Stopped) => Ok(()),
            Some(CanState::Sleeping) => {
                log::info!("{}: sleeping after stop", self.name);
                Ok(())
            }
            Some(state) => Err(CanError::new(
                CanErrorKind::NlStateMismatch,
                format!("{}: state after stop:{}", self.name, state),
            )),
            None if !info.is_up => Ok(()),
            None => Err(CanError::new(
                CanErrorKind::NlStateMismatch,
                format!("{}: still up after stop", self.name),
            )),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// RAII vcan link for hardware tests; dropped links are always
    /// cleaned up (a reboot would also remove them).
    #[cfg(feature = "vcan_tests")]
    pub struct TemporaryVcan {
        name: String,
    }

    #[cfg(feature = "vcan_tests")]
    impl TemporaryVcan {
        pub fn new(name: &str) -> Result<Self, CanError> {
            create_vcan(name)?;
            Ok(TemporaryVcan { name: name.to_string() })
        }

        pub fn name(&self) -> &str {
            &self.name
        }
    }

    #[cfg(feature = "vcan_tests")]
    impl Drop for TemporaryVcan {
        fn drop(&mut self) {
            let _ = delete_link(&self.name);
        }
    }

    fn nla(nla_type: u16, payload: &[u8]) -> Vec<u8> {
        let nla_len = (4 + payload.len()) as u16;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&nla_len.to_ne_bytes());
        bytes.extend_from_slice(&nla_type.to_ne_bytes());
        bytes.extend_from_slice(payload);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
    }

    fn struct_bytes<T: Copy>(value: &T) -> Vec<u8> {
        let size = mem::size_of::<T>();
        let mut bytes = vec![0u8; size];
        unsafe {
            ptr::copy_nonoverlapping(value as *const T as *const u8, bytes.as_mut_ptr(), size)
        };
        bytes
    }

    #[test]
    fn state_from_raw_value() {
        assert_eq!(CanState::try_from(0).unwrap(), CanState::ErrorActive);
        assert_eq!(CanState::try_from(3).unwrap(), CanState::BusOff);
        assert_eq!(CanState::try_from(4).unwrap(), CanState::Stopped);
        assert_eq!(CanState::try_from(5).unwrap(), CanState::Sleeping);
        assert!(CanState::try_from(6).is_err());
    }

    #[test]
    fn start_verification_wants_error_active() {
        let mut info = CanLinkInfo { is_up: true, ..Default::default() };

        info.state = Some(CanState::ErrorActive);
        assert!(check_started("can0", &info).is_ok());

        // a degraded controller does not count as started
        for state in [
            CanState::ErrorWarning,
            CanState::ErrorPassive,
            CanState::BusOff,
            CanState::Stopped,
        ] {
            info.state = Some(state);
            let error = check_started("can0", &info).unwrap_err();
            assert_eq!(error.get_kind(), CanErrorKind::NlStateMismatch);
        }

        // links without state reporting fall back to the up flag
        info.state = None;
        assert!(check_started("can0", &info).is_ok());
        info.is_up = false;
        let error = check_started("can0", &info).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::NlStateMismatch);
    }

    #[test]
    fn ctrl_mode_flag_values() {
        // wire values from linux/can/netlink.h
        assert_eq!(CanCtrlModeFlag::LOOPBACK.bits(), 0x01);
        assert_eq!(CanCtrlModeFlag::FD.bits(), 0x20);
        assert_eq!(CanCtrlModeFlag::CC_LEN8_DLC.bits(), 0x100);
    }

    #[test]
    fn walker_handles_padding_and_truncation() {
        let mut bytes = nla(INFO_KIND, b"can\0");
        bytes.extend_from_slice(&nla(CAN_RESTART_MS, &100u32.to_ne_bytes()));
        let attrs: Vec<(u16, Vec<u8>)> = NlaIter::new(&bytes)
            .map(|(nla_type, payload)| (nla_type, payload.to_vec()))
            .collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, INFO_KIND);
        assert_eq!(attrs[0].1, b"can\0");
        assert_eq!(attrs[1].0, CAN_RESTART_MS);

        // a length running past the buffer ends the walk
        let broken = [12u8, 0, 1, 0, 0xAA, 0xBB];
        assert_eq!(NlaIter::new(&broken).count(), 0);
    }

    #[test]
    fn linkinfo_parse_populates_snapshot() {
        let timing = CanBitTiming { bitrate: 500_000, sjw: 1, ..Default::default() };
        let mode = CanCtrlMode { mask: 0x20, flags: 0x20 };
        let stats = CanDeviceStats { bus_error: 2, restarts: 1, ..Default::default() };

        let mut data = nla(CAN_BITTIMING, &struct_bytes(&timing));
        data.extend_from_slice(&nla(CAN_STATE, &1u32.to_ne_bytes()));
        data.extend_from_slice(&nla(CAN_CTRLMODE, &struct_bytes(&mode)));
        data.extend_from_slice(&nla(CAN_RESTART_MS, &250u32.to_ne_bytes()));

        let mut linkinfo = nla(INFO_KIND, b"can\0");
        linkinfo.extend_from_slice(&nla(INFO_DATA, &data));
        linkinfo.extend_from_slice(&nla(INFO_XSTATS, &struct_bytes(&stats)));

        let mut out = CanLinkInfo::default();
        parse_linkinfo(&linkinfo, &mut out);

        assert_eq!(out.kind.as_deref(), Some("can"));
        assert_eq!(out.bit_timing.unwrap(), timing);
        assert_eq!(out.state.unwrap(), CanState::ErrorWarning);
        assert_eq!(out.ctrl_mode.unwrap(), mode);
        assert_eq!(out.restart_ms.unwrap(), 250);
        assert_eq!(out.device_stats.unwrap(), stats);
        assert!(out.data_bit_timing.is_none());
        assert!(out.berr_counter.is_none());
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    fn vcan_up_down_round_trip() {
        let vcan = TemporaryVcan::new("vcanifnl0").unwrap();
        let iface = CanIf::open(vcan.name()).unwrap();
        iface.start().unwrap();
        assert!(iface.get_link_info().unwrap().is_up);
        iface.stop().unwrap();
        assert!(!iface.get_link_info().unwrap().is_up);
    }
}
