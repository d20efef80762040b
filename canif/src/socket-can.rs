/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 * References:
 *    https://www.kernel.org/doc/html/latest/networking/can.html#raw-protocol-sockets-with-can-filters-sock-raw
 *    https://www.kernel.org/doc/html/latest/networking/timestamping.html
 *
*/
use bitflags::bitflags;
use std::ffi::CString;
use std::mem;
use std::os::raw::{c_int, c_uint, c_void};
use std::os::unix::io::RawFd;

use crate::codec::can_fd_len;
use crate::iface::CanIfConfig;
use crate::prelude::*;

pub type CanId = libc::canid_t;

bitflags! {
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct FilterMask: CanId {
        /// SFF_MASK valid bits in standard frame id
        const SFF_MASK = libc::CAN_SFF_MASK;
        /// EFF_MASK valid bits in extended frame id
        const EFF_MASK = libc::CAN_EFF_MASK;
        /// EFF_FLAG indicate 29 bit extended format
        const EFF_FLAG = libc::CAN_EFF_FLAG;
        /// RTR_FLAG remote transmission request flag
        const RTR_FLAG = libc::CAN_RTR_FLAG;
        /// ERR_FLAG error flag
        const ERR_FLAG = libc::CAN_ERR_FLAG;
        /// ERR_MASK valid bits in error frame
        const ERR_MASK = libc::CAN_ERR_MASK;
    }
}

// error classes from linux/can/error.h, missing from the libc crate
bitflags! {
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    pub struct CanErrorMask: CanId {
        const TX_TIMEOUT = 0x0001;
        const LOST_ARBITRATION = 0x0002;
        const CRTL = 0x0004;
        const PROT = 0x0008;
        const TRX = 0x0010;
        const ACK = 0x0020;
        const BUS_OFF = 0x0040;
        const BUS_ERROR = 0x0080;
        const RESTARTED = 0x0100;
    }
}

/// One kernel-level frame filter. A received frame matches when
/// `received_id & can_mask == can_id & can_mask`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFilter {
    pub can_id: CanId,
    pub can_mask: CanId,
}

impl CanFilter {
    pub fn new(can_id: CanId, can_mask: CanId) -> Self {
        CanFilter { can_id, can_mask }
    }

    pub fn matches(&self, canid: CanId) -> bool {
        canid & self.can_mask == self.can_id & self.can_mask
    }

    fn as_raw(&self) -> libc::can_filter {
        let mut filter: libc::can_filter = unsafe { mem::zeroed() };
        filter.can_id = self.can_id;
        filter.can_mask = self.can_mask;
        filter
    }
}

/// CAN or CAN-FD wire frame. The flexible-data-rate layout is used for
/// both flavors; a classic frame is its 16-byte prefix.
pub struct CanFrame(pub libc::canfd_frame);

impl CanFrame {
    /// Builds a data frame. Payloads longer than 64 bytes are truncated;
    /// the length is snapped to a legal DLC value at transmission time.
    pub fn new(canid: CanId, data: &[u8]) -> Self {
        let mut frame = Self::empty(canid);
        let len = data.len().min(64);
        frame.0.data[..len].copy_from_slice(&data[..len]);
        frame.0.len = len as u8;
        frame
    }

    pub fn empty(canid: CanId) -> Self {
        let mut frame: libc::canfd_frame = unsafe { mem::zeroed() };
        frame.can_id = canid;
        CanFrame(frame)
    }

    /// Raw arbitration id including the EFF/RTR/ERR flag bits.
    pub fn get_raw_id(&self) -> CanId {
        self.0.can_id
    }

    /// Arbitration id with the flag bits masked off.
    pub fn get_id(&self) -> CanId {
        if self.is_extid() {
            self.0.can_id & libc::CAN_EFF_MASK
        } else {
            self.0.can_id & libc::CAN_SFF_MASK
        }
    }

    pub fn is_extid(&self) -> bool {
        self.0.can_id & libc::CAN_EFF_FLAG != 0
    }

    pub fn is_rtr(&self) -> bool {
        self.0.can_id & libc::CAN_RTR_FLAG != 0
    }

    pub fn is_err(&self) -> bool {
        self.0.can_id & libc::CAN_ERR_FLAG != 0
    }

    pub fn get_len(&self) -> u8 {
        self.0.len
    }

    pub fn get_data(&self) -> &[u8] {
        &self.0.data[..self.0.len.min(64) as usize]
    }

    pub fn set_flags(&mut self, flags: u8) -> &mut Self {
        self.0.flags = flags;
        self
    }
}

/// A received frame together with its arrival timestamp in microseconds
/// (zero when header processing is disabled or no stamp was delivered).
pub struct CanMsg {
    pub(crate) frame: CanFrame,
    pub(crate) stamp: u64,
}

impl CanMsg {
    pub fn get_stamp(&self) -> u64 {
        self.stamp
    }

    pub fn get_frame(&self) -> &CanFrame {
        &self.frame
    }

    pub fn get_id(&self) -> CanId {
        self.frame.get_id()
    }

    pub fn get_len(&self) -> u8 {
        self.frame.get_len()
    }

    pub fn get_data(&self) -> &[u8] {
        self.frame.get_data()
    }
}

// outcome of one nonblocking read on a raw CAN socket
pub(crate) enum CanRecvStatus {
    Frame { msg: CanMsg, overflow: u32 },
    Empty,
    Again,
    NetDown,
    Failed(i32),
    Invalid(isize),
}

/// One raw CAN socket, closed on drop.
pub(crate) struct CanSock {
    fd: RawFd,
}

impl Drop for CanSock {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn sockopt_on(fd: RawFd, level: c_int, option: c_int, value: c_int) -> c_int {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const c_void,
            mem::size_of::<c_int>() as libc::socklen_t,
        )
    }
}

impl CanSock {
    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    fn open_raw() -> Result<CanSock, ()> {
        let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW) };
        if fd < 0 {
            Err(())
        } else {
            Ok(CanSock { fd })
        }
    }

    fn set_nonblocking(&self) -> Result<(), ()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(());
        }
        let status = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if status < 0 {
            Err(())
        } else {
            Ok(())
        }
    }

    fn bind_iface(&self, ifindex: c_uint) -> Result<(), ()> {
        let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
        addr.can_family = libc::AF_CAN as libc::sa_family_t;
        addr.can_ifindex = ifindex as c_int;
        let status = unsafe {
            libc::bind(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if status < 0 {
            Err(())
        } else {
            Ok(())
        }
    }

    /// Sizes a socket buffer with the privileged *FORCE option first
    /// (CAP_NET_ADMIN may exceed the rmem/wmem_max ceiling), falling back
    /// to the unprivileged option, then reads back the granted size.
    fn size_buffer(
        &self,
        ifname: &str,
        force_opt: c_int,
        plain_opt: c_int,
        requested: c_int,
        set_kind: CanErrorKind,
        get_kind: CanErrorKind,
    ) -> Result<c_int, CanError> {
        let status = sockopt_on(self.fd, libc::SOL_SOCKET, force_opt, requested);
        if status < 0 {
            log::warn!("{}: privileged buffer sizing refused, retrying unprivileged", ifname);
            let status = sockopt_on(self.fd, libc::SOL_SOCKET, plain_opt, requested);
            if status < 0 {
                return Err(CanError::new(set_kind, get_perror()));
            }
        }

        let mut granted: c_int = 0;
        let mut len = mem::size_of::<c_int>() as libc::socklen_t;
        let status = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                plain_opt,
                &mut granted as *mut _ as *mut c_void,
                &mut len,
            )
        };
        if status < 0 {
            return Err(CanError::new(get_kind, get_perror()));
        }
        Ok(granted)
    }

    fn apply_error_mask(&self, mask: CanErrorMask) -> Result<(), CanError> {
        if mask.is_empty() {
            return Ok(());
        }
        let bits = mask.bits();
        let status = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_ERR_FILTER,
                &bits as *const _ as *const c_void,
                mem::size_of::<CanId>() as libc::socklen_t,
            )
        };
        if status < 0 {
            Err(CanError::new(CanErrorKind::SetSockOptErrFilter, get_perror()))
        } else {
            Ok(())
        }
    }

    fn enable_fd_frames(&self) -> Result<(), CanError> {
        let status = sockopt_on(self.fd, libc::SOL_CAN_RAW, libc::CAN_RAW_FD_FRAMES, 1);
        if status < 0 {
            Err(CanError::new(CanErrorKind::SetSockOptFdFrames, get_perror()))
        } else {
            Ok(())
        }
    }

    /// Opens and binds the transmit socket for `ifname` per the interface
    /// configuration. Reception is disabled (empty filter set) except for
    /// the subscribed error classes. Returns the socket and the resolved
    /// interface index; the granted send-buffer size is recorded in `cfg`.
    pub(crate) fn open_tx(ifname: &str, cfg: &mut CanIfConfig) -> Result<(CanSock, c_uint), CanError> {
        let sock = CanSock::open_raw()
            .map_err(|()| CanError::new(CanErrorKind::TxSocketCreate, get_perror()))?;

        let ifindex = resolve_ifindex(ifname)?;

        // blocking mode has no observable effect on a raw CAN socket
        // write path, keep it nonblocking as the read path requires
        sock.set_nonblocking()
            .map_err(|()| CanError::new(CanErrorKind::TxSocketCreate, get_perror()))?;

        if cfg.canfd_enabled {
            let mtu = query_mtu(sock.fd, ifname)?;
            if mtu != libc::CANFD_MTU as c_int {
                return Err(CanError::new(
                    CanErrorKind::NotCanFd,
                    format!("{}: mtu {} (CAN FD requires {})", ifname, mtu, libc::CANFD_MTU),
                ));
            }
            sock.enable_fd_frames()?;
        }

        // transmit only: drop every data frame, keep subscribed error frames
        let status = unsafe {
            libc::setsockopt(
                sock.fd,
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_FILTER,
                std::ptr::null(),
                0,
            )
        };
        if status < 0 {
            return Err(CanError::new(CanErrorKind::SetSockOptRawFilter, get_perror()));
        }

        if cfg.tx_buf_len > 0 {
            cfg.tx_buf_len_rd = sock.size_buffer(
                ifname,
                libc::SO_SNDBUFFORCE,
                libc::SO_SNDBUF,
                cfg.tx_buf_len,
                CanErrorKind::SetSockOptSndBuf,
                CanErrorKind::GetSockOptSndBuf,
            )?;
        }

        sock.apply_error_mask(cfg.error_mask)?;

        sock.bind_iface(ifindex)
            .map_err(|()| CanError::new(CanErrorKind::TxSocketBind, get_perror()))?;

        Ok((sock, ifindex))
    }

    /// Opens and binds one receive socket with its own filter set. An
    /// empty `filters` slice means "receive everything".
    pub(crate) fn open_rx(
        ifindex: c_uint,
        ifname: &str,
        cfg: &mut CanIfConfig,
        filters: &[CanFilter],
    ) -> Result<CanSock, CanError> {
        let sock = CanSock::open_raw()
            .map_err(|()| CanError::new(CanErrorKind::RxSocketCreate, get_perror()))?;

        sock.set_nonblocking()
            .map_err(|()| CanError::new(CanErrorKind::RxSocketCreate, get_perror()))?;

        if cfg.process_header {
            // see Documentation/networking/timestamping.rst
            let status = if cfg.hw_timestamp {
                let flags = (libc::SOF_TIMESTAMPING_SOFTWARE
                    | libc::SOF_TIMESTAMPING_RX_SOFTWARE
                    | libc::SOF_TIMESTAMPING_RAW_HARDWARE) as c_int;
                sockopt_on(sock.fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags)
            } else {
                sockopt_on(sock.fd, libc::SOL_SOCKET, libc::SO_TIMESTAMP, 1)
            };
            if status < 0 {
                log::info!(
                    "{}: setsockopt {} not supported",
                    ifname,
                    if cfg.hw_timestamp { "SO_TIMESTAMPING" } else { "SO_TIMESTAMP" }
                );
                return Err(CanError::new(CanErrorKind::SetSockOptTimestamp, get_perror()));
            }

            // overflow accounting rides on the same ancillary channel
            let status = sockopt_on(sock.fd, libc::SOL_SOCKET, libc::SO_RXQ_OVFL, 1);
            if status < 0 {
                return Err(CanError::new(
                    CanErrorKind::SetSockOptTimestamp,
                    format!("SO_RXQ_OVFL {}", get_perror()),
                ));
            }
        }

        if cfg.canfd_enabled {
            sock.enable_fd_frames()?;
        }

        if cfg.rx_buf_len > 0 {
            cfg.rx_buf_len_rd = sock.size_buffer(
                ifname,
                libc::SO_RCVBUFFORCE,
                libc::SO_RCVBUF,
                cfg.rx_buf_len,
                CanErrorKind::SetSockOptRcvBuf,
                CanErrorKind::GetSockOptRcvBuf,
            )?;
        }

        sock.apply_error_mask(cfg.error_mask)?;

        if !filters.is_empty() {
            let raw: Vec<libc::can_filter> = filters.iter().map(CanFilter::as_raw).collect();
            let status = unsafe {
                libc::setsockopt(
                    sock.fd,
                    libc::SOL_CAN_RAW,
                    libc::CAN_RAW_FILTER,
                    raw.as_ptr() as *const c_void,
                    (raw.len() * mem::size_of::<libc::can_filter>()) as libc::socklen_t,
                )
            };
            if status < 0 {
                return Err(CanError::new(CanErrorKind::SetSockOptRawFilter, get_perror()));
            }
        }

        sock.bind_iface(ifindex)
            .map_err(|()| CanError::new(CanErrorKind::RxSocketBind, get_perror()))?;

        Ok(sock)
    }

    /// Writes one frame. CAN-FD lengths are snapped through the DLC codec
    /// before the write; the write must cover the full interface MTU.
    /// A full kernel txqueue surfaces as [`CanErrorKind::TxRetryLater`].
    pub(crate) fn send_frame(&self, frame: &mut CanFrame, canfd: bool) -> Result<(), CanError> {
        let mtu = if canfd {
            frame.0.len = can_fd_len(frame.0.len as usize);
            libc::CANFD_MTU as usize
        } else {
            libc::CAN_MTU as usize
        };

        let count = unsafe { libc::write(self.fd, &frame.0 as *const _ as *const c_void, mtu) };
        if count == -1 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::ENOBUFS || errno == libc::EAGAIN {
                // txqueue full and no spare buffers: user space retries,
                // blocking mode has no effect on this condition
                return Err(CanError::new(CanErrorKind::TxRetryLater, "kernel txqueue full"));
            }
            return Err(CanError::new(CanErrorKind::TxSocketWrite, get_perror()));
        }
        if (count as usize) < mtu {
            return Err(CanError::new(
                CanErrorKind::IncompleteFrame,
                format!("wrote {}/{} bytes", count, mtu),
            ));
        }
        Ok(())
    }

    /// One nonblocking read with ancillary metadata. When `process_header`
    /// is set, the timestamp (raw hardware slot preferred over the
    /// software one) and the cumulative overflow counter are extracted
    /// from the control messages.
    pub(crate) fn recv(&self, process_header: bool) -> CanRecvStatus {
        let mut frame: libc::canfd_frame = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: &mut frame as *mut _ as *mut c_void,
            iov_len: mem::size_of::<libc::canfd_frame>(),
        };
        // room for timeval + 3 timespec + u32 ancillary payloads
        let mut ctrl = [0u64; 16];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = ctrl.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = mem::size_of_val(&ctrl);

        let count = unsafe { libc::recvmsg(self.fd, &mut msg, 0) };
        if count < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return match errno {
                libc::EAGAIN => CanRecvStatus::Again,
                libc::ENETDOWN => CanRecvStatus::NetDown,
                _ => CanRecvStatus::Failed(errno),
            };
        }
        if count == 0 {
            return CanRecvStatus::Empty;
        }
        if count != libc::CAN_MTU as isize && count != libc::CANFD_MTU as isize {
            return CanRecvStatus::Invalid(count);
        }

        let mut stamp: u64 = 0;
        let mut overflow: u32 = 0;
        if process_header {
            let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            while !cmsg.is_null() {
                let hdr = unsafe { &*cmsg };
                if hdr.cmsg_level == libc::SOL_SOCKET {
                    let data = unsafe { libc::CMSG_DATA(cmsg) };
                    match hdr.cmsg_type {
                        libc::SO_RXQ_OVFL => {
                            overflow =
                                unsafe { std::ptr::read_unaligned(data as *const u32) };
                        }
                        libc::SCM_TIMESTAMP => {
                            let tv = unsafe {
                                std::ptr::read_unaligned(data as *const libc::timeval)
                            };
                            stamp = (tv.tv_sec as u64) * 1_000_000 + tv.tv_usec as u64;
                        }
                        libc::SCM_TIMESTAMPING => {
                            // slot 0 software stamp, slot 2 raw hardware
                            // stamp; prefer the hardware one when present
                            let ts = unsafe {
                                std::ptr::read_unaligned(data as *const [libc::timespec; 3])
                            };
                            let slot = if ts[2].tv_sec != 0 || ts[2].tv_nsec != 0 {
                                &ts[2]
                            } else {
                                &ts[0]
                            };
                            stamp = (slot.tv_sec as u64) * 1_000_000
                                + (slot.tv_nsec as u64) / 1_000;
                        }
                        _ => {}
                    }
                }
                cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
            }
        }

        CanRecvStatus::Frame {
            msg: CanMsg { frame: CanFrame(frame), stamp },
            overflow,
        }
    }
}

pub(crate) fn resolve_ifindex(ifname: &str) -> Result<c_uint, CanError> {
    let cname = CString::new(ifname)
        .map_err(|_| CanError::new(CanErrorKind::IfaceIndex, "embedded nul in interface name"))?;
    let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if ifindex == 0 {
        Err(CanError::new(
            CanErrorKind::IfaceIndex,
            format!("{}: {}", ifname, get_perror()),
        ))
    } else {
        Ok(ifindex)
    }
}

fn query_mtu(fd: RawFd, ifname: &str) -> Result<c_int, CanError> {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    let name = ifname.as_bytes();
    for idx in 0..libc::IFNAMSIZ - 1 {
        if idx == name.len() {
            break;
        }
        ifr.ifr_name[idx] = name[idx] as libc::c_char;
    }
    let status = unsafe { libc::ioctl(fd, libc::SIOCGIFMTU, &mut ifr) };
    if status < 0 {
        Err(CanError::new(
            CanErrorKind::MtuQuery,
            format!("{}: {}", ifname, get_perror()),
        ))
    } else {
        Ok(unsafe { ifr.ifr_ifru.ifru_mtu })
    }
}

/// Self-wakeup descriptor added to the dispatch poll set so registry
/// mutations and teardown can interrupt a blocking wait.
pub(crate) struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    pub(crate) fn new() -> Result<WakeFd, CanError> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd < 0 {
            Err(CanError::new(CanErrorKind::ThreadCreate, get_perror()))
        } else {
            Ok(WakeFd { fd })
        }
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        unsafe { libc::write(self.fd, &one as *const _ as *const c_void, 8) };
    }

    pub(crate) fn drain(&self) {
        let mut counter: u64 = 0;
        unsafe { libc::read(self.fd, &mut counter as *mut _ as *mut c_void, 8) };
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_matches_masked_id() {
        let filter = CanFilter::new(0x100, libc::CAN_SFF_MASK);
        assert!(filter.matches(0x100));
        assert!(!filter.matches(0x200));
        // id bits outside the mask are ignored
        let loose = CanFilter::new(0x100, 0x700);
        assert!(loose.matches(0x1FF));
        assert!(!loose.matches(0x2FF));
    }

    #[test]
    fn frame_truncates_oversized_payload() {
        let data = [0xABu8; 80];
        let frame = CanFrame::new(0x42, &data);
        assert_eq!(frame.get_len(), 64);
        assert_eq!(frame.get_data().len(), 64);
    }

    #[test]
    fn frame_id_flags() {
        let frame = CanFrame::empty(0x18FEF100 | libc::CAN_EFF_FLAG);
        assert!(frame.is_extid());
        assert!(!frame.is_rtr());
        assert!(!frame.is_err());
        assert_eq!(frame.get_id(), 0x18FEF100);
        assert_eq!(frame.get_raw_id(), 0x18FEF100 | libc::CAN_EFF_FLAG);

        let frame = CanFrame::empty(0x7FF);
        assert!(!frame.is_extid());
        assert_eq!(frame.get_id(), 0x7FF);

        let frame = CanFrame::empty(0x40 | libc::CAN_ERR_FLAG);
        assert!(frame.is_err());
    }

    #[test]
    fn frame_payload_accessors() {
        let frame = CanFrame::new(0x123, &[1, 2, 3]);
        assert_eq!(frame.get_len(), 3);
        assert_eq!(frame.get_data(), &[1, 2, 3]);
        assert_eq!(frame.get_id(), 0x123);
    }

    #[test]
    fn fd_flags_are_settable() {
        let mut frame = CanFrame::new(0x100, &[0u8; 12]);
        frame.set_flags(libc::CANFD_BRS as u8 | libc::CANFD_ESI as u8);
        assert_eq!(frame.0.flags, 0x03);
        frame.set_flags(0);
        assert_eq!(frame.0.flags, 0);
    }

    #[test]
    fn error_mask_is_a_plain_bitset() {
        let mask = CanErrorMask::TX_TIMEOUT | CanErrorMask::BUS_OFF;
        assert_eq!(mask.bits(), 0x0041);
        assert!(!mask.contains(CanErrorMask::RESTARTED));
    }
}
