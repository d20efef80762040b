/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
*/
use std::fmt;
use std::os::raw::{c_int, c_uint};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;

use crate::prelude::*;
use crate::sockcan::{CanRecvStatus, CanSock, WakeFd};

/// Frame callback. Identity is the allocation: register and unregister
/// with clones of the same `Arc`.
pub type CanRxCallback = Arc<dyn Fn(&CanMsg) + Send + Sync + 'static>;

/// Asynchronous event callback, fanned out to every registered error
/// handler of the interface.
pub type CanErrCallback = Arc<dyn Fn(&CanEvent) + Send + Sync + 'static>;

/// Interface configuration. `Default` matches the defconfig: classic
/// CAN, headers processed, every error class subscribed, kernel-default
/// buffer sizes and no netlink reconfiguration.
#[derive(Clone, Debug)]
pub struct CanIfConfig {
    /// arbitration bitrate, 0 keeps the device setting
    pub bitrate: u32,
    /// CAN-FD data-phase bitrate, 0 keeps the device setting
    pub dbitrate: u32,
    /// automatic bus-off restart delay in ms, 0 keeps the device setting
    pub restart_ms: u32,
    /// explicit bit-timing segments, applied after `bitrate`
    pub bit_timing: Option<CanBitTiming>,
    /// explicit data-phase bit-timing segments (CAN-FD)
    pub data_bit_timing: Option<CanBitTiming>,
    /// read back every netlink write and fail on disagreement
    pub nl_verify: bool,
    /// controller mode bits to touch at init
    pub ctrl_mask: CanCtrlModeFlag,
    pub ctrl_flags: CanCtrlModeFlag,
    /// open sockets in CAN-FD mode (requires an FD capable link)
    pub canfd_enabled: bool,
    /// parse ancillary data (timestamps, overflow counter) on reception
    pub process_header: bool,
    /// prefer hardware timestamps over SO_TIMESTAMP
    pub hw_timestamp: bool,
    /// error classes delivered as error frames
    pub error_mask: CanErrorMask,
    /// requested socket buffer sizes, 0 keeps the kernel default
    pub tx_buf_len: c_int,
    pub rx_buf_len: c_int,
    /// buffer sizes actually granted by the kernel, filled at open time
    pub tx_buf_len_rd: c_int,
    pub rx_buf_len_rd: c_int,
    /// dispatch poll timeout in ms, -1 waits forever
    pub tout_ms: c_int,
}

impl Default for CanIfConfig {
    fn default() -> CanIfConfig {
        CanIfConfig {
            bitrate: 0,
            dbitrate: 0,
            restart_ms: 0,
            bit_timing: None,
            data_bit_timing: None,
            nl_verify: true,
            ctrl_mask: CanCtrlModeFlag::empty(),
            ctrl_flags: CanCtrlModeFlag::empty(),
            canfd_enabled: false,
            process_header: true,
            hw_timestamp: false,
            error_mask: CanErrorMask::TX_TIMEOUT
                .union(CanErrorMask::CRTL)
                .union(CanErrorMask::BUS_OFF)
                .union(CanErrorMask::BUS_ERROR)
                .union(CanErrorMask::RESTARTED),
            tx_buf_len: 0,
            rx_buf_len: 0,
            tx_buf_len_rd: 0,
            rx_buf_len_rd: 0,
            tout_ms: -1,
        }
    }
}

struct CanRxHandler {
    sock: CanSock,
    callback: CanRxCallback,
    // last cumulative SO_RXQ_OVFL value seen on this socket
    ovfl_seen: u32,
}

// callback registries, guarded by one mutex held across poll + dispatch
struct CanMux {
    rx: Vec<CanRxHandler>,
    err: Vec<CanErrCallback>,
}

struct CanIfShared {
    ifname: String,
    tx: CanSock,
    mux: Mutex<CanMux>,
    waker: WakeFd,
    running: AtomicBool,
    dropped: AtomicU32,
    process_header: bool,
    tout_ms: c_int,
}

fn find_callback<T: ?Sized>(list: &[Arc<T>], target: &Arc<T>) -> Option<usize> {
    list.iter().position(|callback| Arc::ptr_eq(callback, target))
}

// a poisoned registry only means a callback panicked, the lists stay usable
fn lock_mux(shared: &CanIfShared) -> MutexGuard<'_, CanMux> {
    shared.mux.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Handle on one CAN interface.
///
/// `open` only records the name and configuration; `init` applies the
/// netlink configuration, opens the transmit socket and spawns the
/// dispatch thread. Dropping the handle stops the thread and closes
/// every socket.
pub struct CanIf {
    pub(crate) name: String,
    pub(crate) cfg: CanIfConfig,
    pub(crate) ifindex: c_uint,
    pub(crate) shared: Option<Arc<CanIfShared>>,
    pub(crate) thread: Option<JoinHandle<()>>,
    default_err: Option<CanErrCallback>,
}

// callbacks and sockets are not printable; only the identity fields are
impl fmt::Debug for CanIf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanIf")
            .field("name", &self.name)
            .field("ifindex", &self.ifindex)
            .finish_non_exhaustive()
    }
}

impl CanIf {
    /// Opens a handle with the default configuration. Fails when the
    /// interface does not exist.
    pub fn open(ifname: &str) -> Result<CanIf, CanError> {
        Self::open_config(ifname, CanIfConfig::default())
    }

    /// Opens `can<N>` by numeric index.
    pub fn open_index(index: u32) -> Result<CanIf, CanError> {
        Self::open(&format!("can{}", index))
    }

    pub fn open_config(ifname: &str, cfg: CanIfConfig) -> Result<CanIf, CanError> {
        let ifindex = crate::sockcan::resolve_ifindex(ifname)?;
        Ok(CanIf {
            name: ifname.to_string(),
            cfg,
            ifindex,
            shared: None,
            thread: None,
            default_err: None,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_config(&self) -> &CanIfConfig {
        &self.cfg
    }

    pub fn is_running(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.running.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Total frames the kernel reported dropped on this interface since
    /// init.
    pub fn get_dropped_count(&self) -> u32 {
        match &self.shared {
            Some(shared) => shared.dropped.load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// The logging error handler installed by `init`, for callers that
    /// want to unregister it and install their own.
    pub fn get_default_error_handler(&self) -> Option<CanErrCallback> {
        self.default_err.clone()
    }

    fn shared(&self) -> Result<&Arc<CanIfShared>, CanError> {
        self.shared.as_ref().ok_or_else(|| {
            CanError::new(
                CanErrorKind::IfaceIndex,
                format!("{}: interface not initialized", self.name),
            )
        })
    }

    /// Applies the netlink configuration, starts the link, opens the
    /// transmit socket, installs the default error handler and spawns
    /// the dispatch thread. A second call on a live handle does nothing.
    pub fn init(&mut self) -> Result<(), CanError> {
        if self.shared.is_some() {
            return Ok(());
        }

        let needs_netlink = self.cfg.bitrate != 0
            || self.cfg.dbitrate != 0
            || self.cfg.restart_ms != 0
            || self.cfg.bit_timing.is_some()
            || self.cfg.data_bit_timing.is_some()
            || !self.cfg.ctrl_mask.is_empty();
        if needs_netlink {
            // bit timing and ctrl mode only apply on a down link
            self.stop()?;
            if self.cfg.bitrate != 0 {
                let bitrate = self.cfg.bitrate;
                self.set_bitrate(bitrate)?;
            }
            if self.cfg.dbitrate != 0 {
                let dbitrate = self.cfg.dbitrate;
                self.set_data_bitrate(dbitrate)?;
            }
            if self.cfg.restart_ms != 0 {
                let restart_ms = self.cfg.restart_ms;
                self.set_restart_ms(restart_ms)?;
            }
            if let Some(timing) = self.cfg.bit_timing {
                self.set_bit_timing(timing)?;
            }
            if let Some(timing) = self.cfg.data_bit_timing {
                self.set_data_bit_timing(timing)?;
            }
            if !self.cfg.ctrl_mask.is_empty() {
                let (mask, flags) = (self.cfg.ctrl_mask, self.cfg.ctrl_flags);
                self.set_ctrl_mode(mask, flags)?;
            }
        }
        self.start()?;

        let (tx, ifindex) = CanSock::open_tx(&self.name, &mut self.cfg)?;
        self.ifindex = ifindex;

        let default_err = make_default_error_handler(self.name.clone());
        let shared = Arc::new(CanIfShared {
            ifname: self.name.clone(),
            tx,
            mux: Mutex::new(CanMux {
                rx: Vec::new(),
                err: vec![default_err.clone()],
            }),
            waker: WakeFd::new()?,
            running: AtomicBool::new(true),
            dropped: AtomicU32::new(0),
            process_header: self.cfg.process_header,
            tout_ms: self.cfg.tout_ms,
        });

        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("canif-{}", self.name))
            .spawn(move || dispatch_loop(worker))
            .map_err(|error| {
                CanError::new(CanErrorKind::ThreadCreate, format!("{}", error))
            })?;

        self.default_err = Some(default_err);
        self.shared = Some(shared);
        self.thread = Some(thread);
        Ok(())
    }

    /// Registers a frame callback with its own kernel filter set (empty
    /// slice receives everything). The same `Arc` cannot be registered
    /// twice.
    pub fn register_rx_handler(
        &mut self,
        callback: &CanRxCallback,
        filters: &[CanFilter],
    ) -> Result<(), CanError> {
        let shared = self.shared()?.clone();

        // wake the dispatcher before taking the registry lock: it holds
        // the lock across its poll and would never release it otherwise
        shared.waker.wake();
        let mut mux = lock_mux(&shared);
        if mux.rx.iter().any(|handler| Arc::ptr_eq(&handler.callback, callback)) {
            return Err(CanError::new(
                CanErrorKind::RxCallbackAlreadyRegistered,
                self.name.clone(),
            ));
        }
        // identity settled, only now touch kernel and config state
        let sock = CanSock::open_rx(self.ifindex, &self.name, &mut self.cfg, filters)?;
        mux.rx.push(CanRxHandler {
            sock,
            callback: callback.clone(),
            ovfl_seen: 0,
        });
        Ok(())
    }

    /// Removes a frame callback and closes its socket.
    pub fn unregister_rx_handler(&self, callback: &CanRxCallback) -> Result<(), CanError> {
        let shared = self.shared()?;
        shared.waker.wake();
        let mut mux = lock_mux(shared);
        match mux.rx.iter().position(|handler| Arc::ptr_eq(&handler.callback, callback)) {
            Some(index) => {
                mux.rx.remove(index);
                Ok(())
            }
            None => Err(CanError::new(
                CanErrorKind::RxCallbackNotFound,
                self.name.clone(),
            )),
        }
    }

    pub fn register_error_handler(&self, callback: &CanErrCallback) -> Result<(), CanError> {
        let shared = self.shared()?;
        shared.waker.wake();
        let mut mux = lock_mux(shared);
        if find_callback(&mux.err, callback).is_some() {
            return Err(CanError::new(
                CanErrorKind::ErrCallbackAlreadyRegistered,
                self.name.clone(),
            ));
        }
        mux.err.push(callback.clone());
        Ok(())
    }

    pub fn unregister_error_handler(&self, callback: &CanErrCallback) -> Result<(), CanError> {
        let shared = self.shared()?;
        shared.waker.wake();
        let mut mux = lock_mux(shared);
        match find_callback(&mux.err, callback) {
            Some(index) => {
                mux.err.remove(index);
                Ok(())
            }
            None => Err(CanError::new(
                CanErrorKind::ErrCallbackNotFound,
                self.name.clone(),
            )),
        }
    }

    /// Sends one frame on the transmit socket. The frame length is
    /// snapped to a legal DLC value in FD mode, which is why the frame
    /// is taken mutably. A full txqueue reports
    /// [`CanErrorKind::TxRetryLater`]; resend when the bus drains.
    pub fn tx_frame(&self, frame: &mut CanFrame) -> Result<(), CanError> {
        let shared = self.shared()?;
        if !shared.running.load(Ordering::Acquire) {
            return Err(CanError::new(CanErrorKind::NetworkDown, self.name.clone()));
        }
        shared.tx.send_frame(frame, self.cfg.canfd_enabled)
    }

    /// Stops the dispatch thread and closes every socket. Handlers
    /// registered on the interface are discarded. Idempotent; also runs
    /// on drop.
    pub fn close(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.running.store(false, Ordering::Release);
            shared.waker.wake();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
        self.default_err = None;
    }
}

impl Drop for CanIf {
    fn drop(&mut self) {
        self.close();
    }
}

fn make_default_error_handler(ifname: String) -> CanErrCallback {
    Arc::new(move |event: &CanEvent| match event {
        CanEvent::DroppedFrames(count) => {
            log::warn!("{}: kernel dropped {} frame(s)", ifname, count)
        }
        CanEvent::ErrorFrame(canid) => {
            log::error!("{}: error frame canid:{:#x}", ifname, canid)
        }
        CanEvent::NetworkDown => log::error!("{}: network down", ifname),
        CanEvent::WaitError(errno) => log::error!("{}: wait error errno:{}", ifname, errno),
    })
}

fn fan_out(handlers: &[CanErrCallback], event: CanEvent) {
    for callback in handlers {
        callback(&event);
    }
}

/// Per-interface dispatch loop. The registry lock is held across the
/// readiness wait and the callback invocations; registration paths wake
/// the eventfd first so the lock is released between rounds.
fn dispatch_loop(shared: Arc<CanIfShared>) {
    while shared.running.load(Ordering::Acquire) {
        let mut mux = lock_mux(&shared);

        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(mux.rx.len() + 2);
        fds.push(libc::pollfd {
            fd: shared.waker.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        // only error frames and link conditions ever show up here
        fds.push(libc::pollfd {
            fd: shared.tx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for handler in &mux.rx {
            fds.push(libc::pollfd {
                fd: handler.sock.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, shared.tout_ms) };
        if rc < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR {
                fan_out(&mux.err, CanEvent::WaitError(errno));
            }
            drop(mux);
            thread::yield_now();
            continue;
        }
        if fds[0].revents & libc::POLLIN != 0 {
            shared.waker.drain();
        }
        if fds[1].revents & (libc::POLLIN | libc::POLLERR) != 0 {
            drain_tx_socket(&shared, &mux.err);
        }

        let CanMux { rx, err } = &mut *mux;
        for (index, handler) in rx.iter_mut().enumerate() {
            let revents = fds[index + 2].revents;
            if revents & (libc::POLLIN | libc::POLLERR) == 0 {
                continue;
            }
            drain_socket(&shared, handler, err);
        }

        drop(mux);
        // give registration calls a chance at the registry lock
        thread::yield_now();
    }
}

/// Drains the transmit socket. Its filter set is empty, so anything
/// readable is an error frame or a link condition.
fn drain_tx_socket(shared: &CanIfShared, err: &[CanErrCallback]) {
    loop {
        match shared.tx.recv(shared.process_header) {
            CanRecvStatus::Frame { msg, .. } => {
                if msg.get_frame().is_err() {
                    fan_out(err, CanEvent::ErrorFrame(msg.get_frame().get_raw_id()));
                }
            }
            CanRecvStatus::Empty | CanRecvStatus::Again => break,
            CanRecvStatus::NetDown => {
                fan_out(err, CanEvent::NetworkDown);
                break;
            }
            CanRecvStatus::Failed(errno) => {
                fan_out(err, CanEvent::WaitError(errno));
                break;
            }
            CanRecvStatus::Invalid(count) => {
                log::warn!("{}: short read {} bytes on tx socket", shared.ifname, count);
                break;
            }
        }
    }
}

// the kernel overflow counter is cumulative per socket, report deltas
fn overflow_delta(seen: &mut u32, reported: u32) -> u32 {
    let delta = reported.wrapping_sub(*seen);
    *seen = reported;
    delta
}

/// Delivers one received frame. An error-flagged frame is fanned out to
/// the error handlers and still reaches the rx callback, like any other
/// frame the socket subscription delivers.
fn dispatch_msg(msg: &CanMsg, callback: &CanRxCallback, err: &[CanErrCallback]) {
    if msg.get_frame().is_err() {
        fan_out(err, CanEvent::ErrorFrame(msg.get_frame().get_raw_id()));
    }
    (callback)(msg);
}

/// Reads one ready socket until EAGAIN, dispatching frames and events.
fn drain_socket(shared: &CanIfShared, handler: &mut CanRxHandler, err: &[CanErrCallback]) {
    loop {
        match handler.sock.recv(shared.process_header) {
            CanRecvStatus::Frame { msg, overflow } => {
                let delta = overflow_delta(&mut handler.ovfl_seen, overflow);
                if delta != 0 {
                    shared.dropped.fetch_add(delta, Ordering::Relaxed);
                    fan_out(err, CanEvent::DroppedFrames(delta));
                }
                dispatch_msg(&msg, &handler.callback, err);
            }
            CanRecvStatus::Empty | CanRecvStatus::Again => break,
            CanRecvStatus::NetDown => {
                fan_out(err, CanEvent::NetworkDown);
                break;
            }
            CanRecvStatus::Failed(errno) => {
                fan_out(err, CanEvent::WaitError(errno));
                break;
            }
            CanRecvStatus::Invalid(count) => {
                log::warn!("{}: short read {} bytes, frame ignored", shared.ifname, count);
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[cfg(feature = "vcan_tests")]
    use crate::netlink::tests::TemporaryVcan;
    #[cfg(feature = "vcan_tests")]
    use std::time::{Duration, Instant};

    #[test]
    fn defconfig_values() {
        let cfg = CanIfConfig::default();
        assert!(cfg.process_header);
        assert!(!cfg.canfd_enabled);
        assert_eq!(cfg.bitrate, 0);
        assert_eq!(cfg.tout_ms, -1);
        assert!(cfg.nl_verify);
        assert!(cfg.error_mask.contains(CanErrorMask::BUS_OFF));
        assert!(cfg.error_mask.contains(CanErrorMask::RESTARTED));
        assert!(!cfg.error_mask.contains(CanErrorMask::LOST_ARBITRATION));
        assert_eq!(cfg.tx_buf_len, 0);
    }

    #[test]
    fn callback_identity_is_the_allocation() {
        let first: CanErrCallback = Arc::new(|_event| {});
        let clone = first.clone();
        // a second closure with the same body is a different callback
        let second: CanErrCallback = Arc::new(|_event| {});

        let list = vec![first.clone()];
        assert_eq!(find_callback(&list, &clone), Some(0));
        assert_eq!(find_callback(&list, &second), None);
    }

    #[test]
    fn error_frames_reach_rx_and_error_handlers() {
        let frames = Arc::new(Mutex::new(0u32));
        let events = Arc::new(Mutex::new(Vec::<u32>::new()));

        let frame_sink = frames.clone();
        let callback: CanRxCallback = Arc::new(move |_msg| {
            *frame_sink.lock().unwrap() += 1;
        });
        let event_sink = events.clone();
        let on_event: CanErrCallback = Arc::new(move |event| {
            if let CanEvent::ErrorFrame(canid) = event {
                event_sink.lock().unwrap().push(*canid);
            }
        });

        let err_id = 0x20 | libc::CAN_ERR_FLAG;
        let msg = CanMsg { frame: CanFrame::empty(err_id), stamp: 0 };
        dispatch_msg(&msg, &callback, &[on_event.clone()]);

        let msg = CanMsg { frame: CanFrame::new(0x100, &[1, 2]), stamp: 0 };
        dispatch_msg(&msg, &callback, &[on_event]);

        // the error frame fired the event and was still delivered
        assert_eq!(*frames.lock().unwrap(), 2);
        assert_eq!(events.lock().unwrap().as_slice(), [err_id]);
    }

    #[test]
    fn overflow_counter_reports_deltas() {
        let mut seen = 0u32;
        assert_eq!(overflow_delta(&mut seen, 0), 0);
        assert_eq!(overflow_delta(&mut seen, 7), 7);
        assert_eq!(overflow_delta(&mut seen, 7), 0);
        assert_eq!(overflow_delta(&mut seen, 10), 3);

        // counter wrap still yields the dropped count
        seen = u32::MAX - 1;
        assert_eq!(overflow_delta(&mut seen, 1), 3);
        assert_eq!(seen, 1);
    }

    #[test]
    fn open_unknown_interface_fails() {
        let error = CanIf::open("nosuchcan0").unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::IfaceIndex);
    }

    #[cfg(feature = "vcan_tests")]
    fn wait_for<F: Fn() -> bool>(predicate: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    fn loopback_frame_reaches_handler() {
        let vcan = TemporaryVcan::new("vcanift0").unwrap();
        let mut iface = CanIf::open(vcan.name()).unwrap();
        iface.init().unwrap();

        let seen = Arc::new(Mutex::new(Vec::<(u32, Vec<u8>)>::new()));
        let sink = seen.clone();
        let callback: CanRxCallback = Arc::new(move |msg| {
            sink.lock().unwrap().push((msg.get_id(), msg.get_data().to_vec()));
        });
        iface.register_rx_handler(&callback, &[]).unwrap();

        let mut frame = CanFrame::new(0x257, &[1, 2, 3, 4]);
        iface.tx_frame(&mut frame).unwrap();

        assert!(wait_for(|| !seen.lock().unwrap().is_empty()));
        let got = seen.lock().unwrap();
        assert_eq!(got[0], (0x257, vec![1, 2, 3, 4]));
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    fn filters_select_frames() {
        let vcan = TemporaryVcan::new("vcanift1").unwrap();
        let mut iface = CanIf::open(vcan.name()).unwrap();
        iface.init().unwrap();

        let seen = Arc::new(Mutex::new(Vec::<u32>::new()));
        let sink = seen.clone();
        let callback: CanRxCallback = Arc::new(move |msg| {
            sink.lock().unwrap().push(msg.get_id());
        });
        let filters = [CanFilter::new(0x100, libc::CAN_SFF_MASK)];
        iface.register_rx_handler(&callback, &filters).unwrap();

        iface.tx_frame(&mut CanFrame::new(0x200, &[0])).unwrap();
        iface.tx_frame(&mut CanFrame::new(0x100, &[1])).unwrap();

        assert!(wait_for(|| !seen.lock().unwrap().is_empty()));
        let got = seen.lock().unwrap();
        assert_eq!(got.as_slice(), [0x100]);
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    fn registration_is_exclusive_and_symmetric() {
        let vcan = TemporaryVcan::new("vcanift2").unwrap();
        let mut iface = CanIf::open(vcan.name()).unwrap();
        iface.init().unwrap();

        let callback: CanRxCallback = Arc::new(|_msg| {});
        iface.register_rx_handler(&callback, &[]).unwrap();

        // a rejected registration opens no socket and leaves the
        // recorded config alone
        iface.cfg.rx_buf_len_rd = -1;
        let error = iface.register_rx_handler(&callback, &[]).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::RxCallbackAlreadyRegistered);
        assert_eq!(iface.cfg.rx_buf_len_rd, -1);

        iface.unregister_rx_handler(&callback).unwrap();
        let error = iface.unregister_rx_handler(&callback).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::RxCallbackNotFound);

        let on_event: CanErrCallback = Arc::new(|_event| {});
        iface.register_error_handler(&on_event).unwrap();
        let error = iface.register_error_handler(&on_event).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::ErrCallbackAlreadyRegistered);
        iface.unregister_error_handler(&on_event).unwrap();
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    fn default_error_handler_can_be_replaced() {
        let vcan = TemporaryVcan::new("vcanift3").unwrap();
        let mut iface = CanIf::open(vcan.name()).unwrap();
        iface.init().unwrap();

        let default = iface.get_default_error_handler().unwrap();
        iface.unregister_error_handler(&default).unwrap();
        let error = iface.unregister_error_handler(&default).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::ErrCallbackNotFound);
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    fn txqueue_backpressure_is_retryable() {
        let vcan = TemporaryVcan::new("vcanift5").unwrap();
        let mut cfg = CanIfConfig::default();
        cfg.tx_buf_len = 4096;
        let mut iface = CanIf::open_config(vcan.name(), cfg).unwrap();
        iface.init().unwrap();

        // nobody reads, push hard: a refused send must always be the
        // retryable kind, never a hard failure
        let mut frame = CanFrame::new(0x257, &[0u8; 8]);
        for _ in 0..20_000 {
            match iface.tx_frame(&mut frame) {
                Ok(()) => {}
                Err(error) => {
                    assert_eq!(error.get_kind(), CanErrorKind::TxRetryLater);
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    fn close_is_idempotent() {
        let vcan = TemporaryVcan::new("vcanift4").unwrap();
        let mut iface = CanIf::open(vcan.name()).unwrap();
        iface.init().unwrap();
        assert!(iface.is_running());
        iface.close();
        assert!(!iface.is_running());
        iface.close();

        let callback: CanRxCallback = Arc::new(|_msg| {});
        let error = iface.register_rx_handler(&callback, &[]).unwrap_err();
        assert_eq!(error.get_kind(), CanErrorKind::IfaceIndex);
    }
}
