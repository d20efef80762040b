/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
 */
extern crate canif;
use canif::prelude::*;
use env_logger::Env;
use std::sync::Arc;

fn main() -> Result<(), String> {
    // Initialize logging backend for the `log` facade (idempotent).
    let env = Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();

    const VCAN: &str = "vcan0";

    let mut iface = match CanIf::open(VCAN) {
        Err(error) => return Err(format!("fail opening candev {error}")),
        Ok(value) => value,
    };
    if let Err(error) = iface.init() {
        return Err(format!("fail initializing candev {error}"));
    }

    let on_frame: CanRxCallback = Arc::new(|msg| {
        log::info!(
            "Received frame id:{:#04x} stamp:{} len:{} data:{:?}",
            msg.get_id(),
            msg.get_stamp(),
            msg.get_len(),
            msg.get_data()
        );
    });
    let filters = [
        CanFilter::new(0x257, FilterMask::SFF_MASK.bits()),
        CanFilter::new(0x118, FilterMask::SFF_MASK.bits()),
    ];
    if let Err(error) = iface.register_rx_handler(&on_frame, &filters) {
        return Err(format!("fail registering rx handler {error}"));
    }

    let on_event: CanErrCallback = Arc::new(|event| {
        log::warn!("Bus event {event}");
    });
    if let Err(error) = iface.register_error_handler(&on_event) {
        return Err(format!("fail registering error handler {error}"));
    }

    log::info!("Waiting for raw CAN frames on {VCAN}");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
