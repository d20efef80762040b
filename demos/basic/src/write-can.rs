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
use std::time::Duration;

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

    let mut count = 0u8;
    loop {
        let mut frame = CanFrame::new(0x257, &[count, 0xDE, 0xAD]);
        match iface.tx_frame(&mut frame) {
            Ok(()) => log::info!("Sent frame id:0x257 count:{count}"),
            Err(error) if error.get_kind() == CanErrorKind::TxRetryLater => {
                log::warn!("txqueue full, resending");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            Err(error) => return Err(format!("fail sending frame {error}")),
        }
        count = count.wrapping_add(1);
        std::thread::sleep(Duration::from_millis(500));
    }
}
