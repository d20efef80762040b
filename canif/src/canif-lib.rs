/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
 *
*/

#![doc(
    html_logo_url = "https://iot.bzh/images/defaults/company/512-479-max-transp.png",
    html_favicon_url = "https://iot.bzh/images/defaults/favicon.ico"
)]
extern crate bitflags;

#[cfg(feature = "serde")]
extern crate serde;

#[path = "./utils-mod.rs"]
mod utils;

#[path = "./codec-mod.rs"]
mod codec;

#[path = "./socket-can.rs"]
mod sockcan;

#[path = "./netlink-mod.rs"]
mod netlink;

#[path = "./iface-mod.rs"]
mod iface;

pub mod prelude {
    pub use crate::codec::*;
    pub use crate::iface::*;
    pub use crate::netlink::*;
    pub use crate::sockcan::*;
    pub use crate::utils::*;
}
