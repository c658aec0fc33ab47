//! Bindings to the linux-gpib user library (`libgpib`)

use std::os::raw::{c_char, c_int, c_long, c_short, c_void};

/// `ibask` option: timeout code of a descriptor
pub const IBA_TMO: c_int = 0x3;
/// `ibask` option: board index a device descriptor is attached to
pub const IBA_BNA: c_int = 0x200;

/// No secondary address
pub const NO_SAD: c_int = 0;

/// `ibwait` mask bits
pub const TIMO: c_int = 0x4000;
pub const END: c_int = 0x2000;
pub const SRQI: c_int = 0x1000;
pub const CMPL: c_int = 0x100;

#[link(name = "gpib")]
unsafe extern "C" {
    pub fn ibdev(
        board_index: c_int,
        pad: c_int,
        sad: c_int,
        timo: c_int,
        send_eoi: c_int,
        eosmode: c_int,
    ) -> c_int;
    pub fn ibfind(dev: *const c_char) -> c_int;
    pub fn ibonl(ud: c_int, onl: c_int) -> c_int;
    pub fn ibtmo(ud: c_int, v: c_int) -> c_int;
    pub fn ibask(ud: c_int, option: c_int, value: *mut c_int) -> c_int;
    pub fn ibln(ud: c_int, pad: c_int, sad: c_int, found_listener: *mut c_short) -> c_int;
    pub fn ibloc(ud: c_int) -> c_int;
    pub fn ibclr(ud: c_int) -> c_int;
    pub fn ibwrt(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
    pub fn ibrd(ud: c_int, buf: *mut c_void, count: c_long) -> c_int;
    pub fn ibwrta(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
    pub fn ibrda(ud: c_int, buf: *mut c_void, count: c_long) -> c_int;
    pub fn ibwait(ud: c_int, mask: c_int) -> c_int;
    pub fn ibstop(ud: c_int) -> c_int;
    pub fn ibrsp(ud: c_int, spr: *mut c_char) -> c_int;
    pub fn ThreadIbcntl() -> c_long;
    pub fn ThreadIberr() -> c_int;
}
