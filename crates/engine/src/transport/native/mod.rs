//! Native IEEE-488 controller through linux-gpib
//!
//! Only built with the `native-gpib` feature, which links `libgpib`. The
//! status word returned by every library call is stored unchanged; it already
//! has the layout of [`BusStatus`].

use super::Transport;
use protocol::{BusError, Result, TransportConfig};

#[cfg(feature = "native-gpib")]
mod ffi;

#[cfg(feature = "native-gpib")]
pub use bus::NativeBus;

/// Open the native controller described by `config`
#[cfg(feature = "native-gpib")]
pub fn connect(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    NativeBus::open(config).map(|bus| Box::new(bus) as Box<dyn Transport>)
}

#[cfg(not(feature = "native-gpib"))]
pub fn connect(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    Err(BusError::TransportNotFound(format!(
        "{}: built without native GPIB support (enable the native-gpib feature)",
        config.describe()
    )))
}

#[cfg(feature = "native-gpib")]
mod bus {
    use super::ffi;
    use crate::transport::{AsyncRequest, Transport};
    use protocol::{
        BusError, BusStatus, Result, TimeoutClass, TimeoutTarget, TransportConfig, TransportKind,
    };
    use std::ffi::CString;
    use std::os::raw::{c_char, c_int, c_long, c_short, c_void};
    use tracing::{debug, warn};

    /// `ibask` option: primary address of a descriptor
    const IBA_PAD: c_int = 0x1;

    fn status_word(sta: c_int) -> BusStatus {
        BusStatus((sta & 0xffff) as u16)
    }

    fn byte_count() -> usize {
        // SAFETY: reads the calling thread's count of the last library call.
        let count = unsafe { ffi::ThreadIbcntl() };
        usize::try_from(count).unwrap_or(0)
    }

    fn ask(ud: c_int, option: c_int) -> Result<c_int> {
        let mut value: c_int = 0;
        // SAFETY: `value` outlives the call.
        let sta = status_word(unsafe { ffi::ibask(ud, option, &mut value) });
        if sta.is_error() {
            return Err(BusError::bus(format!("ibask({:#x})", option), sta));
        }
        Ok(value)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Pending {
        Write,
        Read,
    }

    /// Device and board descriptors of one instrument
    #[derive(Debug)]
    pub struct NativeBus {
        device: c_int,
        board: c_int,
        pad: c_int,
        description: String,
        status: BusStatus,
        count: usize,
        /// Buffer handed to the driver by `ibwrta`/`ibrda`; untouched while
        /// `pending` is set
        io_buf: Vec<u8>,
        pending: Option<Pending>,
        read_data: Vec<u8>,
    }

    impl NativeBus {
        pub fn open(config: &TransportConfig) -> Result<Self> {
            let device = if config.use_named {
                let name = config.name.as_deref().unwrap_or_default();
                let c_name = CString::new(name).map_err(|_| {
                    BusError::TransportNotFound(format!("invalid device name {:?}", name))
                })?;
                // SAFETY: `c_name` is a valid NUL-terminated string for the call.
                unsafe { ffi::ibfind(c_name.as_ptr()) }
            } else {
                // SAFETY: plain integer arguments.
                unsafe {
                    ffi::ibdev(
                        config.controller_index as c_int,
                        c_int::from(config.device_address),
                        ffi::NO_SAD,
                        c_int::from(TimeoutClass::T3s.code()),
                        1,
                        0,
                    )
                }
            };
            if device < 0 {
                // SAFETY: reads the calling thread's error code.
                let iberr = unsafe { ffi::ThreadIberr() };
                return Err(BusError::TransportNotFound(format!(
                    "{} (iberr {})",
                    config.describe(),
                    iberr
                )));
            }

            let board = ask(device, ffi::IBA_BNA)?;
            let pad = ask(device, IBA_PAD)?;
            debug!(
                "Opened GPIB descriptor {} on board {} at address {}",
                device, board, pad
            );

            Ok(Self {
                device,
                board,
                pad,
                description: config.describe(),
                status: BusStatus::empty(),
                count: 0,
                io_buf: Vec::new(),
                pending: None,
                read_data: Vec::new(),
            })
        }

        fn descriptor(&self, target: TimeoutTarget) -> c_int {
            match target {
                TimeoutTarget::Controller => self.board,
                TimeoutTarget::Device => self.device,
            }
        }

        fn record(&mut self, sta: c_int) -> BusStatus {
            self.status = status_word(sta);
            self.count = byte_count();
            self.status
        }
    }

    impl Transport for NativeBus {
        fn kind(&self) -> TransportKind {
            TransportKind::NativeBus
        }

        fn describe(&self) -> String {
            self.description.clone()
        }

        fn status(&self) -> BusStatus {
            self.status
        }

        fn byte_count(&self) -> usize {
            self.count
        }

        fn set_error_flag(&mut self) {
            self.status.insert(BusStatus::ERR);
        }

        fn timeout(&mut self, target: TimeoutTarget) -> Result<TimeoutClass> {
            let code = ask(self.descriptor(target), ffi::IBA_TMO)?;
            u8::try_from(code)
                .ok()
                .and_then(TimeoutClass::from_code)
                .ok_or_else(|| BusError::InvalidResponse(format!("timeout code {}", code)))
        }

        fn set_timeout(&mut self, target: TimeoutTarget, class: TimeoutClass) -> Result<()> {
            // SAFETY: plain integer arguments.
            let sta = status_word(unsafe {
                ffi::ibtmo(self.descriptor(target), c_int::from(class.code()))
            });
            if sta.is_error() {
                return Err(BusError::bus(format!("set {} timeout", target), sta));
            }
            Ok(())
        }

        fn listen_probe(&mut self) -> Result<bool> {
            let mut found: c_short = 0;
            // SAFETY: `found` outlives the call.
            let sta = status_word(unsafe { ffi::ibln(self.board, self.pad, ffi::NO_SAD, &mut found) });
            if sta.is_error() {
                return Err(BusError::bus("listener probe", sta));
            }
            Ok(found != 0)
        }

        fn local(&mut self) -> BusStatus {
            // SAFETY: plain integer argument.
            let sta = status_word(unsafe { ffi::ibloc(self.device) });
            if sta.is_error() {
                warn!("Go-to-local failed on {} ({})", self.description, sta);
            }
            sta
        }

        fn clear(&mut self) -> BusStatus {
            self.cancel();
            // SAFETY: plain integer argument.
            let sta = unsafe { ffi::ibclr(self.device) };
            let status = self.record(sta);
            if status.is_error() {
                warn!("Device clear failed on {} ({})", self.description, status);
            }
            status
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            // SAFETY: `data` is valid for `data.len()` bytes during the call.
            let sta = unsafe {
                ffi::ibwrt(self.device, data.as_ptr().cast::<c_void>(), data.len() as c_long)
            };
            let status = self.record(sta);
            if status.is_error() {
                return Err(BusError::bus("write", status));
            }
            Ok(self.count)
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            // SAFETY: `buf` is valid for writes of `buf.len()` bytes during the call.
            let sta = unsafe {
                ffi::ibrd(self.device, buf.as_mut_ptr().cast::<c_void>(), buf.len() as c_long)
            };
            let status = self.record(sta);
            if status.is_error() {
                return Err(BusError::bus("read", status));
            }
            Ok(self.count.min(buf.len()))
        }

        /// Reads stop at EOI; the `until` terminator is left to the
        /// instrument, which asserts EOI with its last byte.
        fn submit(&mut self, request: AsyncRequest) -> Result<()> {
            if self.pending.is_some() {
                return Err(BusError::Unsupported(
                    "an asynchronous operation is already in flight".into(),
                ));
            }

            let (sta, pending) = match request {
                AsyncRequest::Write(data) => {
                    self.io_buf = data;
                    // SAFETY: `io_buf` is owned by `self` and neither moved nor
                    // touched until the operation completes or is stopped.
                    let sta = unsafe {
                        ffi::ibwrta(
                            self.device,
                            self.io_buf.as_ptr().cast::<c_void>(),
                            self.io_buf.len() as c_long,
                        )
                    };
                    (sta, Pending::Write)
                }
                AsyncRequest::Read { max, .. } => {
                    self.io_buf = vec![0u8; max];
                    // SAFETY: as above.
                    let sta = unsafe {
                        ffi::ibrda(
                            self.device,
                            self.io_buf.as_mut_ptr().cast::<c_void>(),
                            self.io_buf.len() as c_long,
                        )
                    };
                    (sta, Pending::Read)
                }
            };

            let status = self.record(sta);
            if status.is_error() {
                return Err(BusError::bus("submit", status));
            }
            self.pending = Some(pending);
            Ok(())
        }

        fn poll_once(&mut self) -> BusStatus {
            let Some(pending) = self.pending else {
                return self.status;
            };

            // SAFETY: plain integer arguments; waits at most the device timeout.
            let sta = unsafe { ffi::ibwait(self.device, ffi::TIMO | ffi::CMPL | ffi::END) };
            let status = self.record(sta);

            if status.is_error() {
                self.pending = None;
                return status;
            }
            if status.contains(BusStatus::CMPL) {
                self.pending = None;
                if pending == Pending::Read {
                    let n = self.count.min(self.io_buf.len());
                    self.read_data = self.io_buf[..n].to_vec();
                }
                return status;
            }
            BusStatus::TIMO
        }

        fn cancel(&mut self) {
            if self.pending.take().is_some() {
                // SAFETY: plain integer argument.
                let sta = status_word(unsafe { ffi::ibstop(self.device) });
                debug!("Stopped asynchronous operation ({})", sta);
            }
        }

        fn take_read(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.read_data)
        }

        fn wait_service_request(&mut self) -> BusStatus {
            // SAFETY: plain integer arguments; waits at most the controller timeout.
            let sta = status_word(unsafe { ffi::ibwait(self.board, ffi::SRQI | ffi::TIMO) });
            if sta.is_error() {
                return sta;
            }
            if sta.contains(BusStatus::SRQI) {
                BusStatus::SRQI
            } else {
                BusStatus::TIMO
            }
        }

        fn serial_poll(&mut self) -> Result<u8> {
            let mut byte: c_char = 0;
            // SAFETY: `byte` outlives the call.
            let sta = status_word(unsafe { ffi::ibrsp(self.device, &mut byte) });
            if sta.is_error() {
                return Err(BusError::bus("serial poll", sta));
            }
            Ok(byte as u8)
        }

        fn close(&mut self) -> Result<()> {
            self.cancel();
            // SAFETY: plain integer arguments.
            let sta = status_word(unsafe { ffi::ibonl(self.device, 0) });
            if sta.is_error() {
                return Err(BusError::bus("take offline", sta));
            }
            Ok(())
        }
    }

    impl Drop for NativeBus {
        fn drop(&mut self) {
            // The driver may still write into `io_buf`
            self.cancel();
        }
    }
}

#[cfg(all(test, not(feature = "native-gpib")))]
mod tests {
    use super::*;
    use protocol::TransportKind;

    #[test]
    fn test_connect_without_feature() {
        let config = TransportConfig::numeric(TransportKind::NativeBus, 0, 16);
        match connect(&config) {
            Err(BusError::TransportNotFound(msg)) => assert!(msg.contains("native-gpib")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connect succeeded without native support"),
        }
    }
}
