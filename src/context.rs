//! RDMA device context and port discovery.

use std::{ffi::CStr, io, ptr::NonNull};

use rdma_sys::{
    ibv_close_device, ibv_context, ibv_device, ibv_free_device_list, ibv_get_device_list,
    ibv_get_device_name, ibv_open_device, ibv_port_attr, ibv_port_state,
};

use crate::error::{log_last_os_err, log_ret_last_os_err, log_ret_last_os_err_with_note};

/// An opened device context plus the attributes of the port the benchmark
/// drives. Every other hardware resource hangs off this.
pub(crate) struct Context {
    /// Internal `ibv_context` pointer
    inner_ctx: NonNull<ibv_context>,
    /// Attributes of the driven port, queried once at open time
    port_attr: ibv_port_attr,
}

impl Context {
    /// Get the internal context pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_context {
        self.inner_ctx.as_ptr()
    }

    /// Open a device by name, or the first device whose port is active when
    /// no name was given, and query the attributes of `port_num`. A named
    /// device whose port is down is an error, not a fallback.
    pub(crate) fn open(dev_name: Option<&str>, port_num: u8) -> io::Result<Self> {
        let mut num_devs: i32 = 0;
        // SAFETY: ffi
        let dev_list_ptr = unsafe { ibv_get_device_list(&mut num_devs) };
        if dev_list_ptr.is_null() {
            return Err(log_ret_last_os_err_with_note("no RDMA devices available"));
        }
        // SAFETY: `ibv_get_device_list` returns `num_devs` valid pointers
        let dev_list = unsafe {
            std::slice::from_raw_parts(dev_list_ptr, usize::try_from(num_devs).unwrap_or(0))
        };
        let ctx = Self::from_list(dev_list, dev_name, port_num);
        // SAFETY: ffi; an opened device stays valid after the list is freed
        unsafe { ibv_free_device_list(dev_list_ptr) };
        ctx
    }

    /// Pick the device from the list and bring its port attributes in.
    fn from_list(
        dev_list: &[*mut ibv_device],
        dev_name: Option<&str>,
        port_num: u8,
    ) -> io::Result<Self> {
        if let Some(dev_name) = dev_name {
            let dev = dev_list
                .iter()
                .find(|dev| device_name(**dev).as_deref() == Some(dev_name))
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("device {dev_name} not found"),
                    )
                })?;
            let ctx = Self::open_device(*dev, port_num)?;
            if !port_is_active(&ctx.port_attr) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("port {port_num} of device {dev_name} is not active"),
                ));
            }
            Ok(ctx)
        } else {
            for dev in dev_list {
                // skip devices that fail to open or whose port is down
                if let Ok(ctx) = Self::open_device(*dev, port_num) {
                    if port_is_active(&ctx.port_attr) {
                        return Ok(ctx);
                    }
                }
            }
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no device with an active port {port_num}"),
            ))
        }
    }

    /// Open one device and query its port; closes the device again if the
    /// query fails.
    fn open_device(dev: *mut ibv_device, port_num: u8) -> io::Result<Self> {
        // SAFETY: ffi
        let inner_ctx =
            NonNull::new(unsafe { ibv_open_device(dev) }).ok_or_else(log_ret_last_os_err)?;
        // SAFETY: POD FFI type
        let mut port_attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        // SAFETY: ffi
        let errno =
            unsafe { rdma_sys::___ibv_query_port(inner_ctx.as_ptr(), port_num, &mut port_attr) };
        if errno != 0_i32 {
            let err = io::Error::from_raw_os_error(errno);
            // SAFETY: ffi
            let _ = unsafe { ibv_close_device(inner_ctx.as_ptr()) };
            return Err(err);
        }
        Ok(Self {
            inner_ctx,
            port_attr,
        })
    }

    /// Local identifier of the driven port.
    pub(crate) fn lid(&self) -> u16 {
        self.port_attr.lid
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_close_device(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for Context {}

unsafe impl Sync for Context {}

/// Name of a listed device, when the driver reports one.
fn device_name(dev: *mut ibv_device) -> Option<String> {
    // SAFETY: ffi
    let name = unsafe { ibv_get_device_name(dev) };
    if name.is_null() {
        return None;
    }
    // SAFETY: non-null device names are valid C strings
    Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
}

/// Whether the queried port can carry traffic.
fn port_is_active(attr: &ibv_port_attr) -> bool {
    attr.state == ibv_port_state::IBV_PORT_ACTIVE
}

#[cfg(test)]
mod tests {
    use rdma_sys::{ibv_port_attr, ibv_port_state};

    use super::{port_is_active, Context};

    #[test]
    #[ignore = "requires an RDMA device"]
    fn open_first_device() {
        let _ctx = Context::open(None, 1).unwrap();
    }

    #[test]
    fn unknown_device_is_not_found() {
        // either there is no device at all or none with this name
        assert!(Context::open(Some("no-such-device"), 1).is_err());
    }

    #[test]
    fn only_active_ports_qualify() {
        // SAFETY: POD FFI type; a zeroed port is in the NOP state
        let mut attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        assert!(!port_is_active(&attr));
        attr.state = ibv_port_state::IBV_PORT_DOWN;
        assert!(!port_is_active(&attr));
        attr.state = ibv_port_state::IBV_PORT_ACTIVE;
        assert!(port_is_active(&attr));
    }
}
