use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::{syscall, Fd};

/// An eventfd created with `EFD_CLOEXEC | EFD_NONBLOCK`.
///
/// See: <http://man7.org/linux/man-pages/man2/eventfd.2.html>
#[derive(Debug)]
pub struct EventFd {
    inner: Fd,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(EventFd { inner: Fd::new(fd) })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = super::read(self.inner.raw(), &mut buf)?;
        debug_assert_eq!(n, 8);
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        super::write(self.inner.raw(), &buf)?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn read_empty_would_block() {
        let eventfd = EventFd::new().unwrap();
        let err = eventfd.read().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
