use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::{syscall, Fd};

/// A monotonic-clock timerfd created with `TFD_CLOEXEC | TFD_NONBLOCK`.
///
/// See: <http://man7.org/linux/man-pages/man2/timerfd_create.2.html>
#[derive(Debug)]
pub struct TimerFd {
    inner: Fd,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK
        ))?;
        Ok(TimerFd { inner: Fd::new(fd) })
    }

    /// Arm the timer to expire once, `delay` from now.
    ///
    /// A zero `it_value` disarms a timerfd, so a zero delay is rounded up
    /// to one nanosecond to keep "expire immediately" meaning what it says.
    pub fn set_after(&self, delay: Duration) -> io::Result<()> {
        let mut value = duration_to_timespec(delay);
        if value.tv_sec == 0 && value.tv_nsec == 0 {
            value.tv_nsec = 1;
        }

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };

        let mut old: libc::itimerspec = unsafe { mem::zeroed() };
        syscall!(timerfd_settime(self.inner.raw(), 0, &spec, &mut old))?;
        Ok(())
    }

    pub fn disarm(&self) -> io::Result<()> {
        let spec: libc::itimerspec = unsafe { mem::zeroed() };
        let mut old: libc::itimerspec = unsafe { mem::zeroed() };
        syscall!(timerfd_settime(self.inner.raw(), 0, &spec, &mut old))?;
        Ok(())
    }

    /// Number of expirations since the last read.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = super::read(self.inner.raw(), &mut buf)?;
        debug_assert_eq!(n, 8);
        Ok(u64::from_ne_bytes(buf))
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod test {
    use super::TimerFd;
    use std::time::Duration;

    #[test]
    fn expires_after_delay() {
        let timerfd = TimerFd::new().unwrap();
        timerfd.set_after(Duration::from_millis(10)).unwrap();

        assert_eq!(
            timerfd.read().unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(timerfd.read().unwrap(), 1);
    }

    #[test]
    fn disarm_cancels() {
        let timerfd = TimerFd::new().unwrap();
        timerfd.set_after(Duration::from_millis(10)).unwrap();
        timerfd.disarm().unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(
            timerfd.read().unwrap_err().kind(),
            std::io::ErrorKind::WouldBlock
        );
    }
}
