//! Linux concretions: getsockopt/setsockopt-backed kernel queries
// (c) 2025 Ross Younger

// The only unsafe code in this crate lives here: raw getsockopt/setsockopt
// calls the safe socket wrappers do not expose.

use std::io;
use std::mem::{self, MaybeUninit};
use std::os::fd::{AsRawFd as _, BorrowedFd};

use super::{CcInfo, Error, TcpInfo};

/// Longest congestion control algorithm name the kernel will report
/// (TCP_CA_NAME_MAX).
const CC_NAME_MAX: usize = 16;

pub(super) fn set_congestion_control(fd: BorrowedFd<'_>, name: &str) -> Result<(), Error> {
    let bytes = name.as_bytes();
    // SAFETY: the pointer/length pair describes a live, correctly-sized buffer.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            bytes.as_ptr().cast(),
            bytes.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

pub(super) fn get_congestion_control(fd: BorrowedFd<'_>) -> Result<String, Error> {
    let mut buf = [0u8; CC_NAME_MAX];
    let mut len = buf.len() as libc::socklen_t;
    // SAFETY: as above; the kernel writes at most `len` bytes.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            buf.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let end = buf[..len as usize]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(len as usize);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

pub(super) fn tcp_info(fd: BorrowedFd<'_>) -> Result<TcpInfo, Error> {
    // Zero-initialised so that fields an older kernel does not fill read as
    // zero; the kernel writes min(len, its own struct size) bytes.
    let mut info = TcpInfo::default();
    let mut len = mem::size_of::<TcpInfo>() as libc::socklen_t;
    // SAFETY: TcpInfo is repr(C) and matches the UAPI layout; len bounds the write.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_TCP,
            libc::TCP_INFO,
            (&mut info as *mut TcpInfo).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(info)
}

/// BBR state block of the `tcp_cc_info` union (linux/inet_diag.h).
#[repr(C)]
#[derive(Clone, Copy)]
struct RawBbrInfo {
    bw_lo: u32,
    bw_hi: u32,
    min_rtt: u32,
    pacing_gain: u32,
    cwnd_gain: u32,
}

pub(super) fn bbr_info(fd: BorrowedFd<'_>) -> Result<CcInfo, Error> {
    let mut raw = MaybeUninit::<RawBbrInfo>::zeroed();
    let mut len = mem::size_of::<RawBbrInfo>() as libc::socklen_t;
    // SAFETY: zero-initialised buffer; len bounds the kernel's write.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_CC_INFO,
            raw.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: every bit pattern is a valid RawBbrInfo.
    let raw = unsafe { raw.assume_init() };
    Ok(CcInfo {
        max_bandwidth: u64::from(raw.bw_lo) | (u64::from(raw.bw_hi) << 32),
        min_rtt: raw.min_rtt,
        pacing_gain: raw.pacing_gain,
        cwnd_gain: raw.cwnd_gain,
    })
}

pub(super) fn socket_cookie(fd: BorrowedFd<'_>) -> Result<u64, Error> {
    let mut cookie: u64 = 0;
    let mut len = mem::size_of::<u64>() as libc::socklen_t;
    // SAFETY: the kernel writes exactly 8 bytes for SO_COOKIE.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_COOKIE,
            (&mut cookie as *mut u64).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(cookie)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsFd as _;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn congestion_control_roundtrip() {
        let (sock, _peer) = connected_pair();
        let cc = get_congestion_control(sock.as_fd()).unwrap();
        assert!(!cc.is_empty());
        // Setting the already-active algorithm must succeed.
        set_congestion_control(sock.as_fd(), &cc).unwrap();
        assert_eq!(get_congestion_control(sock.as_fd()).unwrap(), cc);
    }

    #[test]
    fn set_bogus_congestion_control_fails() {
        let (sock, _peer) = connected_pair();
        let _ = set_congestion_control(sock.as_fd(), "no-such-algorithm").unwrap_err();
    }

    #[test]
    fn tcp_info_is_populated() {
        let (sock, _peer) = connected_pair();
        let info = tcp_info(sock.as_fd()).unwrap();
        // An established connection has a positive MSS.
        assert!(info.snd_mss > 0);
        assert_eq!(info.state, 1); // TCP_ESTABLISHED
    }

    #[test]
    fn socket_cookie_is_stable() {
        let (sock, _peer) = connected_pair();
        let a = socket_cookie(sock.as_fd()).unwrap();
        let b = socket_cookie(sock.as_fd()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }
}
