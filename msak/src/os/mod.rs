//! OS abstraction layer: kernel-level socket introspection
//!
//! The measurement protocols want three things from the kernel that plain
//! socket APIs do not provide: the `TCP_INFO` snapshot, the congestion
//! control algorithm (get/set, plus the BBR state block when BBR is active),
//! and the `SO_COOKIE` connection identifier. All three exist only on Linux;
//! everywhere else this module returns a typed [`Error::Unsupported`] and the
//! upper layers degrade gracefully. Callers never branch on OS.
// (c) 2025 Ross Younger

use std::os::fd::BorrowedFd;

use cfg_if::cfg_if;
use serde::{Deserialize, Serialize};

cfg_if! {
    if #[cfg(linux)] {
        mod linux;
        use linux as imp;
    } else {
        mod stub;
        use stub as imp;
    }
}

/// Errors from kernel socket queries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// This platform cannot answer the query at all. Expected off-Linux;
    /// callers must tolerate it.
    #[error("kernel socket introspection is not supported on this platform")]
    Unsupported,
    /// The connection has no duplicated kernel handle to query.
    #[error("no kernel handle available for this connection")]
    NoHandle,
    /// The kernel rejected the query.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sets the congestion control algorithm on a socket (`TCP_CONGESTION`).
pub fn set_congestion_control(fd: BorrowedFd<'_>, name: &str) -> Result<(), Error> {
    imp::set_congestion_control(fd, name)
}

/// Reads the active congestion control algorithm from a socket.
pub fn get_congestion_control(fd: BorrowedFd<'_>) -> Result<String, Error> {
    imp::get_congestion_control(fd)
}

/// Reads the kernel's `TCP_INFO` snapshot for a socket.
pub fn tcp_info(fd: BorrowedFd<'_>) -> Result<TcpInfo, Error> {
    imp::tcp_info(fd)
}

/// Reads the BBR state block (`TCP_CC_INFO`) for a socket.
///
/// Only meaningful while the socket's congestion control algorithm is BBR;
/// callers are expected to check [`get_congestion_control`] first.
pub fn bbr_info(fd: BorrowedFd<'_>) -> Result<CcInfo, Error> {
    imp::bbr_info(fd)
}

/// Reads the kernel connection cookie (`SO_COOKIE`) for a socket.
pub fn socket_cookie(fd: BorrowedFd<'_>) -> Result<u64, Error> {
    imp::socket_cookie(fd)
}

/// BBR congestion control state, as reported by the kernel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcInfo {
    /// Estimated bottleneck bandwidth, bits per second.
    pub max_bandwidth: u64,
    /// Minimum observed round-trip time, microseconds.
    pub min_rtt: u32,
    /// Pacing gain shifted left 8 bits.
    pub pacing_gain: u32,
    /// Congestion window gain shifted left 8 bits.
    pub cwnd_gain: u32,
}

/// The kernel's `TCP_INFO` block for one connection.
///
/// Field layout matches `struct tcp_info` from the Linux UAPI headers so the
/// kernel can fill this struct directly. Older kernels return a shorter
/// struct; the remaining fields read as zero.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)] // field meanings are as documented in tcp(7)
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    pub wscale: u8,
    pub app_limited: u8,

    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,

    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,

    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,

    pub pmtu: u32,
    pub rcv_ssthresh: u32,
    pub rtt: u32,
    pub rttvar: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub reordering: u32,

    pub rcv_rtt: u32,
    pub rcv_space: u32,

    pub total_retrans: u32,

    pub pacing_rate: u64,
    pub max_pacing_rate: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub segs_out: u32,
    pub segs_in: u32,

    pub notsent_bytes: u32,
    pub min_rtt: u32,
    pub data_segs_in: u32,
    pub data_segs_out: u32,

    pub delivery_rate: u64,

    pub busy_time: u64,
    pub rwnd_limited: u64,
    pub sndbuf_limited: u64,

    pub delivered: u32,
    pub delivered_ce: u32,

    pub bytes_sent: u64,
    pub bytes_retrans: u64,
    pub dsack_dups: u32,
    pub reord_seen: u32,

    pub rcv_ooopack: u32,
    pub snd_wnd: u32,
}

#[cfg(test)]
mod test {
    use super::TcpInfo;

    #[test]
    fn tcp_info_layout_is_uapi_sized() {
        // The kernel struct this maps is 232 bytes up to tcpi_snd_wnd. A
        // mismatch here means a field was added or removed out of step with
        // the UAPI layout.
        assert_eq!(std::mem::size_of::<TcpInfo>(), 232);
        assert_eq!(std::mem::align_of::<TcpInfo>(), 8);
    }

    #[test]
    fn tcp_info_serializes_flat() {
        let info = TcpInfo {
            rtt: 1234,
            bytes_acked: 99,
            ..Default::default()
        };
        let v = serde_json::to_value(info).unwrap();
        assert_eq!(v["rtt"], 1234);
        assert_eq!(v["bytes_acked"], 99);
    }
}
