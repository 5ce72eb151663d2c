//! Periodic kernel-metric sampling for one connection
// (c) 2025 Ross Younger

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::net::ConnInfo;
use crate::throughput1::model::{Measurement, TcpInfo};
use crate::util::memoryless::Memoryless;

/// Minimum interval between subsequent measurements.
pub const MIN_MEASURE_INTERVAL: Duration = Duration::from_millis(100);
/// Average interval between subsequent measurements.
pub const AVG_MEASURE_INTERVAL: Duration = Duration::from_millis(250);
/// Maximum interval between subsequent measurements.
pub const MAX_MEASURE_INTERVAL: Duration = Duration::from_millis(400);

/// Buffer size of the measurement channel. Sized for at least 10 seconds of
/// samples so a reader busy with data I/O never stalls the sampler.
const CHANNEL_CAPACITY: usize = 100;

/// Samples one connection's byte counters and kernel metrics, producing a
/// lazy sequence of [`Measurement`]s.
///
/// Byte counters are offset against their values at construction time, so
/// every Measurement describes this measurement session rather than the whole
/// connection.
#[derive(Debug)]
pub struct Measurer {
    conn_info: Arc<ConnInfo>,
    start_time: Instant,
    offset_read: u64,
    offset_written: u64,
}

impl Measurer {
    /// Creates a measurer for the given connection, recording the counter
    /// offsets and the session start time.
    #[must_use]
    pub fn new(conn_info: Arc<ConnInfo>) -> Self {
        let (offset_read, offset_written) = conn_info.byte_counters();
        Self {
            conn_info,
            start_time: Instant::now(),
            offset_read,
            offset_written,
        }
    }

    /// Takes a single synchronous snapshot.
    ///
    /// Kernel metrics are best-effort: where they are unavailable the
    /// Measurement still carries the counters, with the kernel fields absent.
    #[must_use]
    pub fn measure_once(&self) -> Measurement {
        let (cc_info, tcp_info) = match self.conn_info.kernel_info() {
            Ok((cc, kernel)) => (
                cc,
                Some(TcpInfo {
                    kernel,
                    elapsed_microseconds: elapsed_micros(self.conn_info.accept_time()),
                }),
            ),
            Err(e) => {
                trace!("kernel info unavailable: {e}");
                (None, None)
            }
        };
        let (read, written) = self.conn_info.byte_counters();
        Measurement {
            elapsed_microseconds: elapsed_micros(self.start_time),
            application_bytes_sent: written.saturating_sub(self.offset_written),
            application_bytes_received: read.saturating_sub(self.offset_read),
            cc_info,
            tcp_info,
        }
    }

    /// Starts the sampling task. Samples are taken at memoryless intervals
    /// (so they cannot alias with periodic network behaviour) and sent over
    /// the returned channel until `deadline` passes or the receiver is
    /// dropped.
    ///
    /// Sends never block: if the reader falls behind, samples are dropped
    /// rather than slowing the data path.
    #[must_use]
    pub fn start(self: Arc<Self>, deadline: Instant) -> mpsc::Receiver<Measurement> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let measurer = self;
        drop(tokio::spawn(async move {
            trace!("measurer: start");
            let Ok(mut ticker) = Memoryless::new(
                AVG_MEASURE_INTERVAL,
                MIN_MEASURE_INTERVAL,
                MAX_MEASURE_INTERVAL,
            ) else {
                debug!("measurement interval constants are invalid (this is a bug)");
                return;
            };
            loop {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => break,
                    () = ticker.wait() => {
                        match tx.try_send(measurer.measure_once()) {
                            Ok(()) => (),
                            // Reader is busy and the buffer is full: drop the sample.
                            Err(TrySendError::Full(_)) => (),
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
            trace!("measurer: stop");
        }));
        rx
    }
}

fn elapsed_micros(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Listener;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpStream;

    async fn measured_conn() -> (crate::net::Conn, TcpStream) {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let conn = listener.accept().await.unwrap();
        (conn, client)
    }

    #[tokio::test]
    async fn counters_are_offset_subtracted() {
        let (mut conn, mut client) = measured_conn().await;
        // Traffic before the measurer starts must not count.
        client.write_all(&[0u8; 64]).await.unwrap();
        let mut buf = [0u8; 64];
        tokio::io::AsyncReadExt::read_exact(&mut conn, &mut buf).await.unwrap();

        let measurer = Measurer::new(conn.info());
        let m = measurer.measure_once();
        assert_eq!(m.application_bytes_received, 0);
        assert_eq!(m.application_bytes_sent, 0);

        conn.write_all(&[0u8; 100]).await.unwrap();
        let m = measurer.measure_once();
        assert_eq!(m.application_bytes_sent, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_respects_deadline() {
        let (conn, _client) = measured_conn().await;
        let measurer = Arc::new(Measurer::new(conn.info()));
        let mut rx = measurer.start(Instant::now() + Duration::from_secs(2));

        let mut received = 0;
        while let Some(m) = rx.recv().await {
            assert!(m.elapsed_microseconds <= 2_100_000);
            received += 1;
        }
        // Mean interval 250ms over 2s: expect roughly 8 samples, and the
        // clamp guarantees at least 5 (2s / 400ms).
        assert!(received >= 5, "only {received} samples");
        assert!(received <= 20, "{received} samples is too many");
    }

    #[tokio::test]
    async fn elapsed_is_strictly_increasing() {
        let (conn, _client) = measured_conn().await;
        let measurer = Measurer::new(conn.info());
        let a = measurer.measure_once();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let b = measurer.measure_once();
        assert!(b.elapsed_microseconds > a.elapsed_microseconds);
    }

    #[cfg(linux)]
    #[tokio::test]
    async fn kernel_fields_present_on_linux() {
        let (conn, _client) = measured_conn().await;
        let measurer = Measurer::new(conn.info());
        let m = measurer.measure_once();
        let tcp = m.tcp_info.expect("tcp_info expected on Linux");
        assert!(tcp.kernel.snd_mss > 0);
    }
}
