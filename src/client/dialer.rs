//! Outbound dialing: the first-success race across transports.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;

use super::latch::Latch;
use crate::conn_tracker::{ConnTracker, TrackerEntry, TrackerKey};
use crate::transport::{Network, PeerStream, Transport};

pub(crate) struct DialResult {
    pub stream: PeerStream,
    pub network: Network,
}

/// Dial timeout under half-open pressure: the nominal timeout divided by
/// how many "generations" of half-open slots the pending peers would
/// occupy, floored at the configured minimum.
pub(crate) fn reduced_dial_timeout(
    min: Duration,
    nominal: Duration,
    half_open_limit: usize,
    pending_peers: usize,
) -> Duration {
    let divisor = ((pending_peers + half_open_limit) / half_open_limit.max(1)).max(1);
    (nominal / divisor as u32).max(min)
}

/// Starts a dial on every eligible transport and returns the first
/// stream to connect. The rest are cancelled; late winners are closed as
/// their results drain. Every arm claims a tracker entry before dialing
/// and the entry stays tied to the returned stream's lifetime.
pub(crate) async fn dial_first(
    transports: &[Arc<dyn Transport>],
    tracker: &Arc<ConnTracker>,
    closed: &Arc<Latch>,
    addr: SocketAddr,
    eligible: impl Fn(Network) -> bool,
) -> Option<DialResult> {
    let cancel = Arc::new(Latch::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<DialResult>>();
    let mut arms = 0usize;

    for transport in transports {
        let network = transport.network();
        if !eligible(network) {
            continue;
        }
        arms += 1;
        let transport = Arc::clone(transport);
        let tracker = Arc::clone(tracker);
        let cancel = Arc::clone(&cancel);
        let closed = Arc::clone(closed);
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = dial_one(transport, tracker, cancel, closed, addr).await;
            let _ = tx.send(result);
        });
    }
    drop(tx);
    if arms == 0 {
        return None;
    }

    let mut winner = None;
    while let Some(result) = rx.recv().await {
        arms -= 1;
        if let Some(result) = result {
            winner = Some(result);
            break;
        }
        if arms == 0 {
            break;
        }
    }
    cancel.set();

    if arms > 0 {
        // Collect the incomplete dials and close whatever they produce.
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                if let Some(late) = result {
                    debug!(
                        network = late.network.as_str(),
                        "closing connection that lost the dial race"
                    );
                    drop(late);
                }
            }
        });
    }
    winner
}

async fn dial_one(
    transport: Arc<dyn Transport>,
    tracker: Arc<ConnTracker>,
    cancel: Arc<Latch>,
    closed: Arc<Latch>,
    addr: SocketAddr,
) -> Option<DialResult> {
    let network = transport.network();
    let key = TrackerKey {
        protocol: network.as_str().to_string(),
        local: transport.local_addr().to_string(),
        remote: addr.to_string(),
    };
    let entry = tokio::select! {
        _ = cancel.wait() => return None,
        _ = closed.wait() => return None,
        entry = tracker.acquire(key) => entry,
    };
    // The race may have ended while we queued for the budget; don't
    // commit to a dial whose error we could then misattribute.
    if cancel.is_set() || closed.is_set() {
        drop(entry);
        return None;
    }
    let dialed = tokio::select! {
        _ = cancel.wait() => None,
        result = transport.dial(addr) => Some(result),
    };
    match dialed {
        Some(Ok(stream)) => Some(DialResult {
            stream: Box::new(TrackedStream {
                inner: stream,
                _entry: entry,
            }),
            network,
        }),
        Some(Err(err)) => {
            debug!(network = network.as_str(), %addr, "dial failed: {err}");
            None
        }
        None => None,
    }
}

/// A peer stream that holds its connection-tracker entry; closing or
/// dropping the stream releases the slot exactly once.
struct TrackedStream {
    inner: PeerStream,
    _entry: TrackerEntry,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BoxFuture, Family, Protocol};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory transport whose dials resolve after a fixed delay.
    struct SlowTransport {
        network: Network,
        delay: Duration,
        fail: bool,
        dials: AtomicUsize,
    }

    impl SlowTransport {
        fn new(network: Network, delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                network,
                delay,
                fail,
                dials: AtomicUsize::new(0),
            })
        }
    }

    impl Transport for SlowTransport {
        fn network(&self) -> Network {
            self.network
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }

        fn accept(&self) -> BoxFuture<'_, io::Result<(PeerStream, SocketAddr)>> {
            Box::pin(async { Err(io::Error::other("accept unsupported")) })
        }

        fn dial(&self, _addr: SocketAddr) -> BoxFuture<'_, io::Result<PeerStream>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            let fail = self.fail;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if fail {
                    return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
                }
                let (a, _b) = tokio::io::duplex(64);
                Ok(Box::new(a) as PeerStream)
            })
        }
    }

    const UTP4: Network = Network {
        family: Family::V4,
        protocol: Protocol::UdpTunnel,
    };

    #[tokio::test]
    async fn fastest_transport_wins_and_entries_are_released() {
        let fast = SlowTransport::new(UTP4, Duration::from_millis(10), false);
        let slow = SlowTransport::new(Network::TCP4, Duration::from_millis(200), false);
        let transports: Vec<Arc<dyn Transport>> = vec![slow.clone(), fast.clone()];
        let tracker = ConnTracker::new(16);
        let closed = Arc::new(Latch::new());

        let result = dial_first(
            &transports,
            &tracker,
            &closed,
            "127.0.0.1:6881".parse().unwrap(),
            |_| true,
        )
        .await
        .expect("one dial should win");
        assert_eq!(result.network, UTP4);
        assert_eq!(fast.dials.load(Ordering::SeqCst), 1);
        assert_eq!(slow.dials.load(Ordering::SeqCst), 1);

        // The winner holds one tracker entry; the cancelled loser's is
        // released once its arm drains.
        drop(result);
        tokio::time::timeout(Duration::from_secs(1), async {
            while tracker.active() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all tracker entries released");
    }

    #[tokio::test]
    async fn all_failures_yield_none() {
        let a = SlowTransport::new(Network::TCP4, Duration::from_millis(5), true);
        let b = SlowTransport::new(UTP4, Duration::from_millis(5), true);
        let transports: Vec<Arc<dyn Transport>> = vec![a, b];
        let tracker = ConnTracker::new(16);
        let closed = Arc::new(Latch::new());

        let result = dial_first(
            &transports,
            &tracker,
            &closed,
            "127.0.0.1:6881".parse().unwrap(),
            |_| true,
        )
        .await;
        assert!(result.is_none());
        tokio::time::timeout(Duration::from_secs(1), async {
            while tracker.active() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("failed dials release their entries");
    }

    #[tokio::test]
    async fn ineligible_networks_are_skipped() {
        let tcp = SlowTransport::new(Network::TCP4, Duration::from_millis(5), false);
        let transports: Vec<Arc<dyn Transport>> = vec![tcp.clone()];
        let tracker = ConnTracker::new(16);
        let closed = Arc::new(Latch::new());

        let result = dial_first(
            &transports,
            &tracker,
            &closed,
            "127.0.0.1:6881".parse().unwrap(),
            |network| network.protocol != Protocol::Tcp,
        )
        .await;
        assert!(result.is_none());
        assert_eq!(tcp.dials.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reduced_dial_timeout_scales_with_pressure() {
        let min = Duration::from_secs(3);
        let nominal = Duration::from_secs(20);
        // No pending peers: the nominal timeout.
        assert_eq!(reduced_dial_timeout(min, nominal, 25, 0), nominal);
        // pending == limit halves it.
        assert_eq!(
            reduced_dial_timeout(min, nominal, 25, 25),
            nominal / 2
        );
        // Extreme pressure is floored.
        assert_eq!(reduced_dial_timeout(min, nominal, 25, 10_000), min);
    }
}
