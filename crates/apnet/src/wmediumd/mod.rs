//! Wmediumd connector
//!
//! A dedicated task owns the unix stream socket to the RF daemon.
//! Callers submit messages on a bounded FIFO; the task writes each frame
//! and waits for the daemon's status byte, correlating it to the
//! monotonically increasing request id it assigned at submission.
//!
//! Updates for the same MAC pair are therefore delivered in submission
//! order; across pairs nothing is promised. On a socket error the task
//! logs, fails the in-flight queue and exits - the expected recovery is
//! topology teardown, so reconnection is deliberately not attempted.

pub mod proto;

pub use proto::{Mac, Message};

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum WmediumdError {
    #[error("Could not connect to wmediumd at {0}: {1}")]
    Connect(PathBuf, std::io::Error),

    #[error("Socket error after request {0}: {1}")]
    Socket(u64, std::io::Error),

    #[error("Daemon rejected request {0} with status {1}")]
    Rejected(u64, u8),

    #[error("Connector is shut down")]
    Closed,
}

struct Request {
    msg: Message,
    done: oneshot::Sender<Result<(), WmediumdError>>,
}

/// Depth of the submission FIFO. Senders back-pressure when the daemon
/// falls behind.
const QUEUE_DEPTH: usize = 256;

/// Handle to the connector task.
#[derive(Clone, Debug)]
pub struct WmediumdClient {
    tx: mpsc::Sender<Request>,
    disconnected: watch::Receiver<bool>,
}

impl WmediumdClient {
    /// Connect to the daemon's control socket and spawn the io task.
    pub async fn connect(path: &Path) -> Result<Self, WmediumdError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| WmediumdError::Connect(path.to_path_buf(), e))?;
        info!("Connected to wmediumd at {}", path.display());

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (disc_tx, disc_rx) = watch::channel(false);
        tokio::spawn(io_task(stream, rx, disc_tx));
        Ok(Self {
            tx,
            disconnected: disc_rx,
        })
    }

    /// True once the io task has observed a socket failure.
    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.borrow()
    }

    /// Submit one message and wait for the daemon's acknowledgement.
    pub async fn send(&self, msg: Message) -> Result<(), WmediumdError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Request { msg, done })
            .await
            .map_err(|_| WmediumdError::Closed)?;
        wait.await.map_err(|_| WmediumdError::Closed)?
    }

    pub async fn register(&self, mac: Mac, medium: u32) -> Result<(), WmediumdError> {
        self.send(Message::RegisterInterface { mac, medium }).await
    }

    pub async fn update_position(&self, mac: Mac, x: f64, y: f64, z: f64) -> Result<(), WmediumdError> {
        self.send(Message::UpdatePosition { mac, x, y, z }).await
    }

    pub async fn update_gain(&self, mac: Mac, gain_dbi: f64) -> Result<(), WmediumdError> {
        self.send(Message::UpdateGain { mac, gain_dbi }).await
    }

    pub async fn update_txpower(&self, mac: Mac, txpower_dbm: f64) -> Result<(), WmediumdError> {
        self.send(Message::UpdateTxPower { mac, txpower_dbm }).await
    }

    pub async fn update_error_prob(&self, mac_a: Mac, mac_b: Mac, prob: f64) -> Result<(), WmediumdError> {
        self.send(Message::UpdateErrorProb { mac_a, mac_b, prob }).await
    }

    /// Symmetric SNR update, emitted as two messages (a->b, b->a).
    pub async fn update_snr_pair(&self, mac_a: Mac, mac_b: Mac, snr_db: f64) -> Result<(), WmediumdError> {
        self.send(Message::UpdateSnr { mac_a, mac_b, snr_db }).await?;
        self.send(Message::UpdateSnr {
            mac_a: mac_b,
            mac_b: mac_a,
            snr_db,
        })
        .await
    }

    pub async fn set_medium(&self, mac: Mac, medium: u32) -> Result<(), WmediumdError> {
        self.send(Message::SetMedium { mac, medium }).await
    }

    pub async fn del(&self, mac: Mac) -> Result<(), WmediumdError> {
        self.send(Message::Del { mac }).await
    }
}

async fn io_task(
    mut stream: UnixStream,
    mut rx: mpsc::Receiver<Request>,
    disconnected: watch::Sender<bool>,
) {
    let mut request_id: u64 = 0;
    while let Some(req) = rx.recv().await {
        request_id += 1;
        debug!("wmediumd request {}: {:?}", request_id, req.msg);
        let frame = req.msg.to_frame();
        let result = write_and_ack(&mut stream, &frame, request_id).await;
        let failed = result.is_err();
        let _ = req.done.send(result);
        if failed {
            break;
        }
    }

    // Either the engine dropped the client (normal shutdown) or the
    // socket died. Fail whatever is still queued and bow out; teardown
    // is the caller's recovery path.
    let _ = disconnected.send(true);
    rx.close();
    while let Some(req) = rx.recv().await {
        let _ = req.done.send(Err(WmediumdError::Closed));
    }
    warn!("wmediumd connector exiting after {} requests", request_id);
    let _ = stream.shutdown().await;
}

async fn write_and_ack(
    stream: &mut UnixStream,
    frame: &[u8],
    request_id: u64,
) -> Result<(), WmediumdError> {
    stream
        .write_all(frame)
        .await
        .map_err(|e| WmediumdError::Socket(request_id, e))?;
    let mut status = [0u8; 1];
    stream
        .read_exact(&mut status)
        .await
        .map_err(|e| WmediumdError::Socket(request_id, e))?;
    if status[0] != proto::STATUS_OK {
        return Err(WmediumdError::Rejected(request_id, status[0]));
    }
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::proto::{parse_frame, Message, STATUS_OK};
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// In-process stand-in for the RF daemon: accepts one connection,
    /// acks every frame and records the decoded messages.
    pub struct MockDaemon {
        pub received: Arc<Mutex<Vec<Message>>>,
    }

    impl MockDaemon {
        pub fn spawn(path: &Path) -> std::io::Result<Self> {
            let listener = UnixListener::bind(path)?;
            let received = Arc::new(Mutex::new(Vec::new()));
            let sink = received.clone();
            tokio::spawn(async move {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                loop {
                    let mut len_buf = [0u8; 4];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u32::from_be_bytes(len_buf) as usize;
                    let mut payload = vec![0u8; len];
                    if stream.read_exact(&mut payload).await.is_err() {
                        return;
                    }
                    if let Some(msg) = parse_frame(&payload) {
                        sink.lock().push(msg);
                    }
                    if stream.write_all(&[STATUS_OK]).await.is_err() {
                        return;
                    }
                }
            });
            Ok(Self { received })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockDaemon;
    use super::*;

    const MAC_A: Mac = [0x02, 0, 0, 0, 0, 1];
    const MAC_B: Mac = [0x02, 0, 0, 0, 0, 2];

    #[tokio::test]
    async fn register_and_update_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wmd.sock");
        let daemon = MockDaemon::spawn(&path).unwrap();

        let client = WmediumdClient::connect(&path).await.unwrap();
        client.register(MAC_A, 0).await.unwrap();
        client.register(MAC_B, 0).await.unwrap();
        client.update_position(MAC_A, 10.0, 10.0, 0.0).await.unwrap();
        client.update_snr_pair(MAC_A, MAC_B, 28.0).await.unwrap();

        let received = daemon.received.lock().clone();
        assert_eq!(received.len(), 5);
        assert_eq!(received[0], Message::RegisterInterface { mac: MAC_A, medium: 0 });
        // The symmetric SNR update is two messages, a->b then b->a.
        assert_eq!(
            received[3],
            Message::UpdateSnr { mac_a: MAC_A, mac_b: MAC_B, snr_db: 28.0 }
        );
        assert_eq!(
            received[4],
            Message::UpdateSnr { mac_a: MAC_B, mac_b: MAC_A, snr_db: 28.0 }
        );
    }

    #[tokio::test]
    async fn error_prob_carries_exact_probability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wmd.sock");
        let daemon = MockDaemon::spawn(&path).unwrap();

        let client = WmediumdClient::connect(&path).await.unwrap();
        client.update_error_prob(MAC_A, MAC_B, 1.0).await.unwrap();

        let received = daemon.received.lock().clone();
        assert_eq!(
            received,
            vec![Message::UpdateErrorProb { mac_a: MAC_A, mac_b: MAC_B, prob: 1.0 }]
        );
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() {
        let err = WmediumdClient::connect(Path::new("/nonexistent/wmd.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, WmediumdError::Connect(_, _)));
    }

    #[tokio::test]
    async fn daemon_death_fails_senders_without_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wmd.sock");
        // A daemon that accepts and immediately drops the connection.
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
            // Connection dropped here.
        });

        let client = WmediumdClient::connect(&path).await.unwrap();
        let err = client.register(MAC_A, 0).await.unwrap_err();
        assert!(matches!(err, WmediumdError::Socket(_, _)));
        // Subsequent sends observe the closed connector.
        let err = client.register(MAC_B, 0).await.unwrap_err();
        assert!(matches!(err, WmediumdError::Closed | WmediumdError::Socket(_, _)));
        assert!(client.is_disconnected());
    }
}
