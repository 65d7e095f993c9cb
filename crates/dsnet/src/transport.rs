//! Transport abstraction for remote requests.
//!
//! A transport delivers one [`RemoteRequest`] to an address and returns the
//! answer. Implementations may use HTTP or any other request/response
//! carrier; [`memory::MemoryNetwork`] runs nodes inside one process.

use async_trait::async_trait;

use crate::messages::{RemoteError, RemoteRequest, RemoteResponse};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Delivers requests to remote nodes.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to the node at `address` and wait for its answer.
    ///
    /// Failures to deliver are `Transport` or `Timeout`; failures the remote
    /// raised come back as [`RemoteResponse::Error`].
    async fn call(&self, address: &str, request: RemoteRequest) -> Result<RemoteResponse>;
}

/// The serving side: something that answers remote requests.
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    async fn handle(&self, request: RemoteRequest) -> RemoteResponse;
}

/// An in-memory network for tests and single-process deployments.
///
/// Every message crosses the network CBOR-encoded, so size limits and the
/// wire format are exercised exactly as on a real carrier.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
    use tracing::{debug, trace};

    use dsnet_dsync::{DsyncRequest, DsyncResponse};

    use crate::messages::{decode, encode};

    /// Request envelope for internal routing.
    struct Envelope {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    }

    /// Failures the network can inject for one address.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Fault {
        /// Fail the next `n` requests before delivery.
        DropRequests(u32),
        /// Deliver the next `count` requests of `kind` but lose the replies.
        DropReplies { kind: &'static str, count: u32 },
        /// Flip a byte in every block carried, in either direction.
        CorruptBlocks,
        /// Hold every reply back this long.
        Delay(Duration),
    }

    #[derive(Debug, Default)]
    struct Faults {
        drop_requests: u32,
        drop_replies: HashMap<&'static str, u32>,
        corrupt_blocks: bool,
        delay: Option<Duration>,
    }

    /// What the faults decided for one request.
    #[derive(Debug, Default)]
    struct Verdict {
        drop_request: bool,
        drop_reply: bool,
        corrupt: bool,
        delay: Option<Duration>,
    }

    /// Shared state for the memory network.
    pub struct MemoryNetwork {
        /// Request channel for each serving address.
        senders: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
        faults: Mutex<HashMap<String, Faults>>,
        /// Requests seen per address and kind, delivered or not.
        requests: Mutex<HashMap<(String, &'static str), usize>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Answer requests sent to `address` with `handler`.
        ///
        /// Each request runs in its own task, so a slow request never holds
        /// up the others.
        pub async fn serve(&self, address: impl Into<String>, handler: Arc<dyn RemoteHandler>) {
            let address = address.into();
            let (tx, mut rx) = mpsc::channel::<Envelope>(1000);
            self.senders.write().await.insert(address.clone(), tx);

            tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let response = match decode::<RemoteRequest>(&envelope.bytes) {
                            Ok(request) => handler.handle(request).await,
                            Err(e) => RemoteResponse::Error(e),
                        };
                        let bytes = match encode(&response) {
                            Ok(bytes) => bytes,
                            Err(e) => match encode(&RemoteResponse::Error(e)) {
                                Ok(bytes) => bytes,
                                Err(_) => return,
                            },
                        };
                        // The caller may have timed out and gone away.
                        let _ = envelope.reply.send(bytes);
                    });
                }
                debug!(address = %address, "stopped serving");
            });
        }

        /// Stop routing to `address`. Requests already delivered still finish.
        pub async fn disconnect(&self, address: &str) {
            self.senders.write().await.remove(address);
        }

        /// Add a fault for requests sent to `address`.
        pub async fn inject(&self, address: &str, fault: Fault) {
            let mut faults = self.faults.lock().await;
            let entry = faults.entry(address.to_string()).or_default();
            match fault {
                Fault::DropRequests(n) => entry.drop_requests += n,
                Fault::DropReplies { kind, count } => *entry.drop_replies.entry(kind).or_default() += count,
                Fault::CorruptBlocks => entry.corrupt_blocks = true,
                Fault::Delay(delay) => entry.delay = Some(delay),
            }
        }

        /// Remove every fault for `address`.
        pub async fn heal(&self, address: &str) {
            self.faults.lock().await.remove(address);
        }

        /// Requests of `kind` sent to `address` so far.
        pub async fn request_count(&self, address: &str, kind: &'static str) -> usize {
            self.requests
                .lock()
                .await
                .get(&(address.to_string(), kind))
                .copied()
                .unwrap_or(0)
        }

        /// A transport on this network with a per-request timeout.
        pub fn transport(self: &Arc<Self>, timeout: Duration) -> MemoryTransport {
            MemoryTransport {
                network: Arc::clone(self),
                timeout,
            }
        }

        async fn judge(&self, address: &str, kind: &'static str) -> Verdict {
            *self
                .requests
                .lock()
                .await
                .entry((address.to_string(), kind))
                .or_default() += 1;

            let mut faults = self.faults.lock().await;
            let Some(faults) = faults.get_mut(address) else {
                return Verdict::default();
            };

            let mut verdict = Verdict {
                corrupt: faults.corrupt_blocks,
                delay: faults.delay,
                ..Verdict::default()
            };
            if faults.drop_requests > 0 {
                faults.drop_requests -= 1;
                verdict.drop_request = true;
                return verdict;
            }
            if let Some(count) = faults.drop_replies.get_mut(kind) {
                if *count > 0 {
                    *count -= 1;
                    verdict.drop_reply = true;
                }
            }
            verdict
        }
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self {
                senders: RwLock::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
            }
        }
    }

    fn corrupt(data: &mut Bytes) {
        let mut bytes = data.to_vec();
        match bytes.last_mut() {
            Some(last) => *last ^= 0xff,
            None => bytes.push(0),
        }
        *data = Bytes::from(bytes);
    }

    /// A client on a [`MemoryNetwork`].
    pub struct MemoryTransport {
        network: Arc<MemoryNetwork>,
        timeout: Duration,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn call(&self, address: &str, mut request: RemoteRequest) -> Result<RemoteResponse> {
            let kind = request.kind();
            let verdict = self.network.judge(address, kind).await;
            if verdict.drop_request {
                debug!(address, kind, "fault: request dropped");
                return Err(RemoteError::Transport(format!("{} to {} dropped", kind, address)));
            }
            if verdict.corrupt {
                if let RemoteRequest::Dsync(DsyncRequest::PutBlock { data, .. }) = &mut request {
                    corrupt(data);
                }
            }

            let bytes = encode(&request)?;
            let sender = self
                .network
                .senders
                .read()
                .await
                .get(address)
                .cloned()
                .ok_or_else(|| RemoteError::Transport(format!("peer not found: {}", address)))?;

            let (tx, rx) = oneshot::channel();
            sender
                .send(Envelope { bytes, reply: tx })
                .await
                .map_err(|_| RemoteError::Transport(format!("peer disconnected: {}", address)))?;
            trace!(address, kind, "request delivered");

            let delay = verdict.delay;
            let reply = tokio::time::timeout(self.timeout, async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                rx.await
            })
            .await;
            let reply = match reply {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(_)) => {
                    return Err(RemoteError::Transport(format!("{} dropped {}", address, kind)));
                }
                Err(_) => {
                    return Err(RemoteError::Timeout(format!(
                        "{} to {} after {:?}",
                        kind, address, self.timeout
                    )));
                }
            };
            if verdict.drop_reply {
                debug!(address, kind, "fault: reply lost");
                return Err(RemoteError::Transport(format!("reply to {} from {} lost", kind, address)));
            }

            let mut response: RemoteResponse = decode(&reply)?;
            if verdict.corrupt {
                if let RemoteResponse::Dsync(DsyncResponse::Block { data, .. }) = &mut response {
                    corrupt(data);
                }
            }
            Ok(response)
        }
    }

}
