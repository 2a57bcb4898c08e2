//! Peer → [`Sender`] map with race-safe lazy creation.

use std::collections::HashMap;
use std::sync::Arc;

use courier_keys::PeerId;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ServiceError;
use super::sender::Sender;
use crate::config::ServiceConfig;
use crate::metrics::ServiceMetrics;
use crate::transport::Transport;

pub(crate) struct SenderRegistry {
    senders: Mutex<HashMap<PeerId, Arc<Sender>>>,
    protocol: String,
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
    metrics: Arc<ServiceMetrics>,
    shutdown: CancellationToken,
}

impl SenderRegistry {
    pub(crate) fn new(
        protocol: &str,
        transport: Arc<dyn Transport>,
        config: ServiceConfig,
        metrics: Arc<ServiceMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            protocol: protocol.to_string(),
            transport,
            config,
            metrics,
            shutdown,
        }
    }

    /// Existing sender for `peer`, or a new one with its stream already open.
    ///
    /// The map lock is never held while the stream opens. A caller that finds
    /// a placeholder inserted by a concurrent caller returns it right away and
    /// queues on that sender's lock.
    pub(crate) async fn get_or_create(
        &self,
        peer: &PeerId,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Arc<Sender>, ServiceError> {
        let sender = {
            let mut senders = self.senders.lock().await;
            if let Some(existing) = senders.get(peer) {
                return Ok(existing.clone());
            }
            let sender = Arc::new(Sender::new(
                *peer,
                &self.protocol,
                self.transport.clone(),
                &self.config,
                self.metrics.clone(),
                self.shutdown.child_token(),
            ));
            senders.insert(*peer, sender.clone());
            sender
        };

        if let Err(e) = sender.prep_or_invalidate(deadline, cancel).await {
            let mut senders = self.senders.lock().await;
            match senders.get(peer) {
                Some(current) if !Arc::ptr_eq(current, &sender) => {
                    debug!(peer = %peer.short(), "lost sender setup race, using the winner");
                    return Ok(current.clone());
                }
                Some(_) => {
                    senders.remove(peer);
                }
                None => {}
            }
            return Err(e);
        }
        Ok(sender)
    }

    /// Remove `sender` if it is still the registered one, and invalidate it.
    pub(crate) async fn evict(&self, sender: &Arc<Sender>) {
        let peer = *sender.peer();
        {
            let mut senders = self.senders.lock().await;
            if senders.get(&peer).is_some_and(|current| Arc::ptr_eq(current, sender)) {
                senders.remove(&peer);
                self.metrics.sender_evicted();
                debug!(peer = %peer.short(), "evicted sender");
            }
        }
        sender.invalidate().await;
    }

    /// Remove and invalidate whatever sender `peer` has. Returns whether there was one.
    pub(crate) async fn remove(&self, peer: &PeerId) -> bool {
        let removed = self.senders.lock().await.remove(peer);
        match removed {
            Some(sender) => {
                sender.invalidate().await;
                true
            }
            None => false,
        }
    }

    pub(crate) async fn clear(&self) {
        let drained: Vec<_> = self.senders.lock().await.drain().map(|(_, s)| s).collect();
        for sender in drained {
            sender.invalidate().await;
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.senders.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn get(&self, peer: &PeerId) -> Option<Arc<Sender>> {
        self.senders.lock().await.get(peer).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::BoxStream;
    use courier_keys::SigningKey;
    use std::time::Duration;

    const PROTOCOL: &str = "/courier/test/1";

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    fn peer() -> PeerId {
        SigningKey::generate(&mut rand::rng()).public_key().into()
    }

    async fn setup() -> (MemoryNetwork, SenderRegistry, PeerId) {
        let network = MemoryNetwork::new();
        let local = network.join(peer()).await;
        let remote_id = peer();
        let remote = network.join(remote_id).await;
        remote
            .set_stream_handler(
                PROTOCOL,
                Arc::new(|_peer: PeerId, stream: BoxStream| {
                    tokio::spawn(async move {
                        let _stream = stream;
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    });
                }),
            )
            .await;
        let registry = SenderRegistry::new(
            PROTOCOL,
            local,
            ServiceConfig::default(),
            Arc::new(ServiceMetrics::new()),
            CancellationToken::new(),
        );
        (network, registry, remote_id)
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_sender() {
        let (network, registry, remote) = setup().await;
        let registry = Arc::new(registry);
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            registry.get_or_create(&remote, soon(), &cancel),
            registry.get_or_create(&remote, soon(), &cancel)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
        assert_eq!(network.streams_opened_to(&remote).await, 1);
    }

    #[tokio::test]
    async fn failed_setup_leaves_no_entry() {
        let (network, registry, remote) = setup().await;
        network.set_offline(&remote, true).await;
        let cancel = CancellationToken::new();

        let err = registry.get_or_create(&remote, soon(), &cancel).await.err().unwrap();
        assert!(err.is_transport());
        assert_eq!(registry.len().await, 0);

        network.set_offline(&remote, false).await;
        assert!(registry.get_or_create(&remote, soon(), &cancel).await.is_ok());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn evict_only_removes_the_same_sender() {
        let (_network, registry, remote) = setup().await;
        let cancel = CancellationToken::new();
        let first = registry.get_or_create(&remote, soon(), &cancel).await.unwrap();
        registry.evict(&first).await;
        assert!(first.is_invalid().await);
        assert!(registry.get(&remote).await.is_none());

        let second = registry.get_or_create(&remote, soon(), &cancel).await.unwrap();
        // a stale eviction must not knock out the replacement
        registry.evict(&first).await;
        let current = registry.get(&remote).await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert!(!second.is_invalid().await);
    }

    #[tokio::test]
    async fn remove_and_clear_invalidate() {
        let (_network, registry, remote) = setup().await;
        let cancel = CancellationToken::new();
        let sender = registry.get_or_create(&remote, soon(), &cancel).await.unwrap();
        assert!(registry.remove(&remote).await);
        assert!(!registry.remove(&remote).await);
        assert!(sender.is_invalid().await);

        let sender = registry.get_or_create(&remote, soon(), &cancel).await.unwrap();
        registry.clear().await;
        assert_eq!(registry.len().await, 0);
        assert!(sender.is_invalid().await);
    }

    #[tokio::test]
    async fn dropped_stream_is_not_leaked() {
        let (network, registry, remote) = setup().await;
        let cancel = CancellationToken::new();
        let sender = registry.get_or_create(&remote, soon(), &cancel).await.unwrap();
        assert!(sender.has_stream().await);
        registry.remove(&remote).await;
        assert!(!sender.has_stream().await);
        assert_eq!(network.streams_opened_to(&remote).await, 1);
    }

    #[tokio::test]
    async fn stalled_setup_times_out_and_leaves_no_entry() {
        let (network, registry, remote) = setup().await;
        network.set_stalled(&remote, true).await;
        let cancel = CancellationToken::new();

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = registry.get_or_create(&remote, deadline, &cancel).await.err().unwrap();
        assert!(matches!(err, ServiceError::Timeout));
        assert_eq!(registry.len().await, 0);
    }
}
