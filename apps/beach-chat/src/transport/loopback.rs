//! In-process transport that pairs connections created from the same [`LoopbackTransport`].
//!
//! Descriptions carry the endpoint index (`loopback:{index}:{kind}`), so applying a remote
//! description links two endpoints. The channel opens once both sides have applied both
//! descriptions and at least one remote candidate, mirroring how ICE needs a candidate pair
//! before anything flows.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    DataChannel, IceCandidateBlob, PeerConnection, SdpKind, SessionDescription, TransportError,
    TransportEvent, TransportEvents, TransportFactory,
};

const LOCAL_CANDIDATES_PER_ENDPOINT: usize = 2;

/// What one endpoint has been asked to do, for assertions in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub remote_descriptions_applied: usize,
    pub candidates_applied: Vec<IceCandidateBlob>,
    pub open: bool,
    pub closed: bool,
}

struct Endpoint {
    events: TransportEvents,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<usize>,
    offered_label: Option<String>,
    stats: EndpointStats,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn ready_to_open(&self) -> bool {
        self.local.is_some()
            && self.remote.is_some()
            && !self.stats.candidates_applied.is_empty()
            && !self.stats.open
            && !self.stats.closed
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: Vec<Endpoint>,
    fail_next_connection: bool,
}

impl NetworkState {
    fn endpoint(&mut self, index: usize) -> Result<&mut Endpoint, TransportError> {
        self.endpoints
            .get_mut(index)
            .ok_or(TransportError::ConnectionClosed)
    }

    fn try_open(&mut self, index: usize, handle: &LoopbackTransport) {
        let Some(peer) = self.endpoints.get(index).and_then(|e| e.peer) else {
            return;
        };
        let (Some(a), Some(b)) = (self.endpoints.get(index), self.endpoints.get(peer)) else {
            return;
        };
        if b.peer != Some(index) || !a.ready_to_open() || !b.ready_to_open() {
            return;
        }
        let (offerer, answerer) = if a.offered_label.is_some() {
            (index, peer)
        } else if b.offered_label.is_some() {
            (peer, index)
        } else {
            return;
        };
        let label = self.endpoints[offerer]
            .offered_label
            .clone()
            .unwrap_or_default();

        for side in [offerer, answerer] {
            self.endpoints[side].stats.open = true;
        }
        let remote_channel: Arc<dyn DataChannel> = Arc::new(LoopbackChannel {
            transport: handle.clone(),
            endpoint: answerer,
            label,
        });
        self.endpoints[answerer].emit(TransportEvent::DataChannel(remote_channel));
        self.endpoints[answerer].emit(TransportEvent::ChannelOpen);
        self.endpoints[offerer].emit(TransportEvent::ChannelOpen);
        tracing::debug!(target = "loopback", offerer, answerer, "channel open");
    }

    /// Closes the channel between `index` and its peer. Both sides observe the close once.
    fn close_pair(&mut self, index: usize) {
        let peer = self.endpoints.get(index).and_then(|e| e.peer);
        let was_open = self
            .endpoints
            .get(index)
            .is_some_and(|e| e.stats.open && !e.stats.closed);
        for side in std::iter::once(index).chain(peer) {
            if let Some(endpoint) = self.endpoints.get_mut(side) {
                if was_open && !endpoint.stats.closed {
                    endpoint.emit(TransportEvent::ChannelClosed);
                }
                if was_open || side == index {
                    endpoint.stats.closed = true;
                }
            }
        }
    }
}

fn parse_endpoint(description: &SessionDescription) -> Result<usize, TransportError> {
    description
        .sdp
        .strip_prefix("loopback:")
        .and_then(|rest| rest.split(':').next())
        .and_then(|index| index.parse().ok())
        .ok_or_else(|| TransportError::Setup(format!("unrecognized description {:?}", description.sdp)))
}

/// Factory for in-process connections. Clones share one virtual network.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoints are numbered in creation order, starting at zero.
    pub fn stats(&self, endpoint: usize) -> Option<EndpointStats> {
        self.state
            .lock()
            .endpoints
            .get(endpoint)
            .map(|e| e.stats.clone())
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    pub fn fail_next_connection(&self) {
        self.state.lock().fail_next_connection = true;
    }

    /// Reports a fatal connection failure to `endpoint`.
    pub fn fail_connection(&self, endpoint: usize, reason: &str) {
        if let Some(e) = self.state.lock().endpoints.get(endpoint) {
            e.emit(TransportEvent::ConnectionFailed(reason.to_string()));
        }
    }

    /// Closes the channel from `endpoint`'s side, as if that peer went away.
    pub fn drop_channel(&self, endpoint: usize) {
        self.state.lock().close_pair(endpoint);
    }
}

#[async_trait]
impl TransportFactory for LoopbackTransport {
    async fn create_connection(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_connection) {
            return Err(TransportError::Setup("loopback connection refused".into()));
        }
        let endpoint = state.endpoints.len();
        state.endpoints.push(Endpoint {
            events,
            local: None,
            remote: None,
            peer: None,
            offered_label: None,
            stats: EndpointStats::default(),
        });
        Ok(Arc::new(LoopbackConnection {
            transport: self.clone(),
            endpoint,
        }))
    }
}

struct LoopbackConnection {
    transport: LoopbackTransport,
    endpoint: usize,
}

impl LoopbackConnection {
    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let sdp = format!(
            "loopback:{}:{}",
            self.endpoint,
            match kind {
                SdpKind::Offer => "offer",
                SdpKind::Answer => "answer",
            }
        );
        SessionDescription { kind, sdp }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.transport.state.lock();
        if state.endpoint(self.endpoint)?.remote.is_none() {
            return Err(TransportError::RemoteDescriptionMissing);
        }
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.transport.state.lock();
        let endpoint = state.endpoint(self.endpoint)?;
        endpoint.local = Some(description);
        for n in 0..LOCAL_CANDIDATES_PER_ENDPOINT {
            let candidate = IceCandidateBlob::new(format!(
                "candidate:loopback{}{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.endpoint,
                n,
                50_000 + self.endpoint * 10 + n
            ));
            endpoint.emit(TransportEvent::LocalCandidate(candidate));
        }
        state.try_open(self.endpoint, &self.transport);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let peer = parse_endpoint(&description)?;
        let mut state = self.transport.state.lock();
        let endpoint = state.endpoint(self.endpoint)?;
        endpoint.remote = Some(description);
        endpoint.peer = Some(peer);
        endpoint.stats.remote_descriptions_applied += 1;
        state.try_open(self.endpoint, &self.transport);
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: IceCandidateBlob,
    ) -> Result<(), TransportError> {
        let mut state = self.transport.state.lock();
        let endpoint = state.endpoint(self.endpoint)?;
        if endpoint.remote.is_none() {
            return Err(TransportError::RemoteDescriptionMissing);
        }
        endpoint.stats.candidates_applied.push(candidate);
        state.try_open(self.endpoint, &self.transport);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let mut state = self.transport.state.lock();
        state.endpoint(self.endpoint)?.offered_label = Some(label.to_string());
        Ok(Arc::new(LoopbackChannel {
            transport: self.transport.clone(),
            endpoint: self.endpoint,
            label: label.to_string(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.transport.state.lock().close_pair(self.endpoint);
        Ok(())
    }
}

struct LoopbackChannel {
    transport: LoopbackTransport,
    endpoint: usize,
    label: String,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.transport
            .state
            .lock()
            .endpoints
            .get(self.endpoint)
            .is_some_and(|e| e.stats.open && !e.stats.closed)
    }

    fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let state = self.transport.state.lock();
        let local = state
            .endpoints
            .get(self.endpoint)
            .ok_or(TransportError::ChannelClosed)?;
        if !local.stats.open || local.stats.closed {
            return Err(TransportError::ChannelClosed);
        }
        let peer = local
            .peer
            .and_then(|peer| state.endpoints.get(peer))
            .ok_or(TransportError::ChannelClosed)?;
        peer.emit(TransportEvent::ChannelMessage(payload));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.transport.state.lock().close_pair(self.endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn candidates(events: &[TransportEvent]) -> Vec<IceCandidateBlob> {
        events
            .iter()
            .filter_map(|event| match event {
                TransportEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn pair_opens_and_exchanges_messages() {
        let transport = LoopbackTransport::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = transport.create_connection(a_tx).await.unwrap();
        let b = transport.create_connection(b_tx).await.unwrap();

        let a_channel = a.create_data_channel("chat").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        let a_candidates = candidates(&drain(&mut a_rx));
        assert_eq!(a_candidates.len(), 2);

        let early = b.add_remote_candidate(a_candidates[0].clone()).await;
        assert_eq!(early, Err(TransportError::RemoteDescriptionMissing));

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        let b_candidates = candidates(&drain(&mut b_rx));
        a.set_remote_description(answer).await.unwrap();
        for candidate in a_candidates {
            b.add_remote_candidate(candidate).await.unwrap();
        }
        assert!(!a_channel.is_open());
        a.add_remote_candidate(b_candidates[0].clone()).await.unwrap();
        assert!(a_channel.is_open());

        let b_events = drain(&mut b_rx);
        let b_channel = match &b_events[0] {
            TransportEvent::DataChannel(channel) => channel.clone(),
            other => panic!("expected data channel, got {other:?}"),
        };
        assert_eq!(b_channel.label(), "chat");
        assert!(matches!(b_events[1], TransportEvent::ChannelOpen));
        assert!(matches!(drain(&mut a_rx)[0], TransportEvent::ChannelOpen));

        a_channel.send(Bytes::from_static(b"one")).unwrap();
        a_channel.send(Bytes::from_static(b"two")).unwrap();
        let received: Vec<Bytes> = drain(&mut b_rx)
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::ChannelMessage(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

        b_channel.close().await.unwrap();
        assert!(matches!(drain(&mut a_rx)[..], [TransportEvent::ChannelClosed]));
        assert!(matches!(drain(&mut b_rx)[..], [TransportEvent::ChannelClosed]));
        assert!(a_channel.send(Bytes::from_static(b"late")).is_err());
        a.close().await.unwrap();
        assert!(drain(&mut a_rx).is_empty());

        let stats = transport.stats(1).unwrap();
        assert_eq!(stats.remote_descriptions_applied, 1);
        assert_eq!(stats.candidates_applied.len(), 2);
        assert!(stats.closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn refused_connection_is_a_setup_error() {
        let transport = LoopbackTransport::new();
        transport.fail_next_connection();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            transport.create_connection(tx.clone()).await,
            Err(TransportError::Setup(_))
        ));
        assert!(transport.create_connection(tx).await.is_ok());
        assert_eq!(transport.endpoint_count(), 1);
    }
}
