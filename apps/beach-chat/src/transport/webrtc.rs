use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    DataChannel, IceCandidateBlob, PeerConnection, SdpKind, SessionDescription, TransportError,
    TransportEvent, TransportEvents, TransportFactory, to_setup_error,
};
use crate::config::ChatConfig;

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates `webrtc` peer connections using the configured ICE servers.
#[derive(Clone)]
pub struct WebRtcTransport {
    ice_servers: Vec<RTCIceServer>,
    localhost_only: bool,
}

impl WebRtcTransport {
    pub fn new(ice_servers: Vec<RTCIceServer>, localhost_only: bool) -> Self {
        Self {
            ice_servers,
            localhost_only,
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.ice_servers.clone(), config.localhost_only)
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransport {
    async fn create_connection(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let mut setting = SettingEngine::default();
        if self.localhost_only {
            setting.set_include_loopback_candidate(true);
        }
        let api = build_api(setting)?;
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidateBlob {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    let _ = events.send(TransportEvent::ConnectionFailed(
                        "peer connection failed".into(),
                    ));
                }
            })
        }));

        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", label = dc.label(), "remote data channel announced");
                let channel = WebRtcDataChannel::new(dc.clone());
                let _ = events.send(TransportEvent::DataChannel(channel));
                register_channel_handlers(&dc, events);
            })
        }));

        Ok(Arc::new(WebRtcPeerConnection { pc, events }))
    }
}

struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: TransportEvents,
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_setup_error)
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::RemoteDescriptionMissing);
        }
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn add_remote_candidate(
        &self,
        candidate: IceCandidateBlob,
    ) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::RemoteDescriptionMissing);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(to_setup_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        let channel = WebRtcDataChannel::new(dc.clone());
        register_channel_handlers(&dc, self.events.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

fn register_channel_handlers(dc: &Arc<RTCDataChannel>, events: TransportEvents) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let open_events = open_events.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel opened");
            let _ = open_events.send(TransportEvent::ChannelOpen);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            tracing::trace!(target = "webrtc", frame_len = msg.data.len(), "received frame");
            let _ = events.send(TransportEvent::ChannelMessage(msg.data));
        })
    }));

    dc.on_close(Box::new(move || {
        let events = events.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel closed");
            let _ = events.send(TransportEvent::ChannelClosed);
        })
    }));
}

/// Data channel with an outbound writer task so sends from sync code keep their order.
struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
}

impl WebRtcDataChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Arc<dyn DataChannel> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = dc.clone();
        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                match writer.send(&data).await {
                    Ok(bytes_written) => {
                        tracing::trace!(target = "webrtc", bytes_written, "sent frame");
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "webrtc send error");
                        break;
                    }
                }
            }
            tracing::trace!(target = "webrtc", "sender loop ended");
        });
        Arc::new(Self {
            label: dc.label().to_string(),
            dc,
            outbound_tx,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.outbound_tx
            .send(payload)
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await.map_err(to_setup_error)
    }
}
