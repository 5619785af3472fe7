use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::{
    api::{APIBuilder, interceptor_registry::register_default_interceptors, media_engine::MediaEngine},
    ice_transport::{ice_candidate::RTCIceCandidate, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        sdp::session_description::RTCSessionDescription,
    },
};

use super::engine::{CandidateSender, EngineError, EngineFactory, IceCandidate, NegotiationEngine};

/// Builds engines on `webrtc` peer connections.
#[derive(Debug, Clone)]
pub struct RtcEngineFactory {
    stun_urls: Vec<String>,
}

impl RtcEngineFactory {
    pub fn new(stun_urls: Vec<String>) -> Self {
        Self { stun_urls }
    }
}

fn internal(context: &str) -> impl Fn(webrtc::Error) -> EngineError + '_ {
    move |err| EngineError::Internal(format!("{context}: {err}"))
}

#[async_trait]
impl EngineFactory for RtcEngineFactory {
    async fn create(&self, candidates: CandidateSender) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(internal("failed to register codecs"))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(internal("failed to register interceptors"))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            }]
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(internal("failed to create peer connection"))?,
        );

        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidates = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates.send(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        });
                    }
                    Err(err) => warn!(%err, "unserializable ice candidate"),
                }
            })
        }));

        Ok(Box::new(RtcEngine { peer_connection }))
    }
}

struct RtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn set_remote_description(&self, sdp: &str) -> Result<(), EngineError> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())
            .map_err(|err| EngineError::InvalidOffer(err.to_string()))?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|err| EngineError::InvalidOffer(err.to_string()))
    }

    async fn create_local_answer(&self) -> Result<String, EngineError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(internal("failed to create answer"))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), EngineError> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())
            .map_err(internal("failed to parse local answer"))?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(internal("failed to set local description"))
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            debug!(%err, "peer connection close failed");
        }
    }
}
