use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::engine::{CandidateSender, EngineError, EngineFactory, IceCandidate, NegotiationEngine};

/// Engine that answers without touching the network: the answer mirrors the
/// offer's media sections and a single loopback host candidate is reported
/// once the local description is set. For local development and tests.
#[derive(Debug, Default)]
pub struct LoopbackEngineFactory;

#[async_trait]
impl EngineFactory for LoopbackEngineFactory {
    async fn create(&self, candidates: CandidateSender) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        Ok(Box::new(LoopbackEngine {
            candidates: Mutex::new(Some(candidates)),
            remote: Mutex::new(None),
        }))
    }
}

struct LoopbackEngine {
    candidates: Mutex<Option<CandidateSender>>,
    remote: Mutex<Option<String>>,
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn set_remote_description(&self, sdp: &str) -> Result<(), EngineError> {
        if !sdp.trim_start().starts_with("v=0") {
            return Err(EngineError::InvalidOffer("offer must start with `v=0`".into()));
        }
        *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = Some(sdp.to_owned());
        Ok(())
    }

    async fn create_local_answer(&self) -> Result<String, EngineError> {
        let remote = self.remote.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(offer) = remote else {
            return Err(EngineError::Internal("no remote description".into()));
        };

        let mut answer = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            Uuid::now_v7().as_u128() & 0xffff_ffff
        );
        for line in offer.lines().filter(|line| line.starts_with("m=")) {
            answer.push_str(line.trim_end());
            answer.push_str("\r\na=recvonly\r\n");
        }
        Ok(answer)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), EngineError> {
        if !sdp.starts_with("v=0") {
            return Err(EngineError::Internal("local description is not SDP".into()));
        }
        let sender = self.candidates.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.candidates.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn answers_and_reports_a_candidate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = LoopbackEngineFactory.create(tx).await.unwrap();
        engine
            .set_remote_description("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n")
            .await
            .unwrap();
        let answer = engine.create_local_answer().await.unwrap();
        assert!(answer.starts_with("v=0"));
        assert!(answer.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111"));

        engine.set_local_description(&answer).await.unwrap();
        assert!(rx.recv().await.unwrap().candidate.contains("typ host"));
        // the sender went with the first candidate
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn rejects_non_sdp_offers() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = LoopbackEngineFactory.create(tx).await.unwrap();
        assert!(matches!(
            engine.set_remote_description("hello").await,
            Err(EngineError::InvalidOffer(_))
        ));
    }
}
