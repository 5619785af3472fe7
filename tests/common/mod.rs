#![allow(dead_code)]

use std::sync::Arc;

use signalrelay::{
    AppState,
    clock::ManualClock,
    config::Config,
    negotiation::LoopbackEngineFactory,
    relay::{MemoryBroker, Relay},
    store::{KvStore, MemoryKv},
};

pub struct Harness {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub broker: Arc<MemoryBroker>,
    pub config: Config,
}

pub fn harness(config: Config) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(clock.clone()));
    harness_with_store(config, kv, clock)
}

pub fn harness_with_store(config: Config, kv: Arc<dyn KvStore>, clock: Arc<ManualClock>) -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let relay = Relay::new(broker.clone(), config.queue_capacity);
    let state = AppState::new(
        &config,
        kv,
        relay,
        Arc::new(LoopbackEngineFactory),
        clock.clone(),
    );
    Harness {
        state,
        clock,
        broker,
        config,
    }
}

pub const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n";
