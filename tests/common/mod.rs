//! Shared fixtures: endpoints wired to one in-process hub and one simulated network

#![allow(dead_code)]

use callcore::application::{CallSession, SessionContext, SessionManager};
use callcore::config::{CallConfig, IceConfig};
use callcore::domain::call::event::CallEventEnvelope;
use callcore::domain::call::policy::{AllowAll, CallPolicy};
use callcore::domain::call::value_object::SessionState;
use callcore::infrastructure::media::MemoryMediaEngine;
use callcore::infrastructure::persistence::InMemoryCallHistory;
use callcore::infrastructure::protocols::signaling::MemorySignalingHub;
use callcore::infrastructure::protocols::webrtc::SimulatedConnectionFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct Network {
    pub hub: Arc<MemorySignalingHub>,
    pub connections: Arc<SimulatedConnectionFactory>,
}

pub struct Endpoint {
    pub manager: Arc<SessionManager>,
    pub media: Arc<MemoryMediaEngine>,
    pub history: Arc<InMemoryCallHistory>,
    pub events: broadcast::Receiver<CallEventEnvelope>,
}

impl Network {
    pub fn new() -> Self {
        Self {
            hub: MemorySignalingHub::new(),
            connections: Arc::new(SimulatedConnectionFactory::from_config(&IceConfig {
                host_addresses: vec!["192.168.1.10:50000".parse().unwrap()],
                ..IceConfig::default()
            })),
        }
    }

    pub fn endpoint(&self, name: &str) -> Endpoint {
        self.endpoint_with(name, CallConfig::default(), Arc::new(AllowAll))
    }

    pub fn endpoint_with(&self, name: &str, config: CallConfig, policy: Arc<dyn CallPolicy>) -> Endpoint {
        let media = Arc::new(MemoryMediaEngine::new());
        let history = Arc::new(InMemoryCallHistory::new(config.history_limit));
        let ctx = SessionContext::new(
            Arc::new(self.hub.connect(name)),
            media.clone(),
            self.connections.clone(),
            history.clone(),
            config,
        );
        let manager = SessionManager::new(name, ctx, policy);
        manager.start();
        let events = manager.subscribe();

        Endpoint {
            manager,
            media,
            history,
            events,
        }
    }
}

impl Endpoint {
    /// The session currently ringing, if any
    pub fn ringing(&self) -> Option<CallSession> {
        self.manager
            .current_session()
            .filter(|session| session.state() == SessionState::Incoming)
    }

    pub async fn wait_for_ring(&self) -> CallSession {
        wait_until(|| self.ringing().is_some()).await;
        self.ringing().unwrap()
    }

    pub async fn answer(&self) -> CallSession {
        let session = self.wait_for_ring().await;
        session.accept().await.unwrap();
        session
    }

    pub fn drain_events(&mut self) -> Vec<CallEventEnvelope> {
        let mut events = Vec::new();
        while let Ok(envelope) = self.events.try_recv() {
            events.push(envelope);
        }
        events
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn wait_for_state(session: &CallSession, state: SessionState) {
    wait_until(|| session.state() == state).await;
}
