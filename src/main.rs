use anyhow::Context;
use callcore::application::metrics::describe_metrics;
use callcore::application::{CallSession, SessionContext, SessionManager};
use callcore::config::Config;
use callcore::domain::call::event::CallEvent;
use callcore::domain::call::policy::AllowAll;
use callcore::domain::call::value_object::{CallKind, SessionState};
use callcore::domain::shared::value_objects::ParticipantId;
use callcore::infrastructure::media::MemoryMediaEngine;
use callcore::infrastructure::persistence::InMemoryCallHistory;
use callcore::infrastructure::protocols::signaling::MemorySignalingHub;
use callcore::infrastructure::protocols::webrtc::SimulatedConnectionFactory;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    describe_metrics();
    info!("Starting CallCore demo");
    info!("Configuration loaded:\n{}", config.to_toml()?);

    let hub = MemorySignalingHub::new();
    let connections = Arc::new(SimulatedConnectionFactory::from_config(&config.ice));

    let endpoint = |name: &str| {
        let ctx = SessionContext::new(
            Arc::new(hub.connect(name)),
            Arc::new(MemoryMediaEngine::new()),
            connections.clone(),
            Arc::new(InMemoryCallHistory::new(config.call.history_limit)),
            config.call.clone(),
        );
        let manager = SessionManager::new(name, ctx, Arc::new(AllowAll));
        manager.start();
        manager
    };
    let alice = endpoint("alice");
    let bob = endpoint("bob");

    // Bob answers whatever rings
    let mut bob_events = bob.subscribe();
    let answering = bob.clone();
    tokio::spawn(async move {
        while let Ok(envelope) = bob_events.recv().await {
            if let CallEvent::IncomingCall { call_id, from, .. } = envelope.event {
                info!(call_id = %call_id, "bob: answering {}", from);
                if let Some(session) = answering.current_session() {
                    if let Err(e) = session.accept().await {
                        warn!("bob: could not answer: {}", e);
                    }
                }
            }
        }
    });

    let call = alice
        .request_outgoing_call(vec![ParticipantId::from("bob")], CallKind::Voice)
        .await?;
    wait_for_state(&call, SessionState::Active).await?;
    info!(call_id = %call.call_id(), "alice: call is active");

    let flags = call.toggle_mute();
    info!("alice: muted = {}", flags.muted);
    tokio::time::sleep(Duration::from_millis(250)).await;
    call.toggle_mute();

    call.end().await;
    info!("alice: call stats {:?}", call.stats());

    // Give bob a moment to process the Bye
    tokio::time::sleep(Duration::from_millis(50)).await;

    for (name, manager) in [("alice", &alice), ("bob", &bob)] {
        for record in manager.recent_calls(10).await? {
            info!(
                "{} history: {} {:?} {:?} with {:?}, {}s",
                name,
                record.call_id,
                record.direction,
                record.outcome,
                record.remote_participants,
                record.duration_seconds()
            );
        }
    }

    info!("CallCore demo finished");
    Ok(())
}

async fn wait_for_state(call: &CallSession, state: SessionState) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while call.state() != state && !call.is_terminal() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("timed out waiting for the call")?;

    anyhow::ensure!(
        call.state() == state,
        "call finished in {} ({:?})",
        call.state(),
        call.end_reason()
    );
    Ok(())
}
