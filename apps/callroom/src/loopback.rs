use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use media_session::media::SyntheticMedia;
use media_session::transport::RtcTransportFactory;
use media_session::{
    Booking, BookingRoleResolver, CallState, MediaConstraints, NegotiationEngine, RoleResolver,
    StaticBookings,
};
use signaling_store::{ensure_session, Janitor, MemoryStore, SignalingStore};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cli::LoopbackArgs;
use crate::config::Config;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(config: Config, args: LoopbackArgs) -> Result<()> {
    let store: Arc<dyn SignalingStore> = Arc::new(MemoryStore::new());
    let janitor = Janitor::spawn(
        Arc::clone(&store),
        config.janitor_interval,
        config.session_retention,
    );

    let bookings = StaticBookings::new();
    bookings.insert(Booking {
        session_id: args.session.clone(),
        requester_id: args.requester.clone(),
        interpreter_id: args.interpreter.clone(),
    });
    let resolver: Arc<dyn RoleResolver> = Arc::new(BookingRoleResolver::new(bookings));

    ensure_session(store.as_ref(), &args.session, &args.requester)
        .await
        .context("creating call session")?;

    let constraints = MediaConstraints {
        video: !args.audio_only,
        audio: true,
    };
    let requester = Arc::new(endpoint(&config, &store));
    let interpreter = Arc::new(endpoint(&config, &store));

    let joining = {
        let interpreter = Arc::clone(&interpreter);
        let resolver = Arc::clone(&resolver);
        let session = args.session.clone();
        let self_id = args.interpreter.clone();
        let delay = args.join_delay();
        tokio::spawn(async move {
            sleep(delay).await;
            interpreter
                .join_call(resolver.as_ref(), &session, &self_id, constraints, |remote| {
                    info!(tracks = remote.tracks().len(), "interpreter receiving media");
                })
                .await
        })
    };

    let outcome = async {
        let role = requester
            .join_call(
                resolver.as_ref(),
                &args.session,
                &args.requester,
                constraints,
                |remote| info!(tracks = remote.tracks().len(), "requester receiving media"),
            )
            .await
            .map_err(|err| anyhow::anyhow!("{err} ({})", err.remediation()))?;
        info!(role = role.role.as_str(), "requester joined");

        joining
            .await
            .context("interpreter task")?
            .map_err(|err| anyhow::anyhow!("{err} ({})", err.remediation()))?;

        requester.wait_for(CallState::Connected, CONNECT_TIMEOUT).await?;
        interpreter.wait_for(CallState::Connected, CONNECT_TIMEOUT).await?;
        println!("connected: session {}", args.session);

        exercise_controls(&requester, &args).await?;

        tokio::select! {
            _ = sleep(args.duration()) => {}
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
        anyhow::Ok(())
    }
    .await;

    requester.hang_up(&args.session, false).await;
    interpreter.hang_up(&args.session, true).await;
    janitor.shutdown();

    match &outcome {
        Ok(()) => println!("call ended"),
        Err(err) => warn!(error = %err, "loopback call failed"),
    }
    outcome
}

fn endpoint(config: &Config, store: &Arc<dyn SignalingStore>) -> NegotiationEngine {
    NegotiationEngine::new(
        config.engine.clone(),
        Arc::clone(store),
        Arc::new(SyntheticMedia::new()),
        Arc::new(RtcTransportFactory::new()),
    )
}

async fn exercise_controls(engine: &NegotiationEngine, args: &LoopbackArgs) -> Result<()> {
    let muted = engine.toggle_microphone()?;
    let unmuted = engine.toggle_microphone()?;
    info!(muted = !muted.enabled, unmuted = unmuted.enabled, "microphone toggled");

    if !args.audio_only {
        let off = engine.toggle_camera().await?;
        let on = engine.toggle_camera().await?;
        info!(off = ?off.effect, on = ?on.effect, "camera toggled");
    }

    if args.screen_share && !args.audio_only {
        engine.start_screen_share().await?;
        sleep(Duration::from_secs(1)).await;
        engine.stop_screen_share().await?;
        info!("screen share round trip complete");
    }
    Ok(())
}
