use anyhow::{bail, Context};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use meshcall::media::DeviceCapture;
use meshcall::peer::RtcLinkFactory;
use meshcall::signaling::SignalingClient;
use meshcall::{Config, Session, SessionEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshcall=info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref()).context("loading configuration")?;
    if let Some(room) = args.next() {
        config.room = Some(room);
    }
    let Some(room) = config.room.clone() else {
        bail!("no room given; pass it after the config path or set MESHCALL_ROOM");
    };

    let channel = Arc::new(SignalingClient::new(&config));
    let capture = Box::new(DeviceCapture::new(
        config.media.clone(),
        config.display_name.clone(),
    ));
    let factory = Arc::new(RtcLinkFactory::new(config.rtc_ice_servers())?);
    let (session, mut events) = Session::new(&config, channel, capture, factory);

    if let Err(e) = session.start().await {
        error!("Failed to start local media: {}", e);
        return Err(e.into());
    }
    if let Err(e) = session.join(&room).await {
        error!(room = %room, "Failed to join: {}", e);
        session.close().await;
        return Err(e.into());
    }
    info!(room = %room, name = %config.display_name, "in call, ctrl-c to leave");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SessionEvent::RemoteStream { peer, media }) => {
                    let kinds: Vec<_> = media.tracks().iter().map(|t| t.kind.to_string()).collect();
                    info!(%peer, tracks = ?kinds, "remote media");
                }
                Some(SessionEvent::ParticipantJoined { peer, display_name }) => {
                    info!(%peer, name = %display_name, "participant joined");
                }
                Some(SessionEvent::ParticipantLeft(peer)) => info!(%peer, "participant left"),
                Some(SessionEvent::RoomNotFound(room)) => {
                    error!(room = %room, "room does not exist");
                    break;
                }
                Some(SessionEvent::ConnectivityChanged(state)) => info!(%state, "relay connectivity"),
                Some(SessionEvent::NegotiationAbandoned(peer)) => {
                    warn!(%peer, "gave up negotiating with participant");
                }
                Some(SessionEvent::ConnectionIdChanged(id)) => info!(connection_id = %id, "connected"),
                None => break,
            }
        }
    }

    session.close().await;
    info!("left room");
    Ok(())
}
