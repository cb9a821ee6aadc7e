//! Housecall CLI demo

use anyhow::Result;
use clap::{Parser, Subcommand};
use housecall_core::prelude::*;
use housecall_core::signaling::LocalRelay;
use housecall_core::testing::{FakeCaptureSource, MockAgentFactory};
use housecall_core::SdpAgentFactory;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a loopback doctor↔nurse call in one process
    Demo {
        /// Hang up after this many seconds
        #[arg(long, default_value = "5")]
        seconds: u64,

        /// Audio-only call
        #[arg(long)]
        audio_only: bool,

        /// Use the scripted agent instead of a real peer connection
        #[arg(long)]
        mock: bool,

        /// STUN server for the real agent
        #[arg(long, default_value = "stun:stun.l.google.com:19302")]
        stun: String,
    },

    /// Show build configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("housecall=info")
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo {
            seconds,
            audio_only,
            mock,
            stun,
        } => run_demo(seconds, audio_only, mock, &stun).await,
        Commands::Status => {
            println!("housecall {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_demo(seconds: u64, audio_only: bool, mock: bool, stun: &str) -> Result<()> {
    let relay = LocalRelay::new();
    let doctor = Participant::new("doctor-demo", "Dr. Demo", Role::Doctor);
    let nurse = Participant::new("nurse-demo", "Nurse Demo", Role::Nurse);
    let (doctor_channel, doctor_inbound) = relay.register(doctor.clone());
    let (nurse_channel, nurse_inbound) = relay.register(nurse.clone());

    let agents: Arc<dyn SdpAgentFactory> = if mock {
        MockAgentFactory::new()
    } else {
        Arc::new(WebRtcAgentFactory::new())
    };
    let config = CallConfig {
        rtc: RtcConfig {
            ice_servers: vec![IceServer::stun(stun)],
        },
        media: if audio_only {
            MediaConstraints::audio_only()
        } else {
            MediaConstraints::video_call()
        },
    };

    let doctor_service = CallService::new(
        doctor.clone(),
        doctor_channel,
        FakeCaptureSource::new(),
        Arc::clone(&agents),
        config.clone(),
        doctor_inbound,
    );
    let nurse_service = Arc::new(CallService::new(
        nurse.clone(),
        nurse_channel,
        FakeCaptureSource::new(),
        agents,
        config,
        nurse_inbound,
    ));

    // The nurse side auto-accepts the ring.
    let mut nurse_events = nurse_service.subscribe();
    let acceptor = Arc::clone(&nurse_service);
    tokio::spawn(async move {
        while let Ok(event) = nurse_events.recv().await {
            if let SessionEvent::IncomingCall { caller, service_id } = event {
                println!("[nurse]  ringing: {} for visit {service_id}", caller.display_name);
                if let Err(e) = acceptor.accept(&caller.id).await {
                    eprintln!("[nurse]  accept failed: {e}");
                }
            }
        }
    });

    let mut doctor_events = doctor_service.subscribe();
    println!("[doctor] calling {}", nurse.display_name);
    doctor_service.start_call(nurse.clone(), "visit-demo").await?;

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let mut hung_up = false;
    loop {
        tokio::select! {
            event = doctor_events.recv() => match event {
                Ok(SessionEvent::StateChanged { state, .. }) => {
                    println!("[doctor] state: {state:?}");
                }
                Ok(SessionEvent::RemoteTrackAdded { kind, .. }) => {
                    println!("[doctor] remote track: {kind:?}");
                }
                Ok(SessionEvent::Ended { reason, .. }) => {
                    println!("[doctor] ended: {}", reason.describe());
                    break;
                }
                Ok(SessionEvent::IncomingCall { .. }) => {}
                Err(_) => break,
            },
            () = &mut deadline, if !hung_up => {
                hung_up = true;
                // Hanging up discards the session, so read the clock first.
                if let Some(duration) = doctor_service.call_duration(&nurse.id).await {
                    println!("[doctor] call lasted {duration:?}");
                }
                println!("[doctor] hanging up");
                if let Err(e) = doctor_service.hang_up(&nurse.id).await {
                    eprintln!("[doctor] hang up failed: {e}");
                    break;
                }
            }
        }
    }

    nurse_service.shutdown().await;
    doctor_service.shutdown().await;
    Ok(())
}
