//! Intercom CLI - Einstiegspunkt einer Station
//!
//! Startet eine Station als `intercom mobile` oder `intercom base` und
//! nimmt Kommandos von stdin entgegen.

use anyhow::{bail, Context};
use intercom::signaling::SignalChannel;
use intercom::{CallController, Config, Identity, Phase, RelayChannel};
use intercom::media::WebRtcFactory;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging initialisieren
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("intercom=debug".parse().unwrap())
                .add_directive("webrtc=warn".parse().unwrap()),
        )
        .init();

    let identity = match std::env::args().nth(1).as_deref() {
        Some(arg) => Identity::parse(arg)
            .with_context(|| format!("unknown station '{}', expected 'mobile' or 'base'", arg))?,
        None => bail!("usage: intercom <mobile|base>"),
    };

    let config = Config::from_env();
    tracing::info!(
        "Starting intercom station {} via {} (topic '{}')",
        identity,
        config.relay_url,
        config.topic
    );

    let channel = RelayChannel::open(&config.relay_url, &config.topic)
        .await
        .context("failed to reach the relay")?;
    let channel: Arc<dyn SignalChannel> = Arc::new(channel);
    let peers = Arc::new(WebRtcFactory::new(config.ice_servers()));

    let handle = CallController::spawn(identity, channel, peers, config.dial_timeout);

    println!("Commands: call, accept, reject, end, mute, status, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "call" => handle.dial().await,
            "accept" => handle.accept().await,
            "reject" => handle.reject().await,
            "end" => handle.hang_up().await,
            "mute" => handle.toggle_mute().await,
            "status" => print_status(&handle),
            "quit" | "exit" => break,
            "" => {}
            other => println!("Unknown command: {}", other),
        }
    }

    handle.hang_up().await;
    Ok(())
}

fn print_status(handle: &intercom::CallHandle) {
    let snapshot = handle.snapshot();
    match snapshot.phase {
        Phase::Idle => println!("idle"),
        Phase::Calling => println!("calling..."),
        Phase::Ringing => println!("incoming call - accept/reject"),
        Phase::Active => {
            let secs = snapshot.elapsed.map(|d| d.as_secs()).unwrap_or(0);
            println!(
                "in call ({}s{})",
                secs,
                if snapshot.muted { ", muted" } else { "" }
            );
        }
    }
}
