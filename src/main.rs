use std::sync::Arc;

use clap::Parser;
use log::warn;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use relay_voice::audio::{devices, playback::Playback};
use relay_voice::client::CallClient;
use relay_voice::config::Settings;
use relay_voice::effects::VoiceEffectRunner;
use relay_voice::relay;
use relay_voice::signaling::Identity;
use relay_voice::state_machine::Event;

/// Voice calls and push-to-talk over a broadcast relay.
#[derive(Parser, Debug)]
#[command(name = "relay-voice", version, about)]
struct Args {
    /// Nickname to register with (persisted for next time)
    #[arg(short, long)]
    nick: Option<String>,

    /// Relay websocket URL, e.g. ws://relay.example:5555
    #[arg(long)]
    relay: Option<String>,

    /// Relay channel to join
    #[arg(long)]
    channel: Option<String>,

    /// Preferred input device name
    #[arg(long)]
    input_device: Option<String>,

    /// Preferred output device name
    #[arg(long)]
    output_device: Option<String>,

    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn pick_nickname(args: &Args, settings: &Settings) -> String {
    args.nick
        .clone()
        .or_else(|| settings.nickname.clone())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "Anonymous".to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    if args.list_devices {
        println!("Input devices:");
        for name in devices::list_input_devices() {
            println!("  {}", name);
        }
        println!("Output devices:");
        for name in devices::list_output_devices() {
            println!("  {}", name);
        }
        return Ok(());
    }

    let mut settings = Settings::load();
    let nickname = pick_nickname(&args, &settings);

    // Command-line overrides stick for next run.
    let mut dirty = args.nick.is_some();
    settings.nickname = Some(nickname.clone());
    if let Some(relay_url) = args.relay.clone() {
        settings.relay_url = relay_url;
        dirty = true;
    }
    if let Some(channel) = args.channel.clone() {
        settings.channel = channel;
        dirty = true;
    }
    if let Some(input) = args.input_device.clone() {
        settings.input_device = Some(input);
        dirty = true;
    }
    if let Some(output) = args.output_device.clone() {
        settings.output_device = Some(output);
        dirty = true;
    }
    if dirty {
        if let Err(e) = settings.save() {
            warn!("failed to save settings: {}", e);
        }
    }

    let identity = Identity {
        node_id: format!("{}-{}", nickname, chrono::Utc::now().timestamp_millis()),
        nickname,
    };

    println!("relay-voice - {} on {}", identity.nickname, settings.channel);
    println!("Type help for commands.");

    let (events_tx, events_rx) = mpsc::channel::<Event>(100);

    let relay = Arc::new(
        relay::connect(
            &settings.relay_url,
            identity.clone(),
            settings.channel.clone(),
            events_tx.clone(),
        )
        .await?,
    );

    let playback = Arc::new(Playback::new(settings.output_device.clone()));
    let runner = Arc::new(VoiceEffectRunner::new(
        identity.clone(),
        relay,
        settings.input_device.clone(),
        playback,
    ));

    // Terminal input feeds the same event channel as everything else.
    let line_tx = events_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line_tx.send(Event::UserLine(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = line_tx.send(Event::Quit).await;
                    break;
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    let _ = line_tx.send(Event::Quit).await;
                    break;
                }
            }
        }
    });

    let signal_tx = events_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(Event::Quit).await;
        }
    });

    let client = CallClient::new(identity, runner, events_tx);
    client.run(events_rx).await;

    println!("Goodbye.");
    Ok(())
}
