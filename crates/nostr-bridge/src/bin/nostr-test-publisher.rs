use std::time::Duration;

use clap::Parser;
use nostr_sdk::prelude::*;
use rand_core::{OsRng, RngCore};
use serde_json::{json, Value};
use tracing::info;

use nostr_bridge::{encrypt, ConversationKey, KIND_APP_DATA};

#[derive(Debug, Parser)]
#[command(name = "nostr-test-publisher")]
#[command(about = "Publish encrypted sample events for the Nostr to Home Assistant bridge")]
struct Args {
    /// Print a fresh key pair and exit.
    #[arg(long)]
    generate_keys: bool,
    /// Bridge public key (npub or hex).
    #[arg(long, required_unless_present = "generate_keys")]
    bridge_pubkey: Option<String>,
    #[arg(long, default_value = "wss://relay.damus.io")]
    relay: String,
    #[arg(long, default_value_t = 5)]
    count: u32,
    /// Seconds between events.
    #[arg(long, default_value_t = 3.0)]
    interval: f64,
    /// Publisher secret key (nsec or hex); an ephemeral key is generated otherwise.
    #[arg(long)]
    publisher_nsec: Option<String>,
    #[arg(long, default_value_t = KIND_APP_DATA)]
    kind: u16,
}

/// Pause between events; rejects negative, NaN and overflowing values.
fn pause(interval: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(interval)
        .map_err(|e| format!("--interval {} is not a valid duration: {}", interval, e))
}

fn pick<T: Copy>(options: &[T]) -> T {
    options[(OsRng.next_u32() as usize) % options.len()]
}

fn sensor_payload() -> Value {
    let tenths = 600 + OsRng.next_u32() % 351;
    json!({
        "type": "sensor",
        "entity_id": "outdoor_temperature",
        "value": tenths as f64 / 10.0,
        "unit": "°F",
        "device_class": "temperature",
        "attributes": {"location": "backyard"},
    })
}

fn binary_sensor_payload() -> Value {
    json!({
        "type": "binary_sensor",
        "entity_id": "front_door",
        "state": pick(&[true, false]),
        "device_class": "door",
        "attributes": {"battery": 50 + OsRng.next_u32() % 51},
    })
}

fn notification_payload() -> Value {
    let (title, message, severity) = pick(&[
        ("Motion Detected", "Camera 2 detected motion at driveway", "warning"),
        ("Low Battery", "Front door sensor battery at 15%", "info"),
        ("Smoke Alarm", "Kitchen smoke detector triggered", "critical"),
    ]);
    json!({
        "type": "notification",
        "title": title,
        "message": message,
        "severity": severity,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if args.generate_keys {
        let keys = Keys::generate();
        println!("nsec (private): {}", keys.secret_key().to_bech32()?);
        println!("npub (public):  {}", keys.public_key().to_bech32()?);
        println!();
        println!("Put the npub into the bridge options as 'publisher_public_key'.");
        println!("Keep the nsec secret; pass it with --publisher-nsec to publish test events.");
        return Ok(());
    }

    let delay = pause(args.interval)?;
    let bridge_pubkey = match args.bridge_pubkey.as_deref() {
        Some(value) => PublicKey::parse(value)?,
        None => return Err("--bridge-pubkey is required".into()),
    };

    let keys = match args.publisher_nsec.as_deref() {
        Some(secret) => Keys::parse(secret)?,
        None => {
            let keys = Keys::generate();
            info!(
                npub = %keys.public_key().to_bech32()?,
                "Generated ephemeral publisher key (use --publisher-nsec to reuse one)"
            );
            keys
        }
    };

    let conversation_key = ConversationKey::derive(keys.secret_key(), &bridge_pubkey)?;

    let client = Client::builder().signer(keys.clone()).build();
    client.add_relay(&args.relay).await?;
    client.connect().await;
    info!(
        relay = %args.relay,
        publisher = %keys.public_key().to_bech32()?,
        bridge = %bridge_pubkey.to_bech32()?,
        count = args.count,
        "Connected; publishing sample events"
    );

    let builders: [fn() -> Value; 3] =
        [sensor_payload, binary_sensor_payload, notification_payload];
    for i in 0..args.count {
        let payload = pick(&builders)();
        let content = encrypt(&payload.to_string(), &conversation_key)?;

        let d_tag = payload["entity_id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("notification_{}", Timestamp::now().as_u64()));

        let builder = EventBuilder::new(Kind::Custom(args.kind), content)
            .tags([Tag::identifier(d_tag.clone())]);
        let output = client.send_event_builder(builder).await?;

        info!(
            n = i + 1,
            total = args.count,
            payload_type = payload["type"].as_str().unwrap_or_default(),
            d_tag = %d_tag,
            event_id = %&output.id().to_hex()[..12],
            success = output.success.len(),
            "Published event"
        );

        if i + 1 < args.count {
            tokio::time::sleep(delay).await;
        }
    }

    client.disconnect().await;
    info!("Done");
    Ok(())
}
