//! Probe binary for the voice-turn channel.
//!
//! Usage: channel-probe <ws_url>
//!
//! Prints every segment the server sends and answers each one with
//! `turnDone` right away, as if it had been played instantly.

use std::env;

use duet_channel::{ChannelEvent, ChannelSession};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <ws_url>", args[0]);
        eprintln!();
        eprintln!("Example:");
        eprintln!("  {} ws://127.0.0.1:8000/ws", args[0]);
        std::process::exit(1);
    }

    let url = &args[1];
    println!("Connecting to {}", url);
    let mut session = ChannelSession::connect(url).await?;
    println!("Connected, waiting for segments...");

    let mut segments = 0usize;
    loop {
        match session.next_event().await {
            ChannelEvent::Segment(segment) => {
                segments += 1;
                println!(
                    "[{}] {} ({:.2} KB){}",
                    segments,
                    segment.speaker_id,
                    segment.payload.len() as f64 / 1024.0,
                    segment
                        .stage
                        .map(|stage| format!(" stage {}", stage))
                        .unwrap_or_default()
                );
                if let Some(text) = &segment.text {
                    println!("    {}", text);
                }
                session.turn_done()?;
            }
            ChannelEvent::Closed(reason) => {
                println!(
                    "Channel closed{}",
                    reason.map(|r| format!(": {}", r)).unwrap_or_default()
                );
                break;
            }
            ChannelEvent::Failed(error) => {
                eprintln!("Channel failed: {}", error);
                break;
            }
        }
    }

    println!("Received {} segment(s)", segments);
    Ok(())
}
