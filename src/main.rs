mod cli;
mod config;
mod controller;
mod format;
mod orb;
mod protocol;
mod tasks;
mod transport;
mod ui;

use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::AppConfig;
use crate::format::{format_response, render_plain};
use crate::protocol::{BackendMessage, ClientCommand, TransportEvent};
use crate::tasks::speaker::{choose_voice, SpeakerConfig, SynthesisClient};
use crate::transport::TransportConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    // the terminal ui owns stdout, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("jarvet=debug".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            url,
            host,
            secure,
            retry_ms,
            connect_timeout_ms,
            no_speaker,
        } => {
            let config = AppConfig {
                backend_url: config::resolve_backend_url(url.as_deref(), &host, secure)?,
                retry_interval: Duration::from_millis(retry_ms),
                connect_timeout: Duration::from_millis(connect_timeout_ms),
                speaker_enabled: !no_speaker,
                voice: config::voice_settings_from_env(),
            };
            controller::run_app(config).await.map_err(|err| err.into())
        }
        Command::Ask {
            url,
            host,
            secure,
            timeout_s,
            text,
        } => run_ask(url, host, secure, timeout_s, text)
            .await
            .map_err(|err| err.into()),
        Command::Voices => run_voices().await.map_err(|err| err.into()),
    }
}

async fn run_ask(
    url: Option<String>,
    host: String,
    secure: bool,
    timeout_s: u64,
    text: String,
) -> Result<(), String> {
    let backend_url = config::resolve_backend_url(url.as_deref(), &host, secure)?;
    let deadline = Duration::from_secs(timeout_s);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport = transport::spawn(
        TransportConfig {
            url: backend_url,
            retry_interval: Duration::from_secs(3),
            connect_timeout: deadline.min(Duration::from_secs(10)),
        },
        shutdown_rx,
    );
    let mut events = transport.subscribe();

    // one deadline covers the whole exchange, connect included
    let outcome = tokio::time::timeout(deadline, async {
        transport.wait_connected().await;
        transport.send(ClientCommand::TextCommand { text }).await;
        await_result(&mut events).await
    })
    .await;
    let _ = shutdown_tx.send(true);
    let message = outcome.map_err(|_| format!("timed out after {timeout_s}s"))??;
    println!("{}", render_plain(&format_response(&message)));
    Ok(())
}

async fn await_result(events: &mut broadcast::Receiver<TransportEvent>) -> Result<String, String> {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Message(BackendMessage::Result {
                success, message, ..
            })) => {
                return if success {
                    Ok(message)
                } else {
                    Err(format!("command failed: {message}"))
                };
            }
            Ok(TransportEvent::Message(BackendMessage::Error { message })) => {
                return Err(format!("backend error: {message}"));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                return Err("transport stopped".to_string());
            }
        }
    }
}

async fn run_voices() -> Result<(), String> {
    let config = SpeakerConfig::from_env();
    let client = SynthesisClient::new(&config).map_err(|err| err.to_string())?;
    let voices = client
        .fetch_voices()
        .await
        .map_err(|err| format!("voice listing failed: {err}"))?;
    if voices.is_empty() {
        println!("no voices reported by {}", config.voices_url);
        return Ok(());
    }
    let chosen = choose_voice(&voices, &config.preferred_voices, &config.locale);
    for voice in &voices {
        let marker = if chosen.as_deref() == Some(voice.id.as_str()) {
            "*"
        } else {
            " "
        };
        let name = voice.name.as_deref().unwrap_or(&voice.id);
        let language = voice.language.as_deref().unwrap_or("-");
        println!("{marker} {:<24} {:<8} {name}", voice.id, language);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ask_resolves_on_result_message() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(TransportEvent::Connected).expect("send");
        tx.send(TransportEvent::Message(BackendMessage::Status {
            status: Some("processing".to_string()),
            message: None,
        }))
        .expect("send");
        tx.send(TransportEvent::Message(BackendMessage::Result {
            success: true,
            message: "done".to_string(),
            data: serde_json::Value::Null,
        }))
        .expect("send");
        assert_eq!(await_result(&mut rx).await, Ok("done".to_string()));
    }

    #[tokio::test]
    async fn ask_surfaces_backend_failures() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(TransportEvent::Message(BackendMessage::Result {
            success: false,
            message: "unknown command".to_string(),
            data: serde_json::Value::Null,
        }))
        .expect("send");
        let err = await_result(&mut rx).await.expect_err("failed result");
        assert!(err.contains("unknown command"), "got {err}");

        let (tx, mut rx) = broadcast::channel(8);
        tx.send(TransportEvent::Message(BackendMessage::Error {
            message: "no such skill".to_string(),
        }))
        .expect("send");
        let err = await_result(&mut rx).await.expect_err("backend error");
        assert!(err.contains("no such skill"), "got {err}");
    }

    #[tokio::test]
    async fn ask_deadline_covers_the_connect_phase() {
        // nothing listens here, so the transport never connects; the
        // requested timeout still bounds the whole call
        let err = run_ask(
            Some("ws://127.0.0.1:1/ws".to_string()),
            String::new(),
            false,
            1,
            "hello".to_string(),
        )
        .await
        .expect_err("no backend listening");
        assert!(err.contains("timed out after 1s"), "got {err}");
    }
}
