use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc::UnboundedReceiver,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    envelope::{Envelope, EnvelopeKind},
    peer::{PeerConnection, PeerEvent},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let peer = PeerConnection::new();
    let mut events = peer.subscribe();

    peer.connect(&args.host, args.port, &args.identity)
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&peer, &mut events, &mut stdin, &mut input).await?;
    peer.disconnect().await;

    Ok(())
}

async fn run_client_loop(
    peer: &PeerConnection,
    events: &mut UnboundedReceiver<PeerEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            event = events.recv() => {
                if !handle_event(event, peer).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, peer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_event(event: Option<PeerEvent>, peer: &PeerConnection) -> Result<bool> {
    match event {
        Some(PeerEvent::ConnectionChanged(true)) => {
            let identity = peer.identity().unwrap_or_default();
            write_stdout(&format!("*** connected as {identity}")).await?;
            Ok(true)
        }
        Some(PeerEvent::ConnectionChanged(false)) | None => {
            write_stdout("*** disconnected").await?;
            Ok(false)
        }
        Some(PeerEvent::Roster(roster)) => {
            write_stdout(&render_roster(&roster)).await?;
            Ok(true)
        }
        Some(PeerEvent::Message(envelope)) => {
            write_stdout(&render_envelope(&envelope)).await?;
            Ok(true)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    peer: &PeerConnection,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if text.eq_ignore_ascii_case("/who") {
        write_stdout(&render_roster(&peer.roster())).await?;
        return Ok(true);
    }

    peer.send_text(text).await;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

fn render_roster(roster: &[String]) -> String {
    format!("*** online: {}", roster.join(", "))
}

fn render_envelope(envelope: &Envelope) -> String {
    match envelope.kind() {
        EnvelopeKind::Join => format!("*** {} joined the chat", envelope.sender()),
        EnvelopeKind::Leave => format!("*** {} left the chat", envelope.sender()),
        EnvelopeKind::Chat => format!("<{}> {}", envelope.sender(), envelope.content()),
        EnvelopeKind::RosterUpdate => format!("*** online: {}", envelope.content()),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
