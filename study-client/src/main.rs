use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use ractor::{Actor, ActorRef};
use study_client::backend::HttpBackend;
use study_client::channel::WsConnector;
use study_client::config::Config;
use study_client::controller::{TerminalController, TerminalWidget};
use study_client::detector::PromptPattern;
use study_client::{Notice, SessionActor, SessionArguments, SessionMsg};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Terminal output goes straight to stdout.
struct StdoutWidget;

impl TerminalWidget for StdoutWidget {
    fn write(&mut self, data: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(data);
        let _ = out.flush();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "study_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    info!(
        backend = %config.backend_url,
        relay = %config.relay_url,
        task_session_id = %config.task_session_id,
        stage = %config.stage,
        "study client starting"
    );

    let backend = HttpBackend::new(
        config.backend_url.clone(),
        config.session_id.clone(),
        config.backend_timeout,
    )?;
    let connector = WsConnector::new(config.relay_url.clone(), config.channel_connect_timeout);
    let detector = PromptPattern::new(&config.prompt_user, config.prompt_host_id_len)?;
    let controller = TerminalController::new(
        Arc::new(connector),
        Box::new(detector),
        Box::new(StdoutWidget),
    );

    let (notices_tx, mut notices) = mpsc::unbounded_channel();
    let (session, handle) = Actor::spawn(
        Some("study-session".to_string()),
        SessionActor,
        SessionArguments {
            backend: Arc::new(backend),
            controller,
            notices: notices_tx,
            initial: Some((config.task_session_id.clone(), config.stage)),
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to start session actor: {e}"))?;

    eprintln!("commands: :reset  :quit  :next  :continue  :status");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                eprintln!("[{notice}]");
                if let Notice::StudyComplete(_) = notice {
                    break;
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    ":reset" => send(&session, SessionMsg::Reset)?,
                    ":quit" => send(&session, SessionMsg::Quit)?,
                    ":next" => send(&session, SessionMsg::Advance)?,
                    ":continue" => send(&session, SessionMsg::AcknowledgeStage)?,
                    ":status" => match ractor::call!(session, SessionMsg::GetSnapshot) {
                        Ok(snapshot) => eprintln!("[{snapshot:?}]"),
                        Err(e) => warn!(error = %e, "status unavailable"),
                    },
                    _ => {
                        let mut keys = line.as_bytes().to_vec();
                        keys.push(b'\n');
                        send(&session, SessionMsg::Keystrokes(Bytes::from(keys)))?;
                    }
                }
            }
        }
    }

    session.stop(None);
    handle.await?;
    Ok(())
}

fn send(session: &ActorRef<SessionMsg>, msg: SessionMsg) -> anyhow::Result<()> {
    session
        .cast(msg)
        .map_err(|e| anyhow::anyhow!("session actor stopped: {e}"))
}
