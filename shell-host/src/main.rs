use shell_host::actors::{spawn_shell, ShellSpec};
use shell_host::api;
use shell_host::app_state::AppState;
use shell_host::config::Config;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shell_host=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, shell = %config.shell, "shell host starting");

    let mut spec = ShellSpec::new(config.shell.clone(), config.working_dir.clone());
    spec.term = config.term.clone();
    spec.backlog_limit = config.backlog_bytes;
    let shell = spawn_shell(spec).await?;

    let app = api::router(AppState::new(shell.clone()));

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let exited = shell.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            exited.wait_exit().await;
        })
        .await?;

    let exit = shell.wait_exit().await;
    error!(exit_code = ?exit.exit_code, "shell exited; shutting down");
    Err(anyhow::anyhow!(
        "shell process exited with code {:?}",
        exit.exit_code
    ))
}
