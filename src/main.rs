use chatgate::app::AppState;
use chatgate::error::GatewayError;
use chatgate::shutdown::DrainOutcome;
use std::net::SocketAddr;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chatgate=debug")),
        )
        .json()
        .init();

    match run().await {
        Ok(DrainOutcome::Drained) => {}
        Ok(DrainOutcome::Forced) => {
            tracing::error!("shutdown did not drain cleanly");
            std::process::exit(1);
        }
        Err(err) => {
            tracing::error!(error = %err, "gateway failed");
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<DrainOutcome, GatewayError> {
    let state = chatgate::app::load_state()?;
    let app = chatgate::app::build_app(state.clone());
    let listen = state.runtime.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: listen.clone(),
            source,
        })?;
    let addr = listener.local_addr().map_err(GatewayError::Serve)?;
    tracing::info!(
        %addr,
        adapters = state.adapters.adapter_count(),
        "listening"
    );

    spawn_reload_on_hangup(state.clone());

    let coordinator = state.shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(coordinator.drain_signal());
    let server = async move { server.await };

    coordinator
        .run(server, chatgate::shutdown::termination_signals())
        .await
        .map_err(GatewayError::Serve)
}

#[cfg(unix)]
fn spawn_reload_on_hangup(state: AppState) {
    use tokio::signal::unix::{SignalKind, signal};
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGHUP handler, reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match state.reload_adapters() {
                Ok(count) => tracing::info!(adapters = count, "reloaded adapters on SIGHUP"),
                Err(err) => {
                    tracing::error!(error = %err, "adapter reload failed, keeping current table")
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_state: AppState) {}
