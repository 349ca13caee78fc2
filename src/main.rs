use attendance_server::api;
use attendance_server::config::{Config, LogFormat};
use attendance_server::error::Result;
use attendance_server::presence::{AttendanceServer, PersistentStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("attendance-server: {}", e);
            std::process::exit(2);
        }
    };

    init_tracing(config.log_format);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Attendance server failed");
        std::process::exit(1);
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn run(config: Config) -> Result<()> {
    let store = PersistentStore::from_config(&config.store);
    let server = AttendanceServer::start(store, config.session.clone()).await?;
    let listener = api::listener::bind(config.bind_address()).await?;

    if let Some(addr) = config.http_address() {
        let routes = api::routes::attendance_routes(server.clone());
        tracing::info!(addr = %addr, "HTTP status routes enabled");
        tokio::spawn(warp::serve(routes).run(addr));
    }

    api::listener::serve(listener, server, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await
}
