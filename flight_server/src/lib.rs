use arrow_flight::flight_service_server::FlightServiceServer;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use mallard::conf::ServerConfigSettings;
use mallard::error::ServerError;

pub use flight::FlightSqlServer;

mod flight;

pub async fn run() -> Result<(), ServerError> {
    let conf = ServerConfigSettings::init();
    serve(conf).await
}

/// Binds the configured address and serves flight sql until shutdown.
pub async fn serve(conf: ServerConfigSettings) -> Result<(), ServerError> {
    let addr = conf
        .flight_addr()
        .parse()
        .map_err(|e| ServerError::Internal(format!("invalid flight address: {e}")))?;
    let service = FlightSqlServer::try_new(&conf)?;

    info!("mallard flight sql server listening on {addr}");

    Server::builder()
        .add_service(FlightServiceServer::new(service))
        .serve(addr)
        .await
        .map_err(|e| ServerError::Internal(format!("flight server failed: {e}")))
}

/// Serves on an already bound listener. Used by tests to run on an
/// ephemeral port.
pub async fn serve_with_listener(
    listener: TcpListener,
    conf: ServerConfigSettings,
) -> Result<(), ServerError> {
    let service = FlightSqlServer::try_new(&conf)?;
    Server::builder()
        .add_service(FlightServiceServer::new(service))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
        .map_err(|e| ServerError::Internal(format!("flight server failed: {e}")))
}
