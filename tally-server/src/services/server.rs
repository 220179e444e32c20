use std::net::{SocketAddr, TcpListener};

use tally_system::Controller;

use crate::endpoints;
use crate::service::{ServerError, ServiceState};

/// The local HTTP server hosting the ingestion and status resources.
///
/// Binding happens in [`new`](Self::new) so that a taken port is a startup
/// error instead of a background failure. On shutdown the server first flips
/// the [`ServiceState`] into its shutting-down state (new reports get `503`),
/// then drains open connections.
pub struct HttpServer {
    listener: TcpListener,
    state: ServiceState,
}

impl HttpServer {
    /// Binds the server to `127.0.0.1:<port>`.
    pub fn new(port: u16, state: ServiceState) -> Result<Self, ServerError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::BindFailed {
            port,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::BindFailed { port, source })?;

        Ok(Self { listener, state })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Serves until a shutdown is triggered and connections have drained.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let Self { listener, state } = self;

        let app = endpoints::routes().with_state(state.clone());
        let listener = tokio::net::TcpListener::from_std(listener)?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                Controller::shutdown_handle().notified().await;
                state.set_shutting_down();
                tally_log::info!("shutting down HTTP server");
            })
            .await
    }
}
