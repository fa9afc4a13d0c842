//! gRPC server bound to a virtual listener.

use crate::grpc::proto::ultra_service_server::UltraServiceServer;
use crate::grpc::service::UltraHandler;
use crate::mux::VirtualListener;
use crate::util::ShutdownSignal;
use tonic::transport::Server;
use tracing::info;

pub struct GrpcServer {
    listener: VirtualListener,
}

impl GrpcServer {
    pub fn new(listener: VirtualListener) -> Self {
        Self { listener }
    }

    /// Serve until `shutdown` fires or the virtual listener closes.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), tonic::transport::Error> {
        info!(
            address = %self.listener.local_addr(),
            protocol = self.listener.protocol(),
            "gRPC server starting"
        );

        let result = Server::builder()
            .add_service(UltraServiceServer::new(UltraHandler))
            .serve_with_incoming_shutdown(self.listener.into_incoming(), async move {
                shutdown.wait().await
            })
            .await;

        info!("gRPC server stopped");
        result
    }
}
