//! `ultra.UltraService` implementation.

use crate::grpc::proto::ultra_service_server::UltraService;
use crate::grpc::proto::{DataReply, DataRequest, HelloReply, HelloRequest};
use crate::mux::ConnectionInfo;
use tonic::{Request, Response, Status};
use tracing::debug;

/// Fully qualified gRPC service name.
pub const SERVICE_NAME: &str = "ultra.UltraService";

/// Build the greeting returned by `SayHello`.
pub fn greeting(name: &str) -> String {
    format!("Hello {name} from Ultra Multiplexer!")
}

/// Transform applied by `ProcessData`.
pub fn process(data: &str) -> String {
    data.to_uppercase()
}

/// Stateless handler for both RPCs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UltraHandler;

fn peer<T>(request: &Request<T>) -> String {
    request
        .extensions()
        .get::<ConnectionInfo>()
        .map(|info| format!("{} ({})", info.peer_addr, info.id))
        .unwrap_or_else(|| "unknown".to_string())
}

#[tonic::async_trait]
impl UltraService for UltraHandler {
    async fn say_hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        debug!(peer = %peer(&request), "SayHello");
        let message = greeting(&request.into_inner().name);
        Ok(Response::new(HelloReply { message }))
    }

    async fn process_data(
        &self,
        request: Request<DataRequest>,
    ) -> Result<Response<DataReply>, Status> {
        debug!(peer = %peer(&request), "ProcessData");
        let processed = process(&request.into_inner().data);
        Ok(Response::new(DataReply { processed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_format() {
        assert_eq!(greeting("Ann"), "Hello Ann from Ultra Multiplexer!");
        assert_eq!(greeting(""), "Hello  from Ultra Multiplexer!");
    }

    #[test]
    fn test_service_name_matches_generated_server() {
        use crate::grpc::proto::ultra_service_server::UltraServiceServer;
        use tonic::server::NamedService;

        assert_eq!(<UltraServiceServer<UltraHandler> as NamedService>::NAME, SERVICE_NAME);
    }

    #[tokio::test]
    async fn test_say_hello() {
        let reply = UltraHandler
            .say_hello(Request::new(HelloRequest {
                name: "World".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.message, "Hello World from Ultra Multiplexer!");
    }

    #[tokio::test]
    async fn test_process_data_uppercases() {
        let reply = UltraHandler
            .process_data(Request::new(DataRequest {
                data: "mixed Case ß".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.processed, "MIXED CASE SS");
    }
}
