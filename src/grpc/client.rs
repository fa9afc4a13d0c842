//! Loop-back gRPC client.

use crate::grpc::proto::ultra_service_client::UltraServiceClient;
use crate::grpc::proto::{DataRequest, HelloRequest};
use std::net::SocketAddr;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

/// Cheaply cloneable client over one HTTP/2 channel.
#[derive(Clone, Debug)]
pub struct UltraClient {
    inner: UltraServiceClient<Channel>,
}

impl UltraClient {
    /// Dial `addr` over plaintext HTTP/2.
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(format!("http://{addr}"))?
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .connect()
            .await?;

        Ok(Self {
            inner: UltraServiceClient::new(channel),
        })
    }

    /// Like [`UltraClient::connect`], but dial on first use.
    ///
    /// The mux classifies a connection by its first request, so an idle
    /// eager connection would sit in the matcher until the sniff timeout.
    pub fn connect_lazy(
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(format!("http://{addr}"))?
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .connect_lazy();

        Ok(Self {
            inner: UltraServiceClient::new(channel),
        })
    }

    pub async fn say_hello(&self, name: &str, deadline: Duration) -> Result<String, Status> {
        let request = HelloRequest {
            name: name.to_string(),
        };
        let mut client = self.inner.clone();
        let reply = with_deadline(deadline, client.say_hello(timed(request, deadline))).await?;
        Ok(reply.message)
    }

    pub async fn process_data(&self, data: &str, deadline: Duration) -> Result<String, Status> {
        let request = DataRequest {
            data: data.to_string(),
        };
        let mut client = self.inner.clone();
        let reply = with_deadline(deadline, client.process_data(timed(request, deadline))).await?;
        Ok(reply.processed)
    }
}

fn timed<T>(message: T, deadline: Duration) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(deadline);
    request
}

async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, Status>
where
    F: Future<Output = Result<tonic::Response<T>, Status>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result.map(tonic::Response::into_inner),
        Err(_) => Err(Status::deadline_exceeded("loop-back call timed out")),
    }
}
