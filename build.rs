fn main() {
    let method = |name: &str, route: &str, input: &str, output: &str| {
        tonic_build::manual::Method::builder()
            .name(name)
            .route_name(route)
            .input_type(input)
            .output_type(output)
            .codec_path("tonic::codec::ProstCodec")
            .build()
    };

    let service = tonic_build::manual::Service::builder()
        .name("UltraService")
        .package("ultra")
        .method(method(
            "say_hello",
            "SayHello",
            "crate::grpc::proto::HelloRequest",
            "crate::grpc::proto::HelloReply",
        ))
        .method(method(
            "process_data",
            "ProcessData",
            "crate::grpc::proto::DataRequest",
            "crate::grpc::proto::DataReply",
        ))
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
