use tonic_build::manual::{Builder, Method, Service};

fn main() {
    let call = Method::builder()
        .name("forward")
        .route_name("Call")
        .input_type("crate::proto::RemoteMessage")
        .output_type("crate::proto::Ack")
        .codec_path("tonic::codec::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = Service::builder()
        .name("RemoteService")
        .package("metricgrid.remote")
        .method(call)
        .build();

    Builder::new().compile(&[service]);
}
