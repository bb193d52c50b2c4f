//! gRPC front end of the edge coordinator.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::KeygateService;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("keygate.v1");
}

pub use proto::keygate_server::KeygateServer;
