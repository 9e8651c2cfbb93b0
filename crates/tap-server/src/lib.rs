mod grpc;
pub mod proto;
pub mod web;

pub use grpc::TapServer;
