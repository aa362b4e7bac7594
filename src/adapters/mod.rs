pub mod a2a_client;
pub mod health_handler;
pub mod http_api;
pub mod in_memory_transport;
pub mod metrics_handler;
