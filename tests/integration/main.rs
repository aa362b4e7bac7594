mod common;

mod api_test;
mod discovery_test;
mod routing_test;
