pub mod rdkafka_transport;
pub mod test_utils;
pub mod transport;
pub mod types;
