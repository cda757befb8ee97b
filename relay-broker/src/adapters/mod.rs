#[cfg(feature = "amqp")]
pub mod amqp;
