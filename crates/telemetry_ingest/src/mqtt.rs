mod command_publisher;
mod connection;
pub(crate) mod subscriber;
mod topic;

pub use command_publisher::{MqttCommandConnection, MqttCommandPublisher};
pub use connection::{parse_broker_url, MqttConnectionConfig};
pub use subscriber::run_mqtt_subscriber;
pub use topic::{command_topic, parse_topic, subscription_filters, ParsedTopic};
