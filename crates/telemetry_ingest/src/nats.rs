mod command_request_consumer;
mod domain_event_publisher;
mod envelope_sink;

pub use command_request_consumer::*;
pub use domain_event_publisher::*;
pub use envelope_sink::*;

/// Make a value safe to use as a single NATS subject token
pub(crate) fn subject_token(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}
