mod client;
mod trace_context;
mod traits;

pub use client::*;
pub use trace_context::set_parent_from_headers;
pub use traits::*;
