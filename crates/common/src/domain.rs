mod command;
mod device;
mod envelope;
mod event;
mod ota;
mod result;
mod sink;

pub use command::*;
pub use device::*;
pub use envelope::*;
pub use event::*;
pub use ota::*;
pub use result::*;
pub use sink::*;
