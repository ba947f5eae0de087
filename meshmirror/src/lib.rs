pub mod console;
pub mod radio;

pub use console::Console;
pub use radio::{DeviceLink, SerialLink};
