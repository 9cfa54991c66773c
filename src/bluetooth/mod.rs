pub mod bluez;
pub mod radio;
pub mod session;

pub use bluez::BluezRadio;
pub use radio::{AdapterState, Peripheral, Radio, RadioEvent};
pub use session::{
    NotificationHandler, PeripheralFilter, PeripheralSession, SessionOptions, SessionState,
};
