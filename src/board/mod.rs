// ThunderBorg board driver
//
// Provides:
// - Wire protocol: command table, frame encode/decode
// - Board discovery over candidate buses with an optional address sweep
// - Command dispatch with bounded retries
// - Battery voltage compensation for motor power
// - High-level driver API with a failsafe watchdog

pub mod compensation;
pub mod discovery;
pub mod dispatcher;
mod driver;
pub mod protocol;

pub use compensation::{compensate, compensate_with_minimum, CompensationError};
pub use discovery::{discover, find_boards, DiscoveryError, ProbeAttempt, ProbeFailure};
pub use dispatcher::{BoardHandle, DispatchError, Dispatcher, RetryPolicy};
pub use driver::ThunderBorg;
pub use protocol::{Command, ProtocolError};
