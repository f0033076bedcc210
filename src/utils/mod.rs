//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod context;
mod error;
mod every;
mod stopper;
mod sync;
mod timer;

pub use bitmap::Bitmap;
pub use context::{CancelHandle, Ctx};
pub use error::{AbortReason, ErrorDetail, KvError, RetryReason};
pub use every::LogEvery;
pub use print::{logger_init, ME};
pub use stopper::Stopper;
pub use sync::{MutexExt, RwLockExt};
pub use timer::Timer;
