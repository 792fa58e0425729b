//! Ports - 抽象化レイヤー
//!
//! Time and id generation sit behind traits so the store can be driven by a
//! fixed clock in tests.

pub mod clock;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
