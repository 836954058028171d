pub mod period;

pub use period::Period;
