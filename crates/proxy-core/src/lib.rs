pub mod copy;
pub mod pool;
pub mod prelude;
pub mod strng;
pub mod telemetry;
