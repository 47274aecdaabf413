pub mod idle;
pub mod limited;
pub mod metered;
pub mod stream;
pub mod tls;
