pub mod records;
pub mod server;

pub use server::Authority;
