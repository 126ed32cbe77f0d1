pub mod btle;
pub mod connection;
pub mod constants;
pub mod host;
pub mod registry;
pub mod types;

#[cfg(test)]
pub mod testing;
