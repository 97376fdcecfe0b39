pub mod error;
pub mod utils;
pub mod logging;
pub mod config;
pub mod tools;
pub mod naming;
pub mod descriptor;
pub mod preprocess;
pub mod chunks;
pub mod workdir;
pub mod driver;
pub mod dates;
pub mod aggregate;
pub mod attach;

#[cfg(test)]
pub(crate) mod test_utils;
