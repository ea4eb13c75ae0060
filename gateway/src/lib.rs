pub mod backend;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod dispatcher;
pub mod driver;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod jobdesc;
pub mod lifecycle;
pub mod monitor;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod submission;

#[cfg(test)]
pub(crate) mod test_support;
