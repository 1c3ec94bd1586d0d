pub mod executor;

pub use executor::RpcExecutor;
