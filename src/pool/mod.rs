pub mod bin_math;
pub mod client;

pub use client::{ActiveBin, CreatePositionResult, PoolClient, PositionAccount, RpcPoolClient};
