// src/lib.rs

pub mod types;
pub mod merkle;
pub mod transaction;
pub mod block;
pub mod config;
pub mod storage;
pub mod contracts;
pub mod ledger;
pub mod txpool;
pub mod consensus;
pub mod sync;
pub mod node;
pub mod rpc;
