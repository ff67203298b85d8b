pub mod commit;
pub mod cursor;
pub mod dlq;
pub mod filter;
pub mod metrics_consts;
pub mod pipeline;
pub mod reconnect;
pub mod replay;
pub mod sink;
pub mod testing;
pub mod transform;
pub mod types;
