pub mod acl;
pub mod cancel;
pub mod config;
pub mod provision;
pub mod query;
pub mod storage;
