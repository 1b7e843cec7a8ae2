pub mod accounts;
pub mod daemon;
pub mod storage;
pub mod sync;
