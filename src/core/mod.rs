// Core modules implementing the ring engine, storage media, streams and
// error modeling.
pub mod error;
pub mod file;
pub mod notify;
pub mod reader;
pub mod ring;
pub mod state;
pub mod storage;
pub mod writer;
