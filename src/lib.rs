pub mod config;
pub mod db;
pub mod memory;
pub mod pipeline;
pub mod placeholder;
pub mod progress;
pub mod review;
pub mod session;
pub mod terminology;
pub mod textutil;
pub mod unit;
pub mod unit_log;
pub mod workspace;
