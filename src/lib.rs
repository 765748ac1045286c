pub mod cli;
pub mod constants;
pub mod logging;
pub mod quote;
pub mod service;
pub mod tail;
