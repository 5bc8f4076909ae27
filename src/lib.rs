pub mod canon;
pub mod command;
pub mod context;
pub mod db;
pub mod driver;
pub mod error;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod input;
pub mod inputdb;
pub mod manifest;
pub mod package;
pub mod plan;
pub mod pool;
pub mod process;
pub mod progress;
pub mod run;
pub mod settings;
pub mod signal;
pub mod storage;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
