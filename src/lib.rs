pub mod autodep;
pub mod backend;
pub mod cache;
pub mod canon;
pub mod codec;
pub mod config;
mod db;
pub mod densemap;
pub mod engine;
pub mod exec;
pub mod graph;
pub mod hash;
pub mod job_support;
pub mod logging;
mod process;
pub mod progress;
pub mod rules;
pub mod run;
mod signal;
pub mod smallmap;
pub mod store;
pub mod uptodate;

#[cfg(not(target_arch = "wasm32"))]
use jemallocator::Jemalloc;

#[cfg(not(target_arch = "wasm32"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
