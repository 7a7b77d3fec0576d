//! Creevey Runner
//!
//! Compiles stories into tests, drives browsers through WebDriver to capture
//! screenshots, compares them with approved baselines and keeps the
//! authoritative run state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TestRunner                            │
//! │    ├── catalog::compile_all(config, stories) -> TestsById   │
//! │    ├── Aggregator        single source of truth, updates    │
//! │    └── Orchestrator      start / stop / wait                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BrowserPool (per browser, `limit` slots)                   │
//! │    └── Worker (task or child process, JSON messages)        │
//! │          ├── BrowserSession   open, size, navigate, select  │
//! │          ├── StepRunner       click, hover, fill, ...       │
//! │          ├── capture()        viewport / element / tiles    │
//! │          └── ImageComparator  actual vs baseline            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Driver (trait)                                             │
//! │    ├── WebDriverSession  W3C WebDriver over HTTP            │
//! │    └── FakeDriver        in-memory page for tests           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod capture;
pub mod catalog;
pub mod compare;
pub mod driver;
pub mod error;
pub mod pool;
pub mod runner;
pub mod session;
pub mod steps;
pub mod testing;
pub mod webdriver;
pub mod worker;

pub use aggregator::Aggregator;
pub use catalog::{compile, compile_all, Catalog};
pub use compare::{ImageComparator, PixelComparator};
pub use driver::{Connector, Driver};
pub use error::{RunnerError, RunnerResult};
pub use pool::{InProcessSpawner, Orchestrator, ProcessSpawner, WorkerSpawner};
pub use runner::{RunSummary, TestRunner};
pub use webdriver::WebDriverConnector;
pub use worker::{report_stdio_error, serve_stdio, Worker, WorkerContext};
