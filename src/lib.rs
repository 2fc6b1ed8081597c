pub mod bundler;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod management;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod transport;

pub use client::{GridClient, JobHandle, ResourceProvider};
pub use driver::{Driver, DriverHandle};
pub use error::{GridError, Result};
pub use node::{Node, Task, TaskContext, TaskRegistry};
pub use scheduler::{Job, JobReport, JobSla, TaskSpec, Unit, UnitOutcome, UnitResult};
