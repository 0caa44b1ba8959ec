//! Out-of-process rendering workers.
//!
//! Each worker is a `rasterd-worker` child process that owns one PDFium
//! instance. The parent talks to it over stdin/stdout using the line protocol
//! in [`protocol`]; a crash or hang inside the engine only ever takes down
//! that child.

pub mod error;
pub mod process;
pub mod protocol;

pub use error::{SpawnError, WorkerError};
pub use process::{
    DocumentRef, ExitInfo, ProcessControl, RenderedPage, WorkerCommand, WorkerProcess,
};
