//! In-process integration tests: whole meshes of Trellis runtimes running
//! in one tokio runtime, talking over loopback TCP.

mod harness;

mod calls;
mod failures;
mod fanout;
mod mesh;
mod scopes;
