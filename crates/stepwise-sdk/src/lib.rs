//! Checked-process side of stepwise.
//!
//! A program linked with this crate can be explored by the `stepwise`
//! checker: it talks to the checker over the socket it inherits, publishes
//! its heap and actor table at well-known symbols, and lets the checker
//! decide which pending simcall runs next.
//!
//! # Quick start
//!
//! ```ignore
//! use stepwise_sdk::{ArenaAllocator, Client, Simulation};
//!
//! #[global_allocator]
//! static HEAP: ArenaAllocator = ArenaAllocator::new(4096);
//!
//! fn main() -> Result<(), stepwise_sdk::ClientError> {
//!     let mut simulation = MySimulation::new();
//!     let client = Client::initialize()?;
//!     client.main_loop(&mut simulation)
//! }
//! ```
//!
//! # Modules
//!
//! - [`client`] — Control loop and the [`Simulation`] seam
//! - [`declare`] — Stack areas, ignored memory, propositions, assertions
//! - [`actors`] — The published actor table
//! - [`heap`] — Block/fragment arena with checker-readable metadata
//! - [`published`] — The `#[no_mangle]` symbols the checker looks up

pub mod actors;
pub mod client;
pub mod declare;
pub mod heap;
pub mod published;

pub use actors::Actors;
pub use client::{Client, ClientError, Simulation};
pub use heap::{ArenaAllocator, HeapArena};
pub use published::Published;
