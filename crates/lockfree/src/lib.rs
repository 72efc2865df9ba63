//! Lock-free building blocks.
//!
//! * [`tran`] — per-worker transaction (epoch) publication governing safe
//!   memory reclamation.
//! * [`circular_queue`] — bounded MPMC ring buffer with a per-slot
//!   reservation protocol.
//! * [`freelist`] + [`hash`] — recycling allocator and the sorted-chain
//!   lock-free hash map built on it.

pub mod bitmap;
pub mod circular_queue;
pub mod freelist;
pub mod hash;
pub mod tran;
