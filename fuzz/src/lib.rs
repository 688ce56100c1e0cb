//! Fuzzing harnesses for the shmif shared memory transport.
//!
//! The rings run over heap memory and the negotiation over in-memory
//! queues, so nothing here touches real shared memory objects or
//! semaphores. Each model pairs the real implementation with a small
//! reference and checks that they agree after every step.

pub mod lifecycle_model;
pub mod negotiation_model;
pub mod ring_model;
