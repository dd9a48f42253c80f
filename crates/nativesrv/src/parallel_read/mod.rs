//! Distribution of scan ranges between replicas reading the same table.
//!
//! The initiator owns a [`coordinator::ParallelReadCoordinator`]. Each
//! reading replica pulls ranges from it over the connection the initiator
//! opened to run the replica's part of the query, using a
//! [`channel::ReadTaskChannel`] on the replica side and an
//! [`initiator::InitiatorLink`] on the initiator side.

pub mod channel;
pub mod coordinator;
pub mod initiator;
pub mod types;
