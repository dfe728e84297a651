//! I/O support for the IPC linear-system solver.
//!
//! This crate provides:
//! - **Sparse triplets** (`SparseTriplets`), the backend-agnostic matrix
//!   interchange type
//! - **MatrixMarket sections** for a matrix (coordinate) and a dense vector
//!   (array), written one after the other into a single system file
//!
//! Files written here are meant for regression fixtures and offline
//! reproduction of a solve, never for the per-iteration hot path.

pub mod error;
pub mod matrix_market;
mod triplets;

pub use error::{IoError, Result};
pub use matrix_market::{
    parse_system, read_matrix, read_system, write_matrix, write_system, write_system_to,
    write_vector,
};
pub use triplets::{SparseSystem, SparseTriplets};
