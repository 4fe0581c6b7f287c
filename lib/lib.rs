//! overlay-fs shared library.
//!
//! A local store fronted by an [`Overlay`](overlay::Overlay) that retrieves missing objects from
//! a pluggable remote backend, coalescing concurrent fetches of the same path.

/// Remote protocols and their composition.
pub mod backend;
/// Blocking facade over the overlay.
pub mod blocking;
pub mod content_type;
pub mod error;
/// Filesystem helpers.
pub mod io;
pub mod overlay;
pub mod path;
/// Local store contract and the directory-backed store.
pub mod store;
/// Fetch coalescing.
pub mod sync;
