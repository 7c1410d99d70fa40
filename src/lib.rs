#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod mix;

pub mod dense_map;

pub mod linear_map;

pub mod quad_map;

pub use dense_map::DenseMap;
pub use dense_map::UnsupportedPlatform;
pub use linear_map::IntKey;
pub use linear_map::LinearMap;
pub use quad_map::QuadMap;
