//! Accumulation of spin-orbital n-particle reduced density matrices from spin-adapted
//! block operators.
//!
//! At every sweep position, the operator patterns of [`patterns`] are dispatched onto the left,
//! dot and right blocks by [`dispatch`], left-block instances are spread over the ranks by
//! [`distribution`], and every owned (left, dot, right) triple is evaluated and decomposed onto
//! spin-orbital elements by [`expectations`]. The elements are accumulated in a
//! [`sparse_array::NpdmSparseArray`] by [`driver::NpdmDriver`] and handed over to [`export`]
//! hooks when saved.

pub mod dispatch;
pub mod distribution;
pub mod driver;
pub mod expectations;
pub mod export;
pub mod patterns;
pub mod sparse_array;
pub mod wrappers;
