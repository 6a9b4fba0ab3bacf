// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization Primitives
//!
//! Data locks come from the `spin` crate. This module only adds the raw
//! per-frame lock that the pinning protocol hands across a batch flush.

pub mod spin;

pub use self::spin::RawSpinLock;
