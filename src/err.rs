// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Hypervisor Status Codes
//!
//! Status values returned across the hypervisor boundary. Zero is success,
//! negative values are errno-style failures.

/// Raw status returned by a hypervisor request
pub type HvStatus = i64;

/// Success status code
pub const HV_OK: HvStatus = 0;

/// Operation not permitted (e.g. writable mapping of a pinned table)
pub const HV_EPERM: HvStatus = -1;

/// No memory error
pub const HV_ENOMEM: HvStatus = -12;

/// Resource busy
pub const HV_EBUSY: HvStatus = -16;

/// Invalid arguments error
pub const HV_EINVAL: HvStatus = -22;

/// Check whether a status denotes success
#[inline]
pub const fn hv_ok(status: HvStatus) -> bool {
    status == HV_OK
}
