/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Since tasign is primarily an application and not a library, the semver
//! versioning covers the CLI only. All Rust APIs can change at any time, even
//! in patch releases.

pub mod cli;
pub mod crypto;
pub mod format;
pub mod image;
pub mod sign;
pub mod stream;
pub mod token;
pub mod util;
