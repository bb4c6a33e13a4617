// This file is part of xgqd, a host-side service for the XGQ command queue of PCIe FPGA accelerator cards.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// xgqd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// xgqd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! File system helpers that wrap `std::fs` errors into [`XgqdError`] with the offending path.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use xgqd::system_io::fs_read_bytes;
//! # use std::path::Path;
//! # fn example() -> Result<(), xgqd::error::XgqdError> {
//! let image = fs_read_bytes(Path::new("/lib/firmware/xilinx/partition.xsabin"))?;
//! # Ok(())
//! # }
//! ```

use crate::error::XgqdError;
use log::trace;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;

/// Read a whole file into memory.
///
/// # Arguments
///
/// * `file_path` - Path to the file to read
///
/// # Returns: `Result<Vec<u8>, XgqdError>`
/// * `Ok(Vec<u8>)` - The file contents
/// * `Err(XgqdError::IORead)` - If the file cannot be read (doesn't exist, permissions, etc.)
pub fn fs_read_bytes(file_path: &Path) -> Result<Vec<u8>, XgqdError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf = Vec::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_end(&mut buf));

    match result {
        Ok(n) => {
            trace!("Read {n} bytes");
            Ok(buf)
        }
        Err(e) => Err(XgqdError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_names_the_path() {
        let err = fs_read_bytes(Path::new("/nonexistent/xgqd/image.bin")).unwrap_err();
        assert!(
            err.to_string().contains("/nonexistent/xgqd/image.bin"),
            "Error should carry the path: {err}"
        );
    }
}
