//! Parser for the kernel's CPU list format, as found in
//! `/sys/devices/system/cpu/offline`.
//!
//! The format is a comma separated list of single CPU numbers and inclusive
//! ranges, e.g. `0,2-3,7`. CPUs listed there are not scheduled by the host
//! and have been handed to the Nitro Enclaves allocator.

use std::num::ParseIntError;

use thiserror::Error;

/// Location of the offline CPU list on a Linux host.
pub const OFFLINE_CPUS_PATH: &str = "/sys/devices/system/cpu/offline";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpuRangeError {
    #[error("invalid CPU number: {token}, parsing caused error: {source}")]
    InvalidCpu {
        token: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid CPU range: {token}")]
    InvalidRange { token: String },
    #[error("malformed CPU range: {token}")]
    MalformedRange { token: String },
    #[error("CPU count overflows at: {token}")]
    Overflow { token: String },
}

/// Counts the CPUs described by a CPU list.
///
/// Empty or whitespace-only input means no offline CPUs. The first malformed
/// token aborts parsing and no partial count is returned. Range bounds are
/// not checked for order, so `5-3` contributes `-1`.
pub fn offline_cpu_count(raw: &str) -> Result<i64, CpuRangeError> {
    let content = raw.trim();
    if content.is_empty() {
        return Ok(0);
    }

    let mut total = 0i64;
    for token in content.split(',') {
        let parts: Vec<&str> = token.split('-').collect();
        match parts.as_slice() {
            [cpu] => {
                cpu.parse::<u32>()
                    .map_err(|source| CpuRangeError::InvalidCpu {
                        token: token.to_string(),
                        source,
                    })?;
                total = total.checked_add(1).ok_or_else(|| overflow(token))?;
            }
            [start, end] => {
                let (Ok(start), Ok(end)) = (start.parse::<i64>(), end.parse::<i64>()) else {
                    return Err(CpuRangeError::InvalidRange {
                        token: token.to_string(),
                    });
                };
                total = end
                    .checked_sub(start)
                    .and_then(|span| span.checked_add(1))
                    .and_then(|span| total.checked_add(span))
                    .ok_or_else(|| overflow(token))?;
            }
            _ => {
                return Err(CpuRangeError::MalformedRange {
                    token: token.to_string(),
                })
            }
        }
    }

    Ok(total)
}

fn overflow(token: &str) -> CpuRangeError {
    CpuRangeError::Overflow {
        token: token.to_string(),
    }
}
