//! Fatal error conditions.

use std::time::Duration;

use thiserror::Error;

/// Fatal error conditions of the flip discovery core.
///
/// Recoverable conditions (a window with missing pages, an inventory too
/// small for the contiguous strategy) are not represented here; they are
/// logged and surfaced as a boolean "continue" to the driver.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is inconsistent and the run cannot start.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Memory could not be mapped, or the system's huge-page size does not
    /// match the configured one.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// `/proc/self/pagemap` could not be opened or read.
    #[error("cannot read pagemap: {0}")]
    PagemapUnreadable(#[from] pagemap2::PageMapError),

    /// The measured temperature left the configured interval during a
    /// hammer run; the experiment data would be invalid.
    #[error("temperature outside of given interval: expected {target} °C ± {interval} °C, got {actual} °C")]
    TemperatureOutOfRange {
        /// Configured target temperature in °C
        target: i64,
        /// Measured temperature in °C
        actual: i64,
        /// Allowed deviation in °C
        interval: i64,
    },

    /// The temperature controller did not reach the target in time.
    #[error("could not reach {target} °C within {timeout:?}")]
    TemperatureTimeout {
        /// Configured target temperature in °C
        target: i64,
        /// Configured limit for the temperature change
        timeout: Duration,
    },
}
