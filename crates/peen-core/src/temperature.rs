//! Temperature chamber interface.

/// Interface to the external temperature chamber controller.
///
/// The line protocol behind these calls is not the core's concern; the
/// driver only connects, commands target temperatures and polls the
/// measured one. Implementations keep the last commanded target so the
/// hammering primitive can verify the chamber stayed inside the configured
/// interval.
pub trait TemperatureController {
    /// Opens the controller device. Returns `false` when it cannot be
    /// reached.
    fn connect(&mut self) -> bool;

    /// Commands a new target temperature in °C.
    fn set_target_temperature(&mut self, target: i64);

    /// Returns the last commanded target temperature in °C.
    fn get_target_temperature(&self) -> i64;

    /// Reads the measured temperature in °C.
    fn get_actual_temperature(&mut self) -> i64;
}
