//! Unit conversion constants.
//!
//! Canonical output is SI-flavoured: meters, bar, degrees Celsius, seconds.
//! The constants below convert from the units found on the wire.

/// One bar in Pascal.
pub const BAR: f64 = 100_000.0;

/// One psi in Pascal.
pub const PSI: f64 = 6_894.757_293_168;

/// One standard atmosphere in Pascal.
pub const ATM: f64 = 101_325.0;

/// One foot in meters.
pub const FEET: f64 = 0.3048;

/// Standard gravity in m/s².
pub const GRAVITY: f64 = 9.806_65;

/// One cubic foot in liters.
pub const CUFT: f64 = 28.316_846_592;

/// Convert a temperature in degrees Fahrenheit to degrees Celsius.
#[inline]
pub fn fahrenheit_to_celsius(value: f64) -> f64 {
    (value - 32.0) * (5.0 / 9.0)
}

/// Convert a pressure in psi to bar.
#[inline]
pub fn psi_to_bar(value: f64) -> f64 {
    value * PSI / BAR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fahrenheit_to_celsius() {
        assert!((fahrenheit_to_celsius(32.0)).abs() < 1e-9);
        assert!((fahrenheit_to_celsius(212.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_psi_to_bar() {
        assert!((psi_to_bar(3000.0) - 206.84).abs() < 0.01);
    }
}
