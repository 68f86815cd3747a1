//! Parser abstraction and the canonical, vendor-neutral data model.
//!
//! A parser decodes one family's raw dive blob into dive-level fields and a
//! time-ordered sample stream. Parsers are stateless until [`Parser::set_data`]
//! and cache derived values lazily; `set_data` invalidates the cache.
//!
//! Within one dive, samples arrive in non-decreasing time order and exactly
//! one [`Sample::Time`] precedes each group of same-time samples. Gas mix
//! indices emitted in samples are always below the dive's `GasMixCount`.

use std::any::Any;

use crate::datetime::DateTime;
use crate::error::Result;
use crate::family::Family;

/// Event kinds carried by [`Sample::Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum SampleEvent {
    /// Entered or left a deco stop.
    DecoStop,
    /// Remaining bottom time warning.
    Rbt,
    /// Ascent rate warning.
    Ascent,
    /// Ceiling broken.
    Ceiling,
    /// Workload change.
    Workload,
    /// Tank transmitter event.
    Transmitter,
    /// Generic violation.
    Violation,
    /// User bookmark.
    Bookmark,
    /// Surfaced mid-dive.
    Surface,
    /// Safety stop.
    SafetyStop,
    /// Voluntary safety stop.
    SafetyStopVoluntary,
    /// Mandatory safety stop.
    SafetyStopMandatory,
    /// Deep safety stop.
    DeepStop,
    /// Ceiling reached during a mandatory safety stop.
    CeilingSafetyStop,
    /// Below the deco floor.
    Floor,
    /// Dive time alarm.
    DiveTime,
    /// Maximum depth alarm.
    MaxDepth,
    /// Oxygen limit fraction warning.
    Olf,
    /// Partial pressure of oxygen warning.
    Po2,
    /// Remaining air time warning.
    AirTime,
    /// RGBM warning.
    Rgbm,
    /// Compass heading recorded.
    Heading,
    /// Tissue level warning.
    TissueLevel,
}

/// Whether an event marks the beginning or the end of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventFlags {
    /// Momentary event.
    #[default]
    None,
    /// The condition begins.
    Begin,
    /// The condition ends.
    End,
}

/// Originator of a vendor-specific sample payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum VendorKind {
    /// Uwatec Aladin raw record.
    UwatecAladin,
    /// Uwatec Smart raw record.
    UwatecSmart,
    /// Oceanic VT Pro raw record.
    OceanicVtPro,
    /// Oceanic Veo 250 raw record.
    OceanicVeo250,
    /// Oceanic Atom 2 raw record.
    OceanicAtom2,
}

/// Deco obligation class reported with each [`Sample::Deco`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecoKind {
    /// No stop obligation; time is the remaining no-deco limit.
    #[default]
    Ndl,
    /// Safety stop.
    SafetyStop,
    /// Mandatory decompression stop.
    DecoStop,
    /// Deep stop.
    DeepStop,
}

/// One canonical sample. Borrowed payloads point into the dive blob and are
/// valid for the duration of the callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample<'a> {
    /// Seconds since the start of the dive. Emitted before the sub-samples
    /// it groups.
    Time(u32),
    /// Depth in meters.
    Depth(f64),
    /// Tank pressure in bar.
    Pressure {
        /// Tank index.
        tank: u32,
        /// Pressure in bar.
        bar: f64,
    },
    /// Temperature in degrees Celsius.
    Temperature(f64),
    /// Discrete event.
    Event {
        /// Event kind.
        kind: SampleEvent,
        /// Offset in seconds within the current sample interval.
        time: u32,
        /// Begin/end marker.
        flags: EventFlags,
        /// Event-specific value.
        value: u32,
    },
    /// Remaining bottom time in minutes.
    Rbt(u32),
    /// Heart rate in beats per minute.
    Heartbeat(u32),
    /// Compass bearing in degrees.
    Bearing(u32),
    /// Vendor-specific payload borrowed from the blob.
    Vendor {
        /// Payload originator.
        kind: VendorKind,
        /// Raw bytes.
        data: &'a [u8],
    },
    /// Closed-circuit setpoint in bar.
    Setpoint(f64),
    /// Oxygen partial pressure in bar.
    Ppo2(f64),
    /// CNS oxygen toxicity as a fraction (1.0 = 100%).
    Cns(f64),
    /// Deco obligation at this point in time.
    Deco {
        /// Obligation class.
        kind: DecoKind,
        /// Stop time or NDL in seconds.
        time: u32,
        /// Stop depth in meters (zero when not applicable).
        depth: f64,
    },
    /// Switch to the gas mix with this index into the dive's mix table.
    GasMix(u32),
}

/// Breathing gas composition, as fractions summing to one.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GasMix {
    /// Helium fraction.
    pub helium: f64,
    /// Oxygen fraction.
    pub oxygen: f64,
    /// Nitrogen fraction.
    pub nitrogen: f64,
}

impl GasMix {
    /// Build a mix from oxygen and helium percentages; nitrogen is the rest.
    pub fn from_percent(oxygen: u32, helium: u32) -> Self {
        let oxygen = f64::from(oxygen) / 100.0;
        let helium = f64::from(helium) / 100.0;
        Self {
            helium,
            oxygen,
            nitrogen: 1.0 - oxygen - helium,
        }
    }
}

/// Water type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WaterKind {
    /// Fresh water.
    Fresh,
    /// Salt water.
    Salt,
}

/// Water salinity.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Salinity {
    /// Water type.
    pub kind: WaterKind,
    /// Density in kg/m³ (zero when the device does not report it).
    pub density: f64,
}

/// How a tank volume was specified on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TankVolume {
    /// No volume available; volume and work pressure are zero.
    #[default]
    None,
    /// Metric tank: water capacity, work pressure optional.
    Metric,
    /// Imperial tank: air capacity converted to water capacity; both volume
    /// and work pressure are non-zero.
    Imperial,
}

/// One tank and its pressures.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tank {
    /// Index of the gas mix breathed from this tank, if known.
    pub gasmix: Option<u32>,
    /// Volume representation.
    pub kind: TankVolume,
    /// Water capacity in liters.
    pub volume: f64,
    /// Work pressure in bar.
    pub workpressure: f64,
    /// Pressure at the start of the dive in bar.
    pub beginpressure: f64,
    /// Pressure at the end of the dive in bar.
    pub endpressure: f64,
}

/// Dive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiveMode {
    /// Breath-hold diving.
    Freedive,
    /// Depth gauge mode, no decompression tracking.
    Gauge,
    /// Open circuit.
    OpenCircuit,
    /// Closed circuit rebreather.
    ClosedCircuit,
}

/// A human-readable, dive-level string (serial number, firmware, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldString {
    /// What the string describes.
    pub desc: &'static str,
    /// The value; owned by the caller from here on.
    pub value: String,
}

/// Dive-level field selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Total dive time.
    DiveTime,
    /// Maximum depth.
    MaxDepth,
    /// Average depth.
    AvgDepth,
    /// Number of gas mixes.
    GasMixCount,
    /// Gas mix by index.
    GasMix(u32),
    /// Water salinity.
    Salinity,
    /// Atmospheric pressure.
    Atmospheric,
    /// Temperature at the surface.
    TemperatureSurface,
    /// Minimum water temperature.
    TemperatureMin,
    /// Maximum water temperature.
    TemperatureMax,
    /// Number of tanks.
    TankCount,
    /// Tank by index.
    Tank(u32),
    /// Dive mode.
    DiveMode,
    /// Human-readable string by index.
    String(u32),
}

/// Typed result of a [`Parser::field`] query.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Dive time in seconds.
    DiveTime(u32),
    /// A depth in meters.
    Depth(f64),
    /// A count (gas mixes, tanks).
    Count(u32),
    /// A gas mix.
    GasMix(GasMix),
    /// Water salinity.
    Salinity(Salinity),
    /// Atmospheric pressure in bar.
    Atmospheric(f64),
    /// A temperature in degrees Celsius.
    Temperature(f64),
    /// A tank.
    Tank(Tank),
    /// Dive mode.
    DiveMode(DiveMode),
    /// An owned string.
    String(FieldString),
}

/// Per-sample callback used by [`Parser::samples_foreach`].
pub type SampleCallback<'a> = dyn FnMut(Sample<'_>) + 'a;

/// A decoder for one family's raw dive blobs.
pub trait Parser {
    /// The family this parser decodes.
    fn family(&self) -> Family;

    /// Load a dive blob. Invalidates all cached values; the bytes are
    /// copied, so the caller keeps ownership of its buffer.
    fn set_data(&mut self, data: &[u8]);

    /// The dive's start timestamp.
    fn datetime(&mut self) -> Result<DateTime>;

    /// Query a dive-level field. Repeated queries without an intervening
    /// `set_data` return the same value.
    fn field(&mut self, field: Field) -> Result<FieldValue>;

    /// Walk the sample stream in time order.
    fn samples_foreach(&mut self, callback: &mut SampleCallback<'_>) -> Result<()>;

    /// Downcast support for family-specific extension methods.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Fold of the sample stream used to derive `DiveTime`/`MaxDepth` for
/// families whose header does not store them.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SampleStatistics {
    pub divetime: u32,
    pub maxdepth: f64,
}

impl SampleStatistics {
    pub fn update(&mut self, sample: &Sample<'_>) {
        match sample {
            Sample::Time(time) => self.divetime = *time,
            Sample::Depth(depth) => {
                if self.maxdepth < *depth {
                    self.maxdepth = *depth;
                }
            },
            _ => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gasmix_from_percent() {
        let mix = GasMix::from_percent(32, 0);
        assert!((mix.oxygen - 0.32).abs() < 1e-9);
        assert!((mix.nitrogen - 0.68).abs() < 1e-9);
        assert_eq!(mix.helium, 0.0);
    }

    #[test]
    fn test_sample_statistics() {
        let mut stats = SampleStatistics::default();
        stats.update(&Sample::Time(10));
        stats.update(&Sample::Depth(12.5));
        stats.update(&Sample::Time(20));
        stats.update(&Sample::Depth(8.0));
        assert_eq!(stats.divetime, 20);
        assert!((stats.maxdepth - 12.5).abs() < 1e-9);
    }
}
