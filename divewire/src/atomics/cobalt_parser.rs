//! Atomic Aquatics Cobalt dive blob parser.
//!
//! A 228-byte header, then one 18-byte entry per gas mix (doubling as the
//! tank table), optional 6-byte gas switch records, and 16-byte profile
//! segments. Depth arrives as absolute pressure in millibar and is
//! converted with the atmospheric pressure from the header (or an explicit
//! calibration) and a hydrostatic weight density.

use std::any::Any;

use log::error;

use crate::bytes;
use crate::datetime::DateTime;
use crate::error::{Error, Result};
use crate::family::Family;
use crate::parser::{
    DecoKind, DiveMode, EventFlags, Field, FieldString, FieldValue, GasMix, Parser, Sample,
    SampleCallback, SampleEvent, Tank, TankVolume,
};
use crate::units::{ATM, BAR, CUFT, GRAVITY, PSI};

const SZ_HEADER: usize = 228;
const SZ_GASMIX: usize = 18;
const SZ_GASSWITCH: usize = 6;
const SZ_SEGMENT: usize = 16;

/// Parser for the Cobalt.
pub struct CobaltParser {
    data: Vec<u8>,
    // Depth calibration.
    atmospheric: f64,
    hydrostatic: f64,
}

impl CobaltParser {
    /// Create a parser with the default salt-water calibration.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            atmospheric: 0.0,
            hydrostatic: 1025.0 * GRAVITY,
        }
    }

    /// Override the atmospheric pressure (Pa) and hydrostatic weight
    /// density (N/m³) used for the depth conversion. An atmospheric
    /// pressure of zero falls back to the value recorded in the header.
    pub fn set_calibration(&mut self, atmospheric: f64, hydrostatic: f64) {
        self.atmospheric = atmospheric;
        self.hydrostatic = hydrostatic;
    }

    fn atmospheric(&self) -> f64 {
        if self.atmospheric != 0.0 {
            self.atmospheric
        } else {
            f64::from(bytes::u16_le(&self.data[0x26..])) * BAR / 1000.0
        }
    }

    fn to_depth(&self, millibar: u32) -> f64 {
        (f64::from(millibar) * BAR / 1000.0 - self.atmospheric()) / self.hydrostatic
    }
}

impl Default for CobaltParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser for CobaltParser {
    fn family(&self) -> Family {
        Family::AtomicsCobalt
    }

    fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    fn datetime(&mut self) -> Result<DateTime> {
        if self.data.len() < SZ_HEADER {
            return Err(Error::DataFormat("dive header too short".into()));
        }

        let p = &self.data;
        Ok(DateTime {
            year: bytes::u16_le(&p[0x14..]),
            month: u32::from(p[0x16]),
            day: u32::from(p[0x17]),
            hour: u32::from(p[0x18]),
            minute: u32::from(p[0x19]),
            second: 0,
        })
    }

    fn field(&mut self, field: Field) -> Result<FieldValue> {
        if self.data.len() < SZ_HEADER {
            return Err(Error::DataFormat("dive header too short".into()));
        }

        let p = &self.data;

        match field {
            Field::DiveTime => Ok(FieldValue::DiveTime(bytes::u16_le(&p[0x58..]) * 60)),
            Field::MaxDepth => Ok(FieldValue::Depth(
                self.to_depth(bytes::u16_le(&self.data[0x56..])),
            )),
            Field::GasMixCount | Field::TankCount => Ok(FieldValue::Count(u32::from(p[0x2A]))),
            Field::GasMix(i) => {
                let offset = SZ_HEADER + SZ_GASMIX * i as usize;
                if i >= u32::from(p[0x2A]) || offset + SZ_GASMIX > p.len() {
                    return Err(Error::InvalidArgs("gas mix index out of range".into()));
                }
                Ok(FieldValue::GasMix(GasMix::from_percent(
                    u32::from(p[offset + 4]),
                    u32::from(p[offset + 5]),
                )))
            },
            Field::TemperatureSurface => Ok(FieldValue::Temperature(
                (f64::from(p[0x1B]) - 32.0) * (5.0 / 9.0),
            )),
            Field::Tank(i) => {
                let offset = SZ_HEADER + SZ_GASMIX * i as usize;
                if i >= u32::from(p[0x2A]) || offset + SZ_GASMIX > p.len() {
                    return Err(Error::InvalidArgs("tank index out of range".into()));
                }
                let entry = &p[offset..];

                let mut tank = Tank {
                    gasmix: Some(i),
                    ..Tank::default()
                };
                match entry[2] {
                    1 | 2 => {
                        // Air capacity in cubic feet at the work pressure.
                        let workpressure = f64::from(bytes::u16_le(&entry[10..]));
                        if workpressure == 0.0 {
                            return Err(Error::DataFormat("imperial tank without work pressure".into()));
                        }
                        tank.kind = TankVolume::Imperial;
                        tank.volume = f64::from(bytes::u16_le(&entry[8..])) * CUFT;
                        tank.volume /= workpressure * PSI / ATM;
                        tank.workpressure = workpressure * PSI / BAR;
                    },
                    3 => {
                        // Water capacity in deciliters.
                        tank.kind = TankVolume::Metric;
                        tank.volume = f64::from(bytes::u16_le(&entry[8..])) / 10.0;
                        tank.workpressure = 0.0;
                    },
                    _ => return Err(Error::DataFormat("unknown tank type".into())),
                }
                tank.beginpressure = f64::from(bytes::u16_le(&entry[6..])) * PSI / BAR;
                tank.endpressure = f64::from(bytes::u16_le(&entry[14..])) * PSI / BAR;
                Ok(FieldValue::Tank(tank))
            },
            Field::DiveMode => match p[0x24] {
                // Open circuit trimix and nitrox.
                0 | 2 => Ok(FieldValue::DiveMode(DiveMode::OpenCircuit)),
                1 => Ok(FieldValue::DiveMode(DiveMode::ClosedCircuit)),
                _ => Err(Error::DataFormat("unknown dive mode".into())),
            },
            Field::String(i) => {
                let (desc, value) = match i {
                    0 => (
                        "Serial",
                        format!(
                            "{}{}{}{}-{}{}{}{}",
                            p[4] as char,
                            p[5] as char,
                            p[6] as char,
                            p[7] as char,
                            p[8] as char,
                            p[9] as char,
                            p[10] as char,
                            p[11] as char
                        ),
                    ),
                    1 => (
                        "Program Version",
                        format!("{:.2}", f64::from(bytes::u16_le(&p[30..])) / 100.0),
                    ),
                    2 => (
                        "Boot Version",
                        format!("{:.2}", f64::from(bytes::u16_le(&p[32..])) / 100.0),
                    ),
                    3 => ("NoFly Time", format!("{}:{:02}", p[0x52], p[0x53])),
                    _ => return Err(Error::Unsupported("string index out of range".into())),
                };
                Ok(FieldValue::String(FieldString { desc, value }))
            },
            _ => Err(Error::Unsupported("field not available".into())),
        }
    }

    fn samples_foreach(&mut self, callback: &mut SampleCallback<'_>) -> Result<()> {
        let data = &self.data;
        let size = data.len();

        if size < SZ_HEADER {
            return Err(Error::DataFormat("dive header too short".into()));
        }

        let interval = u32::from(data[0x1A]);
        let ngasmixes = usize::from(data[0x2A]);
        let nswitches = usize::from(data[0x2B]);
        let nsegments = bytes::u16_le(&data[0x50..]) as usize;

        let header = SZ_HEADER + SZ_GASMIX * ngasmixes + SZ_GASSWITCH * nswitches;

        if size < header + SZ_SEGMENT * nsegments {
            return Err(Error::DataFormat("sample data out of range".into()));
        }

        // Previous gas mix, initialized with an impossible value.
        let mut gasmix_previous = u32::MAX;

        // The primary tank carries the pressure sensor with id 1.
        let mut tank = 0;
        while tank < ngasmixes {
            let sensor = bytes::u16_le(&data[SZ_HEADER + SZ_GASMIX * tank + 12..]);
            if sensor == 1 {
                break;
            }
            tank += 1;
        }
        if tank >= ngasmixes {
            error!("Invalid primary tank index.");
            return Err(Error::DataFormat("no primary tank".into()));
        }

        let mut time = 0u32;
        let mut in_deco = false;
        let mut offset = header;
        while offset + SZ_SEGMENT <= size {
            time += interval;
            callback(Sample::Time(time));

            // Depth (absolute pressure in millibar).
            let depth = bytes::u16_le(&data[offset..]);
            callback(Sample::Depth(self.to_depth(depth)));

            // Tank pressure (psi).
            let pressure = bytes::u16_le(&data[offset + 2..]);
            callback(Sample::Pressure {
                tank: tank as u32,
                bar: f64::from(pressure) * PSI / BAR,
            });

            // Gas change.
            let gasmix = u32::from(data[offset + 4]);
            if gasmix != gasmix_previous {
                let mut idx = 0;
                while idx < ngasmixes {
                    if u32::from(data[SZ_HEADER + SZ_GASMIX * idx]) == gasmix {
                        break;
                    }
                    idx += 1;
                }
                if idx >= ngasmixes {
                    error!("Invalid gas mix index.");
                    return Err(Error::DataFormat("invalid gas mix".into()));
                }
                callback(Sample::GasMix(idx as u32));
                gasmix_previous = gasmix;
            }

            // Temperature (°F).
            let temperature = data[offset + 8];
            callback(Sample::Temperature((f64::from(temperature) - 32.0) * (5.0 / 9.0)));

            // Violation status.
            let violation = data[offset + 11];
            for (bit, kind) in [
                (0x01, SampleEvent::Ascent),
                (0x04, SampleEvent::Ceiling),
                (0x08, SampleEvent::Po2),
            ] {
                if violation & bit != 0 {
                    callback(Sample::Event {
                        kind,
                        time: 0,
                        flags: EventFlags::None,
                        value: 0,
                    });
                }
            }

            // NDL and deco.
            let ndl = u32::from(data[offset + 5]) * 60;
            if ndl > 0 {
                in_deco = false;
            } else if violation & 0x02 != 0 {
                in_deco = true;
            }
            callback(Sample::Deco {
                kind: if in_deco {
                    DecoKind::DecoStop
                } else {
                    DecoKind::Ndl
                },
                time: ndl,
                depth: 0.0,
            });

            offset += SZ_SEGMENT;
        }

        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
