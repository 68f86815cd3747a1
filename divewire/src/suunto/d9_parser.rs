//! Suunto D9 dive blob parser.
//!
//! The blob starts with a model-dependent header (timestamp, gas table,
//! sample configuration) followed by fixed-interval telemetry interleaved
//! with a separate event stream. Events are synchronized by a running
//! marker: each header stores the sample ordinal of the first event record,
//! and every "next event marker" record advances the marker by a relative
//! offset.

use std::any::Any;

use log::{error, warn};

use crate::bytes;
use crate::datetime::DateTime;
use crate::error::{Error, Result};
use crate::family::Family;
use crate::parser::{
    DecoKind, DiveMode, EventFlags, Field, FieldString, FieldValue, GasMix, Parser, Sample,
    SampleCallback, SampleEvent,
};

const MAXPARAMS: usize = 3;
const NGASMIXES: usize = 11;

// Model numbers with layout quirks. The D6 (0x0F), Vyper2 (0x10), Cobra2
// (0x11), Vyper Air (0x13) and Cobra3 (0x14) share the baseline layout.
const D9: u8 = 0x0E;
const D4: u8 = 0x12;
const HELO2: u8 = 0x15;
const D4I: u8 = 0x19;
const D6I: u8 = 0x1A;
const D9TX: u8 = 0x1B;
const DX: u8 = 0x1C;

// Dive modes as stored in the header.
const AIR: u8 = 0;
const NITROX: u8 = 1;
const GAUGE: u8 = 2;
const FREEDIVE: u8 = 3;
const MIXED: u8 = 4;
const CCR: u8 = 5;

// In-deco bitmask.
const SAFETYSTOP: u32 = 1 << 0;
const DECOSTOP: u32 = 1 << 1;
const DEEPSTOP: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, Default)]
struct SampleInfo {
    kind: u8,
    size: usize,
    interval: u32,
    divisor: u32,
}

/// Parser for the D9 generation (also covers the Vyper2 family, which
/// shares the format).
pub struct D9Parser {
    model: u8,
    serial: u32,
    data: Vec<u8>,
    // Cached header fields.
    cached: bool,
    mode: u8,
    ngasmixes: usize,
    oxygen: [u8; NGASMIXES],
    helium: [u8; NGASMIXES],
    gasmix: usize,
    config: usize,
}

impl D9Parser {
    /// Create a parser for the given model and serial number.
    pub fn new(model: u32, serial: u32) -> Self {
        Self {
            model: model as u8,
            serial,
            data: Vec::new(),
            cached: false,
            mode: AIR,
            ngasmixes: 0,
            oxygen: [0; NGASMIXES],
            helium: [0; NGASMIXES],
            gasmix: 0,
            config: 0,
        }
    }

    fn is_second_generation(&self) -> bool {
        matches!(self.model, HELO2 | D4I | D6I | D9TX | DX)
    }

    fn find_gasmix(&self, o2: u8, he: u8) -> usize {
        let mut i = 0;
        while i < self.ngasmixes {
            if o2 == self.oxygen[i] && he == self.helium[i] {
                break;
            }
            i += 1;
        }
        i
    }

    fn cache(&mut self) -> Result<()> {
        if self.cached {
            return Ok(());
        }

        let data = &self.data;
        let size = data.len();

        // Gas table location and width per model.
        let mut gasmode_offset = 0x19;
        let mut gasmix_offset = 0x21;
        let mut gasmix_count = 3;
        if self.model == HELO2 {
            gasmode_offset = 0x1F;
            gasmix_offset = 0x54;
            gasmix_count = 8;
        } else if self.model == D4I {
            gasmode_offset = 0x1D;
            gasmix_offset = 0x5F;
            gasmix_count = 1;
        } else if self.model == D6I {
            gasmode_offset = 0x1D;
            gasmix_offset = 0x5F;
            gasmix_count = if size > 1 && data[1] == 0x63 { 3 } else { 2 };
        } else if self.model == D9TX {
            gasmode_offset = 0x1D;
            gasmix_offset = 0x87;
            gasmix_count = 8;
        } else if self.model == DX {
            gasmode_offset = 0x21;
            gasmix_offset = 0xC1;
            gasmix_count = 11;
        }

        // Offset to the sample configuration data.
        let mut config = 0x3A;
        if self.model == D4 {
            config += 1;
        } else if self.is_second_generation() {
            config = gasmix_offset + gasmix_count * 6;
        }
        if config + 1 > size || gasmode_offset >= size {
            return Err(Error::DataFormat("dive header too short".into()));
        }

        let mode = data[gasmode_offset];
        let mut gasmix = 0;
        let mut ngasmixes = 0;
        let mut oxygen = [0u8; NGASMIXES];
        let mut helium = [0u8; NGASMIXES];

        if mode == GAUGE || mode == FREEDIVE {
            // No breathing gas recorded.
        } else if mode == AIR {
            oxygen[0] = 21;
            ngasmixes = 1;
        } else {
            for i in 0..gasmix_count {
                if self.is_second_generation() {
                    let offset = gasmix_offset + 6 * i;
                    if offset + 3 > size {
                        return Err(Error::DataFormat("gas table out of range".into()));
                    }
                    oxygen[i] = data[offset + 1];
                    helium[i] = data[offset + 2];
                } else {
                    if gasmix_offset + i >= size {
                        return Err(Error::DataFormat("gas table out of range".into()));
                    }
                    let o2 = data[gasmix_offset + i];
                    if o2 == 0x00 || o2 == 0xFF {
                        break;
                    }
                    oxygen[i] = o2;
                }
                ngasmixes += 1;
            }

            // Initial gas mix stored in the header on the newer models.
            if self.model == HELO2 {
                gasmix = usize::from(data[0x26]);
            } else if self.model == D4I || self.model == D6I || self.model == D9TX {
                gasmix = usize::from(data[0x28]);
            }
        }

        self.mode = mode;
        self.ngasmixes = ngasmixes;
        self.oxygen = oxygen;
        self.helium = helium;
        self.gasmix = gasmix;
        self.config = config;
        self.cached = true;

        Ok(())
    }

    fn reset_cache(&mut self) {
        self.cached = false;
        self.mode = AIR;
        self.ngasmixes = 0;
        self.oxygen = [0; NGASMIXES];
        self.helium = [0; NGASMIXES];
        self.gasmix = 0;
        self.config = 0;
    }
}

impl Parser for D9Parser {
    fn family(&self) -> Family {
        Family::SuuntoD9
    }

    fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.reset_cache();
    }

    fn datetime(&mut self) -> Result<DateTime> {
        let offset = if self.model == HELO2 || self.model == DX {
            0x17
        } else if self.model == D4I || self.model == D6I || self.model == D9TX {
            0x13
        } else {
            0x11
        };

        if self.data.len() < offset + 7 {
            return Err(Error::DataFormat("dive header too short".into()));
        }

        let p = &self.data[offset..];
        let datetime = if matches!(self.model, D4I | D6I | D9TX | DX) {
            DateTime {
                year: bytes::u16_le(&p[0..]),
                month: u32::from(p[2]),
                day: u32::from(p[3]),
                hour: u32::from(p[4]),
                minute: u32::from(p[5]),
                second: u32::from(p[6]),
            }
        } else {
            DateTime {
                hour: u32::from(p[0]),
                minute: u32::from(p[1]),
                second: u32::from(p[2]),
                year: bytes::u16_le(&p[3..]),
                month: u32::from(p[5]),
                day: u32::from(p[6]),
            }
        };

        Ok(datetime)
    }

    fn field(&mut self, field: Field) -> Result<FieldValue> {
        self.cache()?;

        let data = &self.data;
        let need = |offset: usize, len: usize| -> Result<()> {
            if offset + len > data.len() {
                Err(Error::DataFormat("dive header too short".into()))
            } else {
                Ok(())
            }
        };

        match field {
            Field::DiveTime => {
                let value = if self.model == D4 {
                    need(0x0B, 2)?;
                    bytes::u16_le(&data[0x0B..])
                } else if matches!(self.model, D4I | D6I | D9TX | DX) {
                    need(0x0D, 2)?;
                    bytes::u16_le(&data[0x0D..])
                } else if self.model == HELO2 {
                    need(0x0D, 2)?;
                    bytes::u16_le(&data[0x0D..]) * 60
                } else {
                    need(0x0B, 2)?;
                    bytes::u16_le(&data[0x0B..]) * 60
                };
                Ok(FieldValue::DiveTime(value))
            },
            Field::MaxDepth => {
                need(0x09, 2)?;
                Ok(FieldValue::Depth(f64::from(bytes::u16_le(&data[0x09..])) / 100.0))
            },
            Field::GasMixCount => Ok(FieldValue::Count(self.ngasmixes as u32)),
            Field::GasMix(i) => {
                let i = i as usize;
                if i >= self.ngasmixes {
                    return Err(Error::InvalidArgs("gas mix index out of range".into()));
                }
                Ok(FieldValue::GasMix(GasMix::from_percent(
                    u32::from(self.oxygen[i]),
                    u32::from(self.helium[i]),
                )))
            },
            Field::DiveMode => {
                let mode = match self.mode {
                    AIR | NITROX | MIXED => DiveMode::OpenCircuit,
                    GAUGE => DiveMode::Gauge,
                    FREEDIVE => DiveMode::Freedive,
                    CCR => DiveMode::ClosedCircuit,
                    _ => return Err(Error::DataFormat("unknown dive mode".into())),
                };
                Ok(FieldValue::DiveMode(mode))
            },
            Field::String(0) => Ok(FieldValue::String(FieldString {
                desc: "Serial",
                value: format!("{:08}", self.serial),
            })),
            _ => Err(Error::Unsupported("field not available".into())),
        }
    }

    fn samples_foreach(&mut self, callback: &mut SampleCallback<'_>) -> Result<()> {
        self.cache()?;

        let data = &self.data;
        let size = data.len();

        // Number of parameters in the sample configuration.
        let nparams = usize::from(data[self.config]);
        if nparams == 0 || nparams > MAXPARAMS {
            error!("Invalid number of parameters.");
            return Err(Error::DataFormat("invalid sample configuration".into()));
        }

        const DIVISORS: [u32; 8] = [1, 2, 4, 5, 10, 50, 100, 1000];

        let mut info = [SampleInfo::default(); MAXPARAMS];
        for (i, slot) in info.iter_mut().enumerate().take(nparams) {
            let idx = self.config + 2 + i * 3;
            if idx + 3 > size {
                return Err(Error::DataFormat("invalid sample configuration".into()));
            }
            slot.kind = data[idx];
            slot.interval = u32::from(data[idx + 1]);
            slot.divisor = DIVISORS[usize::from((data[idx + 2] & 0x1C) >> 2)];
            slot.size = match slot.kind {
                0x64 | 0x68 => 2, // depth, pressure
                0x74 => 1,        // temperature
                _ => {
                    error!("Unknown sample type {:#04x}.", slot.kind);
                    return Err(Error::DataFormat("unknown sample type".into()));
                },
            };
        }

        // Offset to the profile data.
        let mut profile = self.config + 2 + nparams * 3;
        if profile + 5 > size {
            error!("Buffer overflow detected!");
            return Err(Error::DataFormat("sample data out of range".into()));
        }

        // HelO2 dives can carry an additional data block.
        if self.model == HELO2 && data[profile..profile + 3] != [0x01, 0x00, 0x00] {
            profile += 12;
        }
        if profile + 5 > size {
            error!("Buffer overflow detected!");
            return Err(Error::DataFormat("sample data out of range".into()));
        }

        // Sample recording interval.
        let interval_offset = if matches!(self.model, HELO2 | D4I | D6I | D9TX) {
            0x1E
        } else if self.model == DX {
            0x22
        } else {
            0x18
        };
        if interval_offset >= size {
            return Err(Error::DataFormat("dive header too short".into()));
        }
        let interval = u32::from(data[interval_offset]);
        if interval == 0 {
            error!("Invalid sample interval.");
            return Err(Error::DataFormat("invalid sample interval".into()));
        }

        // Sample ordinal of the first event record.
        let mut marker = bytes::u16_le(&data[profile + 3..]);

        let mut in_deco: u32 = 0;
        let mut time = 0u32;
        let mut nsamples = 0u32;
        let mut offset = profile + 5;
        while offset < size {
            callback(Sample::Time(time));

            // Fixed-interval telemetry.
            for item in info.iter().take(nparams) {
                if item.interval == 0 || nsamples % item.interval != 0 {
                    continue;
                }
                if offset + item.size > size {
                    error!("Buffer overflow detected!");
                    return Err(Error::DataFormat("sample data out of range".into()));
                }

                match item.kind {
                    0x64 => {
                        let value = bytes::u16_le(&data[offset..]);
                        callback(Sample::Depth(f64::from(value) / f64::from(item.divisor)));
                    },
                    0x68 => {
                        let value = bytes::u16_le(&data[offset..]);
                        if value != 0xFFFF {
                            callback(Sample::Pressure {
                                tank: 0,
                                bar: f64::from(value) / f64::from(item.divisor),
                            });
                        }
                    },
                    0x74 => {
                        let value = data[offset] as i8;
                        callback(Sample::Temperature(
                            f64::from(value) / f64::from(item.divisor),
                        ));
                    },
                    _ => unreachable!("validated above"),
                }

                offset += item.size;
            }

            // Synthetic initial gas mix.
            if time == 0 && self.ngasmixes > 0 {
                if self.gasmix >= self.ngasmixes {
                    error!("Invalid initial gas mix.");
                    return Err(Error::DataFormat("invalid initial gas mix".into()));
                }
                callback(Sample::GasMix(self.gasmix as u32));
            }

            // Event records scheduled for this sample ordinal.
            if nsamples + 1 == marker {
                while offset < size {
                    let event = data[offset];
                    offset += 1;

                    match event {
                        0x01 => {
                            // Next event marker.
                            if offset + 4 > size {
                                error!("Buffer overflow detected!");
                                return Err(Error::DataFormat("event data out of range".into()));
                            }
                            let current = bytes::u16_le(&data[offset..]);
                            let next = bytes::u16_le(&data[offset + 2..]);
                            if marker != current {
                                error!("Unexpected event marker!");
                                return Err(Error::DataFormat("event marker mismatch".into()));
                            }
                            marker += next;
                            offset += 4;
                        },
                        0x02 => {
                            // Surfaced.
                            if offset + 2 > size {
                                error!("Buffer overflow detected!");
                                return Err(Error::DataFormat("event data out of range".into()));
                            }
                            let seconds = u32::from(data[offset + 1]);
                            callback(Sample::Event {
                                kind: SampleEvent::Surface,
                                time: seconds,
                                flags: EventFlags::None,
                                value: 0,
                            });
                            offset += 2;
                        },
                        0x03 => {
                            // Warning/status event.
                            if offset + 2 > size {
                                error!("Buffer overflow detected!");
                                return Err(Error::DataFormat("event data out of range".into()));
                            }
                            let kind = data[offset];
                            let seconds = u32::from(data[offset + 1]);
                            let ended = kind & 0x80 != 0;

                            let mut value = 0;
                            let event_kind = match kind & 0x7F {
                                0x00 => {
                                    set_deco(&mut in_deco, SAFETYSTOP, ended);
                                    Some(SampleEvent::SafetyStopVoluntary)
                                },
                                0x01 | 0x14 => {
                                    set_deco(&mut in_deco, DECOSTOP, ended);
                                    Some(SampleEvent::SafetyStopMandatory)
                                },
                                0x02 | 0x13 => {
                                    set_deco(&mut in_deco, DEEPSTOP, ended);
                                    Some(SampleEvent::DeepStop)
                                },
                                0x03 => {
                                    set_deco(&mut in_deco, DECOSTOP, ended);
                                    Some(SampleEvent::DecoStop)
                                },
                                0x04 => Some(SampleEvent::Ascent),
                                0x05 => Some(SampleEvent::Ceiling),
                                0x06 => Some(SampleEvent::CeilingSafetyStop),
                                0x07 => Some(SampleEvent::Floor),
                                0x08 => Some(SampleEvent::DiveTime),
                                0x09 => Some(SampleEvent::MaxDepth),
                                0x0A => {
                                    value = 80;
                                    Some(SampleEvent::Olf)
                                },
                                0x0B => {
                                    value = 100;
                                    Some(SampleEvent::Olf)
                                },
                                0x0C | 0x0F | 0x10 => Some(SampleEvent::Po2),
                                0x0D => Some(SampleEvent::AirTime),
                                0x0E => Some(SampleEvent::Rgbm),
                                0x11 | 0x12 => Some(SampleEvent::TissueLevel),
                                other => {
                                    warn!("Unknown event type {other:#04x}.");
                                    None
                                },
                            };

                            if let Some(event_kind) = event_kind {
                                callback(Sample::Event {
                                    kind: event_kind,
                                    time: seconds,
                                    flags: if ended {
                                        EventFlags::End
                                    } else {
                                        EventFlags::Begin
                                    },
                                    value,
                                });
                            }
                            offset += 2;
                        },
                        0x04 => {
                            // Bookmark or compass heading.
                            if offset + 4 > size {
                                error!("Buffer overflow detected!");
                                return Err(Error::DataFormat("event data out of range".into()));
                            }
                            let seconds = u32::from(data[offset + 1]);
                            let heading = bytes::u16_le(&data[offset + 2..]);
                            let (kind, value) = if heading == 0xFFFF {
                                (SampleEvent::Bookmark, 0)
                            } else {
                                (SampleEvent::Heading, heading / 2)
                            };
                            callback(Sample::Event {
                                kind,
                                time: seconds,
                                flags: EventFlags::None,
                                value,
                            });
                            offset += 4;
                        },
                        0x05 => {
                            // Gas change (oxygen only).
                            if offset + 2 > size {
                                error!("Buffer overflow detected!");
                                return Err(Error::DataFormat("event data out of range".into()));
                            }
                            let o2 = data[offset];
                            let idx = self.find_gasmix(o2, 0);
                            if idx >= self.ngasmixes {
                                error!("Invalid gas mix.");
                                return Err(Error::DataFormat("invalid gas mix".into()));
                            }
                            callback(Sample::GasMix(idx as u32));
                            offset += 2;
                        },
                        0x06 => {
                            // Gas change (trimix).
                            let length = if self.model == DX { 5 } else { 4 };
                            if offset + length > size {
                                error!("Buffer overflow detected!");
                                return Err(Error::DataFormat("event data out of range".into()));
                            }
                            let he = data[offset + 1];
                            let o2 = data[offset + 2];
                            let idx = self.find_gasmix(o2, he);
                            if idx >= self.ngasmixes {
                                error!("Invalid gas mix.");
                                return Err(Error::DataFormat("invalid gas mix".into()));
                            }
                            callback(Sample::GasMix(idx as u32));
                            offset += length;
                        },
                        other => {
                            warn!("Unknown event {other:#04x}.");
                        },
                    }

                    if event == 0x01 {
                        break;
                    }
                }
            }

            // Current deco state, derived from the begin/end events.
            let kind = if in_deco & DEEPSTOP != 0 {
                DecoKind::DeepStop
            } else if in_deco & DECOSTOP != 0 {
                DecoKind::DecoStop
            } else if in_deco & SAFETYSTOP != 0 {
                DecoKind::SafetyStop
            } else {
                DecoKind::Ndl
            };
            callback(Sample::Deco {
                kind,
                time: 0,
                depth: 0.0,
            });

            time += interval;
            nsamples += 1;
        }

        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn set_deco(in_deco: &mut u32, bit: u32, ended: bool) {
    if ended {
        *in_deco &= !bit;
    } else {
        *in_deco |= bit;
    }
}
