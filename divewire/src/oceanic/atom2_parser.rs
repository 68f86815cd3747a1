//! Oceanic Atom 2 dive blob parser.
//!
//! The Atom 2 protocol family spans some forty models sharing one blob
//! shape: a header of 16-byte pages, profile samples, and a footer. Almost
//! every field moved around between models, so the decoder is a large
//! model dispatch over the same skeleton. Dive time and maximum depth are
//! not stored in most headers and are derived by folding the sample
//! stream once, then cached.

use std::any::Any;

use log::{error, warn};

use crate::bytes::{self, bcd2dec};
use crate::datetime::{self, DateTime};
use crate::error::{Error, Result};
use crate::family::Family;
use crate::parser::{
    DecoKind, DiveMode, Field, FieldString, FieldValue, GasMix, Parser, Sample, SampleCallback,
    SampleStatistics, Salinity, VendorKind, WaterKind,
};
use crate::units::{BAR, FEET, PSI};

const PAGESIZE: usize = 0x10;

// Model numbers.
const ATOM1: u32 = 0x4250;
const EPICA: u32 = 0x4257;
const VT3: u32 = 0x4258;
const T3A: u32 = 0x4259;
const ATOM2: u32 = 0x4342;
const GEO: u32 = 0x4344;
const MANTA: u32 = 0x4345;
const DATAMASK: u32 = 0x4347;
const COMPUMASK: u32 = 0x4348;
const OC1A: u32 = 0x434E;
const F10: u32 = 0x434D;
const WISDOM2: u32 = 0x4350;
const INSIGHT2: u32 = 0x4353;
const ELEMENT2: u32 = 0x4357;
const VEO20: u32 = 0x4359;
const VEO30: u32 = 0x435A;
const ZEN: u32 = 0x4441;
const ZENAIR: u32 = 0x4442;
const ATMOSAI2: u32 = 0x4443;
const PROPLUS21: u32 = 0x4444;
const GEO20: u32 = 0x4446;
const VT4: u32 = 0x4447;
const OC1B: u32 = 0x4449;
const VOYAGER2G: u32 = 0x444B;
const ATOM3: u32 = 0x444C;
const DG03: u32 = 0x444D;
const OCS: u32 = 0x4450;
const OC1C: u32 = 0x4451;
const VT41: u32 = 0x4452;
const EPICB: u32 = 0x4453;
const T3B: u32 = 0x4455;
const ATOM31: u32 = 0x4456;
const A300AI: u32 = 0x4457;
const WISDOM3: u32 = 0x4458;
const A300: u32 = 0x445A;
const TX1: u32 = 0x4542;
const AMPHOS: u32 = 0x4545;
const AMPHOSAIR: u32 = 0x4546;
const PROPLUS3: u32 = 0x4548;
const F11A: u32 = 0x4549;
const OCI: u32 = 0x454B;
const A300CS: u32 = 0x454C;
const F11B: u32 = 0x4554;
const VTX: u32 = 0x4557;

// Dive modes as stored in the header.
const NORMAL: u8 = 0;
const GAUGE: u8 = 1;
const FREEDIVE: u8 = 2;

const NGASMIXES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
enum CacheLevel {
    None,
    Header,
    Profile,
}

/// Parser for the Atom 2 protocol family.
pub struct Atom2Parser {
    model: u32,
    headersize: usize,
    footersize: usize,
    serial: u32,
    data: Vec<u8>,
    // Cached fields.
    cached: CacheLevel,
    header: usize,
    footer: usize,
    mode: u8,
    ngasmixes: usize,
    oxygen: [u8; NGASMIXES],
    helium: [u8; NGASMIXES],
    divetime: u32,
    maxdepth: f64,
}

impl Atom2Parser {
    /// Create a parser for the given model and serial number.
    pub fn new(model: u32, serial: u32) -> Self {
        let mut headersize = 9 * PAGESIZE / 2;
        let mut footersize = 2 * PAGESIZE / 2;
        if matches!(
            model,
            DATAMASK | COMPUMASK | GEO | GEO20 | VEO20 | VEO30 | OCS | PROPLUS3 | A300 | MANTA
                | INSIGHT2 | ZEN
        ) {
            headersize -= PAGESIZE;
        } else if model == VT4 || model == VT41 {
            headersize += PAGESIZE;
        } else if model == TX1 {
            headersize += 2 * PAGESIZE;
        } else if model == ATOM1 {
            headersize -= 2 * PAGESIZE;
        } else if model == F10 {
            headersize = 3 * PAGESIZE;
            footersize = 0;
        } else if model == F11A || model == F11B {
            headersize = 5 * PAGESIZE;
            footersize = 0;
        } else if model == A300CS || model == VTX {
            headersize = 5 * PAGESIZE;
        }

        Self {
            model,
            headersize,
            footersize,
            serial,
            data: Vec::new(),
            cached: CacheLevel::None,
            header: 0,
            footer: 0,
            mode: NORMAL,
            ngasmixes: 0,
            oxygen: [0; NGASMIXES],
            helium: [0; NGASMIXES],
            divetime: 0,
            maxdepth: 0.0,
        }
    }

    fn is_freedive_model(&self) -> bool {
        matches!(self.model, F10 | F11A | F11B)
    }

    fn cache_header(&mut self) -> Result<()> {
        if self.cached >= CacheLevel::Header {
            return Ok(());
        }

        let data = &self.data;
        let size = data.len();

        if size < self.headersize + self.footersize {
            return Err(Error::DataFormat("dive blob too short".into()));
        }

        // Offsets of the header and footer sample pages.
        let mut header = self.headersize - PAGESIZE / 2;
        let footer = size - self.footersize;
        if matches!(self.model, VT4 | VT41 | A300AI) {
            header = 3 * PAGESIZE;
        }

        // Dive mode.
        let mode = if self.is_freedive_model() {
            FREEDIVE
        } else if matches!(self.model, T3B | VT3 | DG03) {
            (data[2] & 0xC0) >> 6
        } else if self.model == VEO20 || self.model == VEO30 {
            (data[1] & 0x60) >> 5
        } else {
            NORMAL
        };

        // Gas table location.
        let mut ngasmixes: usize;
        let mut o2_offset = 0;
        let mut he_offset = 0;
        if mode == FREEDIVE {
            ngasmixes = 0;
        } else if self.model == DATAMASK || self.model == COMPUMASK {
            ngasmixes = 1;
            o2_offset = header + 3;
        } else if matches!(self.model, VT4 | VT41 | A300AI) {
            o2_offset = header + 4;
            ngasmixes = 4;
        } else if self.model == OCI {
            o2_offset = 0x28;
            ngasmixes = 4;
        } else if self.model == TX1 {
            o2_offset = 0x3E;
            he_offset = 0x48;
            ngasmixes = 6;
        } else if self.model == A300CS || self.model == VTX {
            o2_offset = 0x2A;
            ngasmixes = if data[0x39] & 0x04 != 0 {
                1
            } else if data[0x39] & 0x08 != 0 {
                2
            } else if data[0x39] & 0x10 != 0 {
                3
            } else {
                4
            };
        } else {
            o2_offset = header + 4;
            ngasmixes = 3;
        }

        if ngasmixes > 0 && o2_offset + ngasmixes > size {
            return Err(Error::DataFormat("gas table out of range".into()));
        }

        let mut oxygen = [0u8; NGASMIXES];
        let mut helium = [0u8; NGASMIXES];
        for i in 0..ngasmixes {
            oxygen[i] = if data[o2_offset + i] != 0 {
                data[o2_offset + i]
            } else {
                21
            };
            if he_offset != 0 {
                helium[i] = data[he_offset + i];
            }
        }

        self.header = header;
        self.footer = footer;
        self.mode = mode;
        self.ngasmixes = ngasmixes;
        self.oxygen = oxygen;
        self.helium = helium;
        self.cached = CacheLevel::Header;

        Ok(())
    }

    fn cache_profile(&mut self) -> Result<()> {
        self.cache_header()?;
        if self.cached >= CacheLevel::Profile {
            return Ok(());
        }

        let mut statistics = SampleStatistics::default();
        self.walk_samples(&mut |sample| statistics.update(&sample))?;

        self.cached = CacheLevel::Profile;
        self.divetime = statistics.divetime;
        self.maxdepth = statistics.maxdepth;

        Ok(())
    }

    fn reset_cache(&mut self) {
        self.cached = CacheLevel::None;
        self.header = 0;
        self.footer = 0;
        self.mode = NORMAL;
        self.ngasmixes = 0;
        self.oxygen = [0; NGASMIXES];
        self.helium = [0; NGASMIXES];
        self.divetime = 0;
        self.maxdepth = 0.0;
    }

    #[allow(clippy::too_many_lines)]
    fn walk_samples(&self, callback: &mut SampleCallback<'_>) -> Result<()> {
        let data = &self.data;
        let size = data.len();

        // Sample interval (and, on the freedive models, sub-second rates
        // that cannot be represented and collapse).
        let mut interval = 1u32;
        let mut samplerate = 1usize;
        if self.mode != FREEDIVE {
            let idx = if self.model == A300CS || self.model == VTX {
                0x1F
            } else {
                0x17
            };
            interval = match data[idx] & 0x03 {
                0 => 2,
                1 => 15,
                2 => 30,
                _ => 60,
            };
        } else if self.model == F11A || self.model == F11B {
            match data[0x29] & 0x03 {
                0 => {
                    interval = 1;
                    samplerate = 4;
                },
                1 => {
                    interval = 1;
                    samplerate = 2;
                },
                2 => interval = 1,
                _ => interval = 2,
            }
            if samplerate > 1 {
                // The extra sub-second samples get dropped.
                warn!("Multiple samples per second are not supported!");
            }
        }

        let mut samplesize = PAGESIZE / 2;
        if self.mode == FREEDIVE {
            if self.is_freedive_model() {
                samplesize = 2;
            } else {
                samplesize = 4;
            }
        } else if matches!(self.model, OC1A | OC1B | OC1C | OCI | TX1 | A300CS | VTX) {
            samplesize = PAGESIZE;
        }

        let mut have_temperature = true;
        let mut have_pressure = true;
        if self.mode == FREEDIVE {
            have_temperature = false;
            have_pressure = false;
        } else if matches!(
            self.model,
            VEO30 | OCS | ELEMENT2 | VEO20 | A300 | ZEN | GEO | GEO20 | MANTA
        ) {
            have_pressure = false;
        }

        // Initial temperature.
        let mut temperature = 0u32;
        if have_temperature {
            temperature = u32::from(data[self.header + 7]);
        }

        // Initial tank pressure.
        let mut tank = 0u32;
        let mut pressure = 0u32;
        if have_pressure {
            let idx = if self.model == A300CS || self.model == VTX {
                16
            } else {
                2
            };
            pressure = bytes::u16_le(&data[self.header + idx..]);
            if pressure == 10_000 {
                have_pressure = false;
            }
        }

        // Initial gas mix.
        let mut gasmix_previous = u32::MAX;

        let mut time = 0u32;
        let mut complete = true;
        let mut offset = self.headersize;
        while offset + samplesize <= size - self.footersize {
            // Ignore empty samples.
            if (self.mode != FREEDIVE && bytes::is_equal(&data[offset..offset + samplesize], 0x00))
                || bytes::is_equal(&data[offset..offset + samplesize], 0xFF)
            {
                offset += samplesize;
                continue;
            }

            if complete {
                time += interval;
                callback(Sample::Time(time));
                complete = false;
            }

            // Sample type; the freedive models have none.
            let sampletype = if self.mode == FREEDIVE { 0 } else { data[offset] };

            // Most records have the fixed size, but surface intervals are a
            // full page.
            let mut length = samplesize * samplerate;
            if sampletype == 0xBB {
                length = PAGESIZE;
                if offset + length > size - PAGESIZE {
                    return Err(Error::DataFormat("sample data out of range".into()));
                }
            }

            callback(Sample::Vendor {
                kind: VendorKind::OceanicAtom2,
                data: &data[offset..offset + length],
            });

            if sampletype == 0xAA {
                // Tank switch record.
                if self.model == DATAMASK || self.model == COMPUMASK {
                    // Tank pressure (1 psi) only.
                    tank = 0;
                    pressure = ((u32::from(data[offset + 7]) << 8)
                        + u32::from(data[offset + 6]))
                        & 0x0FFF;
                } else if self.model == A300CS || self.model == VTX {
                    // Tank pressure (1 psi) and number (one based index).
                    tank = u32::from(data[offset + 1] & 0x03).saturating_sub(1);
                    pressure = ((u32::from(data[offset + 7]) << 8)
                        + u32::from(data[offset + 6]))
                        & 0x0FFF;
                } else {
                    // Tank pressure (2 psi) and number (one based index).
                    tank = u32::from(data[offset + 1] & 0x03).saturating_sub(1);
                    pressure = if matches!(self.model, ATOM2 | EPICA | EPICB) {
                        ((u32::from(data[offset + 3]) << 8) + u32::from(data[offset + 4]))
                            & 0x0FFF
                    } else {
                        ((u32::from(data[offset + 4]) << 8) + u32::from(data[offset + 5]))
                            & 0x0FFF
                    } * 2;
                }
            } else if sampletype == 0xBB {
                // Surface interval: insert surface samples, rounded down to
                // whole sample intervals to keep the timestamps aligned.
                let surftime =
                    60 * bcd2dec(data[offset + 1]) + bcd2dec(data[offset + 2]);
                let nsamples = surftime / interval;

                for _ in 0..nsamples {
                    if complete {
                        time += interval;
                        callback(Sample::Time(time));
                    }
                    callback(Sample::Depth(0.0));
                    complete = true;
                }
            } else {
                // Temperature (°F).
                if have_temperature {
                    if matches!(self.model, GEO | ATOM1 | ELEMENT2 | MANTA | ZEN) {
                        temperature = u32::from(data[offset + 6]);
                    } else if matches!(
                        self.model,
                        GEO20 | VEO20 | VEO30 | OC1A | OC1B | OC1C | OCI | A300
                    ) {
                        temperature = u32::from(data[offset + 3]);
                    } else if self.model == OCS || self.model == TX1 {
                        temperature = u32::from(data[offset + 1]);
                    } else if matches!(self.model, VT4 | VT41 | ATOM3 | ATOM31 | A300AI) {
                        temperature = (u32::from(data[offset + 7] & 0xF0) >> 4)
                            | (u32::from(data[offset + 7] & 0x0C) << 2)
                            | (u32::from(data[offset + 5] & 0x0C) << 4);
                    } else if self.model == A300CS || self.model == VTX {
                        temperature = u32::from(data[offset + 11]);
                    } else {
                        let sign = if self.model == DG03 || self.model == PROPLUS3 {
                            (!data[offset + 5] & 0x04) >> 2
                        } else if matches!(self.model, VOYAGER2G | AMPHOS | AMPHOSAIR) {
                            (data[offset + 5] & 0x04) >> 2
                        } else if matches!(
                            self.model,
                            ATOM2 | PROPLUS21 | EPICA | EPICB | ATMOSAI2 | WISDOM2 | WISDOM3
                        ) {
                            (data[offset] & 0x80) >> 7
                        } else {
                            (!data[offset] & 0x80) >> 7
                        };
                        let delta = u32::from(data[offset + 7] & 0x0C) >> 2;
                        if sign != 0 {
                            temperature = temperature.saturating_sub(delta);
                        } else {
                            temperature += delta;
                        }
                    }
                    callback(Sample::Temperature(
                        (f64::from(temperature) - 32.0) * (5.0 / 9.0),
                    ));
                }

                // Tank pressure (psi).
                if have_pressure {
                    if matches!(self.model, OC1A | OC1B | OC1C | OCI) {
                        pressure = (u32::from(data[offset + 10])
                            + (u32::from(data[offset + 11]) << 8))
                            & 0x0FFF;
                    } else if matches!(
                        self.model,
                        VT4 | VT41 | ATOM3 | ATOM31 | ZENAIR | A300AI | DG03 | PROPLUS3
                            | AMPHOSAIR
                    ) {
                        pressure = ((u32::from(data[offset] & 0x03) << 8)
                            + u32::from(data[offset + 1]))
                            * 5;
                    } else if matches!(self.model, TX1 | A300CS | VTX) {
                        pressure = bytes::u16_le(&data[offset + 4..]);
                    } else {
                        pressure = pressure.saturating_sub(u32::from(data[offset + 1]));
                    }
                    callback(Sample::Pressure {
                        tank,
                        bar: f64::from(pressure) * PSI / BAR,
                    });
                }

                // Depth (1/16 ft).
                let depth = if self.mode == FREEDIVE {
                    bytes::u16_le(&data[offset..])
                } else if matches!(
                    self.model,
                    GEO20 | VEO20 | VEO30 | OC1A | OC1B | OC1C | OCI | A300
                ) {
                    (u32::from(data[offset + 4]) + (u32::from(data[offset + 5]) << 8)) & 0x0FFF
                } else if self.model == ATOM1 {
                    u32::from(data[offset + 3]) * 16
                } else {
                    (u32::from(data[offset + 2]) + (u32::from(data[offset + 3]) << 8)) & 0x0FFF
                };
                callback(Sample::Depth(f64::from(depth) / 16.0 * FEET));

                // Gas mix.
                if self.model == TX1 {
                    let gasmix = u32::from(data[offset] & 0x07);
                    if gasmix != gasmix_previous {
                        if gasmix < 1 || gasmix as usize > self.ngasmixes {
                            error!("Invalid gas mix index ({gasmix}).");
                            return Err(Error::DataFormat("invalid gas mix".into()));
                        }
                        callback(Sample::GasMix(gasmix - 1));
                        gasmix_previous = gasmix;
                    }
                }

                // NDL and deco, where the model records them.
                let mut have_deco = false;
                let mut decostop = 0u32;
                let mut decotime = 0u32;
                if self.model == A300CS || self.model == VTX {
                    decostop = u32::from(data[offset + 15] & 0x70) >> 4;
                    decotime = bytes::u16_le(&data[offset + 6..]) & 0x03FF;
                    have_deco = true;
                } else if self.model == ZEN {
                    decostop = u32::from(data[offset + 5] & 0xF0) >> 4;
                    decotime = bytes::u16_le(&data[offset + 4..]) & 0x0FFF;
                    have_deco = true;
                } else if self.model == TX1 {
                    decostop = u32::from(data[offset + 10]);
                    decotime = bytes::u16_le(&data[offset + 6..]);
                    have_deco = true;
                }
                if have_deco {
                    let (kind, stop_depth) = if decostop != 0 {
                        (
                            DecoKind::DecoStop,
                            f64::from(decostop) * 10.0 * FEET,
                        )
                    } else {
                        (DecoKind::Ndl, 0.0)
                    };
                    callback(Sample::Deco {
                        kind,
                        time: decotime * 60,
                        depth: stop_depth,
                    });
                }

                complete = true;
            }

            offset += length;
        }

        Ok(())
    }
}

impl Parser for Atom2Parser {
    fn family(&self) -> Family {
        Family::OceanicAtom2
    }

    fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.reset_cache();
    }

    fn datetime(&mut self) -> Result<DateTime> {
        let header = if self.is_freedive_model() { 32 } else { 8 };
        if self.data.len() < header {
            return Err(Error::DataFormat("dive header too short".into()));
        }

        let p = &self.data;

        // AM/PM bit of the 12-hour clock.
        let mut pm = p[1] & 0x80;

        let mut dt = DateTime::default();
        match self.model {
            OC1A | OC1B | OC1C | OCS | VT4 | VT41 | ATOM3 | ATOM31 | A300AI | OCI => {
                dt.year = (u32::from(p[5] & 0xE0) >> 5) + (u32::from(p[7] & 0xE0) >> 2) + 2000;
                dt.month = u32::from(p[3] & 0x0F);
                dt.day = (u32::from(p[0] & 0x80) >> 3) + (u32::from(p[3] & 0xF0) >> 4);
                dt.hour = bcd2dec(p[1] & 0x1F);
                dt.minute = bcd2dec(p[0] & 0x7F);
            },
            VT3 | VEO20 | VEO30 | DG03 | T3A | T3B | GEO20 | PROPLUS3 => {
                dt.year = (u32::from(p[3] & 0xE0) >> 1) + u32::from(p[4] & 0x0F) + 2000;
                dt.month = u32::from(p[4] & 0xF0) >> 4;
                dt.day = u32::from(p[3] & 0x1F);
                dt.hour = bcd2dec(p[1] & 0x1F);
                dt.minute = bcd2dec(p[0]);
            },
            ZENAIR | AMPHOS | AMPHOSAIR | VOYAGER2G => {
                dt.year = u32::from(p[3] & 0x0F) + 2000;
                dt.month = u32::from(p[7] & 0xF0) >> 4;
                dt.day = (u32::from(p[3] & 0x80) >> 3) + (u32::from(p[5] & 0xF0) >> 4);
                dt.hour = bcd2dec(p[1] & 0x1F);
                dt.minute = bcd2dec(p[0]);
            },
            F10 | F11A | F11B => {
                dt.year = bcd2dec(p[6]) + 2000;
                dt.month = bcd2dec(p[7]);
                dt.day = bcd2dec(p[8]);
                dt.hour = bcd2dec(p[13] & 0x7F);
                dt.minute = bcd2dec(p[12]);
                pm = p[13] & 0x80;
            },
            TX1 => {
                dt.year = bcd2dec(p[13]) + 2000;
                dt.month = bcd2dec(p[14]);
                dt.day = bcd2dec(p[15]);
                dt.hour = u32::from(p[11]);
                dt.minute = u32::from(p[10]);
            },
            A300CS | VTX => {
                dt.year = u32::from(p[10]) + 2000;
                dt.month = u32::from(p[8]);
                dt.day = u32::from(p[9]);
                dt.hour = bcd2dec(p[1] & 0x1F);
                dt.minute = bcd2dec(p[0]);
            },
            _ => {
                dt.year = bcd2dec(((p[3] & 0xC0) >> 2) + (p[4] & 0x0F)) + 2000;
                dt.month = u32::from(p[4] & 0xF0) >> 4;
                dt.day = bcd2dec(p[3] & 0x3F);
                dt.hour = bcd2dec(p[1] & 0x1F);
                dt.minute = bcd2dec(p[0]);
            },
        }
        dt.second = 0;

        // Convert to a 24-hour clock.
        dt.hour %= 12;
        if pm != 0 {
            dt.hour += 12;
        }

        // Workaround for the year 2010 problem: some models only store the
        // last digit of the year, so the missing decade is guessed from
        // the host clock. Models that store the year with more bits are
        // left untouched, in case a firmware update fixes this.
        if dt.year < 2010 {
            let now_year = datetime::now_year();
            if now_year >= 2010 {
                let mut decade = (now_year / 10) * 10;
                if dt.year % 10 > now_year % 10 {
                    decade -= 10; // Force back to the previous decade.
                }
                dt.year += decade - 2000;
            }
        }

        Ok(dt)
    }

    fn field(&mut self, field: Field) -> Result<FieldValue> {
        self.cache_header()?;
        if self.cached < CacheLevel::Profile {
            self.cache_profile()?;
        }

        let data = &self.data;

        match field {
            Field::DiveTime => {
                if self.is_freedive_model() {
                    Ok(FieldValue::DiveTime(
                        bcd2dec(data[2]) + bcd2dec(data[3]) * 60,
                    ))
                } else {
                    Ok(FieldValue::DiveTime(self.divetime))
                }
            },
            Field::MaxDepth => {
                let raw = if self.is_freedive_model() {
                    bytes::u16_le(&data[4..])
                } else {
                    bytes::u16_le(&data[self.footer + 4..])
                };
                Ok(FieldValue::Depth(f64::from(raw) / 16.0 * FEET))
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
            Field::Salinity => {
                if self.model == A300CS || self.model == VTX {
                    Ok(FieldValue::Salinity(Salinity {
                        kind: if data[0x18] & 0x80 != 0 {
                            WaterKind::Fresh
                        } else {
                            WaterKind::Salt
                        },
                        density: 0.0,
                    }))
                } else {
                    Err(Error::Unsupported("salinity not recorded".into()))
                }
            },
            Field::DiveMode => match self.mode {
                NORMAL => Ok(FieldValue::DiveMode(DiveMode::OpenCircuit)),
                GAUGE => Ok(FieldValue::DiveMode(DiveMode::Gauge)),
                FREEDIVE => Ok(FieldValue::DiveMode(DiveMode::Freedive)),
                _ => Err(Error::DataFormat("unknown dive mode".into())),
            },
            Field::String(0) => Ok(FieldValue::String(FieldString {
                desc: "Serial",
                value: format!("{:06}", self.serial),
            })),
            _ => Err(Error::Unsupported("field not available".into())),
        }
    }

    fn samples_foreach(&mut self, callback: &mut SampleCallback<'_>) -> Result<()> {
        self.cache_header()?;
        self.walk_samples(callback)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An Atom 2 dive: 72-byte header, 8-byte samples, 16-byte footer.
    fn build_dive() -> Vec<u8> {
        let headersize = 9 * PAGESIZE / 2;
        let footersize = PAGESIZE;
        let mut data = vec![0u8; headersize + 3 * (PAGESIZE / 2) + footersize];

        // Datetime (generic layout): 10:45 BCD, day 21, month 7, year 12
        // (high BCD digit in the top bits of byte 3).
        data[0] = 0x45;
        data[1] = 0x10;
        data[3] = 0x61;
        data[4] = 0x72;

        data[0x17] = 0x00; // interval code 0 = 2 seconds

        // Header sample page: initial temperature 72 °F, pressure 3000 psi,
        // gas table (o2).
        let header = headersize - PAGESIZE / 2;
        data[header + 7] = 72;
        data[header + 2..header + 4].copy_from_slice(&3000u16.to_le_bytes());
        data[header + 4] = 32; // EAN32
        data[header + 5] = 0; // air (stored as 0 -> 21%)
        data[header + 6] = 50;

        // Sample 1: depth 320/16 ft, pressure drop 10 psi.
        let s1 = headersize;
        data[s1 + 1] = 10;
        data[s1 + 2..s1 + 4].copy_from_slice(&320u16.to_le_bytes());

        // Sample 2: empty (skipped).
        let s2 = s1 + PAGESIZE / 2;
        for b in &mut data[s2..s2 + PAGESIZE / 2] {
            *b = 0xFF;
        }

        // Sample 3: depth 160/16 ft.
        let s3 = s2 + PAGESIZE / 2;
        data[s3 + 1] = 5;
        data[s3 + 2..s3 + 4].copy_from_slice(&160u16.to_le_bytes());

        // Footer: max depth 320/16 ft.
        let footer = data.len() - footersize;
        data[footer + 4..footer + 6].copy_from_slice(&320u16.to_le_bytes());

        data
    }

    #[test]
    fn test_derived_divetime_and_maxdepth() {
        let mut parser = Atom2Parser::new(ATOM2, 123456);
        let dive = build_dive();
        parser.set_data(&dive);

        // Two non-empty samples at a 2-second interval.
        assert_eq!(
            parser.field(Field::DiveTime).unwrap(),
            FieldValue::DiveTime(4)
        );

        let maxdepth = match parser.field(Field::MaxDepth).unwrap() {
            FieldValue::Depth(depth) => depth,
            other => panic!("unexpected field value {other:?}"),
        };
        assert!((maxdepth - 320.0 / 16.0 * FEET).abs() < 1e-9);
    }

    #[test]
    fn test_depth_conversion_sixteenths_of_feet() {
        let mut parser = Atom2Parser::new(ATOM2, 0);
        let dive = build_dive();
        parser.set_data(&dive);

        let mut depths = Vec::new();
        parser
            .samples_foreach(&mut |sample| {
                if let Sample::Depth(depth) = sample {
                    depths.push(depth);
                }
            })
            .unwrap();

        assert_eq!(depths.len(), 2);
        assert!((depths[0] - 20.0 * FEET).abs() < 1e-9);
        assert!((depths[1] - 10.0 * FEET).abs() < 1e-9);
    }

    #[test]
    fn test_pressure_decrements_from_initial() {
        let mut parser = Atom2Parser::new(ATOM2, 0);
        let dive = build_dive();
        parser.set_data(&dive);

        let mut pressures = Vec::new();
        parser
            .samples_foreach(&mut |sample| {
                if let Sample::Pressure { bar, .. } = sample {
                    pressures.push(bar);
                }
            })
            .unwrap();

        assert_eq!(pressures.len(), 2);
        assert!((pressures[0] - 2990.0 * PSI / BAR).abs() < 1e-9);
        assert!((pressures[1] - 2985.0 * PSI / BAR).abs() < 1e-9);
    }

    #[test]
    fn test_empty_samples_are_skipped_with_vendor_records() {
        let mut parser = Atom2Parser::new(ATOM2, 0);
        let dive = build_dive();
        parser.set_data(&dive);

        let mut vendor = 0;
        let mut times = Vec::new();
        parser
            .samples_foreach(&mut |sample| match sample {
                Sample::Vendor { kind, .. } => {
                    assert_eq!(kind, VendorKind::OceanicAtom2);
                    vendor += 1;
                },
                Sample::Time(t) => times.push(t),
                _ => {},
            })
            .unwrap();

        // The all-0xFF sample emits nothing, not even a vendor record.
        assert_eq!(vendor, 2);
        assert_eq!(times, vec![2, 4]);
    }

    #[test]
    fn test_zero_oxygen_defaults_to_air() {
        let mut parser = Atom2Parser::new(ATOM2, 0);
        let dive = build_dive();
        parser.set_data(&dive);

        assert_eq!(parser.field(Field::GasMixCount).unwrap(), FieldValue::Count(3));

        let mix = match parser.field(Field::GasMix(1)).unwrap() {
            FieldValue::GasMix(mix) => mix,
            other => panic!("unexpected field value {other:?}"),
        };
        assert!((mix.oxygen - 0.21).abs() < 1e-9);
    }

    #[test]
    fn test_datetime_generic_layout() {
        let mut parser = Atom2Parser::new(ATOM2, 0);
        let dive = build_dive();
        parser.set_data(&dive);

        let dt = parser.datetime().unwrap();
        assert_eq!((dt.year, dt.month, dt.day), (2012, 7, 21));
        assert_eq!((dt.hour, dt.minute), (10, 45));
        assert_eq!(dt.second, 0);
    }

    #[test]
    fn test_am_pm_clock() {
        let mut parser = Atom2Parser::new(ATOM2, 0);
        let mut dive = build_dive();
        dive[1] |= 0x80; // PM
        parser.set_data(&dive);

        let dt = parser.datetime().unwrap();
        assert_eq!(dt.hour, 22);
    }

    #[test]
    fn test_serial_string() {
        let mut parser = Atom2Parser::new(ATOM2, 1234);
        let dive = build_dive();
        parser.set_data(&dive);

        match parser.field(Field::String(0)).unwrap() {
            FieldValue::String(s) => assert_eq!(s.value, "001234"),
            other => panic!("unexpected field value {other:?}"),
        }
    }

    #[test]
    fn test_truncated_blob_is_dataformat() {
        let mut parser = Atom2Parser::new(ATOM2, 0);
        parser.set_data(&[0u8; 16]);
        assert!(matches!(
            parser.field(Field::DiveTime),
            Err(Error::DataFormat(_))
        ));
    }
}
