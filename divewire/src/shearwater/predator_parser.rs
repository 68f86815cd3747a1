//! Shearwater Predator and Petrel dive blob parser.
//!
//! Dives are stored in 128-byte blocks: one header block, fixed-size
//! samples (16 bytes on the Predator, 32 on the Petrel), and a footer
//! block. A final block opening with 0xFFFD follows the footer; the
//! Predator only has it on the newest firmware, the Petrel always.
//!
//! The gas table is not stored in the header; it is collected by scanning
//! the samples for oxygen/helium changes.

use std::any::Any;

use log::error;

use crate::bytes;
use crate::datetime::DateTime;
use crate::error::{Error, Result};
use crate::family::Family;
use crate::parser::{
    DecoKind, DiveMode, Field, FieldString, FieldValue, GasMix, Parser, Sample, SampleCallback,
    Salinity, WaterKind,
};
use crate::units::FEET;

const SZ_BLOCK: usize = 0x80;
const SZ_SAMPLE_PREDATOR: usize = 0x10;
const SZ_SAMPLE_PETREL: usize = 0x20;

// Status flag bits.
const SETPOINT_HIGH: u8 = 0x04;
const OC: u8 = 0x10;

const METRIC: u8 = 0;
const IMPERIAL: u8 = 1;

const NGASMIXES: usize = 10;

struct Cache {
    headersize: usize,
    footersize: usize,
    ngasmixes: usize,
    oxygen: [u8; NGASMIXES],
    helium: [u8; NGASMIXES],
    mode: DiveMode,
    sensor_cal_value: [u32; 3],
    sensor_adc_offset: [i8; 3],
}

/// Parser for the Predator and Petrel.
pub struct PredatorParser {
    petrel: bool,
    samplesize: usize,
    serial: u32,
    data: Vec<u8>,
    cache: Option<Cache>,
}

impl PredatorParser {
    /// Create a Predator parser.
    pub fn new(serial: u32) -> Self {
        Self {
            petrel: false,
            samplesize: SZ_SAMPLE_PREDATOR,
            serial,
            data: Vec::new(),
            cache: None,
        }
    }

    /// Create a Petrel parser.
    pub fn new_petrel(serial: u32) -> Self {
        Self {
            petrel: true,
            samplesize: SZ_SAMPLE_PETREL,
            serial,
            data: Vec::new(),
            cache: None,
        }
    }

    /// The O2 sensor calibration values (with the fixed offset applied)
    /// and raw ADC offsets from the header.
    pub fn sensor_calibration(&mut self) -> Result<([u32; 3], [i8; 3])> {
        let cache = self.cache()?;
        Ok((cache.sensor_cal_value, cache.sensor_adc_offset))
    }

    fn cache(&mut self) -> Result<&Cache> {
        if self.cache.is_none() {
            self.cache = Some(self.build_cache()?);
        }
        Ok(self.cache.as_ref().unwrap())
    }

    fn build_cache(&self) -> Result<Cache> {
        let data = &self.data;
        let size = data.len();

        let headersize = SZ_BLOCK;
        let mut footersize = SZ_BLOCK;
        if size < headersize + footersize {
            error!("Invalid data length.");
            return Err(Error::DataFormat("dive blob too short".into()));
        }

        // The final block is part of the footer; the Predator marks it
        // with 0xFFFD, the Petrel always has it.
        if self.petrel || bytes::u16_be(&data[size - footersize..]) == 0xFFFD {
            footersize += SZ_BLOCK;
            if size < headersize + footersize {
                error!("Invalid data length.");
                return Err(Error::DataFormat("dive blob too short".into()));
            }
        }

        let mut mode = DiveMode::OpenCircuit;

        // Collect the gas table from the samples.
        let mut ngasmixes = 0;
        let mut oxygen = [0u8; NGASMIXES];
        let mut helium = [0u8; NGASMIXES];
        let mut o2_previous = 0u8;
        let mut he_previous = 0u8;

        let mut offset = headersize;
        let length = size - footersize;
        while offset + self.samplesize <= length {
            if bytes::is_equal(&data[offset..offset + self.samplesize], 0x00) {
                offset += self.samplesize;
                continue;
            }

            let status = data[offset + 11];
            if status & OC == 0 {
                mode = DiveMode::ClosedCircuit;
            }

            let o2 = data[offset + 7];
            let he = data[offset + 8];
            if o2 != o2_previous || he != he_previous {
                let mut idx = 0;
                while idx < ngasmixes {
                    if o2 == oxygen[idx] && he == helium[idx] {
                        break;
                    }
                    idx += 1;
                }

                if idx >= ngasmixes {
                    if idx >= NGASMIXES {
                        error!("Maximum number of gas mixes reached.");
                        return Err(Error::NoMemory("gas mix table full".into()));
                    }
                    oxygen[idx] = o2;
                    helium[idx] = he;
                    ngasmixes = idx + 1;
                }

                o2_previous = o2;
                he_previous = he;
            }

            offset += self.samplesize;
        }

        // The Predator expects the mV output of the cells to be within
        // 30mV to 70mV in 100% O2 at 1 atmosphere. Adding 1024 to the
        // calibration value lines the sensors up with the average.
        let mut sensor_cal_value = [
            bytes::u16_be(&data[87..]),
            bytes::u16_be(&data[89..]),
            bytes::u16_be(&data[91..]),
        ];
        for value in sensor_cal_value.iter_mut() {
            *value += 1024;
        }

        // Unit is probably 0.025 mV.
        let sensor_adc_offset = [data[93] as i8, data[94] as i8, data[95] as i8];

        Ok(Cache {
            headersize,
            footersize,
            ngasmixes,
            oxygen,
            helium,
            mode,
            sensor_cal_value,
            sensor_adc_offset,
        })
    }

    fn find_gasmix(cache: &Cache, o2: u8, he: u8) -> usize {
        let mut i = 0;
        while i < cache.ngasmixes {
            if o2 == cache.oxygen[i] && he == cache.helium[i] {
                break;
            }
            i += 1;
        }
        i
    }
}

impl Parser for PredatorParser {
    fn family(&self) -> Family {
        if self.petrel {
            Family::ShearwaterPetrel
        } else {
            Family::ShearwaterPredator
        }
    }

    fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.cache = None;
    }

    fn datetime(&mut self) -> Result<DateTime> {
        if self.data.len() < 2 * SZ_BLOCK {
            return Err(Error::DataFormat("dive blob too short".into()));
        }

        let ticks = bytes::u32_be(&self.data[12..]);
        DateTime::from_unix(i64::from(ticks))
            .ok_or_else(|| Error::DataFormat("timestamp out of range".into()))
    }

    fn field(&mut self, field: Field) -> Result<FieldValue> {
        self.cache()?;
        let cache = self.cache.as_ref().unwrap();

        let data = &self.data;
        let footer = data.len() - cache.footersize;
        let units = data[8];

        match field {
            Field::DiveTime => Ok(FieldValue::DiveTime(
                bytes::u16_be(&data[footer + 6..]) * 60,
            )),
            Field::MaxDepth => {
                let depth = f64::from(bytes::u16_be(&data[footer + 4..]));
                Ok(FieldValue::Depth(if units == IMPERIAL {
                    depth * FEET
                } else {
                    depth
                }))
            },
            Field::GasMixCount => Ok(FieldValue::Count(cache.ngasmixes as u32)),
            Field::GasMix(i) => {
                let i = i as usize;
                if i >= cache.ngasmixes {
                    return Err(Error::InvalidArgs("gas mix index out of range".into()));
                }
                Ok(FieldValue::GasMix(GasMix::from_percent(
                    u32::from(cache.oxygen[i]),
                    u32::from(cache.helium[i]),
                )))
            },
            Field::Salinity => {
                let density = bytes::u16_be(&data[83..]);
                Ok(FieldValue::Salinity(Salinity {
                    kind: if density == 1000 {
                        WaterKind::Fresh
                    } else {
                        WaterKind::Salt
                    },
                    density: f64::from(density),
                }))
            },
            Field::Atmospheric => Ok(FieldValue::Atmospheric(
                f64::from(bytes::u16_be(&data[47..])) / 1000.0,
            )),
            Field::DiveMode => Ok(FieldValue::DiveMode(cache.mode)),
            Field::String(i) => {
                let (desc, value) = match i {
                    0 => (
                        "Battery at end",
                        format!("{:.1}", f64::from(data[9]) / 10.0),
                    ),
                    1 => ("Serial", format!("{:08x}", self.serial)),
                    2 => ("FW Version", format!("{:2x}", data[19])),
                    3 => (
                        "Deco model",
                        match data[67] {
                            0 => "GF".to_string(),
                            1 => "VPM-B".to_string(),
                            2 => "VPM-B/GFS".to_string(),
                            _ => return Err(Error::DataFormat("unknown deco model".into())),
                        },
                    ),
                    4 => (
                        "Deco model info",
                        match data[67] {
                            0 => format!("GF {}/{}", data[4], data[5]),
                            1 => format!("VPM-B +{}", data[68]),
                            2 => format!("VPM-B/GFS +{} {}%", data[68], data[85]),
                            _ => return Err(Error::DataFormat("unknown deco model".into())),
                        },
                    ),
                    _ => return Err(Error::Unsupported("string index out of range".into())),
                };
                Ok(FieldValue::String(FieldString { desc, value }))
            },
            _ => Err(Error::Unsupported("field not available".into())),
        }
    }

    fn samples_foreach(&mut self, callback: &mut SampleCallback<'_>) -> Result<()> {
        self.cache()?;
        let cache = self.cache.as_ref().unwrap();

        let data = &self.data;
        let size = data.len();
        let units = data[8];

        let mut o2_previous = 0u8;
        let mut he_previous = 0u8;

        let mut time = 0u32;
        let mut offset = cache.headersize;
        let length = size - cache.footersize;
        while offset + self.samplesize <= length {
            // Ignore empty samples.
            if bytes::is_equal(&data[offset..offset + self.samplesize], 0x00) {
                offset += self.samplesize;
                continue;
            }

            time += 10;
            callback(Sample::Time(time));

            // Depth (1/10 m or ft).
            let depth = f64::from(bytes::u16_be(&data[offset..]));
            callback(Sample::Depth(if units == IMPERIAL {
                depth * FEET / 10.0
            } else {
                depth / 10.0
            }));

            // Temperature (°C or °F).
            let mut temperature = i32::from(data[offset + 13] as i8);
            if temperature < 0 {
                // Fix negative temperatures.
                temperature += 102;
                if temperature > 0 {
                    temperature = 0;
                }
            }
            callback(Sample::Temperature(if units == IMPERIAL {
                (f64::from(temperature) - 32.0) * (5.0 / 9.0)
            } else {
                f64::from(temperature)
            }));

            let status = data[offset + 11];

            if status & OC == 0 {
                // PPO2, per enabled sensor; only meaningful in closed
                // circuit mode.
                let sensors = data[86];
                for (i, &raw) in [
                    data[offset + 12],
                    data[offset + 14],
                    data[offset + 15],
                ]
                .iter()
                .enumerate()
                {
                    if sensors & (1 << i) != 0 {
                        callback(Sample::Ppo2(
                            f64::from(raw) * f64::from(cache.sensor_cal_value[i]) / 100_000.0,
                        ));
                    }
                }

                // Setpoint.
                let setpoint = if self.petrel {
                    f64::from(data[offset + 18]) / 100.0
                } else if status & SETPOINT_HIGH != 0 {
                    f64::from(data[18]) / 100.0
                } else {
                    f64::from(data[17]) / 100.0
                };
                callback(Sample::Setpoint(setpoint));
            }

            // CNS.
            if self.petrel {
                callback(Sample::Cns(f64::from(data[offset + 22]) / 100.0));
            }

            // Gas change.
            let o2 = data[offset + 7];
            let he = data[offset + 8];
            if o2 != o2_previous || he != he_previous {
                let idx = Self::find_gasmix(cache, o2, he);
                if idx >= cache.ngasmixes {
                    error!("Invalid gas mix.");
                    return Err(Error::DataFormat("invalid gas mix".into()));
                }
                callback(Sample::GasMix(idx as u32));
                o2_previous = o2;
                he_previous = he;
            }

            // Deco stop or NDL.
            let decostop = bytes::u16_be(&data[offset + 2..]);
            let (kind, stop_depth) = if decostop != 0 {
                let stop = f64::from(decostop);
                (
                    DecoKind::DecoStop,
                    if units == IMPERIAL { stop * FEET } else { stop },
                )
            } else {
                (DecoKind::Ndl, 0.0)
            };
            callback(Sample::Deco {
                kind,
                time: u32::from(data[offset + 9]) * 60,
                depth: stop_depth,
            });

            offset += self.samplesize;
        }

        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A Predator dive: header block, two samples, footer block and the
    /// 0xFFFD final block.
    fn build_dive() -> Vec<u8> {
        let mut data = vec![0u8; SZ_BLOCK + 2 * SZ_SAMPLE_PREDATOR + 2 * SZ_BLOCK];

        data[8] = METRIC;
        data[9] = 41; // battery 4.1 V
        data[12..16].copy_from_slice(&1_342_708_205u32.to_be_bytes());
        data[19] = 0x2A; // firmware
        data[47..49].copy_from_slice(&1013u16.to_be_bytes());
        data[67] = 0; // GF
        data[4] = 30;
        data[5] = 85;
        data[83..85].copy_from_slice(&1000u16.to_be_bytes());
        data[86] = 0x01; // sensor 1 enabled
        data[87..89].copy_from_slice(&2176u16.to_be_bytes());

        // Sample 1: 25.0 m, EAN32, open circuit, 18 °C, NDL 45 min.
        let s1 = SZ_BLOCK;
        data[s1..s1 + 2].copy_from_slice(&250u16.to_be_bytes());
        data[s1 + 7] = 32;
        data[s1 + 9] = 45;
        data[s1 + 11] = OC;
        data[s1 + 13] = 18;

        // Sample 2: deco stop at 6 m for 3 minutes, gas unchanged.
        let s2 = s1 + SZ_SAMPLE_PREDATOR;
        data[s2..s2 + 2].copy_from_slice(&180u16.to_be_bytes());
        data[s2 + 2..s2 + 4].copy_from_slice(&6u16.to_be_bytes());
        data[s2 + 7] = 32;
        data[s2 + 9] = 3;
        data[s2 + 11] = OC;
        data[s2 + 13] = 17;

        // Footer: max depth 25 m, dive time 42 minutes.
        let footer = s2 + SZ_SAMPLE_PREDATOR;
        data[footer + 4..footer + 6].copy_from_slice(&25u16.to_be_bytes());
        data[footer + 6..footer + 8].copy_from_slice(&42u16.to_be_bytes());

        // Final block.
        let last = footer + SZ_BLOCK;
        data[last..last + 2].copy_from_slice(&0xFFFDu16.to_be_bytes());

        data
    }

    #[test]
    fn test_footer_detection_via_fffd() {
        let mut parser = PredatorParser::new(0x1234_5678);
        let dive = build_dive();
        parser.set_data(&dive);

        assert_eq!(
            parser.field(Field::DiveTime).unwrap(),
            FieldValue::DiveTime(42 * 60)
        );
        assert_eq!(
            parser.field(Field::MaxDepth).unwrap(),
            FieldValue::Depth(25.0)
        );
    }

    #[test]
    fn test_gas_table_collected_from_samples() {
        let mut parser = PredatorParser::new(0);
        let dive = build_dive();
        parser.set_data(&dive);

        assert_eq!(parser.field(Field::GasMixCount).unwrap(), FieldValue::Count(1));
        let mix = match parser.field(Field::GasMix(0)).unwrap() {
            FieldValue::GasMix(mix) => mix,
            other => panic!("unexpected field value {other:?}"),
        };
        assert!((mix.oxygen - 0.32).abs() < 1e-9);
    }

    #[test]
    fn test_samples_and_deco() {
        let mut parser = PredatorParser::new(0);
        let dive = build_dive();
        parser.set_data(&dive);

        let mut depths = Vec::new();
        let mut deco = Vec::new();
        let mut gasmixes = Vec::new();
        parser
            .samples_foreach(&mut |sample| match sample {
                Sample::Depth(d) => depths.push(d),
                Sample::Deco { kind, time, depth } => deco.push((kind, time, depth)),
                Sample::GasMix(idx) => gasmixes.push(idx),
                _ => {},
            })
            .unwrap();

        assert_eq!(depths, vec![25.0, 18.0]);
        assert_eq!(
            deco,
            vec![
                (DecoKind::Ndl, 45 * 60, 0.0),
                (DecoKind::DecoStop, 3 * 60, 6.0),
            ]
        );
        // One gas change on the first sample only.
        assert_eq!(gasmixes, vec![0]);
    }

    #[test]
    fn test_open_circuit_mode_and_strings() {
        let mut parser = PredatorParser::new(0xDEADBEEF);
        let dive = build_dive();
        parser.set_data(&dive);

        assert_eq!(
            parser.field(Field::DiveMode).unwrap(),
            FieldValue::DiveMode(DiveMode::OpenCircuit)
        );

        match parser.field(Field::String(1)).unwrap() {
            FieldValue::String(s) => assert_eq!(s.value, "deadbeef"),
            other => panic!("unexpected field value {other:?}"),
        }
        match parser.field(Field::String(4)).unwrap() {
            FieldValue::String(s) => assert_eq!(s.value, "GF 30/85"),
            other => panic!("unexpected field value {other:?}"),
        }
        match parser.field(Field::String(0)).unwrap() {
            FieldValue::String(s) => assert_eq!(s.value, "4.1"),
            other => panic!("unexpected field value {other:?}"),
        }
    }

    #[test]
    fn test_sensor_calibration_offset() {
        let mut parser = PredatorParser::new(0);
        let dive = build_dive();
        parser.set_data(&dive);

        let (cal, _adc) = parser.sensor_calibration().unwrap();
        assert_eq!(cal[0], 2176 + 1024);
    }

    #[test]
    fn test_datetime_from_epoch_ticks() {
        let mut parser = PredatorParser::new(0);
        let dive = build_dive();
        parser.set_data(&dive);

        let datetime = parser.datetime().unwrap();
        assert_eq!((datetime.year, datetime.month, datetime.day), (2012, 7, 19));
        assert_eq!(
            (datetime.hour, datetime.minute, datetime.second),
            (14, 30, 5)
        );
    }

    #[test]
    fn test_closed_circuit_ppo2_and_setpoint() {
        let mut parser = PredatorParser::new(0);
        let mut dive = build_dive();
        // Make the first sample closed circuit with sensor 1 at 200 raw,
        // low setpoint 1.3 bar.
        let s1 = SZ_BLOCK;
        dive[s1 + 11] = 0;
        dive[s1 + 12] = 200;
        dive[17] = 130;
        parser.set_data(&dive);

        let mut ppo2 = Vec::new();
        let mut setpoints = Vec::new();
        parser
            .samples_foreach(&mut |sample| match sample {
                Sample::Ppo2(value) => ppo2.push(value),
                Sample::Setpoint(value) => setpoints.push(value),
                _ => {},
            })
            .unwrap();

        assert_eq!(ppo2.len(), 1);
        assert!((ppo2[0] - 200.0 * 3200.0 / 100_000.0).abs() < 1e-9);
        assert_eq!(setpoints, vec![1.3]);

        // A closed-circuit sample flips the dive mode.
        assert_eq!(
            parser.field(Field::DiveMode).unwrap(),
            FieldValue::DiveMode(DiveMode::ClosedCircuit)
        );
    }

    #[test]
    fn test_petrel_always_has_final_block() {
        let mut parser = PredatorParser::new_petrel(0);
        // Petrel: header + one 32-byte sample + two footer blocks, no
        // 0xFFFD marker needed.
        let mut data = vec![0u8; SZ_BLOCK + SZ_SAMPLE_PETREL + 2 * SZ_BLOCK];
        data[8] = METRIC;
        data[12..16].copy_from_slice(&1_000_000_000u32.to_be_bytes());

        let s1 = SZ_BLOCK;
        data[s1..s1 + 2].copy_from_slice(&100u16.to_be_bytes());
        data[s1 + 7] = 21;
        data[s1 + 11] = OC;
        data[s1 + 22] = 15; // CNS 15%

        let footer = s1 + SZ_SAMPLE_PETREL;
        data[footer + 6..footer + 8].copy_from_slice(&10u16.to_be_bytes());

        parser.set_data(&data);

        let mut cns = Vec::new();
        parser
            .samples_foreach(&mut |sample| {
                if let Sample::Cns(value) = sample {
                    cns.push(value);
                }
            })
            .unwrap();
        assert_eq!(cns, vec![0.15]);

        assert_eq!(
            parser.field(Field::DiveTime).unwrap(),
            FieldValue::DiveTime(10 * 60)
        );
        assert_eq!(parser.family(), Family::ShearwaterPetrel);
    }
}
