//! Device-to-parser dispatch.
//!
//! Builds the right parser for a device session from its family tag plus,
//! where the blob layout depends on it, the model and serial number from
//! the device identity. Model-specific routing quirks live here and
//! nowhere else.

use crate::atomics::CobaltParser;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::family::Family;
use crate::oceanic::Atom2Parser;
use crate::parser::Parser;
use crate::shearwater::PredatorParser;
use crate::suunto::D9Parser;

/// The Oceanic "React Pro White" reports the Atom 2 protocol but stores
/// dives in the Veo 250 format.
const REACT_PRO_WHITE: u32 = 0x4354;

/// Create the parser matching a device session.
///
/// Families whose decoder is not built into this crate report
/// [`Error::Unsupported`].
pub fn parser_for_device(device: &dyn Device) -> Result<Box<dyn Parser>> {
    let devinfo = device.devinfo().unwrap_or_default();

    match device.family() {
        Family::SuuntoVyper => {
            if devinfo.model == 0x01 {
                // The Spyder stores Eon-format dives behind the Vyper
                // protocol.
                Err(Error::Unsupported("Suunto Eon parser".into()))
            } else {
                Err(Error::Unsupported("Suunto Vyper parser".into()))
            }
        },
        Family::SuuntoVyper2 | Family::SuuntoD9 => Ok(Box::new(D9Parser::new(
            devinfo.model,
            devinfo.serial,
        ))),
        Family::OceanicAtom2 => {
            if devinfo.model == REACT_PRO_WHITE {
                Err(Error::Unsupported("Oceanic Veo 250 parser".into()))
            } else {
                Ok(Box::new(Atom2Parser::new(devinfo.model, devinfo.serial)))
            }
        },
        Family::AtomicsCobalt => Ok(Box::new(CobaltParser::new())),
        Family::ShearwaterPredator => Ok(Box::new(PredatorParser::new(devinfo.serial))),
        Family::ShearwaterPetrel => Ok(Box::new(PredatorParser::new_petrel(devinfo.serial))),
        family => Err(Error::Unsupported(format!("no parser for {family}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DevInfo;
    use crate::device::{CancelToken, DiveCallback};

    struct FakeDevice {
        family: Family,
        devinfo: Option<DevInfo>,
    }

    impl Device for FakeDevice {
        fn family(&self) -> Family {
            self.family
        }

        fn set_fingerprint(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn foreach(&mut self, _callback: &mut DiveCallback<'_>) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn cancel_token(&self) -> CancelToken {
            CancelToken::new()
        }

        fn devinfo(&self) -> Option<DevInfo> {
            self.devinfo
        }
    }

    fn fake(family: Family, model: u32) -> FakeDevice {
        FakeDevice {
            family,
            devinfo: Some(DevInfo {
                model,
                firmware: 0,
                serial: 42,
            }),
        }
    }

    #[test]
    fn test_d9_and_vyper2_share_a_parser() {
        let parser = parser_for_device(&fake(Family::SuuntoD9, 0x0E)).unwrap();
        assert_eq!(parser.family(), Family::SuuntoD9);

        let parser = parser_for_device(&fake(Family::SuuntoVyper2, 0x10)).unwrap();
        assert_eq!(parser.family(), Family::SuuntoD9);
    }

    #[test]
    fn test_atom2_dispatch() {
        let parser = parser_for_device(&fake(Family::OceanicAtom2, 0x4342)).unwrap();
        assert_eq!(parser.family(), Family::OceanicAtom2);
    }

    #[test]
    fn test_react_pro_white_routes_away_from_atom2() {
        // Model 0x4354 must not get the Atom 2 parser.
        let result = parser_for_device(&fake(Family::OceanicAtom2, REACT_PRO_WHITE));
        assert!(matches!(
            result,
            Err(Error::Unsupported(msg)) if msg.contains("Veo 250")
        ));
    }

    #[test]
    fn test_shearwater_variants() {
        let parser = parser_for_device(&fake(Family::ShearwaterPredator, 0)).unwrap();
        assert_eq!(parser.family(), Family::ShearwaterPredator);

        let parser = parser_for_device(&fake(Family::ShearwaterPetrel, 0)).unwrap();
        assert_eq!(parser.family(), Family::ShearwaterPetrel);
    }

    #[test]
    fn test_unknown_family_is_unsupported() {
        let result = parser_for_device(&fake(Family::CochranCommander, 0));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
