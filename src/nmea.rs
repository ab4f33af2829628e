//! RMC extraction from the GNSS NMEA stream

use nmea0183::{ParseResult, Parser};

use crate::model::GpsFix;

const KMH_PER_KNOT: f32 = 1.852;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rmc {
    /// Receiver has no valid position
    Void,
    Fix(GpsFix),
}

/// Assembles bytes from the GNSS UART into sentences. Partial sentences carry
/// over between calls.
pub struct NmeaReader {
    parser: Parser,
}

impl NmeaReader {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
        }
    }

    /// Feed one byte. Returns a result whenever an RMC sentence completes.
    pub fn feed(&mut self, byte: u8) -> Option<Rmc> {
        match self.parser.parse_from_byte(byte)? {
            Ok(ParseResult::RMC(Some(rmc))) => Some(Rmc::Fix(GpsFix {
                latitude: rmc.latitude.as_f64() as f32,
                longitude: rmc.longitude.as_f64() as f32,
                speed: rmc.speed.as_knots() * KMH_PER_KNOT,
            })),
            Ok(ParseResult::RMC(None)) => Some(Rmc::Void),
            Ok(_) => None,
            Err(e) => {
                log::debug!("[GPS] Bad sentence: {}", e);
                None
            }
        }
    }
}

impl Default for NmeaReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one complete `$xxRMC,...*hh` sentence.
///
/// Returns `None` for other sentence types and for anything malformed.
pub fn parse_rmc(sentence: &str) -> Option<Rmc> {
    let mut reader = NmeaReader::new();
    sentence
        .bytes()
        .chain(*b"\r\n")
        .filter_map(|b| reader.feed(b))
        .last()
}
