// =============================================================================
// TickDecoder — self-describing length-delimited binary frame decode
// =============================================================================
//
// Grounded on `examples/original_source/pullers/realtime/yahoo/pricing_data_decoder.py`:
// a protobuf-shaped varint tag/wire-type loop over field numbers, zig-zag
// `sint64` for size/volume fields, little-endian `f32` for price fields,
// length-delimited UTF-8 (lossy) for string fields. Unknown field numbers are
// skipped by wire type rather than rejected, so the decoder tolerates venue
// payloads that carry fields this crate doesn't know about yet. Matching the
// original's slice-and-default behavior, a tag or value truncated mid-frame
// stops the loop rather than raising — decode never errors on truncation.
//
// Pure function, side-effect-free, wait-free (no allocation beyond the output
// `Tick` and the strings it owns).
// =============================================================================

use crate::error::DecodeError;
use crate::types::{SessionPhase, Symbol, Tick};

// Wire types, protobuf-style.
const WIRE_VARINT: u8 = 0;
const WIRE_64BIT: u8 = 1;
const WIRE_LENGTH_DELIMITED: u8 = 2;
const WIRE_32BIT: u8 = 5;

// Field numbers. 20-26 are intentionally unassigned in this crate — present
// in real venue payloads, skipped here by wire type to stay forward
// compatible rather than growing `Tick` to match every upstream field.
const FIELD_SYMBOL: u64 = 1;
const FIELD_PRICE: u64 = 2;
const FIELD_TIMESTAMP_MS: u64 = 3;
const FIELD_CURRENCY: u64 = 4;
const FIELD_VENUE: u64 = 5;
const FIELD_SESSION_PHASE: u64 = 6;
const FIELD_DAY_VOLUME: u64 = 7;
const FIELD_DAY_HIGH: u64 = 8;
const FIELD_DAY_LOW: u64 = 9;
const FIELD_OPEN_PRICE: u64 = 10;
const FIELD_PREV_CLOSE: u64 = 11;
const FIELD_BID: u64 = 12;
const FIELD_BID_SIZE: u64 = 13;
const FIELD_ASK: u64 = 14;
const FIELD_ASK_SIZE: u64 = 15;
const FIELD_LAST_SIZE: u64 = 16;
const FIELD_CHANGE: u64 = 17;
const FIELD_CHANGE_PCT: u64 = 18;
const FIELD_SHORT_NAME: u64 = 19;

/// Pure decode boundary the real-time fan-out calls through for every
/// incoming frame. `decode` is total: a tag or value truncated mid-frame
/// stops the decode loop and returns whatever fields were accumulated so
/// far rather than erroring — forward compatible with venue payloads cut
/// off by a framing bug upstream.
pub trait TickDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Tick, DecodeError>;
}

pub struct WireTickDecoder;

impl TickDecoder for WireTickDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Tick, DecodeError> {
        decode_tick(bytes)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            if self.pos >= self.buf.len() {
                return Err(DecodeError::TruncatedValue { offset: start });
            }
            let byte = self.buf[self.pos];
            self.pos += 1;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(DecodeError::TruncatedValue { offset: start });
            }
        }
        Ok(result)
    }

    fn read_tag(&mut self) -> Result<Option<(u64, u8)>, DecodeError> {
        if !self.remaining() {
            return Ok(None);
        }
        let start = self.pos;
        let raw = self.read_varint().map_err(|_| DecodeError::TruncatedTag { offset: start })?;
        Ok(Some((raw >> 3, (raw & 0x7) as u8)))
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        let start = self.pos;
        if self.pos + 4 > self.buf.len() {
            return Err(DecodeError::TruncatedValue { offset: start });
        }
        let bytes: [u8; 4] = self.buf[self.pos..self.pos + 4].try_into().expect("checked length");
        self.pos += 4;
        Ok(f32::from_le_bytes(bytes))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let start = self.pos;
        if self.pos + len > self.buf.len() {
            return Err(DecodeError::TruncatedValue { offset: start });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_varint()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn skip(&mut self, wire_type: u8) -> Result<(), DecodeError> {
        match wire_type {
            WIRE_VARINT => {
                self.read_varint()?;
            }
            WIRE_64BIT => {
                self.read_bytes(8)?;
            }
            WIRE_LENGTH_DELIMITED => {
                let len = self.read_varint()? as usize;
                self.read_bytes(len)?;
            }
            WIRE_32BIT => {
                self.read_bytes(4)?;
            }
            _ => {
                // Unknown wire type: nothing safe to skip, treat the rest of
                // the frame as unreadable rather than misaligning the cursor.
                return Err(DecodeError::TruncatedValue { offset: self.pos });
            }
        }
        Ok(())
    }
}

fn zigzag_decode(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Decode one field into `tick`/`session_phase_raw`. Split out of
/// `decode_tick` so a truncated value can be caught per-field rather than
/// unwinding the whole decode.
fn decode_field(
    cur: &mut Cursor,
    field: u64,
    wire_type: u8,
    tick: &mut Tick,
    session_phase_raw: &mut i64,
) -> Result<(), DecodeError> {
    match field {
        FIELD_SYMBOL if wire_type == WIRE_LENGTH_DELIMITED => {
            tick.symbol = Symbol::new(cur.read_string()?);
        }
        FIELD_PRICE if wire_type == WIRE_32BIT => tick.price = cur.read_f32()? as f64,
        FIELD_TIMESTAMP_MS if wire_type == WIRE_VARINT => {
            tick.timestamp_ms = zigzag_decode(cur.read_varint()?)
        }
        FIELD_CURRENCY if wire_type == WIRE_LENGTH_DELIMITED => tick.currency = cur.read_string()?,
        FIELD_VENUE if wire_type == WIRE_LENGTH_DELIMITED => tick.venue = cur.read_string()?,
        FIELD_SESSION_PHASE if wire_type == WIRE_VARINT => {
            *session_phase_raw = zigzag_decode(cur.read_varint()?);
        }
        FIELD_DAY_VOLUME if wire_type == WIRE_VARINT => {
            tick.day_volume = zigzag_decode(cur.read_varint()?)
        }
        FIELD_DAY_HIGH if wire_type == WIRE_32BIT => tick.day_high = cur.read_f32()? as f64,
        FIELD_DAY_LOW if wire_type == WIRE_32BIT => tick.day_low = cur.read_f32()? as f64,
        FIELD_OPEN_PRICE if wire_type == WIRE_32BIT => tick.open_price = cur.read_f32()? as f64,
        FIELD_PREV_CLOSE if wire_type == WIRE_32BIT => tick.prev_close = cur.read_f32()? as f64,
        FIELD_BID if wire_type == WIRE_32BIT => tick.bid = cur.read_f32()? as f64,
        FIELD_BID_SIZE if wire_type == WIRE_VARINT => {
            tick.bid_size = zigzag_decode(cur.read_varint()?)
        }
        FIELD_ASK if wire_type == WIRE_32BIT => tick.ask = cur.read_f32()? as f64,
        FIELD_ASK_SIZE if wire_type == WIRE_VARINT => {
            tick.ask_size = zigzag_decode(cur.read_varint()?)
        }
        FIELD_LAST_SIZE if wire_type == WIRE_VARINT => {
            tick.last_size = zigzag_decode(cur.read_varint()?)
        }
        FIELD_CHANGE if wire_type == WIRE_32BIT => tick.change = cur.read_f32()? as f64,
        FIELD_CHANGE_PCT if wire_type == WIRE_32BIT => tick.change_pct = cur.read_f32()? as f64,
        FIELD_SHORT_NAME if wire_type == WIRE_LENGTH_DELIMITED => {
            tick.short_name = cur.read_string()?
        }
        // Known field number but an unexpected wire type, or a field
        // number outside this crate's universe: skip by wire type.
        _ => cur.skip(wire_type)?,
    }
    Ok(())
}

/// Decode a single tick frame. Absent numeric fields default to zero per the
/// contract; unknown trailing/interleaved field numbers are skipped by wire
/// type rather than rejected. A tag or value that runs off the end of the
/// buffer stops decoding and returns what's accumulated so far — truncation
/// is never an error here, only incomplete data.
pub fn decode_tick(bytes: &[u8]) -> Result<Tick, DecodeError> {
    let mut cur = Cursor::new(bytes);
    let mut tick = Tick::default();
    let mut session_phase_raw: i64 = SessionPhase::Reg as i64;

    loop {
        let (field, wire_type) = match cur.read_tag() {
            Ok(Some(tag)) => tag,
            Ok(None) => break,
            Err(_) => break, // truncated trailing tag: stop, keep what we have
        };

        if decode_field(&mut cur, field, wire_type, &mut tick, &mut session_phase_raw).is_err() {
            break; // truncated trailing value: stop, keep what we have
        }
    }

    tick.session_phase = SessionPhase::from_wire(session_phase_raw);

    // Non-negative invariant on prices/sizes — the wire format should never
    // produce negatives for these fields, but a malformed upstream payload
    // must not propagate a negative size downstream.
    tick.day_volume = tick.day_volume.max(0);
    tick.bid_size = tick.bid_size.max(0);
    tick.ask_size = tick.ask_size.max(0);
    tick.last_size = tick.last_size.max(0);

    Ok(tick)
}

// =============================================================================
// Encoder — test/fixture support only; real venue frames originate upstream.
// =============================================================================

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn write_tag(out: &mut Vec<u8>, field: u64, wire_type: u8) {
    write_varint(out, (field << 3) | wire_type as u64);
}

fn write_string(out: &mut Vec<u8>, field: u64, s: &str) {
    write_tag(out, field, WIRE_LENGTH_DELIMITED);
    write_varint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn write_f32(out: &mut Vec<u8>, field: u64, value: f32) {
    write_tag(out, field, WIRE_32BIT);
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_zigzag(out: &mut Vec<u8>, field: u64, value: i64) {
    write_tag(out, field, WIRE_VARINT);
    write_varint(out, zigzag_encode(value));
}

/// Encode a tick back to wire form. Used by decoder round-trip tests and by
/// the in-process fake real-time source used in fan-out tests.
pub fn encode_tick(tick: &Tick) -> Vec<u8> {
    let mut out = Vec::new();
    write_string(&mut out, FIELD_SYMBOL, tick.symbol.as_str());
    write_f32(&mut out, FIELD_PRICE, tick.price as f32);
    write_zigzag(&mut out, FIELD_TIMESTAMP_MS, tick.timestamp_ms);
    write_string(&mut out, FIELD_CURRENCY, &tick.currency);
    write_string(&mut out, FIELD_VENUE, &tick.venue);
    write_zigzag(&mut out, FIELD_SESSION_PHASE, tick.session_phase as i64);
    write_zigzag(&mut out, FIELD_DAY_VOLUME, tick.day_volume);
    write_f32(&mut out, FIELD_DAY_HIGH, tick.day_high as f32);
    write_f32(&mut out, FIELD_DAY_LOW, tick.day_low as f32);
    write_f32(&mut out, FIELD_OPEN_PRICE, tick.open_price as f32);
    write_f32(&mut out, FIELD_PREV_CLOSE, tick.prev_close as f32);
    write_f32(&mut out, FIELD_BID, tick.bid as f32);
    write_zigzag(&mut out, FIELD_BID_SIZE, tick.bid_size);
    write_f32(&mut out, FIELD_ASK, tick.ask as f32);
    write_zigzag(&mut out, FIELD_ASK_SIZE, tick.ask_size);
    write_zigzag(&mut out, FIELD_LAST_SIZE, tick.last_size);
    write_f32(&mut out, FIELD_CHANGE, tick.change as f32);
    write_f32(&mut out, FIELD_CHANGE_PCT, tick.change_pct as f32);
    write_string(&mut out, FIELD_SHORT_NAME, &tick.short_name);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tick() -> Tick {
        Tick {
            symbol: Symbol::new("AAPL"),
            price: 189.5,
            timestamp_ms: 1_721_136_000_000,
            currency: "USD".to_string(),
            venue: "NMS".to_string(),
            session_phase: SessionPhase::Reg,
            day_volume: 1_200_000,
            day_high: 190.2,
            day_low: 187.1,
            open_price: 188.0,
            prev_close: 187.9,
            bid: 189.4,
            bid_size: 200,
            ask: 189.6,
            ask_size: 150,
            last_size: 100,
            change: 1.6,
            change_pct: 0.85,
            short_name: "Apple Inc.".to_string(),
        }
    }

    #[test]
    fn decode_encode_roundtrips_modulo_f32_precision() {
        let tick = sample_tick();
        let wire = encode_tick(&tick);
        let decoded = decode_tick(&wire).unwrap();

        assert_eq!(decoded.symbol, tick.symbol);
        assert_eq!(decoded.timestamp_ms, tick.timestamp_ms);
        assert_eq!(decoded.currency, tick.currency);
        assert_eq!(decoded.session_phase, tick.session_phase);
        assert_eq!(decoded.day_volume, tick.day_volume);
        assert!((decoded.price - tick.price).abs() < 1e-3);
        assert!((decoded.day_high - tick.day_high).abs() < 1e-3);
    }

    #[test]
    fn unknown_trailing_field_is_skipped_not_rejected() {
        let mut wire = encode_tick(&sample_tick());
        // Append an unknown field number (25) with a length-delimited blob.
        write_string(&mut wire, 25, "future-field-payload");
        let decoded = decode_tick(&wire).unwrap();
        assert_eq!(decoded.symbol, Symbol::new("AAPL"));
    }

    #[test]
    fn unknown_32bit_field_is_skipped() {
        let mut wire = encode_tick(&sample_tick());
        write_f32(&mut wire, 22, 42.0);
        let decoded = decode_tick(&wire).unwrap();
        assert_eq!(decoded.symbol, Symbol::new("AAPL"));
    }

    #[test]
    fn missing_numeric_fields_default_to_zero() {
        let mut out = Vec::new();
        write_string(&mut out, FIELD_SYMBOL, "TSLA");
        let decoded = decode_tick(&out).unwrap();
        assert_eq!(decoded.price, 0.0);
        assert_eq!(decoded.day_volume, 0);
        assert_eq!(decoded.session_phase, SessionPhase::Reg);
    }

    #[test]
    fn unknown_session_phase_value_clamps_to_reg() {
        let mut out = Vec::new();
        write_string(&mut out, FIELD_SYMBOL, "TSLA");
        write_zigzag(&mut out, FIELD_SESSION_PHASE, 99);
        let decoded = decode_tick(&out).unwrap();
        assert_eq!(decoded.session_phase, SessionPhase::Reg);
    }

    #[test]
    fn invalid_utf8_in_string_field_is_replaced_not_rejected() {
        let mut out = Vec::new();
        write_tag(&mut out, FIELD_SYMBOL, WIRE_LENGTH_DELIMITED);
        let invalid = [0xff, 0xfe, 0x41];
        write_varint(&mut out, invalid.len() as u64);
        out.extend_from_slice(&invalid);
        let decoded = decode_tick(&out).unwrap();
        assert!(decoded.symbol.as_str().contains('\u{FFFD}') || !decoded.symbol.as_str().is_empty());
    }

    #[test]
    fn truncated_tag_is_ignored_not_rejected() {
        let out = vec![0x80]; // incomplete varint tag, nothing readable
        let decoded = decode_tick(&out).unwrap();
        assert_eq!(decoded, Tick::default());
    }

    #[test]
    fn truncated_trailing_value_keeps_already_decoded_fields() {
        let mut out = Vec::new();
        write_string(&mut out, FIELD_SYMBOL, "AAPL");
        write_tag(&mut out, FIELD_PRICE, WIRE_32BIT);
        out.push(0x01); // only 1 of the 4 required payload bytes present
        let decoded = decode_tick(&out).unwrap();
        assert_eq!(decoded.symbol, Symbol::new("AAPL"));
        assert_eq!(decoded.price, 0.0);
    }

    #[test]
    fn negative_sizes_are_clamped_to_zero() {
        let mut out = Vec::new();
        write_string(&mut out, FIELD_SYMBOL, "TSLA");
        write_zigzag(&mut out, FIELD_BID_SIZE, -5);
        let decoded = decode_tick(&out).unwrap();
        assert_eq!(decoded.bid_size, 0);
    }
}
