//! Message Decoding Engine
//!
//! Extracts signal values from raw CAN frames based on the frame definition.
//! Handles bit extraction, byte order, sign extension, multiplexing and
//! physical value conversion. Also provides the inverse (raw insertion) used to
//! build payloads.

use crate::signals::{FrameDefinition, SignalDescriptor, ValueType};
use crate::types::{CanFrame, DecodedFrame, DecodedSample, SkippedSignal};

/// Message decoder - extracts signals from CAN frames
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode a CAN frame against its frame definition
    ///
    /// Signals that need more bytes than the payload carries are listed in
    /// `skipped`; every other signal is still decoded.
    pub fn decode_message(frame: &CanFrame, frame_def: &FrameDefinition) -> DecodedFrame {
        let mut samples = Vec::with_capacity(frame_def.signals.len());
        let mut skipped = Vec::new();

        // For multiplexed frames, first extract the multiplexer signal value
        let multiplexer_value = frame_def
            .multiplexer_signal
            .as_ref()
            .and_then(|name| frame_def.signal(name))
            .and_then(|switch| Self::extract_signal_value(&frame.data, switch))
            .map(|raw| raw as u64);

        for signal in &frame_def.signals {
            if let Some(ref mux_info) = signal.multiplexer {
                match multiplexer_value {
                    Some(current) if mux_info.multiplexer_values.contains(&current) => {}
                    _ => continue,
                }
            }

            match Self::decode_signal(frame, signal) {
                Some(sample) => samples.push(sample),
                None => {
                    let required_bytes = signal.required_bytes();
                    log::warn!(
                        "Signal '{}' requires {} bytes but frame 0x{:X} only has {} bytes",
                        signal.name,
                        required_bytes,
                        frame.can_id,
                        frame.data.len()
                    );
                    skipped.push(SkippedSignal {
                        name: signal.name.clone(),
                        required_bytes,
                        actual_bytes: frame.data.len(),
                    });
                }
            }
        }

        DecodedFrame {
            timestamp_ns: frame.timestamp_ns,
            can_id: frame.can_id,
            frame_name: Some(frame_def.name.clone()),
            samples,
            skipped,
        }
    }

    /// Decode a single signal from CAN frame data
    fn decode_signal(frame: &CanFrame, signal: &SignalDescriptor) -> Option<DecodedSample> {
        let raw_value = Self::extract_signal_value(&frame.data, signal)?;

        let label = signal
            .value_table
            .as_ref()
            .and_then(|table| table.get(&raw_value))
            .cloned();

        Some(DecodedSample {
            name: signal.name.clone(),
            value: signal.physical_from_raw(raw_value),
            raw_value,
            timestamp_ns: frame.timestamp_ns,
            label,
            unit: signal.unit.clone(),
        })
    }

    /// Extract the raw (sign-extended) value of a signal, or None if the
    /// payload is too short
    pub fn extract_signal_value(data: &[u8], signal: &SignalDescriptor) -> Option<i64> {
        if signal.required_bytes() > data.len() {
            return None;
        }

        let raw = Self::extract_bits(data, &signal.bit_positions());
        Some(match signal.value_type {
            ValueType::Unsigned => raw as i64,
            ValueType::Signed => Self::sign_extend(raw, signal.length as usize),
        })
    }

    /// Gather bits from the payload, least significant first
    fn extract_bits(data: &[u8], positions: &[usize]) -> u64 {
        positions
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &pos)| {
                let bit = (data[pos / 8] >> (pos % 8)) & 0x01;
                acc | ((bit as u64) << i)
            })
    }

    /// Write a raw value into the payload at the signal's bit positions
    ///
    /// The payload is grown with zero bytes if it is too short.
    pub fn insert_signal_value(data: &mut Vec<u8>, signal: &SignalDescriptor, raw: i64) {
        let required = signal.required_bytes();
        if data.len() < required {
            data.resize(required, 0);
        }

        let raw = raw as u64;
        for (i, pos) in signal.bit_positions().into_iter().enumerate() {
            let mask = 1u8 << (pos % 8);
            if (raw >> i) & 0x01 == 1 {
                data[pos / 8] |= mask;
            } else {
                data[pos / 8] &= !mask;
            }
        }
    }

    /// Sign-extend a value from N bits to 64 bits
    ///
    /// If the value's MSB is 1, fill the upper bits with 1s.
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::ByteOrder;

    fn intel(start: u16, len: u16) -> SignalDescriptor {
        SignalDescriptor::new("S", start, len)
    }

    fn motorola(start: u16, len: u16) -> SignalDescriptor {
        SignalDescriptor::new("S", start, len).with_byte_order(ByteOrder::BigEndian)
    }

    #[test]
    fn test_extract_little_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_signal_value(&data, &intel(0, 8)), Some(0xAB));
    }

    #[test]
    fn test_extract_little_endian_cross_byte() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_signal_value(&data, &intel(0, 16)), Some(0xCDAB));
        assert_eq!(MessageDecoder::extract_signal_value(&data, &intel(4, 8)), Some(0xDA));
    }

    #[test]
    fn test_extract_big_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_signal_value(&data, &motorola(7, 8)), Some(0xAB));
    }

    #[test]
    fn test_extract_big_endian_cross_byte() {
        // MSB at bit 7 of byte 0, 16 bits: bytes 0 and 1 in network order
        let data = vec![0x12, 0x34, 0x00, 0x00];
        assert_eq!(MessageDecoder::extract_signal_value(&data, &motorola(7, 16)), Some(0x1234));
        // 12 bits: byte 0 then the top nibble of byte 1
        assert_eq!(MessageDecoder::extract_signal_value(&data, &motorola(7, 12)), Some(0x123));
    }

    #[test]
    fn test_payload_too_short() {
        let data = vec![0xFF];
        assert_eq!(MessageDecoder::extract_signal_value(&data, &intel(0, 16)), None);
        assert_eq!(MessageDecoder::extract_signal_value(&[], &intel(0, 1)), None);
    }

    #[test]
    fn test_sign_extend_positive() {
        assert_eq!(MessageDecoder::sign_extend(0x7F, 8), 127);
    }

    #[test]
    fn test_sign_extend_negative() {
        assert_eq!(MessageDecoder::sign_extend(0xFF, 8), -1);
        assert_eq!(MessageDecoder::sign_extend(0x8000, 16), -32768);
    }

    #[test]
    fn test_insert_then_extract() {
        let signals = [intel(3, 10), motorola(23, 12), intel(40, 8).signed()];
        let values = [0x2A5, 0xABC, -17];
        let mut data = vec![0u8; 8];
        for (signal, value) in signals.iter().zip(values) {
            MessageDecoder::insert_signal_value(&mut data, signal, value);
        }
        for (signal, value) in signals.iter().zip(values) {
            assert_eq!(MessageDecoder::extract_signal_value(&data, signal), Some(value));
        }
    }

    #[test]
    fn test_insert_grows_payload() {
        let mut data = Vec::new();
        MessageDecoder::insert_signal_value(&mut data, &intel(8, 8), 0x5A);
        assert_eq!(data, vec![0x00, 0x5A]);
    }
}
