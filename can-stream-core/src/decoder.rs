//! Frame decoder API
//!
//! `decode` is a pure function of a frame and the frame database. The
//! [`Decoder`] wrapper holds a shared database for the ingestion loop.

use crate::message_decoder::MessageDecoder;
use crate::signals::{DatabaseStats, FrameDatabase, FrameDefinition};
use crate::types::{CanFrame, DecodedFrame, PipelineError, Result};
use std::sync::Arc;

/// Decode one frame into its signal samples
///
/// # Returns
/// * `Err(UnknownFrame)` if the identifier is not in the database
/// * `Ok(DecodedFrame)` otherwise; signals the payload is too short for are
///   listed in `skipped` and the rest are decoded
/// * error frames decode to an empty `DecodedFrame` without a lookup
///
/// # Example
/// ```
/// use can_stream_core::{decode, CanFrame};
/// use can_stream_core::signals::{FrameDatabase, FrameDefinition, SignalDescriptor};
///
/// let mut db = FrameDatabase::new();
/// db.add_frame(
///     FrameDefinition::new(0x100, "Engine", 8)
///         .with_signal(SignalDescriptor::new("Rpm", 0, 16).with_scaling(0.25, 0.0)),
/// ).unwrap();
///
/// let decoded = decode(&CanFrame::new(0, 0x100, vec![0x40, 0x1F]), &db).unwrap();
/// assert_eq!(decoded.samples[0].value, 2000.0);
/// ```
pub fn decode(frame: &CanFrame, database: &FrameDatabase) -> Result<DecodedFrame> {
    if frame.is_error_frame {
        log::trace!("Error frame at {} ns", frame.timestamp_ns);
        return Ok(DecodedFrame {
            timestamp_ns: frame.timestamp_ns,
            can_id: frame.can_id,
            frame_name: None,
            samples: Vec::new(),
            skipped: Vec::new(),
        });
    }

    let frame_def = database
        .frame(frame.can_id)
        .ok_or(PipelineError::UnknownFrame(frame.can_id))?;

    log::trace!("Decoding frame: {} (ID 0x{:X})", frame_def.name, frame.can_id);
    Ok(MessageDecoder::decode_message(frame, frame_def))
}

/// Build a payload from physical signal values (inverse of [`decode`])
///
/// Signals not listed are left as zero bits.
pub fn encode(frame_def: &FrameDefinition, values: &[(&str, f64)]) -> Result<Vec<u8>> {
    let mut data = vec![0u8; frame_def.size];
    for (name, physical) in values {
        let signal = frame_def.signal(name).ok_or_else(|| {
            PipelineError::InvalidSignalDefinition(format!(
                "frame {} has no signal '{}'",
                frame_def.name, name
            ))
        })?;
        let raw = signal.raw_from_physical(*physical);
        MessageDecoder::insert_signal_value(&mut data, signal, raw);
    }
    Ok(data)
}

/// Decoder bound to a shared, read-only frame database
#[derive(Clone)]
pub struct Decoder {
    database: Arc<FrameDatabase>,
}

impl Decoder {
    /// Create a decoder over a loaded database
    pub fn new(database: Arc<FrameDatabase>) -> Self {
        Self { database }
    }

    /// Decode one frame; see [`decode`]
    pub fn decode(&self, frame: &CanFrame) -> Result<DecodedFrame> {
        decode(frame, &self.database)
    }

    /// The database this decoder reads
    pub fn database(&self) -> &Arc<FrameDatabase> {
        &self.database
    }

    /// Get statistics about the loaded frame database
    pub fn database_stats(&self) -> DatabaseStats {
        self.database.stats()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(Arc::new(FrameDatabase::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{ByteOrder, SignalDescriptor};

    fn test_database() -> FrameDatabase {
        let mut db = FrameDatabase::new();
        db.add_frame(
            FrameDefinition::new(0x123, "EngineData", 8)
                .with_signal(SignalDescriptor::new("EngineSpeed", 0, 16).with_unit("rpm"))
                .with_signal(SignalDescriptor::new("EngineTemp", 16, 8).with_scaling(1.0, -40.0))
                .with_signal(
                    SignalDescriptor::new("Torque", 39, 16)
                        .with_byte_order(ByteOrder::BigEndian)
                        .signed()
                        .with_scaling(0.1, 0.0),
                ),
        )
        .unwrap();
        db.add_frame(
            FrameDefinition::new(0x200, "Gearbox", 2)
                .with_signal(
                    SignalDescriptor::new("Gear", 0, 4)
                        .with_label(0, "Neutral")
                        .with_label(1, "First"),
                )
                .with_multiplexer("Gear")
                .with_signal(SignalDescriptor::new("ClutchA", 8, 8).multiplexed_by("Gear", vec![1]))
                .with_signal(SignalDescriptor::new("ClutchN", 8, 8).multiplexed_by("Gear", vec![0])),
        )
        .unwrap();
        db
    }

    #[test]
    fn test_decoder_creation() {
        let decoder = Decoder::default();
        let stats = decoder.database_stats();
        assert_eq!(stats.num_frames, 0);
        assert_eq!(stats.num_signals, 0);
    }

    #[test]
    fn test_unknown_frame() {
        let db = test_database();
        let result = decode(&CanFrame::new(0, 0x7FF, vec![0; 8]), &db);
        assert!(matches!(result, Err(PipelineError::UnknownFrame(0x7FF))));
    }

    #[test]
    fn test_decode_scaling() {
        let db = test_database();
        // EngineSpeed=3000 (0x0BB8), EngineTemp raw 130 -> 90 C, Torque raw -250 -> -25.0
        let torque = (-250i16).to_be_bytes();
        let frame = CanFrame::new(42, 0x123, vec![0xB8, 0x0B, 130, 0, torque[0], torque[1], 0, 0]);
        let decoded = decode(&frame, &db).unwrap();

        assert_eq!(decoded.frame_name.as_deref(), Some("EngineData"));
        assert!(decoded.skipped.is_empty());
        assert_eq!(decoded.sample("EngineSpeed").unwrap().value, 3000.0);
        assert_eq!(decoded.sample("EngineSpeed").unwrap().unit.as_deref(), Some("rpm"));
        assert_eq!(decoded.sample("EngineTemp").unwrap().value, 90.0);
        let torque = decoded.sample("Torque").unwrap();
        assert_eq!(torque.raw_value, -250);
        assert!((torque.value + 25.0).abs() < 1e-9);
        assert!(decoded.samples.iter().all(|s| s.timestamp_ns == 42));
    }

    #[test]
    fn test_partial_decode() {
        let db = test_database();
        // Only 3 bytes: EngineSpeed and EngineTemp fit, Torque does not
        let frame = CanFrame::new(0, 0x123, vec![0x10, 0x00, 50]);
        let decoded = decode(&frame, &db).unwrap();
        assert_eq!(decoded.samples.len(), 2);
        assert_eq!(decoded.skipped.len(), 1);
        assert_eq!(decoded.skipped[0].name, "Torque");
        assert!(matches!(
            decoded.malformed(),
            Some(PipelineError::MalformedFrame { required: 6, actual: 3, .. })
        ));
    }

    #[test]
    fn test_multiplexed_decode_and_labels() {
        let db = test_database();
        let decoded = decode(&CanFrame::new(0, 0x200, vec![0x01, 77]), &db).unwrap();
        let names: Vec<_> = decoded.samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Gear", "ClutchA"]);
        assert_eq!(decoded.sample("Gear").unwrap().label.as_deref(), Some("First"));

        let decoded = decode(&CanFrame::new(0, 0x200, vec![0x00, 5]), &db).unwrap();
        assert_eq!(decoded.sample("ClutchN").unwrap().value, 5.0);
        assert_eq!(decoded.sample("Gear").unwrap().label.as_deref(), Some("Neutral"));
    }

    #[test]
    fn test_error_frame_has_no_samples() {
        let db = test_database();
        let decoded = decode(&CanFrame::error(10), &db).unwrap();
        assert!(decoded.samples.is_empty());
        assert!(decoded.frame_name.is_none());
    }

    #[test]
    fn test_decode_is_deterministic() {
        let db = test_database();
        let frame = CanFrame::new(7, 0x123, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decode(&frame, &db).unwrap(), decode(&frame, &db).unwrap());
    }

    #[test]
    fn test_encode_round_trip() {
        let db = test_database();
        let frame_def = db.frame(0x123).unwrap();
        let data = encode(
            frame_def,
            &[("EngineSpeed", 1234.0), ("EngineTemp", -12.0), ("Torque", -3.3)],
        )
        .unwrap();
        let decoded = decode(&CanFrame::new(0, 0x123, data), &db).unwrap();

        for sample in &decoded.samples {
            let signal = frame_def.signal(&sample.name).unwrap();
            assert_eq!(signal.raw_from_physical(sample.value), sample.raw_value);
            assert_eq!(sample.value, signal.physical_from_raw(sample.raw_value));
        }
        assert_eq!(decoded.sample("EngineSpeed").unwrap().raw_value, 1234);
        assert_eq!(decoded.sample("EngineTemp").unwrap().raw_value, 28);
        assert_eq!(decoded.sample("Torque").unwrap().raw_value, -33);

        assert!(encode(frame_def, &[("Missing", 1.0)]).is_err());
    }
}
