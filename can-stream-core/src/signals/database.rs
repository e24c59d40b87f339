//! Frame database
//!
//! The static table mapping frame identifiers to their signal layouts. It is
//! built once (by hand or from a DBC file), validated on insertion, and then
//! shared read-only for the lifetime of a connection.

use crate::types::{PipelineError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Classic CAN payloads carry at most 8 bytes
pub const MAX_PAYLOAD_BITS: usize = 64;

/// A complete CAN frame definition
#[derive(Debug, Clone)]
pub struct FrameDefinition {
    /// CAN message ID
    pub id: u32,
    /// Frame name
    pub name: String,
    /// Frame size in bytes
    pub size: usize,
    /// True if the frame uses a 29-bit identifier
    pub is_extended: bool,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this frame
    pub signals: Vec<SignalDescriptor>,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
}

impl FrameDefinition {
    /// Create an empty, non-multiplexed frame definition
    pub fn new(id: u32, name: impl Into<String>, size: usize) -> Self {
        Self {
            id,
            name: name.into(),
            size,
            is_extended: id > 0x7FF,
            sender: None,
            signals: Vec::new(),
            multiplexer_signal: None,
        }
    }

    /// Builder method: add a signal
    pub fn with_signal(mut self, signal: SignalDescriptor) -> Self {
        self.signals.push(signal);
        self
    }

    /// Builder method: mark a signal as the multiplexer switch
    pub fn with_multiplexer(mut self, signal_name: impl Into<String>) -> Self {
        self.multiplexer_signal = Some(signal_name.into());
        self
    }

    /// Find a signal in this frame by name
    pub fn signal(&self, name: &str) -> Option<&SignalDescriptor> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// True if this frame has multiplexed signals
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexer_signal.is_some()
    }
}

/// A CAN signal layout descriptor
#[derive(Debug, Clone)]
pub struct SignalDescriptor {
    /// Signal name (unique within a database)
    pub name: String,
    /// Start bit in the CAN frame (LSB for Intel, MSB for Motorola)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value (advisory)
    pub min: f64,
    /// Maximum physical value (advisory)
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Value table for enum-like values (raw_value -> description)
    pub value_table: Option<HashMap<i64, String>>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer: Option<MultiplexerInfo>,
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

impl SignalDescriptor {
    /// Create an unsigned Intel signal with unit scaling
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            value_table: None,
            multiplexer: None,
        }
    }

    /// Builder method: set factor and offset
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    /// Builder method: set byte order
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Builder method: make the signal signed
    pub fn signed(mut self) -> Self {
        self.value_type = ValueType::Signed;
        self
    }

    /// Builder method: set advisory physical range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Builder method: set engineering unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Builder method: add a value table entry
    pub fn with_label(mut self, raw: i64, label: impl Into<String>) -> Self {
        self.value_table
            .get_or_insert_with(HashMap::new)
            .insert(raw, label.into());
        self
    }

    /// Builder method: activate this signal only for the given multiplexer values
    pub fn multiplexed_by(mut self, switch: impl Into<String>, values: Vec<u64>) -> Self {
        self.multiplexer = Some(MultiplexerInfo {
            multiplexer_signal: switch.into(),
            multiplexer_values: values,
        });
        self
    }

    /// Convert a raw integer to its physical value
    pub fn physical_from_raw(&self, raw: i64) -> f64 {
        raw as f64 * self.factor + self.offset
    }

    /// Inverse of [`physical_from_raw`](Self::physical_from_raw), rounded to the
    /// nearest raw integer
    pub fn raw_from_physical(&self, physical: f64) -> i64 {
        ((physical - self.offset) / self.factor).round() as i64
    }

    /// Payload bit positions occupied by this signal, least significant bit first
    ///
    /// Positions use `byte * 8 + bit_in_byte` numbering with bit 0 the LSB of a
    /// byte. Intel signals grow upward from the start bit; Motorola signals start
    /// at their MSB and walk the DBC "sawtooth" toward the LSB.
    pub fn bit_positions(&self) -> Vec<usize> {
        let length = self.length as usize;
        let start = self.start_bit as usize;
        match self.byte_order {
            ByteOrder::LittleEndian => (start..start + length).collect(),
            ByteOrder::BigEndian => {
                let mut msb_first = Vec::with_capacity(length);
                let mut pos = start;
                for i in 0..length {
                    msb_first.push(pos);
                    if i + 1 == length {
                        break;
                    }
                    if pos % 8 == 0 {
                        pos += 15;
                    } else {
                        pos -= 1;
                    }
                }
                msb_first.reverse();
                msb_first
            }
        }
    }

    /// Number of payload bytes needed to hold this signal
    pub fn required_bytes(&self) -> usize {
        self.bit_positions()
            .into_iter()
            .max()
            .map(|pos| pos / 8 + 1)
            .unwrap_or(0)
    }

    /// Bitmask of the occupied payload bits
    fn bit_mask(&self) -> u64 {
        self.bit_positions()
            .into_iter()
            .filter(|&pos| pos < MAX_PAYLOAD_BITS)
            .fold(0u64, |mask, pos| mask | (1u64 << pos))
    }

    /// True if both signals can be present in the same frame instance
    fn coexists_with(&self, other: &SignalDescriptor) -> bool {
        match (&self.multiplexer, &other.multiplexer) {
            (Some(a), Some(b)) => a
                .multiplexer_values
                .iter()
                .any(|v| b.multiplexer_values.contains(v)),
            _ => true,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PipelineError::InvalidSignalDefinition(
                "signal name must not be empty".to_string(),
            ));
        }
        if self.length == 0 || self.length as usize > MAX_PAYLOAD_BITS {
            return Err(PipelineError::InvalidSignalDefinition(format!(
                "signal '{}' has invalid length {}",
                self.name, self.length
            )));
        }
        if self.factor == 0.0 || !self.factor.is_finite() || !self.offset.is_finite() {
            return Err(PipelineError::InvalidSignalDefinition(format!(
                "signal '{}' has invalid scaling ({}, {})",
                self.name, self.factor, self.offset
            )));
        }
        if let Some(pos) = self
            .bit_positions()
            .into_iter()
            .find(|&pos| pos >= MAX_PAYLOAD_BITS)
        {
            return Err(PipelineError::InvalidSignalDefinition(format!(
                "signal '{}' reaches bit {} beyond an 8-byte payload",
                self.name, pos
            )));
        }
        Ok(())
    }
}

/// The frame database
#[derive(Debug, Default)]
pub struct FrameDatabase {
    /// All frame definitions by CAN ID
    frames: BTreeMap<u32, FrameDefinition>,

    /// Signal name lookup: signal name -> (CAN ID, signal index)
    signal_lookup: HashMap<String, (u32, usize)>,
}

impl FrameDatabase {
    /// Create a new empty frame database
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a frame definition
    ///
    /// Rejects duplicate frame IDs, duplicate signal names, signals that do not
    /// fit in an 8-byte payload, and overlapping bit ranges within the frame.
    pub fn add_frame(&mut self, frame: FrameDefinition) -> Result<()> {
        if self.frames.contains_key(&frame.id) {
            return Err(PipelineError::InvalidSignalDefinition(format!(
                "duplicate frame ID 0x{:X} ({})",
                frame.id, frame.name
            )));
        }

        let mut masks = Vec::with_capacity(frame.signals.len());
        for (idx, signal) in frame.signals.iter().enumerate() {
            signal.validate()?;

            if self.signal_lookup.contains_key(&signal.name)
                || frame.signals[..idx].iter().any(|s| s.name == signal.name)
            {
                return Err(PipelineError::InvalidSignalDefinition(format!(
                    "duplicate signal name '{}'",
                    signal.name
                )));
            }

            let mask = signal.bit_mask();
            for (other, other_mask) in frame.signals[..idx].iter().zip(&masks) {
                if mask & other_mask != 0 && signal.coexists_with(other) {
                    return Err(PipelineError::InvalidSignalDefinition(format!(
                        "signals '{}' and '{}' overlap in frame {}",
                        other.name, signal.name, frame.name
                    )));
                }
            }
            masks.push(mask);
        }

        if let Some(switch) = &frame.multiplexer_signal {
            if frame.signal(switch).is_none() {
                return Err(PipelineError::InvalidSignalDefinition(format!(
                    "multiplexer '{}' is not a signal of frame {}",
                    switch, frame.name
                )));
            }
        }

        for (idx, signal) in frame.signals.iter().enumerate() {
            self.signal_lookup
                .insert(signal.name.clone(), (frame.id, idx));
        }
        self.frames.insert(frame.id, frame);
        Ok(())
    }

    /// Get the frame definition for a CAN ID
    pub fn frame(&self, can_id: u32) -> Option<&FrameDefinition> {
        self.frames.get(&can_id)
    }

    /// Find a frame definition by name
    pub fn frame_by_name(&self, name: &str) -> Option<&FrameDefinition> {
        self.frames.values().find(|f| f.name == name)
    }

    /// All frames, ordered by CAN ID
    pub fn frames(&self) -> impl Iterator<Item = &FrameDefinition> {
        self.frames.values()
    }

    /// Find the frame carrying a signal and the signal's descriptor
    pub fn find_signal(&self, signal_name: &str) -> Option<(u32, &SignalDescriptor)> {
        let (can_id, idx) = self.signal_lookup.get(signal_name)?;
        self.frames
            .get(can_id)
            .and_then(|frame| frame.signals.get(*idx))
            .map(|signal| (*can_id, signal))
    }

    /// True if any frame defines this signal
    pub fn contains_signal(&self, signal_name: &str) -> bool {
        self.signal_lookup.contains_key(signal_name)
    }

    /// All signal names in database order (by CAN ID, then layout order)
    pub fn signal_names(&self) -> Vec<String> {
        self.frames
            .values()
            .flat_map(|f| f.signals.iter().map(|s| s.name.clone()))
            .collect()
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_frames: self.frames.len(),
            num_signals: self.signal_lookup.len(),
            num_multiplexed: self.frames.values().filter(|f| f.is_multiplexed()).count(),
        }
    }

    /// True if no frames are defined
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Add every frame of another database (e.g. a second DBC file)
    ///
    /// Stops at the first frame that conflicts with what is already loaded;
    /// frames merged before the conflict stay.
    pub fn merge(&mut self, other: FrameDatabase) -> Result<()> {
        for frame in other.frames.into_values() {
            self.add_frame(frame)?;
        }
        Ok(())
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    /// Total number of frame definitions
    pub num_frames: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
    /// Number of multiplexed frames
    pub num_multiplexed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_frame() -> FrameDefinition {
        FrameDefinition::new(0x123, "EngineData", 8)
            .with_signal(
                SignalDescriptor::new("EngineSpeed", 0, 16)
                    .with_range(0.0, 8000.0)
                    .with_unit("rpm"),
            )
            .with_signal(SignalDescriptor::new("EngineTemp", 16, 8).with_scaling(1.0, -40.0))
    }

    #[test]
    fn test_empty_database() {
        let db = FrameDatabase::new();
        let stats = db.stats();
        assert_eq!(stats.num_frames, 0);
        assert_eq!(stats.num_signals, 0);
        assert!(db.is_empty());
    }

    #[test]
    fn test_add_frame() {
        let mut db = FrameDatabase::new();
        db.add_frame(engine_frame()).unwrap();

        let stats = db.stats();
        assert_eq!(stats.num_frames, 1);
        assert_eq!(stats.num_signals, 2);

        let frame = db.frame(0x123).unwrap();
        assert_eq!(frame.name, "EngineData");
        assert_eq!(frame.signals[0].name, "EngineSpeed");
        assert!(db.frame_by_name("EngineData").is_some());

        let (can_id, signal) = db.find_signal("EngineTemp").unwrap();
        assert_eq!(can_id, 0x123);
        assert_eq!(signal.offset, -40.0);
        assert_eq!(db.signal_names(), vec!["EngineSpeed", "EngineTemp"]);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut db = FrameDatabase::new();
        let frame = FrameDefinition::new(0x200, "Overlap", 8)
            .with_signal(SignalDescriptor::new("A", 0, 12))
            .with_signal(SignalDescriptor::new("B", 8, 8));
        let err = db.add_frame(frame).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSignalDefinition(_)));
        assert!(db.is_empty());
    }

    #[test]
    fn test_multiplexed_signals_may_share_bits() {
        let mut db = FrameDatabase::new();
        let frame = FrameDefinition::new(0x200, "Muxed", 8)
            .with_multiplexer("Mode")
            .with_signal(SignalDescriptor::new("Mode", 0, 8))
            .with_signal(SignalDescriptor::new("SignalA", 8, 16).multiplexed_by("Mode", vec![0]))
            .with_signal(SignalDescriptor::new("SignalB", 8, 16).multiplexed_by("Mode", vec![1]));
        db.add_frame(frame).unwrap();
        assert_eq!(db.stats().num_multiplexed, 1);

        let clash = FrameDefinition::new(0x201, "Clash", 8)
            .with_multiplexer("Sel")
            .with_signal(SignalDescriptor::new("Sel", 0, 8))
            .with_signal(SignalDescriptor::new("X", 8, 8).multiplexed_by("Sel", vec![1, 2]))
            .with_signal(SignalDescriptor::new("Y", 8, 8).multiplexed_by("Sel", vec![2]));
        assert!(db.add_frame(clash).is_err());
    }

    #[test]
    fn test_duplicate_signal_name_rejected() {
        let mut db = FrameDatabase::new();
        db.add_frame(engine_frame()).unwrap();
        let other = FrameDefinition::new(0x124, "Other", 8)
            .with_signal(SignalDescriptor::new("EngineSpeed", 0, 8));
        assert!(db.add_frame(other).is_err());
        assert!(db.frame(0x124).is_none());
    }

    #[test]
    fn test_signal_beyond_payload_rejected() {
        let mut db = FrameDatabase::new();
        let frame = FrameDefinition::new(0x300, "TooLong", 8)
            .with_signal(SignalDescriptor::new("Wide", 60, 8));
        assert!(db.add_frame(frame).is_err());
    }

    #[test]
    fn test_merge_databases() {
        let mut a = FrameDatabase::new();
        a.add_frame(FrameDefinition::new(0x100, "A", 8).with_signal(SignalDescriptor::new("S1", 0, 8)))
            .unwrap();
        let mut b = FrameDatabase::new();
        b.add_frame(FrameDefinition::new(0x200, "B", 8).with_signal(SignalDescriptor::new("S2", 0, 8)))
            .unwrap();
        a.merge(b).unwrap();
        assert_eq!(a.stats().num_frames, 2);
        assert_eq!(a.find_signal("S2").map(|(id, _)| id), Some(0x200));

        let mut clash = FrameDatabase::new();
        clash
            .add_frame(FrameDefinition::new(0x300, "C", 8).with_signal(SignalDescriptor::new("S1", 0, 8)))
            .unwrap();
        assert!(a.merge(clash).is_err());
    }

    #[test]
    fn test_motorola_bit_positions() {
        // 12-bit Motorola signal with MSB at bit 7: byte 0 fully, then top nibble of byte 1
        let signal = SignalDescriptor::new("M", 7, 12).with_byte_order(ByteOrder::BigEndian);
        let positions = signal.bit_positions();
        assert_eq!(positions.len(), 12);
        assert_eq!(*positions.last().unwrap(), 7);
        assert_eq!(positions[0], 12);
        assert_eq!(signal.required_bytes(), 2);
    }

    #[test]
    fn test_scaling_inverse() {
        let signal = SignalDescriptor::new("Voltage", 0, 16).with_scaling(0.01, 0.0);
        let physical = signal.physical_from_raw(1234);
        assert!((physical - 12.34).abs() < 1e-9);
        assert_eq!(signal.raw_from_physical(physical), 1234);
    }
}
