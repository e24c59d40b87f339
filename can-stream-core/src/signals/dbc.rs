//! DBC file adapter
//!
//! Parses Vector DBC files and converts them into a validated [`FrameDatabase`].

use crate::signals::database::{
    ByteOrder, FrameDatabase, FrameDefinition, MultiplexerInfo, SignalDescriptor, ValueType,
};
use crate::types::{PipelineError, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// DBC files flag 29-bit identifiers with bit 31
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file into a frame database
pub fn load_dbc_file(path: &Path) -> Result<FrameDatabase> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        PipelineError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Fall back to Latin-1 for files exported by Windows tools
    let content = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let db = parse_dbc_str(&content)?;
    let stats = db.stats();
    log::info!(
        "Loaded {} frames / {} signals from {:?}",
        stats.num_frames,
        stats.num_signals,
        path
    );
    Ok(db)
}

/// Parse DBC text into a frame database
///
/// Signal names that repeat across frames are qualified as `Frame.Signal` so
/// the database keeps unique names.
pub fn parse_dbc_str(content: &str) -> Result<FrameDatabase> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| PipelineError::DbcParseError(format!("{:?}", e)))?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut duplicates: HashSet<String> = HashSet::new();
    for message in dbc.messages() {
        for signal in message.signals() {
            if !seen.insert(signal.name().to_string()) {
                duplicates.insert(signal.name().to_string());
            }
        }
    }

    let mut db = FrameDatabase::new();
    for message in dbc.messages() {
        let frame = convert_message(&dbc, message, &duplicates)?;
        db.add_frame(frame)?;
    }
    Ok(db)
}

/// Convert a can-dbc message to our FrameDefinition
fn convert_message(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
    duplicates: &HashSet<String>,
) -> Result<FrameDefinition> {
    let raw_id = dbc_msg.message_id().0;
    let frame_name = dbc_msg.message_name().to_string();

    let qualify = |name: &str| -> String {
        if duplicates.contains(name) {
            log::warn!(
                "Signal '{}' appears in several frames, using '{}.{}'",
                name,
                frame_name,
                name
            );
            format!("{}.{}", frame_name, name)
        } else {
            name.to_string()
        }
    };

    // First pass: identify multiplexer signal
    let multiplexer_signal = dbc_msg
        .signals()
        .iter()
        .find(|s| {
            matches!(
                s.multiplexer_indicator(),
                can_dbc::MultiplexIndicator::Multiplexor
                    | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(_)
            )
        })
        .map(|s| qualify(s.name()));

    // Second pass: convert all signals
    let mut signals = Vec::with_capacity(dbc_msg.signals().len());
    for dbc_sig in dbc_msg.signals() {
        let labels = dbc
            .value_descriptions_for_signal(can_dbc::MessageId(raw_id), dbc_sig.name())
            .map(|descriptions| {
                descriptions
                    .iter()
                    .map(|d| (*d.a() as i64, d.b().to_string()))
                    .collect::<HashMap<i64, String>>()
            });
        signals.push(convert_signal(
            dbc_sig,
            qualify(dbc_sig.name()),
            multiplexer_signal.as_deref(),
            labels,
        )?);
    }

    Ok(FrameDefinition {
        id: raw_id & !EXTENDED_ID_FLAG,
        name: frame_name.clone(),
        size: *dbc_msg.message_size() as usize,
        is_extended: raw_id & EXTENDED_ID_FLAG != 0,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        multiplexer_signal,
    })
}

/// Convert a can-dbc signal to our SignalDescriptor
fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    name: String,
    multiplexer_signal: Option<&str>,
    value_table: Option<HashMap<i64, String>>,
) -> Result<SignalDescriptor> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let multiplexer = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value)
        | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(switch_value) => {
            Some(MultiplexerInfo {
                multiplexer_signal: multiplexer_signal
                    .ok_or_else(|| {
                        PipelineError::InvalidSignalDefinition(format!(
                            "Multiplexed signal '{}' but no multiplexer found",
                            dbc_sig.name()
                        ))
                    })?
                    .to_string(),
                multiplexer_values: vec![switch_value],
            })
        }
        _ => None,
    };

    Ok(SignalDescriptor {
        name,
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table,
        multiplexer,
    })
}
