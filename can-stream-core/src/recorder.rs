//! CSV recording of raw frames or decoded signals
//!
//! Raw files can be read back with `RawCsvReader`, which is how recorded
//! sessions are replayed. Timestamps are written as seconds with exactly nine
//! decimals so the nanosecond value survives the round trip.

use crate::ingest::FrameRecord;
use crate::signals::FrameDatabase;
use crate::types::{CanFrame, DecodedFrame, PipelineError, Result, MAX_DATA_LEN};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const RAW_HEADER: [&str; 7] = ["timestamp", "id", "id_hex", "dlc", "data_hex", "extended", "error"];
pub const DECODED_HEADER_PREFIX: [&str; 3] = ["timestamp", "frame_id", "frame_name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    #[default]
    Raw,
    Decoded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecorderStatus {
    pub is_recording: bool,
    pub path: Option<PathBuf>,
    pub rows: u64,
    pub mode: RecordingMode,
}

/// File name used when the caller does not supply one
pub fn default_file_name() -> String {
    chrono::Local::now()
        .format("can_recording_%Y%m%d_%H%M%S.csv")
        .to_string()
}

fn format_timestamp(timestamp_ns: u64) -> String {
    format!("{}.{:09}", timestamp_ns / 1_000_000_000, timestamp_ns % 1_000_000_000)
}

fn parse_timestamp(field: &str) -> Option<u64> {
    let (secs, frac) = field.split_once('.').unwrap_or((field, ""));
    let secs: u64 = secs.parse().ok()?;
    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos: u64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<9}", frac).parse().ok()?
    };
    secs.checked_mul(1_000_000_000)?.checked_add(nanos)
}

/// Quote a field if it would otherwise break the row
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Writes one CSV file per recording
#[derive(Debug, Default)]
pub struct CsvRecorder {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    mode: RecordingMode,
    columns: Vec<String>,
    column_index: HashMap<String, usize>,
    rows: u64,
}

impl CsvRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every signal in the database, in database order
    pub fn all_columns(database: &FrameDatabase) -> Vec<String> {
        database.signal_names()
    }

    /// Open a new file and write its header
    ///
    /// `columns` is only used in decoded mode, where it must not be empty.
    /// Returns the path of the file being written.
    pub fn start(
        &mut self,
        dir: &Path,
        filename: Option<&str>,
        mode: RecordingMode,
        columns: Vec<String>,
    ) -> Result<PathBuf> {
        if self.is_recording() {
            return Err(PipelineError::RecorderError(
                "recording already in progress".to_string(),
            ));
        }
        if mode == RecordingMode::Decoded && columns.is_empty() {
            return Err(PipelineError::RecorderError(
                "decoded recording needs at least one signal column".to_string(),
            ));
        }

        fs::create_dir_all(dir)?;
        let path = dir.join(filename.map_or_else(default_file_name, str::to_string));
        let mut writer = BufWriter::new(File::create(&path)?);

        let header: Vec<String> = match mode {
            RecordingMode::Raw => RAW_HEADER.iter().map(|s| s.to_string()).collect(),
            RecordingMode::Decoded => DECODED_HEADER_PREFIX
                .iter()
                .map(|s| s.to_string())
                .chain(columns.iter().map(|c| csv_field(c)))
                .collect(),
        };
        writeln!(writer, "{}", header.join(","))?;

        log::info!("Recording ({:?}) to {}", mode, path.display());
        self.column_index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        self.columns = columns;
        self.writer = Some(writer);
        self.path = Some(path.clone());
        self.mode = mode;
        self.rows = 0;
        Ok(path)
    }

    /// Flush and close; returns the number of rows written
    pub fn stop(&mut self) -> Result<u64> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            log::info!("Stopped recording, {} row(s)", self.rows);
        }
        Ok(self.rows)
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn status(&self) -> RecorderStatus {
        RecorderStatus {
            is_recording: self.is_recording(),
            path: self.path.clone(),
            rows: self.rows,
            mode: self.mode,
        }
    }

    /// Write whatever the current mode takes from a frame record
    pub fn record(&mut self, record: &FrameRecord) -> Result<()> {
        match (self.mode, &record.decoded) {
            (RecordingMode::Raw, _) => self.record_raw(&record.frame),
            (RecordingMode::Decoded, Some(decoded)) => self.record_decoded(decoded),
            (RecordingMode::Decoded, None) => Ok(()),
        }
    }

    /// Write one raw-frame row; ignored unless recording in raw mode
    pub fn record_raw(&mut self, frame: &CanFrame) -> Result<()> {
        if self.mode != RecordingMode::Raw {
            return Ok(());
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writeln!(
            writer,
            "{},{},0x{:X},{},{},{},{}",
            format_timestamp(frame.timestamp_ns),
            frame.can_id,
            frame.can_id,
            frame.dlc(),
            hex_encode(&frame.data),
            frame.is_extended,
            frame.is_error_frame
        )?;
        self.rows += 1;
        Ok(())
    }

    /// Write one decoded row; signals not in the frame leave empty cells
    pub fn record_decoded(&mut self, decoded: &DecodedFrame) -> Result<()> {
        if self.mode != RecordingMode::Decoded {
            return Ok(());
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        let mut cells = vec![String::new(); self.columns.len()];
        let mut any = false;
        for sample in &decoded.samples {
            if let Some(&i) = self.column_index.get(&sample.name) {
                cells[i] = sample.value.to_string();
                any = true;
            }
        }
        if !any {
            return Ok(());
        }

        writeln!(
            writer,
            "{},{},{},{}",
            format_timestamp(decoded.timestamp_ns),
            decoded.can_id,
            csv_field(decoded.frame_name.as_deref().unwrap_or("")),
            cells.join(",")
        )?;
        self.rows += 1;
        Ok(())
    }
}

impl Drop for CsvRecorder {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

/// Reads frames back from a raw-mode recording
pub struct RawCsvReader<R> {
    lines: std::io::Lines<R>,
    line_no: usize,
}

impl RawCsvReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PipelineError::RecorderError(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::new(BufReader::new(file))
    }
}

impl<R: BufRead> RawCsvReader<R> {
    /// Wrap a reader, checking the header line
    ///
    /// The header comparison ignores case and surrounding whitespace.
    pub fn new(reader: R) -> Result<Self> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .transpose()?
            .ok_or_else(|| PipelineError::RecorderError("empty recording".to_string()))?;
        let fields: Vec<String> = header.split(',').map(|f| f.trim().to_ascii_lowercase()).collect();
        // Older recordings name the payload column "data"
        let matches = fields.len() == RAW_HEADER.len()
            && fields
                .iter()
                .zip(RAW_HEADER)
                .all(|(f, h)| f == h || (h == "data_hex" && f == "data"));
        if !matches {
            return Err(PipelineError::RecorderError(format!(
                "not a raw recording, header is '{}'",
                header
            )));
        }
        Ok(Self { lines, line_no: 1 })
    }

    fn parse_line(&self, line: &str) -> Result<CanFrame> {
        let bad = |what: &str| {
            PipelineError::RecorderError(format!("line {}: {}", self.line_no, what))
        };
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != RAW_HEADER.len() {
            return Err(bad(&format!("expected {} fields, found {}", RAW_HEADER.len(), fields.len())));
        }

        let timestamp_ns = parse_timestamp(fields[0]).ok_or_else(|| bad("bad timestamp"))?;
        let can_id: u32 = fields[1].parse().map_err(|_| bad("bad id"))?;
        let dlc: usize = fields[3].parse().map_err(|_| bad("bad dlc"))?;
        if dlc > MAX_DATA_LEN {
            return Err(bad(&format!("dlc {} exceeds {} bytes", dlc, MAX_DATA_LEN)));
        }
        let data = hex_decode(fields[4]).ok_or_else(|| bad("bad data"))?;
        if data.len() != dlc {
            return Err(bad(&format!("dlc {} but {} data bytes", dlc, data.len())));
        }
        let flag = |field: &str| match field.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(bad("bad flag")),
        };

        Ok(CanFrame {
            timestamp_ns,
            can_id,
            data,
            is_extended: flag(fields[5])?,
            is_error_frame: flag(fields[6])?,
        })
    }
}

impl<R: BufRead> Iterator for RawCsvReader<R> {
    type Item = Result<CanFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.parse_line(&line));
        }
    }
}

/// Read a whole raw recording into memory
pub fn read_raw_csv(path: &Path) -> Result<Vec<CanFrame>> {
    RawCsvReader::open(path)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DecodedSample;
    use std::io::Cursor;

    fn sample(name: &str, value: f64) -> DecodedSample {
        DecodedSample {
            name: name.to_string(),
            value,
            raw_value: value as i64,
            timestamp_ns: 0,
            label: None,
            unit: None,
        }
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(1_500_000_001), "1.500000001");
        assert_eq!(parse_timestamp("1.500000001"), Some(1_500_000_001));
        assert_eq!(parse_timestamp("2.5"), Some(2_500_000_000));
        assert_eq!(parse_timestamp("3"), Some(3_000_000_000));
        assert_eq!(parse_timestamp("1.0000000001"), None);
        assert_eq!(parse_timestamp("x"), None);
    }

    #[test]
    fn test_raw_recording_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = CsvRecorder::new();
        let path = recorder
            .start(dir.path(), Some("raw.csv"), RecordingMode::Raw, Vec::new())
            .unwrap();

        let frames = vec![
            CanFrame::new(1_000_000_123, 0x123, vec![0xDE, 0xAD]),
            CanFrame::new(2_000_000_000, 0x18FF_0001, vec![]),
            CanFrame::error(3_000_000_000),
        ];
        for frame in &frames {
            recorder.record_raw(frame).unwrap();
        }
        assert_eq!(recorder.stop().unwrap(), 3);

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "timestamp,id,id_hex,dlc,data_hex,extended,error");
        assert_eq!(lines.next().unwrap(), "1.000000123,291,0x123,2,DEAD,false,false");

        assert_eq!(read_raw_csv(&path).unwrap(), frames);
    }

    #[test]
    fn test_decoded_recording_fixed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = CsvRecorder::new();
        let path = recorder
            .start(
                dir.path(),
                Some("decoded.csv"),
                RecordingMode::Decoded,
                vec!["Speed".into(), "Rpm".into()],
            )
            .unwrap();

        let decoded = DecodedFrame {
            timestamp_ns: 500_000_000,
            can_id: 0x100,
            frame_name: Some("Vehicle".into()),
            samples: vec![sample("Speed", 42.5), sample("Other", 1.0)],
            skipped: Vec::new(),
        };
        recorder.record_decoded(&decoded).unwrap();
        // Raw rows are ignored in decoded mode
        recorder.record_raw(&CanFrame::new(0, 1, vec![])).unwrap();
        assert_eq!(recorder.status().rows, 1);
        recorder.stop().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,frame_id,frame_name,Speed,Rpm");
        assert_eq!(lines[1], "0.500000000,256,Vehicle,42.5,");
    }

    #[test]
    fn test_start_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = CsvRecorder::new();
        assert!(recorder
            .start(dir.path(), None, RecordingMode::Decoded, Vec::new())
            .is_err());

        let path = recorder.start(dir.path(), None, RecordingMode::Raw, Vec::new()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("can_recording_") && name.ends_with(".csv"));
        assert!(recorder.start(dir.path(), Some("b.csv"), RecordingMode::Raw, Vec::new()).is_err());
        assert!(recorder.status().is_recording);
        recorder.stop().unwrap();
        assert!(!recorder.status().is_recording);
    }

    #[test]
    fn test_reader_accepts_legacy_header_and_rejects_garbage() {
        let legacy = "Timestamp,ID,ID_Hex,DLC,Data,Extended,Error\n0.5,256,0x100,1,FF,False,False\n\n";
        let frames: Vec<CanFrame> = RawCsvReader::new(Cursor::new(legacy))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(frames, vec![CanFrame::new(500_000_000, 0x100, vec![0xFF])]);

        assert!(RawCsvReader::new(Cursor::new("a,b\n")).is_err());
        assert!(RawCsvReader::new(Cursor::new("")).is_err());

        let bad_dlc = "timestamp,id,id_hex,dlc,data_hex,extended,error\n0.1,1,0x1,3,FF,false,false\n";
        let mut reader = RawCsvReader::new(Cursor::new(bad_dlc)).unwrap();
        assert!(matches!(reader.next(), Some(Err(PipelineError::RecorderError(_)))));
    }

    #[test]
    fn test_reader_rejects_payload_over_eight_bytes() {
        let rows = "timestamp,id,id_hex,dlc,data_hex,extended,error\n\
                    0.1,1,0x1,12,000102030405060708090A0B,false,false\n\
                    0.2,1,0x1,8,0001020304050607,false,false\n";
        let mut reader = RawCsvReader::new(Cursor::new(rows)).unwrap();
        match reader.next() {
            Some(Err(PipelineError::RecorderError(msg))) => assert!(msg.contains("exceeds"), "{}", msg),
            other => panic!("expected a recorder error, got {:?}", other),
        }
        let frame = reader.next().unwrap().unwrap();
        assert_eq!(frame.dlc(), 8);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
