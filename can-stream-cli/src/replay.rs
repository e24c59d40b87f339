//! Replay of raw CSV recordings as a hardware source

use can_stream_core::{CanFrame, HardwareSource, PipelineError, RawCsvReader, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Streams frames from a raw recording, optionally paced by their timestamps
pub struct ReplaySource<R> {
    reader: RawCsvReader<R>,
    name: String,
    realtime: bool,
    pending: Option<CanFrame>,
    /// Wall-clock instant and frame timestamp of the first replayed frame
    origin: Option<(Instant, u64)>,
    replayed: u64,
}

impl ReplaySource<BufReader<File>> {
    pub fn open(path: &Path, realtime: bool) -> Result<Self> {
        let reader = RawCsvReader::open(path)?;
        Ok(Self::new(reader, path.display().to_string(), realtime))
    }
}

impl<R: BufRead> ReplaySource<R> {
    pub fn new(reader: RawCsvReader<R>, name: String, realtime: bool) -> Self {
        Self {
            reader,
            name,
            realtime,
            pending: None,
            origin: None,
            replayed: 0,
        }
    }

    fn next_frame(&mut self) -> Option<Result<CanFrame>> {
        if let Some(frame) = self.pending.take() {
            return Some(Ok(frame));
        }
        self.reader.next()
    }

    /// Hold a frame back until its time offset has elapsed, at most `timeout`
    fn pace(&mut self, frame: CanFrame, timeout: Duration) -> Result<CanFrame> {
        let (start, first_ts) = *self
            .origin
            .get_or_insert_with(|| (Instant::now(), frame.timestamp_ns));
        let offset = Duration::from_nanos(frame.timestamp_ns.saturating_sub(first_ts));
        let due = start + offset;
        let now = Instant::now();

        if due > now + timeout {
            thread::sleep(timeout);
            self.pending = Some(frame);
            return Err(PipelineError::HardwareReadTimeout);
        }
        if due > now {
            thread::sleep(due - now);
        }
        Ok(frame)
    }
}

impl<R: BufRead + Send> HardwareSource for ReplaySource<R> {
    fn read(&mut self, timeout: Duration) -> Result<CanFrame> {
        let frame = match self.next_frame() {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(PipelineError::HardwareDisconnected(format!(
                    "end of replay after {} frame(s)",
                    self.replayed
                )))
            }
        };
        let frame = if self.realtime {
            self.pace(frame, timeout)?
        } else {
            frame
        };
        self.replayed += 1;
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("replay of {}", self.name)
    }
}

/// Resolve the replay file, preferring the command line over the config file
pub fn replay_path(cli: Option<&PathBuf>, config: Option<&PathBuf>) -> Option<PathBuf> {
    cli.or(config).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const RECORDING: &str = "timestamp,id,id_hex,dlc,data_hex,extended,error
0.000000000,256,0x100,2,0102,false,false
0.020000000,512,0x200,1,FF,false,false
0.040000000,256,0x100,2,0304,false,false
";

    fn source(text: &str, realtime: bool) -> ReplaySource<Cursor<Vec<u8>>> {
        let reader = RawCsvReader::new(Cursor::new(text.as_bytes().to_vec())).unwrap();
        ReplaySource::new(reader, "test".to_string(), realtime)
    }

    #[test]
    fn test_replays_then_disconnects() {
        let mut replay = source(RECORDING, false);
        let timeout = Duration::from_millis(10);
        let ids: Vec<u32> = (0..3).map(|_| replay.read(timeout).unwrap().can_id).collect();
        assert_eq!(ids, vec![0x100, 0x200, 0x100]);
        match replay.read(timeout) {
            Err(PipelineError::HardwareDisconnected(reason)) => assert!(reason.contains("3 frame")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_realtime_pacing_keeps_pending_frame() {
        let mut replay = source(RECORDING, true);
        let started = Instant::now();
        assert_eq!(replay.read(Duration::from_millis(100)).unwrap().can_id, 0x100);

        // The second frame is due 20 ms later, beyond a 1 ms timeout
        assert!(matches!(
            replay.read(Duration::from_millis(1)),
            Err(PipelineError::HardwareReadTimeout)
        ));
        assert_eq!(replay.read(Duration::from_millis(100)).unwrap().can_id, 0x200);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_bad_line_is_recoverable() {
        let text = "timestamp,id,id_hex,dlc,data_hex,extended,error\nnot,a,valid,row,at,all,!\n0.1,1,0x1,0,,false,false\n";
        let mut replay = source(text, false);
        let err = replay.read(Duration::from_millis(1)).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(replay.read(Duration::from_millis(1)).unwrap().can_id, 1);
    }

    #[test]
    fn test_replay_path_precedence() {
        let cli = PathBuf::from("cli.csv");
        let cfg = PathBuf::from("cfg.csv");
        assert_eq!(replay_path(Some(&cli), Some(&cfg)), Some(cli.clone()));
        assert_eq!(replay_path(None, Some(&cfg)), Some(cfg));
        assert_eq!(replay_path(None, None), None);
    }
}
