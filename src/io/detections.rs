//! JSON-lines detector feed
//!
//! One object per line, produced by the upstream detector/tracker:
//!
//! ```json
//! {"ts": 1718000000.25, "image": "frames/000123.jpg",
//!  "detections": [{"cls": "pipe", "conf": 0.91, "track_id": 7, "bbox": [410, 220, 530, 300]}]}
//! ```
//!
//! `ts` defaults to the read time and `image` is optional. A malformed line
//! is a lost frame, not a fatal error: it is logged and skipped.

use crate::domain::types::{now_ts, Frame, TrackDet};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionFrame {
    #[serde(default)]
    pub ts: Option<f64>,
    #[serde(default)]
    pub image: Option<PathBuf>,
    #[serde(default)]
    pub detections: Vec<TrackDet>,
}

impl DetectionFrame {
    /// Decode the referenced image, if any. A missing or unreadable file yields `None`.
    pub fn load_image(&self) -> Option<Frame> {
        let path = self.image.as_ref()?;
        match image::open(path) {
            Ok(img) => Some(img.to_rgb8()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "frame_image_unreadable");
                None
            }
        }
    }
}

/// Line-oriented reader over any buffered source
pub struct DetectionSource<R> {
    reader: R,
    line: String,
    line_no: u64,
    skipped: u64,
}

impl DetectionSource<Box<dyn BufRead + Send>> {
    /// Open a file, or stdin for "-"
    pub fn open(path: &str) -> Result<Self> {
        let reader: Box<dyn BufRead + Send> = if path == "-" {
            Box::new(BufReader::new(io::stdin()))
        } else {
            let file = File::open(path)
                .with_context(|| format!("Failed to open detections file {path}"))?;
            Box::new(BufReader::new(file))
        };
        Ok(Self::new(reader))
    }
}

impl<R: BufRead> DetectionSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: String::new(), line_no: 0, skipped: 0 }
    }

    /// Lines rejected so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next well-formed frame, with `ts` filled in. `None` at end of input.
    pub fn next_frame(&mut self) -> Option<DetectionFrame> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                // read_line has already consumed the offending bytes
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    self.line_no += 1;
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %e, "detections_bad_line");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "detections_read_failed");
                    return None;
                }
            }
            self.line_no += 1;

            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<DetectionFrame>(text) {
                Ok(mut frame) => {
                    if frame.ts.is_none() {
                        frame.ts = Some(now_ts());
                    }
                    debug!(line = self.line_no, dets = frame.detections.len(), "detections_frame");
                    return Some(frame);
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %e, "detections_bad_line");
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for DetectionSource<R> {
    type Item = DetectionFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BBox, TrackId};
    use std::io::Cursor;

    #[test]
    fn test_reads_frames_and_skips_garbage() {
        let input = r#"{"ts": 10.0, "detections": [{"cls":"pipe","conf":0.9,"track_id":3,"bbox":[0,0,10,10]}]}

not json
{"ts": 10.1, "detections": []}
{"detections": [{"cls":"gate1","conf":0.7,"bbox":[1,2,3,4]}]}
"#;
        let mut src = DetectionSource::new(Cursor::new(input));

        let f1 = src.next_frame().unwrap();
        assert_eq!(f1.ts, Some(10.0));
        assert_eq!(f1.detections[0].track_id, Some(TrackId(3)));
        assert_eq!(f1.detections[0].bbox, BBox::new(0.0, 0.0, 10.0, 10.0));

        let f2 = src.next_frame().unwrap();
        assert_eq!(f2.ts, Some(10.1));
        assert!(f2.detections.is_empty());

        let f3 = src.next_frame().unwrap();
        assert!(f3.ts.is_some());
        assert_eq!(f3.detections[0].track_id, None);

        assert!(src.next_frame().is_none());
        assert_eq!(src.skipped(), 1);
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let mut input = b"{\"ts\": 1.0}\n".to_vec();
        input.extend_from_slice(b"\xff\xfe garbage\n");
        input.extend_from_slice(b"{\"ts\": 2.0}\n{\"ts\": 3.0}\n");

        let mut src = DetectionSource::new(Cursor::new(input));
        let stamps: Vec<_> = src.by_ref().map(|f| f.ts).collect();

        assert_eq!(stamps, vec![Some(1.0), Some(2.0), Some(3.0)]);
        assert_eq!(src.skipped(), 1);
    }

    #[test]
    fn test_missing_image_is_not_fatal() {
        let frame = DetectionFrame {
            ts: Some(1.0),
            image: Some(PathBuf::from("/nonexistent/frame.jpg")),
            detections: vec![],
        };
        assert!(frame.load_image().is_none());

        let no_image = DetectionFrame { ts: Some(1.0), image: None, detections: vec![] };
        assert!(no_image.load_image().is_none());
    }

    #[test]
    fn test_loads_png_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.png");
        Frame::from_pixel(12, 8, image::Rgb([1, 2, 3])).save(&path).unwrap();

        let frame = DetectionFrame { ts: None, image: Some(path), detections: vec![] };
        let img = frame.load_image().unwrap();
        assert_eq!(img.dimensions(), (12, 8));
    }
}
