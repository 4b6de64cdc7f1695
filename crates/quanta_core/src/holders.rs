//! Path-keyed resource holders used by the I/O-bridging functions.
//!
//! A holder is opened the first time an expression evaluates with a given
//! key and reused afterwards. Handles are reference counted so several keys
//! can alias one underlying resource; the last handle to go away releases
//! it. Asking for a key with a different kind of holder than the one already
//! open is a model error.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use anyhow::{bail, Context};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::value::{parse_matrix, Matrix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderKind {
    Input,
    Output,
    Matrix,
    Canvas,
}

/// Numeric table read from a delimited text file. A first line containing
/// any non-numeric field is taken as the column header.
#[derive(Debug, Clone, Default)]
pub struct InputHolder {
    pub header: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl InputHolder {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("malformed input file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut holder = InputHolder::default();
        for (number, line) in text.lines().enumerate() {
            let fields: Vec<&str> = line
                .split(|c: char| c == ',' || c == '\t' || c == ' ')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if fields.is_empty() {
                continue;
            }
            let parsed: std::result::Result<Vec<f64>, _> =
                fields.iter().map(|f| f.parse::<f64>()).collect();
            match parsed {
                Ok(row) => holder.rows.push(row),
                Err(_) if holder.rows.is_empty() && holder.header.is_empty() => {
                    holder.header = fields.iter().map(|s| s.to_string()).collect();
                }
                Err(e) => bail!("line {}: {e}", number + 1),
            }
        }
        Ok(holder)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Last row whose first column is at or before `time`.
    pub fn row_at_time(&self, time: f64) -> Option<&[f64]> {
        self.rows
            .iter()
            .take_while(|row| row.first().map(|t| *t <= time).unwrap_or(false))
            .last()
            .map(Vec::as_slice)
    }
}

/// Column-oriented trace buffer, written out when flushed or when the last
/// handle is dropped.
#[derive(Debug)]
pub struct OutputHolder {
    path: PathBuf,
    columns: Vec<String>,
    rows: Vec<(f64, Vec<f64>)>,
    dirty: bool,
}

impl OutputHolder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            dirty: false,
        }
    }

    /// Records `value` under `column` for the row at `time`.
    pub fn trace(&mut self, time: f64, column: &str, value: f64) {
        let index = match self.columns.iter().position(|c| c == column) {
            Some(i) => i,
            None => {
                self.columns.push(column.to_string());
                self.columns.len() - 1
            }
        };
        let new_row = self.rows.last().map(|(t, _)| *t != time).unwrap_or(true);
        if new_row {
            self.rows.push((time, Vec::new()));
        }
        if let Some((_, row)) = self.rows.last_mut() {
            if row.len() <= index {
                row.resize(index + 1, f64::NAN);
            }
            row[index] = value;
        }
        self.dirty = true;
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[(f64, Vec<f64>)] {
        &self.rows
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let file = File::create(&self.path)
            .with_context(|| format!("failed to create output file {}", self.path.display()))?;
        let mut out = BufWriter::new(file);
        write!(out, "$t")?;
        for column in &self.columns {
            write!(out, "\t{column}")?;
        }
        writeln!(out)?;
        for (time, row) in &self.rows {
            write!(out, "{time}")?;
            for i in 0..self.columns.len() {
                match row.get(i) {
                    Some(v) if !v.is_nan() => write!(out, "\t{v}")?,
                    _ => write!(out, "\t")?,
                }
            }
            writeln!(out)?;
        }
        out.flush()?;
        self.dirty = false;
        debug!(path = %self.path.display(), rows = self.rows.len(), "flushed output");
        Ok(())
    }
}

impl Drop for OutputHolder {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("output holder lost data: {e:#}");
        }
    }
}

/// One recorded primitive of the drawing stub.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Disc {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub time: f64,
    pub discs: Vec<Disc>,
}

/// Drawing stub. Records primitives per frame instead of rasterizing them;
/// the rendering layer consumes the frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Canvas {
    pub width: usize,
    pub height: usize,
    /// Background color (packed RGB) applied when a frame starts.
    pub clear: u32,
    /// Keep the previous frame's primitives when a new frame starts.
    pub hold: bool,
    /// Coordinates are pixels rather than fractions of the canvas width.
    pub raw: bool,
    pub frames: Vec<Frame>,
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            clear: 0,
            hold: false,
            raw: false,
            frames: Vec::new(),
        }
    }
}

impl Canvas {
    pub fn draw_disc(&mut self, time: f64, mut disc: Disc) {
        if !self.raw {
            let scale = self.width as f64;
            disc.x *= scale;
            disc.y *= scale;
            disc.radius *= scale;
        }
        let new_frame = self.frames.last().map(|f| f.time != time).unwrap_or(true);
        if new_frame {
            let discs = match (self.hold, self.frames.last()) {
                (true, Some(previous)) => previous.discs.clone(),
                _ => Vec::new(),
            };
            self.frames.push(Frame { time, discs });
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.discs.push(disc);
        }
    }
}

#[derive(Debug, Clone)]
pub enum Holder {
    Input(Rc<InputHolder>),
    Output(Rc<RefCell<OutputHolder>>),
    Matrix(Rc<Matrix>),
    Canvas(Rc<RefCell<Canvas>>),
}

impl Holder {
    pub fn kind(&self) -> HolderKind {
        match self {
            Holder::Input(_) => HolderKind::Input,
            Holder::Output(_) => HolderKind::Output,
            Holder::Matrix(_) => HolderKind::Matrix,
            Holder::Canvas(_) => HolderKind::Canvas,
        }
    }

    fn strong_count(&self) -> usize {
        match self {
            Holder::Input(h) => Rc::strong_count(h),
            Holder::Output(h) => Rc::strong_count(h),
            Holder::Matrix(h) => Rc::strong_count(h),
            Holder::Canvas(h) => Rc::strong_count(h),
        }
    }
}

/// Per-instance cache of open holders.
#[derive(Debug, Default)]
pub struct Holders {
    by_key: HashMap<String, Holder>,
    matrix_files: HashMap<PathBuf, Weak<Matrix>>,
}

impl Holders {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(&self, key: &str, requested: HolderKind) -> Result<Option<&Holder>> {
        match self.by_key.get(key) {
            Some(holder) if holder.kind() != requested => Err(Error::ResourceConflict {
                key: key.to_string(),
                existing: holder.kind(),
                requested,
            }),
            other => Ok(other),
        }
    }

    pub fn input(&mut self, key: &str) -> Result<Rc<InputHolder>> {
        if let Some(Holder::Input(h)) = self.existing(key, HolderKind::Input)? {
            return Ok(Rc::clone(h));
        }
        let holder = Rc::new(InputHolder::open(Path::new(key))?);
        self.by_key
            .insert(key.to_string(), Holder::Input(Rc::clone(&holder)));
        Ok(holder)
    }

    pub fn output(&mut self, key: &str) -> Result<Rc<RefCell<OutputHolder>>> {
        if let Some(Holder::Output(h)) = self.existing(key, HolderKind::Output)? {
            return Ok(Rc::clone(h));
        }
        let holder = Rc::new(RefCell::new(OutputHolder::new(key)));
        self.by_key
            .insert(key.to_string(), Holder::Output(Rc::clone(&holder)));
        Ok(holder)
    }

    /// File-backed matrix. Keys naming the same file share one matrix.
    pub fn matrix(&mut self, key: &str) -> Result<Rc<Matrix>> {
        if let Some(Holder::Matrix(h)) = self.existing(key, HolderKind::Matrix)? {
            return Ok(Rc::clone(h));
        }
        let canonical = fs::canonicalize(key)?;
        let holder = match self.matrix_files.get(&canonical).and_then(Weak::upgrade) {
            Some(shared) => shared,
            None => {
                let text = fs::read_to_string(&canonical)?;
                let matrix = parse_matrix(&text)
                    .with_context(|| format!("malformed matrix file {key}"))?;
                let shared = Rc::new(matrix);
                self.matrix_files
                    .insert(canonical, Rc::downgrade(&shared));
                shared
            }
        };
        self.by_key
            .insert(key.to_string(), Holder::Matrix(Rc::clone(&holder)));
        Ok(holder)
    }

    pub fn canvas(&mut self, key: &str) -> Result<Rc<RefCell<Canvas>>> {
        if let Some(Holder::Canvas(h)) = self.existing(key, HolderKind::Canvas)? {
            return Ok(Rc::clone(h));
        }
        let holder = Rc::new(RefCell::new(Canvas::default()));
        self.by_key
            .insert(key.to_string(), Holder::Canvas(Rc::clone(&holder)));
        Ok(holder)
    }

    /// Registers `alias` as a second key for the holder open under `key`.
    pub fn alias(&mut self, alias: &str, key: &str) -> Result<()> {
        let holder = self
            .by_key
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Format(anyhow::anyhow!("no holder open under {key}")))?;
        if let Some(existing) = self.by_key.get(alias) {
            if existing.kind() != holder.kind() {
                return Err(Error::ResourceConflict {
                    key: alias.to_string(),
                    existing: existing.kind(),
                    requested: holder.kind(),
                });
            }
        }
        self.by_key.insert(alias.to_string(), holder);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Holder> {
        self.by_key.get(key)
    }

    /// Number of live handles on the resource behind `key`, this cache's
    /// own entries included.
    pub fn handle_count(&self, key: &str) -> usize {
        self.by_key.get(key).map(Holder::strong_count).unwrap_or(0)
    }

    /// Drops `key`. Returns true when that released the underlying resource.
    pub fn release(&mut self, key: &str) -> bool {
        match self.by_key.remove(key) {
            Some(holder) => holder.strong_count() == 1,
            None => false,
        }
    }

    /// Flushes every output holder.
    pub fn flush(&self) -> Result<()> {
        for holder in self.by_key.values() {
            if let Holder::Output(h) = holder {
                h.borrow_mut().flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn input_reads_header_and_rows() {
        let holder = InputHolder::parse("t, a, b\n0, 1, 2\n1, 3, 4\n2.5, 5, 6\n").expect("parse");
        assert_eq!(holder.column_index("b"), Some(2));
        assert_eq!(holder.row(1), Some(&[1.0, 3.0, 4.0][..]));
        assert_eq!(holder.row_at_time(2.0), Some(&[1.0, 3.0, 4.0][..]));
        assert_eq!(holder.row_at_time(-1.0), None);
        assert!(InputHolder::parse("1 2\nx y\n").is_err());
    }

    #[test]
    fn same_key_reuses_the_same_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("in.txt");
        fs::write(&path, "1 2\n3 4\n").expect("write");
        let key = path.to_string_lossy().to_string();

        let mut holders = Holders::new();
        let first = holders.input(&key).expect("open");
        let second = holders.input(&key).expect("reopen");
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn reopening_with_another_kind_conflicts() {
        let mut holders = Holders::new();
        holders.canvas("frames").expect("canvas");
        assert_err_contains(holders.output("frames"), "already open as Canvas");
    }

    #[test]
    fn matrix_files_are_shared_and_released_by_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("m.txt");
        fs::write(&path, "1 2\n3 4\n").expect("write");
        let key = path.to_string_lossy().to_string();
        let dotted = dir.path().join(".").join("m.txt").to_string_lossy().to_string();

        let mut holders = Holders::new();
        let a = holders.matrix(&key).expect("open");
        let b = holders.matrix(&dotted).expect("open alias path");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.get(1, 0), 3.0);
        drop(a);
        drop(b);

        assert_eq!(holders.handle_count(&key), 2);
        assert!(!holders.release(&key));
        assert!(holders.release(&dotted));
    }

    #[test]
    fn aliases_share_output_and_flush_on_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.tsv");
        let key = path.to_string_lossy().to_string();

        let mut holders = Holders::new();
        holders.output(&key).expect("open");
        holders.alias("series", &key).expect("alias");
        if let Some(Holder::Output(h)) = holders.get("series") {
            h.borrow_mut().trace(0.0, "x", 1.5);
            h.borrow_mut().trace(0.0, "y", 2.0);
            h.borrow_mut().trace(1.0, "x", 3.0);
        } else {
            panic!("alias should resolve to the output holder");
        }
        assert!(!holders.release(&key));
        assert!(!path.exists());
        assert!(holders.release("series"));

        let written = fs::read_to_string(&path).expect("flushed on release");
        assert_eq!(written, "$t\tx\ty\n0\t1.5\t2\n1\t3\t\n");
    }

    #[test]
    fn canvas_frames_honor_hold() {
        let mut canvas = Canvas {
            raw: true,
            hold: true,
            ..Canvas::default()
        };
        let disc = Disc {
            x: 1.0,
            y: 2.0,
            radius: 3.0,
        };
        canvas.draw_disc(0.0, disc);
        canvas.draw_disc(1.0, disc);
        assert_eq!(canvas.frames.len(), 2);
        assert_eq!(canvas.frames[1].discs.len(), 2);
    }
}
