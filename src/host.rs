//! Host collaborators: the interfaces the interpreter core talks to for
//! file I/O, the clock, the screen, the keyboard, the external editor and
//! OS commands. The core never reaches the outside world except through
//! these traits; `StdHost` is the standard-library-backed implementation
//! and `TestHost` a scripted one for the test suite.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::time::Instant;

use chrono::Local;
use log::debug;

use crate::errors::{BResult, BasicError, ErrorKind, raise};

pub const MAX_HANDLES: usize = 64;

/// Byte-stream file access, including the `ip0:host:port` network form.
pub trait FileIo {
    fn open_in(&mut self, name: &str) -> BResult<i32>;
    fn open_out(&mut self, name: &str) -> BResult<i32>;
    fn open_up(&mut self, name: &str) -> BResult<i32>;
    fn read_byte(&mut self, handle: i32) -> BResult<i32>;
    fn write_byte(&mut self, handle: i32, byte: u8) -> BResult<()>;
    fn read_line(&mut self, handle: i32) -> BResult<Option<Vec<u8>>>;
    fn set_ptr(&mut self, handle: i32, ptr: i64) -> BResult<()>;
    fn get_ptr(&mut self, handle: i32) -> BResult<i64>;
    fn set_ext(&mut self, handle: i32, newsize: i64) -> BResult<()>;
    fn get_ext(&mut self, handle: i32) -> BResult<i64>;
    fn at_eof(&mut self, handle: i32) -> BResult<bool>;
    fn close(&mut self, handle: i32) -> BResult<()>;
}

pub trait Clock {
    /// Centiseconds since interpreter start (or an epoch of its choosing).
    fn read_time(&mut self) -> i64;
    fn write_time(&mut self, t: i64);
    fn read_time_string(&mut self) -> String;
    fn write_time_string(&mut self, s: &str) -> BResult<()>;
}

pub trait Screen {
    fn print_text(&mut self, s: &str);
    fn refresh_mode7(&mut self, row: usize);
}

/// Outcome of an interactive line read.
pub enum LineRead {
    Line(String),
    Escape,
    Eof,
}

pub trait Keyboard {
    fn get_key(&mut self) -> BResult<i32>;
    fn poll_escape(&mut self) -> bool;
    fn clear_escape(&mut self);
    /// Read a line with `prefill` already in the buffer.
    fn read_line_edit(&mut self, prompt: &str, prefill: &str) -> BResult<LineRead>;
}

pub trait Editor {
    fn spawn_editor(&mut self, command: &str, tempfile: &str) -> BResult<i32>;
}

pub trait OsCli {
    fn oscli(&mut self, command: &str) -> BResult<()>;
}

/// The collaborator bundle handed to the interpreter.
pub struct Host {
    pub files: Box<dyn FileIo>,
    pub clock: Box<dyn Clock>,
    pub screen: Box<dyn Screen>,
    pub keyboard: Box<dyn Keyboard>,
    pub editor: Box<dyn Editor>,
    pub oscli: Box<dyn OsCli>,
}

impl Host {
    pub fn std() -> Host {
        let escape = Rc::new(RefCell::new(false));
        Host {
            files: Box::new(StdFileIo::new()),
            clock: Box::new(StdClock::new()),
            screen: Box::new(StdScreen),
            keyboard: Box::new(StdKeyboard { escape }),
            editor: Box::new(StdEditor),
            oscli: Box::new(StdOsCli),
        }
    }
}

enum Stream {
    File(std::fs::File),
    Net(TcpStream),
}

impl Stream {
    fn as_read(&mut self) -> &mut dyn Read {
        match self {
            Stream::File(f) => f,
            Stream::Net(s) => s,
        }
    }

    fn as_write(&mut self) -> &mut dyn Write {
        match self {
            Stream::File(f) => f,
            Stream::Net(s) => s,
        }
    }
}

pub struct StdFileIo {
    handles: HashMap<i32, Stream>,
    next: i32,
}

impl StdFileIo {
    pub fn new() -> Self {
        StdFileIo { handles: HashMap::new(), next: 1 }
    }

    fn insert(&mut self, stream: Stream) -> BResult<i32> {
        if self.handles.len() >= MAX_HANDLES {
            return raise(ErrorKind::MaxHandle);
        }
        let h = self.next;
        self.next += 1;
        self.handles.insert(h, stream);
        Ok(h)
    }

    fn stream(&mut self, handle: i32) -> BResult<&mut Stream> {
        self.handles
            .get_mut(&handle)
            .ok_or_else(|| BasicError::with_val(ErrorKind::BadHandle, handle as i64))
    }

    fn file(&mut self, handle: i32) -> BResult<&mut std::fs::File> {
        match self.stream(handle)? {
            Stream::File(f) => Ok(f),
            Stream::Net(_) => raise(ErrorKind::UnsupState),
        }
    }

    fn open_net(name: &str) -> Option<BResult<Stream>> {
        let rest = name
            .strip_prefix("ip0:")
            .or_else(|| name.strip_prefix("ip4:"))
            .or_else(|| name.strip_prefix("ip:"))?;
        Some(
            TcpStream::connect(rest)
                .map(Stream::Net)
                .map_err(|_| BasicError::with_text(ErrorKind::NetConnect, rest)),
        )
    }
}

impl Default for StdFileIo {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIo for StdFileIo {
    fn open_in(&mut self, name: &str) -> BResult<i32> {
        if let Some(net) = Self::open_net(name) {
            let stream = net?;
            return self.insert(stream);
        }
        let f = std::fs::File::open(name)
            .map_err(|_| BasicError::with_text(ErrorKind::OpenIn, name))?;
        self.insert(Stream::File(f))
    }

    fn open_out(&mut self, name: &str) -> BResult<i32> {
        if let Some(net) = Self::open_net(name) {
            let stream = net?;
            return self.insert(stream);
        }
        let f = std::fs::File::create(name)
            .map_err(|_| BasicError::with_text(ErrorKind::NotCreated, name))?;
        self.insert(Stream::File(f))
    }

    fn open_up(&mut self, name: &str) -> BResult<i32> {
        if let Some(net) = Self::open_net(name) {
            let stream = net?;
            return self.insert(stream);
        }
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(name)
            .map_err(|_| BasicError::with_text(ErrorKind::OpenIn, name))?;
        self.insert(Stream::File(f))
    }

    fn read_byte(&mut self, handle: i32) -> BResult<i32> {
        let stream = self.stream(handle)?;
        let mut buf = [0u8; 1];
        match stream.as_read().read(&mut buf) {
            Ok(0) => raise(ErrorKind::HitEof),
            Ok(_) => Ok(buf[0] as i32),
            Err(_) => raise(ErrorKind::ReadFail),
        }
    }

    fn write_byte(&mut self, handle: i32, byte: u8) -> BResult<()> {
        let stream = self.stream(handle)?;
        stream
            .as_write()
            .write_all(&[byte])
            .map_err(|_| BasicError::new(ErrorKind::WriteFail))
    }

    fn read_line(&mut self, handle: i32) -> BResult<Option<Vec<u8>>> {
        let stream = self.stream(handle)?;
        let mut line = Vec::new();
        let mut buf = [0u8; 1];
        loop {
            match stream.as_read().read(&mut buf) {
                Ok(0) => {
                    if line.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(line));
                }
                Ok(_) => {
                    if buf[0] == b'\n' {
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                        return Ok(Some(line));
                    }
                    line.push(buf[0]);
                }
                Err(_) => return raise(ErrorKind::ReadFail),
            }
        }
    }

    fn set_ptr(&mut self, handle: i32, ptr: i64) -> BResult<()> {
        let f = self.file(handle)?;
        f.seek(SeekFrom::Start(ptr.max(0) as u64))
            .map(|_| ())
            .map_err(|_| BasicError::new(ErrorKind::FileIo))
    }

    fn get_ptr(&mut self, handle: i32) -> BResult<i64> {
        let f = self.file(handle)?;
        f.stream_position()
            .map(|p| p as i64)
            .map_err(|_| BasicError::new(ErrorKind::FileIo))
    }

    fn set_ext(&mut self, handle: i32, newsize: i64) -> BResult<()> {
        let f = self.file(handle)?;
        f.set_len(newsize.max(0) as u64)
            .map_err(|_| BasicError::new(ErrorKind::FileIo))
    }

    fn get_ext(&mut self, handle: i32) -> BResult<i64> {
        let f = self.file(handle)?;
        f.metadata()
            .map(|m| m.len() as i64)
            .map_err(|_| BasicError::new(ErrorKind::FileIo))
    }

    fn at_eof(&mut self, handle: i32) -> BResult<bool> {
        let f = self.file(handle)?;
        let pos = f.stream_position().map_err(|_| BasicError::new(ErrorKind::FileIo))?;
        let len = f.metadata().map_err(|_| BasicError::new(ErrorKind::FileIo))?.len();
        Ok(pos >= len)
    }

    fn close(&mut self, handle: i32) -> BResult<()> {
        if handle == 0 {
            self.handles.clear();
            return Ok(());
        }
        self.handles
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| BasicError::with_val(ErrorKind::BadHandle, handle as i64))
    }
}

pub struct StdClock {
    started: Instant,
    offset: i64,
}

impl StdClock {
    pub fn new() -> Self {
        StdClock { started: Instant::now(), offset: 0 }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn read_time(&mut self) -> i64 {
        self.started.elapsed().as_millis() as i64 / 10 + self.offset
    }

    fn write_time(&mut self, t: i64) {
        self.offset = t - self.started.elapsed().as_millis() as i64 / 10;
    }

    fn read_time_string(&mut self) -> String {
        // The dialect's format: Day,DD Mon YYYY.HH:MM:SS
        Local::now().format("%a,%d %b %Y.%H:%M:%S").to_string()
    }

    fn write_time_string(&mut self, _s: &str) -> BResult<()> {
        // Setting the host clock is not permitted here.
        raise(ErrorKind::Unsupported)
    }
}

pub struct StdScreen;

impl Screen for StdScreen {
    fn print_text(&mut self, s: &str) {
        print!("{s}");
        let _ = std::io::stdout().flush();
    }

    fn refresh_mode7(&mut self, row: usize) {
        debug!("mode7 row {row} dirty");
    }
}

/// The Escape key itself.
const ESC: u8 = 0x1B;

/// The key poller that feeds the Escape flag: any ESC byte arriving
/// through the keyboard raises it, and the interpreter samples the flag
/// between statements.
pub fn contains_escape(bytes: &[u8]) -> bool {
    bytes.contains(&ESC)
}

pub struct StdKeyboard {
    escape: Rc<RefCell<bool>>,
}

impl Keyboard for StdKeyboard {
    fn get_key(&mut self) -> BResult<i32> {
        let mut buf = [0u8; 1];
        match std::io::stdin().read(&mut buf) {
            Ok(0) => Ok(-1),
            Ok(_) => {
                if buf[0] == ESC {
                    *self.escape.borrow_mut() = true;
                }
                Ok(buf[0] as i32)
            }
            Err(_) => raise(ErrorKind::ReadFail),
        }
    }

    fn poll_escape(&mut self) -> bool {
        *self.escape.borrow()
    }

    fn clear_escape(&mut self) {
        *self.escape.borrow_mut() = false;
    }

    fn read_line_edit(&mut self, prompt: &str, prefill: &str) -> BResult<LineRead> {
        print!("{prompt}{prefill}");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => Ok(LineRead::Eof),
            Ok(_) => {
                if contains_escape(line.as_bytes()) {
                    *self.escape.borrow_mut() = true;
                    return Ok(LineRead::Escape);
                }
                let trimmed = line.trim_end_matches(['\n', '\r']);
                Ok(LineRead::Line(format!("{prefill}{trimmed}")))
            }
            Err(_) => raise(ErrorKind::ReadFail),
        }
    }
}

pub struct StdEditor;

impl Editor for StdEditor {
    fn spawn_editor(&mut self, command: &str, tempfile: &str) -> BResult<i32> {
        let status = std::process::Command::new(command)
            .arg(tempfile)
            .status()
            .map_err(|_| BasicError::with_text(ErrorKind::EditFail, command))?;
        Ok(status.code().unwrap_or(-1))
    }
}

pub struct StdOsCli;

impl OsCli for StdOsCli {
    fn oscli(&mut self, command: &str) -> BResult<()> {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .map_err(|_| BasicError::with_text(ErrorKind::OscliFail, command))?;
        if !status.success() {
            return Err(BasicError::with_text(ErrorKind::OscliFail, command));
        }
        Ok(())
    }
}

/// Scripted host for tests: captures screen output and feeds prepared
/// keyboard lines. The escape flag is raised by scripting `<ESC>`.
pub struct TestHost {
    pub host: Host,
    pub output: Rc<RefCell<String>>,
    pub escape: Rc<RefCell<bool>>,
    pub mode7_rows: Rc<RefCell<Vec<usize>>>,
    pub keys: Rc<RefCell<Vec<i32>>>,
    pub time: Rc<RefCell<i64>>,
}

impl TestHost {
    pub fn full(input: Vec<&str>) -> TestHost {
        let output = Rc::new(RefCell::new(String::new()));
        let mode7_rows = Rc::new(RefCell::new(Vec::new()));
        let escape = Rc::new(RefCell::new(false));
        let keys = Rc::new(RefCell::new(Vec::new()));
        let time = Rc::new(RefCell::new(0));
        let input = Rc::new(RefCell::new(
            input.into_iter().rev().map(String::from).collect::<Vec<_>>(),
        ));
        let host = Host {
            files: Box::new(StdFileIo::new()),
            clock: Box::new(TestClock { time: Rc::clone(&time) }),
            screen: Box::new(TestScreen {
                output: Rc::clone(&output),
                mode7_rows: Rc::clone(&mode7_rows),
            }),
            keyboard: Box::new(TestKeyboard {
                input: Rc::clone(&input),
                escape: Rc::clone(&escape),
                keys: Rc::clone(&keys),
            }),
            editor: Box::new(StdEditor),
            oscli: Box::new(StdOsCli),
        };
        TestHost { host, output, escape, mode7_rows, keys, time }
    }

    #[allow(clippy::type_complexity)]
    pub fn new(input: Vec<&str>) -> (Host, Rc<RefCell<String>>, Rc<RefCell<bool>>) {
        let parts = TestHost::full(input);
        (parts.host, parts.output, parts.escape)
    }
}

struct TestClock {
    time: Rc<RefCell<i64>>,
}

impl Clock for TestClock {
    fn read_time(&mut self) -> i64 {
        *self.time.borrow()
    }

    fn write_time(&mut self, t: i64) {
        *self.time.borrow_mut() = t;
    }

    fn read_time_string(&mut self) -> String {
        "Tue,01 Jan 2030.00:00:00".to_string()
    }

    fn write_time_string(&mut self, _s: &str) -> BResult<()> {
        Ok(())
    }
}

struct TestScreen {
    output: Rc<RefCell<String>>,
    mode7_rows: Rc<RefCell<Vec<usize>>>,
}

impl Screen for TestScreen {
    fn print_text(&mut self, s: &str) {
        self.output.borrow_mut().push_str(s);
    }

    fn refresh_mode7(&mut self, row: usize) {
        self.mode7_rows.borrow_mut().push(row);
    }
}

struct TestKeyboard {
    input: Rc<RefCell<Vec<String>>>,
    escape: Rc<RefCell<bool>>,
    keys: Rc<RefCell<Vec<i32>>>,
}

impl Keyboard for TestKeyboard {
    fn get_key(&mut self) -> BResult<i32> {
        Ok(self.keys.borrow_mut().pop().unwrap_or(-1))
    }

    fn poll_escape(&mut self) -> bool {
        *self.escape.borrow()
    }

    fn clear_escape(&mut self) {
        *self.escape.borrow_mut() = false;
    }

    fn read_line_edit(&mut self, _prompt: &str, prefill: &str) -> BResult<LineRead> {
        match self.input.borrow_mut().pop() {
            Some(line) if line == "<ESC>" => {
                *self.escape.borrow_mut() = true;
                Ok(LineRead::Escape)
            }
            Some(line) => Ok(LineRead::Line(format!("{prefill}{line}"))),
            None => Ok(LineRead::Eof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_captures_output_and_feeds_lines() -> Result<(), Box<dyn std::error::Error>> {
        let (mut host, output, _) = TestHost::new(vec!["first", "<ESC>"]);
        host.screen.print_text("hello");
        assert_eq!(&*output.borrow(), "hello");
        match host.keyboard.read_line_edit("> ", "")? {
            LineRead::Line(l) => assert_eq!(l, "first"),
            _ => panic!("expected a line"),
        }
        assert!(matches!(host.keyboard.read_line_edit("> ", "")?, LineRead::Escape));
        assert!(host.keyboard.poll_escape());
        Ok(())
    }

    #[test]
    fn std_fileio_round_trips_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let mut io = StdFileIo::new();
        let path = std::env::temp_dir().join("brandy_host_test.dat");
        let name = path.to_str().unwrap();
        let h = io.open_out(name)?;
        io.write_byte(h, 0x41)?;
        io.write_byte(h, 0x42)?;
        io.close(h)?;
        let h = io.open_in(name)?;
        assert_eq!(io.read_byte(h)?, 0x41);
        assert_eq!(io.get_ptr(h)?, 1);
        io.set_ptr(h, 0)?;
        assert_eq!(io.read_byte(h)?, 0x41);
        assert_eq!(io.get_ext(h)?, 2);
        io.close(h)?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    #[test]
    fn unknown_handle_is_refused() {
        let mut io = StdFileIo::new();
        assert_eq!(io.read_byte(99).unwrap_err().kind, ErrorKind::BadHandle);
    }

    #[test]
    fn escape_key_poller_spots_esc_bytes() {
        assert!(contains_escape(b"\x1b"));
        assert!(contains_escape(b"abc\x1bdef"));
        assert!(!contains_escape(b"plain text"));
        assert!(!contains_escape(b""));
    }
}
