//! The interpreter context and statement executor.
//!
//! One `Interpreter` owns the workspace, the value stack, the variable
//! store and the host collaborators; every handler receives it by mutable
//! reference. The command loop (`process_line`) is the recovery point for
//! raised errors, and `run_from` holds the ON ERROR catch for running
//! programs: when a statement raises, either the installed handler gets
//! control or the error propagates out to the prompt.

use log::{debug, trace};

use crate::assign::{self, Destination};
use crate::commands;
use crate::errors::{BResult, BasicError, ErrorKind, Severity, raise};
use crate::eval::{self, Cursor, OpenMode};
use crate::host::Host;
use crate::printfmt;
use crate::program;
use crate::stack::{Control, ErrorSave, LocalSave, StmtAddr, ValueStack};
use crate::tokens::{self, Item, LineMode, Listo, Token, LINE_HDR};
use crate::values::{BStr, ElementKind, Value};
use crate::variables::{ParamDef, ParamMode, ProcDef, VarStore, VarValue, AT_PERCENT};
use crate::workspace::{Workspace, DEFAULT_SIZE};

/// Where an execution span stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCond {
    Program,
    Proc,
    Fn,
}

/// What a statement asks the executor to do next.
#[derive(Debug)]
pub enum Flow {
    Normal,
    /// Skip the remaining statements on the current line.
    NextLine,
    Jump(StmtAddr),
    End,
    EndProc,
    FnResult(Value),
    Quit,
}

/// Outcome of one prompt line, for the REPL driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Quit,
}

pub struct Interpreter {
    pub ws: Workspace,
    pub stack: ValueStack,
    pub vars: VarStore,
    pub host: Host,
    pub listo: Listo,
    /// Last raised error, feeding ERR, ERL and REPORT$.
    pub error_slot: Option<BasicError>,
    pub filepath: String,
    /// Name last used for LOAD or SAVE.
    pub last_name: Option<String>,
    /// Recognise lower-case keywords when tokenising input.
    pub lower: bool,
    pub running: bool,
    /// PROC/FN nesting depth; gates LOMEM/HIMEM moves.
    pub call_depth: usize,
    pub print_count: usize,
    pub current_line: u16,
    error_handler: Option<StmtAddr>,
    data_ptr: Option<StmtAddr>,
    trace: bool,
    rnd_state: u64,
    rnd_last: f64,
    pub edit_listo: Listo,
    /// RETURN-parameter copy-back lists, one per active PROC call.
    proc_returns: Vec<Vec<(Destination, usize)>>,
}

impl Interpreter {
    pub fn new(size: usize, host: Host) -> BResult<Interpreter> {
        let mut ws = Workspace::init(size)?;
        program::clear(&mut ws)?;
        let limit = ws.stack_limit();
        let filepath = std::env::var("FILEPATH").unwrap_or_default();
        Ok(Interpreter {
            ws,
            stack: ValueStack::new(limit),
            vars: VarStore::new(),
            host,
            listo: Listo::empty(),
            error_slot: None,
            filepath,
            last_name: None,
            lower: false,
            running: false,
            call_depth: 0,
            print_count: 0,
            current_line: 0,
            error_handler: None,
            data_ptr: None,
            trace: false,
            rnd_state: 0x2545F4914F6CDD1D,
            rnd_last: 0.0,
            edit_listo: Listo::empty(),
            proc_returns: Vec::new(),
        })
    }

    pub fn with_default_size(host: Host) -> BResult<Interpreter> {
        Interpreter::new(DEFAULT_SIZE, host)
    }

    // ----- output ---------------------------------------------------

    /// All interpreter output funnels through here so COUNT stays right.
    pub fn print(&mut self, text: &str) {
        for part in text.split_inclusive('\n') {
            if part.ends_with('\n') {
                self.print_count = 0;
            } else {
                self.print_count += part.len();
            }
        }
        self.host.screen.print_text(text);
    }

    pub fn print_line(&mut self, text: &str) {
        self.print(text);
        self.print("\n");
    }

    /// Report a warning: record it and keep going.
    pub fn warn(&mut self, err: BasicError) {
        let msg = err.message();
        self.error_slot = Some(err);
        self.print_line(&msg);
    }

    /// Forward a workspace write to the Mode-7 shadow when it lands there.
    pub fn note_write(&mut self, addr: usize, len: usize) {
        if let Some(rows) = Workspace::mode7_rows(addr, len) {
            for row in rows {
                self.host.screen.refresh_mode7(row);
            }
        }
    }

    pub fn check_escape(&mut self) -> BResult<()> {
        if self.host.keyboard.poll_escape() {
            self.host.keyboard.clear_escape();
            return raise(ErrorKind::Escape);
        }
        Ok(())
    }

    // ----- random numbers -------------------------------------------

    pub fn reseed(&mut self, seed: i32) {
        self.rnd_state = seed as u64 | 0x5DEECE66D_0000;
    }

    pub fn next_rnd(&mut self) -> f64 {
        // xorshift64*, folded to [0, 1).
        let mut x = self.rnd_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rnd_state = x;
        let v = (x.wrapping_mul(0x2545F4914F6CDD1D) >> 11) as f64 / (1u64 << 53) as f64;
        self.rnd_last = v;
        v
    }

    pub fn last_rnd(&self) -> f64 {
        self.rnd_last
    }

    // ----- variable-cache plumbing ----------------------------------

    fn cached_slot(&self, cur: &Cursor, cache_off: usize) -> Option<usize> {
        let base = cur.payload_base?;
        let raw = self.ws.read_u32(base + cache_off).ok()?;
        if raw == 0 {
            return None;
        }
        let slot = raw as usize - 1;
        if slot < self.vars.slot_count() {
            Some(slot)
        } else {
            None
        }
    }

    fn patch_cache(&mut self, cur: &Cursor, cache_off: usize, slot: usize) {
        if let Some(base) = cur.payload_base {
            let _ = self.ws.write_u32(base + cache_off, slot as u32 + 1);
        }
    }

    /// Resolve a name for reading; unknown names raise `VarMiss`.
    pub fn resolve_variable(
        &mut self,
        cur: &Cursor,
        name: &str,
        cache_off: usize,
    ) -> BResult<usize> {
        if let Some(slot) = self.cached_slot(cur, cache_off) {
            if self.vars.slot(slot)?.name == name {
                return Ok(slot);
            }
        }
        match self.vars.lookup(name) {
            Some(slot) => {
                self.patch_cache(cur, cache_off, slot);
                Ok(slot)
            }
            None => Err(BasicError::with_text(ErrorKind::VarMiss, name)),
        }
    }

    /// Resolve a name for assignment, creating it on first use.
    pub fn resolve_or_create(&mut self, cur: &Cursor, name: &str, cache_off: usize) -> usize {
        if let Some(slot) = self.cached_slot(cur, cache_off) {
            if self.vars.slot(slot).map(|s| s.name == name).unwrap_or(false) {
                return slot;
            }
        }
        let slot = self.vars.define(name);
        self.patch_cache(cur, cache_off, slot);
        slot
    }

    // ----- files ----------------------------------------------------

    /// Open a file, searching FILEPATH for input modes.
    pub fn open_file(&mut self, name: &[u8], mode: OpenMode) -> BResult<i32> {
        let name = String::from_utf8_lossy(name).into_owned();
        match mode {
            OpenMode::Out => self.host.files.open_out(&name),
            OpenMode::Up => self.host.files.open_up(&name),
            OpenMode::In => {
                let resolved = self
                    .find_on_path(&name)
                    .ok_or_else(|| BasicError::with_text(ErrorKind::NotFound, &name))?;
                self.host.files.open_in(&resolved)
            }
        }
    }

    /// Resolve a read file against the FILEPATH search list.
    pub fn find_on_path(&self, name: &str) -> Option<String> {
        if name.contains(':') || std::path::Path::new(name).exists() {
            return Some(name.to_string());
        }
        for dir in self.filepath.split(':').filter(|d| !d.is_empty()) {
            let candidate = format!("{dir}/{name}");
            if std::path::Path::new(&candidate).exists() {
                return Some(candidate);
            }
        }
        None
    }

    // ----- program edits --------------------------------------------

    /// Store, replace or delete a numbered line; edits clear variables.
    pub fn edit_line(&mut self, number: u16, payload: &[u8]) -> BResult<()> {
        program::insert_line(&mut self.ws, number, payload)?;
        self.vars.clear();
        self.ws.clear_heap();
        self.data_ptr = None;
        Ok(())
    }

    // ----- the REPL entry point -------------------------------------

    /// Tokenise and act on one line typed at the prompt.
    pub fn process_line(&mut self, text: &str) -> BResult<Outcome> {
        let trimmed = text.trim_end();
        if trimmed.trim().is_empty() {
            return Ok(Outcome::Continue);
        }
        let tok = tokens::tokenize(trimmed, LineMode::HasLine, self.lower)?;
        match tok.number {
            Some(n) => {
                // A bare number deletes the line.
                let only_spaces = tok.payload.iter().all(|&b| b == b' ');
                if only_spaces {
                    self.edit_line(n, &[])?;
                } else {
                    self.edit_line(n, &tok.payload)?;
                }
                Ok(Outcome::Continue)
            }
            None => self.exec_immediate(tok.payload),
        }
    }

    /// Execute an immediate (unnumbered) line.
    pub fn exec_immediate(&mut self, payload: Vec<u8>) -> BResult<Outcome> {
        let mut cur = Cursor::immediate(payload);
        self.current_line = 0;
        loop {
            cur.skip_spaces();
            if cur.at_end() {
                return Ok(Outcome::Continue);
            }
            match self.exec_statement(&mut cur)? {
                Flow::Normal => {
                    cur.skip_spaces();
                    if cur.at_end() {
                        return Ok(Outcome::Continue);
                    }
                    if !cur.try_char(b':') {
                        return raise(ErrorKind::Syntax);
                    }
                }
                Flow::NextLine | Flow::End => return Ok(Outcome::Continue),
                Flow::Jump(addr) if addr.line_off == StmtAddr::IMMEDIATE => {
                    // A loop body on this very line (immediate FOR/REPEAT).
                    cur.pos = addr.pos;
                }
                Flow::Jump(addr) => {
                    self.run_from(addr)?;
                    return Ok(Outcome::Continue);
                }
                Flow::Quit => return Ok(Outcome::Quit),
                Flow::EndProc => return raise(ErrorKind::EndProc),
                Flow::FnResult(_) => return raise(ErrorKind::FnReturn),
            }
        }
    }

    // ----- running a program ----------------------------------------

    /// RUN: reset state and execute from the first (or given) line.
    pub fn run_program(&mut self, from: Option<u16>) -> BResult<()> {
        self.vars.clear();
        self.ws.clear_heap();
        let limit = self.ws.stack_limit();
        self.stack.reinit(limit);
        self.call_depth = 0;
        self.data_ptr = None;
        self.error_handler = None;
        let start = match from {
            Some(n) => program::find_exact(&self.ws, n)?
                .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, n as i64))?,
            None => self.ws.page,
        };
        self.run_from(StmtAddr { line_off: start, pos: 0 })
    }

    /// The catch loop: executes until the program ends; a raised error
    /// transfers to the installed ON ERROR handler, if any.
    fn run_from(&mut self, mut addr: StmtAddr) -> BResult<()> {
        self.running = true;
        loop {
            let result = self.exec_span(addr, StopCond::Program);
            match result {
                Ok(()) => {
                    self.running = false;
                    return Ok(());
                }
                Err(e) => {
                    let e = e.at_line(self.current_line);
                    if e.kind.severity() == Severity::Fatal {
                        self.running = false;
                        return Err(e);
                    }
                    match self.error_handler {
                        Some(handler) => {
                            debug!("error trapped: {}", e.message());
                            self.error_slot = Some(e);
                            self.stack.clear();
                            self.call_depth = 0;
                            self.proc_returns.clear();
                            addr = handler;
                        }
                        None => {
                            self.running = false;
                            self.error_slot = Some(e.clone());
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Execute statements from `addr` until the stop condition is met.
    fn exec_span(&mut self, mut addr: StmtAddr, stop: StopCond) -> BResult<()> {
        loop {
            if addr.line_off == StmtAddr::IMMEDIATE {
                // A control record created at the prompt sent us back
                // there; the program part is over.
                return match stop {
                    StopCond::Program => Ok(()),
                    StopCond::Proc => raise(ErrorKind::EndProc),
                    StopCond::Fn => raise(ErrorKind::FnReturn),
                };
            }
            if program::at_progend(&self.ws, addr.line_off)? {
                return match stop {
                    StopCond::Program => Ok(()),
                    StopCond::Proc => raise(ErrorKind::EndProc),
                    StopCond::Fn => raise(ErrorKind::FnReturn),
                };
            }
            let lineno = program::line_number(&self.ws, addr.line_off)?;
            let range = program::payload_range(&self.ws, addr.line_off)?;
            let payload = self.ws.bytes(range.clone())?.to_vec();
            let mut cur = Cursor::stored(payload, range.start, lineno);
            cur.pos = addr.pos;
            self.current_line = lineno;
            if self.trace && addr.pos == 0 {
                let text = format!("[{lineno}]");
                self.print(&text);
            }

            let next_line = StmtAddr {
                line_off: addr.line_off + program::line_length(&self.ws, addr.line_off)? as usize,
                pos: 0,
            };

            'line: loop {
                self.check_escape()?;
                cur.skip_spaces();
                if cur.at_end() {
                    addr = next_line;
                    break 'line;
                }
                let flow = self.exec_statement(&mut cur)?;
                match flow {
                    Flow::Normal => {
                        cur.skip_spaces();
                        if cur.at_end() {
                            addr = next_line;
                            break 'line;
                        }
                        if !cur.try_char(b':') {
                            // An ELSE clause left over from a taken IF.
                            if cur.try_token(Token::Else) {
                                addr = next_line;
                                break 'line;
                            }
                            return raise(ErrorKind::Syntax);
                        }
                    }
                    Flow::NextLine => {
                        addr = next_line;
                        break 'line;
                    }
                    Flow::Jump(target) => {
                        addr = target;
                        break 'line;
                    }
                    Flow::End => {
                        return match stop {
                            StopCond::Program => Ok(()),
                            StopCond::Proc => raise(ErrorKind::EndProc),
                            StopCond::Fn => raise(ErrorKind::FnReturn),
                        };
                    }
                    Flow::EndProc => {
                        return match stop {
                            StopCond::Proc => Ok(()),
                            _ => raise(ErrorKind::EndProc),
                        };
                    }
                    Flow::FnResult(v) => {
                        return match stop {
                            StopCond::Fn => {
                                self.stack.push(v)?;
                                Ok(())
                            }
                            _ => raise(ErrorKind::FnReturn),
                        };
                    }
                    Flow::Quit => return raise(ErrorKind::UnsupState),
                }
            }
        }
    }

    // ----- statement dispatch ---------------------------------------

    /// Execute one statement; the cursor is left after it.
    pub fn exec_statement(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        cur.skip_spaces();
        let Some((item, next)) = cur.peek()? else {
            return Ok(Flow::Normal);
        };
        match item {
            Item::Cmd(c) => {
                cur.pos = next;
                commands::exec_command(self, c, cur)
            }
            Item::VarRef { .. } => {
                assign::exec_assignment(self, cur)?;
                Ok(Flow::Normal)
            }
            Item::Char(b'?' | b'!' | b'|' | b'$' | b']') => {
                assign::exec_assignment(self, cur)?;
                Ok(Flow::Normal)
            }
            Item::Char(b'*') => {
                cur.pos = next;
                let text = self.rest_of_line_text(cur);
                self.host.oscli.oscli(text.trim())?;
                Ok(Flow::NextLine)
            }
            Item::Char(b'=') => {
                cur.pos = next;
                let value = eval::eval_value(self, cur)?;
                self.fn_return(value)
            }
            Item::Char(b':') => Ok(Flow::Normal),
            Item::Char(_) => raise(ErrorKind::Syntax),
            Item::StrCon { .. } | Item::LineRef { .. } | Item::Pad => raise(ErrorKind::Syntax),
            Item::Token(t) => {
                cur.pos = next;
                self.exec_token_statement(t, cur)
            }
        }
    }

    fn exec_token_statement(&mut self, t: Token, cur: &mut Cursor) -> BResult<Flow> {
        trace!("statement {:?} at line {}", t, self.current_line);
        match t {
            Token::Let
            | Token::Himem
            | Token::Lomem
            | Token::Page
            | Token::Time
            | Token::TimeDol
            | Token::FilepathDol
            | Token::Ptr
            | Token::Ext
            | Token::LeftDol
            | Token::MidDol
            | Token::RightDol => {
                if t != Token::Let {
                    // The token is part of the destination; rewind it.
                    cur.pos -= 1;
                }
                assign::exec_assignment(self, cur)?;
                Ok(Flow::Normal)
            }
            Token::Print => self.stmt_print(cur),
            Token::Input => self.stmt_input(cur),
            Token::Dim => self.stmt_dim(cur),
            Token::For => self.stmt_for(cur),
            Token::Next => self.stmt_next(cur),
            Token::Repeat => {
                let body = StmtAddr {
                    line_off: cur.payload_base.map(|b| b - LINE_HDR).unwrap_or(StmtAddr::IMMEDIATE),
                    pos: cur.pos,
                };
                self.stack.push_control(Control::Repeat { body })?;
                Ok(Flow::Normal)
            }
            Token::Until => self.stmt_until(cur),
            Token::While => self.stmt_while(cur),
            Token::Endwhile => self.stmt_endwhile(cur),
            Token::Goto => {
                let target = self.line_target(cur)?;
                Ok(Flow::Jump(StmtAddr { line_off: target, pos: 0 }))
            }
            Token::Gosub => {
                let target = self.line_target(cur)?;
                let ret = self.addr_after(cur);
                self.stack.push_control(Control::Gosub { ret })?;
                Ok(Flow::Jump(StmtAddr { line_off: target, pos: 0 }))
            }
            Token::Return => self.stmt_return(),
            Token::If => self.stmt_if(cur),
            Token::Else => Ok(Flow::NextLine),
            Token::On => self.stmt_on(cur),
            Token::Proc => self.stmt_proc(cur),
            Token::Endproc => self.stmt_endproc(),
            Token::Def => self.stmt_def(cur),
            Token::Local => self.stmt_local(cur),
            Token::Read => self.stmt_read(cur),
            Token::Data => Ok(Flow::NextLine),
            Token::Restore => self.stmt_restore(cur),
            Token::Rem => Ok(Flow::NextLine),
            Token::End => Ok(Flow::End),
            Token::Stop => raise(ErrorKind::Stop),
            Token::Run => {
                let from = match cur.read_number()? {
                    Some(Value::Int32(n)) if n > 0 => Some(n as u16),
                    _ => None,
                };
                if cur.payload_base.is_some() {
                    // Restarting from inside the program.
                    self.vars.clear();
                    self.ws.clear_heap();
                    self.stack.clear();
                    self.call_depth = 0;
                    self.data_ptr = None;
                    let start = match from {
                        Some(n) => program::find_exact(&self.ws, n)?
                            .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, n as i64))?,
                        None => self.ws.page,
                    };
                    Ok(Flow::Jump(StmtAddr { line_off: start, pos: 0 }))
                } else {
                    self.run_program(from)?;
                    Ok(Flow::NextLine)
                }
            }
            Token::Clear => {
                self.vars.clear();
                self.ws.clear_heap();
                Ok(Flow::Normal)
            }
            Token::Report => {
                let msg = self
                    .error_slot
                    .as_ref()
                    .map(|e| e.message())
                    .unwrap_or_default();
                self.print_line("");
                self.print_line(&msg);
                Ok(Flow::Normal)
            }
            Token::Trace => {
                if cur.try_token(Token::Off) {
                    self.trace = false;
                } else if cur.try_token(Token::On) {
                    self.trace = true;
                } else {
                    // TRACE n limits tracing in the dialect; treat as ON.
                    let _ = eval::eval_numeric32(self, cur)?;
                    self.trace = true;
                }
                Ok(Flow::Normal)
            }
            Token::Oscli => {
                let s = eval::eval_string(self, cur)?;
                let text = String::from_utf8_lossy(&s.bytes).into_owned();
                self.host.oscli.oscli(text.trim())?;
                Ok(Flow::Normal)
            }
            Token::Swap => self.stmt_swap(cur),
            Token::Bput => {
                cur.expect_char(b'#', ErrorKind::HashMiss)?;
                let h = eval::eval_numeric32(self, cur)?;
                cur.expect_char(b',', ErrorKind::ComMiss)?;
                let v = eval::eval_value(self, cur)?;
                match v {
                    Value::Str(s) => {
                        for b in s.bytes {
                            self.host.files.write_byte(h, b)?;
                        }
                    }
                    _ => {
                        self.stack.push(v)?;
                        let b = self.stack.pop_anynum32()?;
                        self.host.files.write_byte(h, b as u8)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Token::Close => {
                cur.expect_char(b'#', ErrorKind::HashMiss)?;
                let h = eval::eval_numeric32(self, cur)?;
                self.host.files.close(h)?;
                Ok(Flow::Normal)
            }
            Token::Wait => {
                let cs = if cur.at_statement_end() {
                    0
                } else {
                    eval::eval_numeric32(self, cur)?
                };
                if cs > 0 {
                    std::thread::sleep(std::time::Duration::from_millis(cs as u64 * 10));
                }
                Ok(Flow::Normal)
            }
            Token::Width => {
                let _ = eval::eval_numeric32(self, cur)?;
                Ok(Flow::Normal)
            }
            Token::Cls => {
                self.print("\u{000C}");
                self.print_count = 0;
                Ok(Flow::Normal)
            }
            Token::Quit => Ok(Flow::Quit),
            Token::Library => {
                let s = eval::eval_string(self, cur)?;
                let name = String::from_utf8_lossy(&s.bytes).into_owned();
                commands::install_library(self, &name)?;
                Ok(Flow::Normal)
            }
            Token::Chain => {
                // The chained program replaces this one; there is nothing
                // to come back to.
                let s = eval::eval_string(self, cur)?;
                let name = String::from_utf8_lossy(&s.bytes).into_owned();
                commands::load_program(self, &name)?;
                self.stack.clear();
                self.call_depth = 0;
                self.proc_returns.clear();
                self.run_program(None)?;
                Ok(Flow::End)
            }
            Token::Error => {
                // ERROR n, "message": raise a user error with that code.
                let code = eval::eval_numeric32(self, cur)?;
                cur.expect_char(b',', ErrorKind::ComMiss)?;
                let s = eval::eval_string(self, cur)?;
                let mut err =
                    BasicError::with_text(ErrorKind::None, String::from_utf8_lossy(&s.bytes));
                err.val = Some(code as i64);
                Err(err)
            }
            Token::Mode | Token::Colour | Token::Gcol | Token::Move | Token::Draw
            | Token::Plot | Token::Circle | Token::Sound => raise(ErrorKind::NoGraphics),
            Token::Vdu => raise(ErrorKind::NoVduCmds),
            Token::Sys => raise(ErrorKind::Unsupported),
            Token::Case | Token::When | Token::Otherwise | Token::Endcase | Token::Of
            | Token::Endif => raise(ErrorKind::Unsupported),
            _ => raise(ErrorKind::Syntax),
        }
    }

    // ----- statement helpers ----------------------------------------

    fn rest_of_line_text(&self, cur: &mut Cursor) -> String {
        let mut out = String::new();
        while let Ok(Some((item, next))) = cur.peek() {
            match item {
                Item::Char(c) => out.push(c as char),
                Item::Token(t) => out.push_str(tokens::keyword_text(t)),
                Item::StrCon { content, .. } => {
                    out.push('"');
                    out.push_str(&String::from_utf8_lossy(content));
                    out.push('"');
                }
                Item::VarRef { name, .. } => out.push_str(&String::from_utf8_lossy(name)),
                Item::LineRef { value, .. } => out.push_str(&value.to_string()),
                Item::Cmd(c) => out.push_str(tokens::command_text(c)),
                Item::Pad => {}
            }
            cur.pos = next;
        }
        out
    }

    /// Address of the next statement after the current cursor position.
    fn addr_after(&self, cur: &Cursor) -> StmtAddr {
        StmtAddr {
            line_off: cur
                .payload_base
                .map(|b| b - LINE_HDR)
                .unwrap_or(StmtAddr::IMMEDIATE),
            pos: cur.pos,
        }
    }

    /// Parse a GOTO/GOSUB/RESTORE target and find its line.
    fn line_target(&mut self, cur: &mut Cursor) -> BResult<usize> {
        cur.skip_spaces();
        let n = match cur.peek()? {
            Some((Item::LineRef { value, .. }, next)) => {
                cur.pos = next;
                value
            }
            _ => {
                let v = eval::eval_numeric32(self, cur)?;
                if v <= 0 || v > tokens::MAX_LINENO as i32 {
                    return Err(BasicError::with_val(ErrorKind::LineNo, v as i64));
                }
                v as u16
            }
        };
        program::find_exact(&self.ws, n)?
            .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, n as i64))
    }

    fn stmt_return(&mut self) -> BResult<Flow> {
        loop {
            match self.stack.top_control() {
                Some(Control::Gosub { .. }) => {
                    let Control::Gosub { ret } = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    return Ok(Flow::Jump(ret));
                }
                Some(Control::For { .. })
                | Some(Control::Repeat { .. })
                | Some(Control::While { .. }) => {
                    // Leaving a loop by RETURN abandons it.
                    self.stack.pop_control()?;
                }
                _ => return raise(ErrorKind::Return),
            }
        }
    }

    fn stmt_if(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let cond = eval::eval_numeric_fp(self, cur)? != 0.0;
        cur.try_token(Token::Then);
        cur.skip_spaces();
        if cond {
            // Fall through; a trailing ELSE clause ends the line.
            if let Some((Item::LineRef { value, .. }, next)) = cur.peek()? {
                cur.pos = next;
                let off = program::find_exact(&self.ws, value)?
                    .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, value as i64))?;
                return Ok(Flow::Jump(StmtAddr { line_off: off, pos: 0 }));
            }
            return Ok(Flow::Normal);
        }
        // Condition false: skip to ELSE on this line, else skip the line.
        while let Some((item, next)) = cur.peek()? {
            let is_else = item == Item::Token(Token::Else);
            cur.pos = next;
            if is_else {
                cur.skip_spaces();
                if let Some((Item::LineRef { value, .. }, next)) = cur.peek()? {
                    cur.pos = next;
                    let off = program::find_exact(&self.ws, value)?
                        .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, value as i64))?;
                    return Ok(Flow::Jump(StmtAddr { line_off: off, pos: 0 }));
                }
                return Ok(Flow::Normal);
            }
        }
        Ok(Flow::NextLine)
    }

    fn stmt_on(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        if cur.try_token(Token::Error) {
            if cur.try_token(Token::Off) {
                self.error_handler = None;
                return Ok(Flow::Normal);
            }
            let local = cur.try_token(Token::Local);
            if local {
                self.stack.push_control(Control::OnError(ErrorSave {
                    handler: self.error_handler,
                    local: true,
                }))?;
            }
            cur.skip_spaces();
            if cur.payload_base.is_some() {
                self.error_handler = Some(self.addr_after(cur));
            } else {
                debug!("ON ERROR at the prompt is not retained");
            }
            return Ok(Flow::NextLine);
        }
        // ON expr GOTO/GOSUB target list [ELSE ...]
        let selector = eval::eval_numeric32(self, cur)?;
        let is_gosub = if cur.try_token(Token::Goto) {
            false
        } else if cur.try_token(Token::Gosub) {
            true
        } else {
            return raise(ErrorKind::Syntax);
        };
        let mut index = 1;
        let mut target = None;
        loop {
            cur.skip_spaces();
            let Some((Item::LineRef { value, .. }, next)) = cur.peek()? else {
                break;
            };
            cur.pos = next;
            if index == selector {
                target = Some(value);
            }
            index += 1;
            if !cur.try_char(b',') {
                break;
            }
        }
        match target {
            Some(n) => {
                let off = program::find_exact(&self.ws, n)?
                    .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, n as i64))?;
                if is_gosub {
                    // Return to just after the whole ON statement.
                    while !cur.at_statement_end() {
                        let Some((_, next)) = cur.peek()? else { break };
                        cur.pos = next;
                    }
                    let ret = self.addr_after(cur);
                    self.stack.push_control(Control::Gosub { ret })?;
                }
                Ok(Flow::Jump(StmtAddr { line_off: off, pos: 0 }))
            }
            None => {
                if cur.try_token(Token::Else) {
                    return Ok(Flow::Normal);
                }
                Err(BasicError::with_val(ErrorKind::OnRange, selector as i64))
            }
        }
    }

    // ----- PRINT ----------------------------------------------------

    fn stmt_print(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let mut newline = true;
        loop {
            cur.skip_spaces();
            if cur.at_statement_end() {
                break;
            }
            newline = true;
            if cur.try_char(b';') {
                newline = false;
                continue;
            }
            if cur.try_char(b',') {
                let col = (self.print_count / 10 + 1) * 10;
                let pad = col - self.print_count;
                let spaces = " ".repeat(pad);
                self.print(&spaces);
                newline = false;
                continue;
            }
            if cur.try_char(b'\'') {
                self.print("\n");
                newline = false;
                continue;
            }
            if cur.try_token(Token::TabLp) {
                let col = eval::eval_numeric32(self, cur)?.max(0) as usize;
                cur.expect_char(b')', ErrorKind::RpMiss)?;
                if self.print_count > col {
                    self.print("\n");
                }
                let pad = col - self.print_count;
                let spaces = " ".repeat(pad);
                self.print(&spaces);
                continue;
            }
            if cur.try_token(Token::Spc) {
                let n = eval::eval_numeric32(self, cur)?.max(0) as usize;
                let spaces = " ".repeat(n.min(255));
                self.print(&spaces);
                continue;
            }
            let value = eval::eval_value(self, cur)?;
            match value {
                Value::Str(s) => {
                    let text = String::from_utf8_lossy(&s.bytes).into_owned();
                    self.print(&text);
                }
                v if v.is_numeric() => {
                    let word = self.vars.statics[AT_PERCENT] as u32;
                    let mut text = printfmt::format_number(&v, word);
                    // Unpadded general format separates numbers itself.
                    if (word >> 16) & 3 == 0 && (word >> 16) & 0x30 == 0 {
                        text.push(' ');
                    }
                    self.print(&text);
                }
                _ => return raise(ErrorKind::UnsuitableVar),
            }
        }
        if newline {
            self.print("\n");
        }
        Ok(Flow::Normal)
    }

    // ----- INPUT ----------------------------------------------------

    fn stmt_input(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        // INPUT ["prompt" (;|,)] var [, var ...]
        let mut prompt = String::new();
        cur.skip_spaces();
        if let Some((Item::StrCon { content, .. }, next)) = cur.peek()? {
            prompt = String::from_utf8_lossy(content).into_owned();
            cur.pos = next;
            if !cur.try_char(b';') {
                let _ = cur.try_char(b',');
            }
        }
        let mut fields: Vec<String> = Vec::new();
        loop {
            let dest = assign::parse_destination(self, cur)?;
            if fields.is_empty() {
                let shown = if prompt.is_empty() { "?".to_string() } else { prompt.clone() };
                match self.host.keyboard.read_line_edit(&shown, "")? {
                    crate::host::LineRead::Line(line) => {
                        fields = line.split(',').map(|f| f.trim().to_string()).collect();
                        fields.reverse();
                    }
                    crate::host::LineRead::Escape => return raise(ErrorKind::Escape),
                    crate::host::LineRead::Eof => return raise(ErrorKind::EofErr),
                }
            }
            let field = fields.pop().unwrap_or_default();
            let is_string = matches!(
                dest,
                Destination::Scalar { kind: ElementKind::Str, .. }
                    | Destination::Element { kind: ElementKind::Str, .. }
            );
            let value = if is_string {
                Value::Str(BStr::temp(field.into_bytes()))
            } else {
                match tokens::parse_number(field.trim_start_matches('-').as_bytes()) {
                    Ok((v, _)) => {
                        if field.starts_with('-') {
                            match v {
                                Value::Int32(i) => Value::Int32(-i),
                                Value::Int64(i) => Value::Int64(-i),
                                Value::Float(f) => Value::Float(-f),
                                other => other,
                            }
                        } else {
                            v
                        }
                    }
                    Err(_) => Value::Int32(0),
                }
            };
            assign::plain_assign(self, &dest, value)?;
            if !cur.try_char(b',') {
                break;
            }
        }
        Ok(Flow::Normal)
    }

    // ----- DIM ------------------------------------------------------

    fn stmt_dim(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        loop {
            cur.skip_spaces();
            let Some((Item::VarRef { name, cache_off }, next)) = cur.peek()? else {
                return raise(ErrorKind::NameMiss);
            };
            let name = String::from_utf8_lossy(name).into_owned();
            let cache_off = cache_off;
            cur.pos = next;
            if cur.try_char(b'(') {
                // Heap array.
                let mut bounds = Vec::new();
                loop {
                    let b = eval::eval_numeric32(self, cur)?;
                    if b < 0 {
                        return raise(ErrorKind::DimRange);
                    }
                    bounds.push(b as usize);
                    if cur.try_char(b',') {
                        continue;
                    }
                    cur.expect_char(b')', ErrorKind::RpMiss)?;
                    break;
                }
                let count: usize = bounds.iter().map(|b| b + 1).product();
                if count == 0 || count > (1 << 26) {
                    return raise(ErrorKind::DimSpace);
                }
                self.vars.dim_array(&format!("{name}("), bounds)?;
            } else {
                // Byte block: DIM name size.
                let size = eval::eval_numeric32(self, cur)?;
                if size < -1 {
                    return raise(ErrorKind::BadByteDim);
                }
                let base = self.ws.alloc_block((size + 1) as usize)?;
                let dest = match crate::variables::static_index(&name) {
                    Some(idx) => Destination::StaticInt(idx),
                    None => {
                        let slot = self.resolve_or_create(cur, &name, cache_off);
                        let kind = crate::variables::kind_of_name(&name);
                        Destination::Scalar { slot, kind }
                    }
                };
                assign::plain_assign(self, &dest, Value::Int64(base as i64))?;
            }
            if !cur.try_char(b',') {
                return Ok(Flow::Normal);
            }
        }
    }

    // ----- loops ----------------------------------------------------

    fn stmt_for(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let dest = assign::parse_destination(self, cur)?;
        match dest {
            Destination::Scalar { kind: ElementKind::Str, .. } | Destination::Substr { .. } => {
                return raise(ErrorKind::ForVariable);
            }
            Destination::Scalar { .. } | Destination::Element { .. } | Destination::StaticInt(_) => {}
            _ => return raise(ErrorKind::ForVariable),
        }
        cur.expect_char(b'=', ErrorKind::EqMiss)?;
        let start = eval::eval_value(self, cur)?;
        if !cur.try_token(Token::To) {
            return raise(ErrorKind::ToMiss);
        }
        let end = eval::eval_numeric_fp(self, cur)?;
        let step = if cur.try_token(Token::Step) {
            eval::eval_numeric_fp(self, cur)?
        } else {
            1.0
        };
        if step == 0.0 {
            return raise(ErrorKind::Silly);
        }
        assign::plain_assign(self, &dest, start)?;
        let body = self.addr_after(cur);
        self.stack.push_control(Control::For { dest, end, step, body })?;
        Ok(Flow::Normal)
    }

    fn stmt_next(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        // An optional variable names which loop to step.
        let named = if !cur.at_statement_end() {
            Some(assign::parse_destination(self, cur)?)
        } else {
            None
        };
        loop {
            match self.stack.top_control() {
                Some(Control::For { dest, .. }) => {
                    if let Some(want) = &named {
                        if dest != want {
                            // Inner loops abandoned by a named NEXT.
                            self.stack.pop_control()?;
                            continue;
                        }
                    }
                    break;
                }
                Some(_) | None => {
                    return match named {
                        Some(_) => raise(ErrorKind::CantMatchFor),
                        None => raise(ErrorKind::NotFor),
                    };
                }
            }
        }
        let Control::For { dest, end, step, body } = self.stack.pop_control()? else {
            unreachable!()
        };
        let current = assign::read_destination(self, &dest)?;
        self.stack.push(current)?;
        let v = self.stack.pop_anynumfp()? + step;
        assign::plain_assign(self, &dest, Value::Float(v))?;
        let more = if step > 0.0 { v <= end } else { v >= end };
        if more {
            self.stack.push_control(Control::For { dest, end, step, body })?;
            Ok(Flow::Jump(body))
        } else {
            Ok(Flow::Normal)
        }
    }

    fn stmt_until(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let done = eval::eval_numeric_fp(self, cur)? != 0.0;
        match self.stack.top_control() {
            Some(Control::Repeat { .. }) => {
                let Control::Repeat { body } = self.stack.pop_control()? else {
                    unreachable!()
                };
                if done {
                    Ok(Flow::Normal)
                } else {
                    self.stack.push_control(Control::Repeat { body })?;
                    Ok(Flow::Jump(body))
                }
            }
            _ => raise(ErrorKind::NotRepeat),
        }
    }

    fn stmt_while(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let cond_addr = StmtAddr {
            line_off: cur
                .payload_base
                .map(|b| b - LINE_HDR)
                .unwrap_or(StmtAddr::IMMEDIATE),
            pos: cur.pos.saturating_sub(1),
        };
        let keep = eval::eval_numeric_fp(self, cur)? != 0.0;
        if keep {
            // Re-entry runs the WHILE statement again, so pop first there.
            if !matches!(self.stack.top_control(), Some(Control::While { cond })
                if *cond == cond_addr)
            {
                self.stack.push_control(Control::While { cond: cond_addr })?;
            }
            Ok(Flow::Normal)
        } else {
            if matches!(self.stack.top_control(), Some(Control::While { cond })
                if *cond == cond_addr)
            {
                self.stack.pop_control()?;
            }
            self.skip_to_endwhile(cur)
        }
    }

    fn stmt_endwhile(&mut self, _cur: &mut Cursor) -> BResult<Flow> {
        match self.stack.top_control() {
            Some(Control::While { .. }) => {
                let Control::While { cond } = self.stack.top_control().cloned().unwrap() else {
                    unreachable!()
                };
                Ok(Flow::Jump(StmtAddr {
                    line_off: cond.line_off,
                    pos: cond.pos,
                }))
            }
            _ => raise(ErrorKind::NotWhile),
        }
    }

    /// Scan past the matching ENDWHILE, across lines if necessary.
    fn skip_to_endwhile(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let mut depth = 1usize;
        // Rest of the current line first.
        while let Some((item, next)) = cur.peek()? {
            let token = match item {
                Item::Token(t) => Some(t),
                _ => None,
            };
            cur.pos = next;
            match token {
                Some(Token::While) => depth += 1,
                Some(Token::Endwhile) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(Flow::Normal);
                    }
                }
                _ => {}
            }
        }
        let Some(base) = cur.payload_base else {
            return raise(ErrorKind::EndWhile);
        };
        let mut off = base - LINE_HDR;
        off += program::line_length(&self.ws, off)? as usize;
        loop {
            if program::at_progend(&self.ws, off)? {
                return raise(ErrorKind::EndWhile);
            }
            let range = program::payload_range(&self.ws, off)?;
            let payload = self.ws.bytes(range)?.to_vec();
            let mut pos = 0;
            while pos < payload.len() {
                let (item, next) = tokens::item_at(&payload, pos)?;
                match item {
                    Item::Token(Token::While) => depth += 1,
                    Item::Token(Token::Endwhile) => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(Flow::Jump(StmtAddr { line_off: off, pos: next }));
                        }
                    }
                    _ => {}
                }
                pos = next;
            }
            off += program::line_length(&self.ws, off)? as usize;
        }
    }

    // ----- PROC / FN ------------------------------------------------

    fn stmt_proc(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let Some((Item::VarRef { name, .. }, next)) = cur.peek()? else {
            return raise(ErrorKind::NameMiss);
        };
        let name = String::from_utf8_lossy(name).into_owned();
        cur.pos = next;
        let def = self.resolve_proc(&name, false)?;
        let (locals, returns) = self.bind_args(cur, &def)?;
        self.stack.push_control(Control::Proc {
            ret: self.addr_after(cur),
            locals,
        })?;
        self.proc_returns_push(returns);
        self.call_depth += 1;
        let result = self.exec_span(
            StmtAddr { line_off: def.line_off, pos: def.body_pos },
            StopCond::Proc,
        );
        self.call_depth = self.call_depth.saturating_sub(1);
        result?;
        Ok(Flow::Normal)
    }

    /// FN call from the expression evaluator.
    pub fn call_fn(&mut self, name: &str, args: Vec<Value>) -> BResult<Value> {
        let def = self.resolve_proc(name, true)?;
        if args.len() != def.params.len() {
            return Err(BasicError::with_text(ErrorKind::Arguments, format!("FN{name}")));
        }
        let mut locals = Vec::new();
        for (param, value) in def.params.iter().zip(args) {
            let slot = self.vars.define(&param.name);
            locals.push(LocalSave {
                slot,
                previous: Some(self.vars.slot(slot)?.value.clone()),
            });
            self.set_var_value(slot, value)?;
        }
        self.stack.push_control(Control::Fn {
            ret: StmtAddr { line_off: StmtAddr::IMMEDIATE, pos: 0 },
            locals,
        })?;
        self.call_depth += 1;
        let result = self.exec_span(
            StmtAddr { line_off: def.line_off, pos: def.body_pos },
            StopCond::Fn,
        );
        self.call_depth = self.call_depth.saturating_sub(1);
        result?;
        self.stack.pop_value()
    }

    /// `=expr`: unwind to the innermost FN frame.
    fn fn_return(&mut self, value: Value) -> BResult<Flow> {
        loop {
            match self.stack.top_control() {
                Some(Control::Fn { .. }) => {
                    let Control::Fn { locals, .. } = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    self.restore_locals(locals)?;
                    return Ok(Flow::FnResult(value));
                }
                Some(Control::Local(_)) => {
                    let Control::Local(save) = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    self.restore_locals(vec![save])?;
                }
                Some(Control::OnError(_)) => {
                    let Control::OnError(save) = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    self.error_handler = save.handler;
                }
                Some(Control::For { .. })
                | Some(Control::Repeat { .. })
                | Some(Control::While { .. })
                | Some(Control::Gosub { .. }) => {
                    self.stack.pop_control()?;
                }
                _ => return raise(ErrorKind::FnReturn),
            }
        }
    }

    fn stmt_endproc(&mut self) -> BResult<Flow> {
        loop {
            match self.stack.top_control() {
                Some(Control::Proc { .. }) => {
                    let Control::Proc { locals, .. } = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    let returns = self.proc_returns_pop();
                    for (dest, slot) in returns {
                        let value = self.var_value_as_value(slot)?;
                        assign::plain_assign(self, &dest, value)?;
                    }
                    self.restore_locals(locals)?;
                    return Ok(Flow::EndProc);
                }
                Some(Control::Local(_)) => {
                    let Control::Local(save) = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    self.restore_locals(vec![save])?;
                }
                Some(Control::OnError(_)) => {
                    let Control::OnError(save) = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    self.error_handler = save.handler;
                }
                Some(Control::For { .. })
                | Some(Control::Repeat { .. })
                | Some(Control::While { .. })
                | Some(Control::Gosub { .. }) => {
                    self.stack.pop_control()?;
                }
                _ => return raise(ErrorKind::EndProc),
            }
        }
    }

    fn stmt_local(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        if self.call_depth == 0 {
            return raise(ErrorKind::Local);
        }
        if cur.try_token(Token::Error) {
            self.stack.push_control(Control::OnError(ErrorSave {
                handler: self.error_handler,
                local: true,
            }))?;
            return Ok(Flow::Normal);
        }
        if cur.try_token(Token::Data) {
            // LOCAL DATA saves the read pointer for RESTORE DATA.
            let (line, pos) = match self.data_ptr {
                Some(p) => (program::line_number(&self.ws, p.line_off)?, p.pos),
                None => (0, 0),
            };
            self.stack.push_control(Control::Data { line, pos })?;
            return Ok(Flow::Normal);
        }
        loop {
            cur.skip_spaces();
            let Some((Item::VarRef { name, .. }, next)) = cur.peek()? else {
                return raise(ErrorKind::NameMiss);
            };
            let name = String::from_utf8_lossy(name).into_owned();
            cur.pos = next;
            let slot = self.vars.define(&name);
            let previous = Some(self.vars.slot(slot)?.value.clone());
            self.stack.push_control(Control::Local(LocalSave { slot, previous }))?;
            let kind = crate::variables::kind_of_name(&name);
            self.vars.slot_mut(slot)?.value = VarValue::zero_of(kind);
            if !cur.try_char(b',') {
                return Ok(Flow::Normal);
            }
        }
    }

    fn restore_locals(&mut self, locals: Vec<LocalSave>) -> BResult<()> {
        for save in locals.into_iter().rev() {
            if let Some(value) = save.previous {
                self.vars.slot_mut(save.slot)?.value = value;
            }
        }
        Ok(())
    }

    fn set_var_value(&mut self, slot: usize, value: Value) -> BResult<()> {
        let kind = crate::variables::kind_of_name(&self.vars.slot(slot)?.name.clone());
        assign::plain_assign(self, &Destination::Scalar { slot, kind }, value)
    }

    fn var_value_as_value(&self, slot: usize) -> BResult<Value> {
        Ok(match &self.vars.slot(slot)?.value {
            VarValue::Int32(v) => Value::Int32(*v),
            VarValue::Float(v) => Value::Float(*v),
            VarValue::Int64(v) => Value::Int64(*v),
            VarValue::Uint8(v) => Value::Uint8(*v),
            VarValue::Str(b) => Value::Str(BStr::temp(b.clone())),
            _ => return raise(ErrorKind::UnsuitableVar),
        })
    }

    /// Parse a call's argument list against the definition, saving the
    /// parameters' previous bindings.
    fn bind_args(
        &mut self,
        cur: &mut Cursor,
        def: &ProcDef,
    ) -> BResult<(Vec<LocalSave>, Vec<(Destination, usize)>)> {
        let mut values: Vec<(Value, Option<Destination>)> = Vec::new();
        if !def.params.is_empty() {
            cur.expect_char(b'(', ErrorKind::LpMiss)?;
            for (i, param) in def.params.iter().enumerate() {
                if i > 0 {
                    cur.expect_char(b',', ErrorKind::ComMiss)?;
                }
                match param.mode {
                    ParamMode::Value => values.push((eval::eval_value(self, cur)?, None)),
                    ParamMode::Return => {
                        let dest = assign::parse_destination(self, cur)?;
                        let value = assign::read_destination(self, &dest)?;
                        values.push((value, Some(dest)));
                    }
                }
            }
            cur.expect_char(b')', ErrorKind::RpMiss)?;
        } else if cur.try_char(b'(') {
            return Err(BasicError::with_text(
                ErrorKind::Arguments,
                format!("line {}", def.line_no),
            ));
        }
        let mut locals = Vec::new();
        let mut returns = Vec::new();
        for (param, (value, dest)) in def.params.iter().zip(values) {
            let slot = self.vars.define(&param.name);
            locals.push(LocalSave {
                slot,
                previous: Some(self.vars.slot(slot)?.value.clone()),
            });
            self.set_var_value(slot, value)?;
            if let Some(d) = dest {
                returns.push((d, slot));
            }
        }
        Ok((locals, returns))
    }

    // RETURN-parameter copy-back lists are nested per active PROC call.
    fn proc_returns_push(&mut self, returns: Vec<(Destination, usize)>) {
        self.proc_returns.push(returns);
    }

    fn proc_returns_pop(&mut self) -> Vec<(Destination, usize)> {
        self.proc_returns.pop().unwrap_or_default()
    }

    /// Find a PROC/FN definition: variable store first, then a scan of
    /// the program, then the installed libraries (the dispatch hook).
    fn resolve_proc(&mut self, name: &str, is_fn: bool) -> BResult<ProcDef> {
        let key = if is_fn { format!("FN{name}") } else { format!("PROC{name}") };
        if let Some(slot) = self.vars.lookup(&key) {
            match &self.vars.slot(slot)?.value {
                VarValue::Proc(def) if !is_fn => return Ok(def.clone()),
                VarValue::Fn(def) if is_fn => return Ok(def.clone()),
                _ => {}
            }
        }
        let mut regions = vec![(self.ws.page, None)];
        for (i, lib) in self.vars.libraries().iter().enumerate() {
            regions.push((lib.base, Some(i)));
        }
        for (base, library) in regions {
            if let Some(def) = self.scan_defs(base, name, is_fn, library)? {
                let slot = self.vars.define(&key);
                self.vars.slot_mut(slot)?.value = if is_fn {
                    VarValue::Fn(def.clone())
                } else {
                    VarValue::Proc(def.clone())
                };
                return Ok(def);
            }
        }
        Err(BasicError::with_text(
            if is_fn { ErrorKind::NotAFn } else { ErrorKind::NotAProc },
            name,
        ))
    }

    /// Walk a line-store region looking for `DEF PROCname`/`DEF FNname`.
    fn scan_defs(
        &self,
        base: usize,
        name: &str,
        is_fn: bool,
        library: Option<usize>,
    ) -> BResult<Option<ProcDef>> {
        let mut off = base;
        loop {
            if program::at_progend(&self.ws, off)? {
                return Ok(None);
            }
            let lineno = program::line_number(&self.ws, off)?;
            let range = program::payload_range(&self.ws, off)?;
            let payload = self.ws.bytes(range.clone())?.to_vec();
            if let Some(def) =
                parse_def_line(&payload, name, is_fn, off, range.start, lineno, library)?
            {
                return Ok(Some(def));
            }
            off += program::line_length(&self.ws, off)? as usize;
        }
    }

    // ----- DATA / READ / RESTORE ------------------------------------

    fn stmt_restore(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        if cur.try_token(Token::Error) {
            // RESTORE ERROR pops a saved handler state.
            match self.stack.top_control() {
                Some(Control::OnError(_)) => {
                    let Control::OnError(save) = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    self.error_handler = save.handler;
                    return Ok(Flow::Normal);
                }
                _ => return raise(ErrorKind::ErrNotOp),
            }
        }
        if cur.try_token(Token::Data) {
            match self.stack.top_control() {
                Some(Control::Data { .. }) => {
                    let Control::Data { line, pos } = self.stack.pop_control()? else {
                        unreachable!()
                    };
                    if line == 0 {
                        self.data_ptr = None;
                        return Ok(Flow::Normal);
                    }
                    let off = program::find_exact(&self.ws, line)?
                        .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, line as i64))?;
                    self.data_ptr = Some(StmtAddr { line_off: off, pos });
                    return Ok(Flow::Normal);
                }
                _ => return raise(ErrorKind::DataNotOp),
            }
        }
        cur.skip_spaces();
        if cur.at_statement_end() {
            self.data_ptr = None;
            return Ok(Flow::Normal);
        }
        let off = self.line_target(cur)?;
        self.data_ptr = Some(StmtAddr { line_off: off, pos: 0 });
        Ok(Flow::Normal)
    }

    /// Advance the DATA pointer to the next item and return its text.
    fn next_data_item(&mut self) -> BResult<Vec<u8>> {
        let mut ptr = match self.data_ptr {
            Some(p) => p,
            None => StmtAddr { line_off: self.ws.page, pos: 0 },
        };
        loop {
            if program::at_progend(&self.ws, ptr.line_off)? {
                return raise(ErrorKind::OutOfData);
            }
            let range = program::payload_range(&self.ws, ptr.line_off)?;
            let payload = self.ws.bytes(range)?.to_vec();
            if ptr.pos == 0 {
                // Find the DATA keyword on this line.
                let mut pos = 0;
                let mut found = None;
                while pos < payload.len() {
                    let (item, next) = tokens::item_at(&payload, pos)?;
                    if item == Item::Token(Token::Data) {
                        found = Some(next);
                        break;
                    }
                    pos = next;
                }
                match found {
                    Some(start) => ptr.pos = start,
                    None => {
                        ptr = StmtAddr {
                            line_off: ptr.line_off
                                + program::line_length(&self.ws, ptr.line_off)? as usize,
                            pos: 0,
                        };
                        continue;
                    }
                }
            }
            if ptr.pos >= payload.len() {
                ptr = StmtAddr {
                    line_off: ptr.line_off
                        + program::line_length(&self.ws, ptr.line_off)? as usize,
                    pos: 0,
                };
                continue;
            }
            // Collect text until the next comma or end of line.
            let mut item = Vec::new();
            let mut pos = ptr.pos;
            while pos < payload.len() && payload[pos] != b',' {
                item.push(payload[pos]);
                pos += 1;
            }
            if pos < payload.len() {
                pos += 1;
            }
            self.data_ptr = Some(StmtAddr { line_off: ptr.line_off, pos });
            return Ok(item);
        }
    }

    fn stmt_read(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        loop {
            let dest = assign::parse_destination(self, cur)?;
            let raw = self.next_data_item()?;
            let text: Vec<u8> = {
                let trimmed: &[u8] = {
                    let start = raw.iter().position(|&b| b != b' ').unwrap_or(raw.len());
                    let end = raw.iter().rposition(|&b| b != b' ').map_or(start, |e| e + 1);
                    &raw[start..end]
                };
                if trimmed.first() == Some(&b'"') && trimmed.last() == Some(&b'"') && trimmed.len() >= 2
                {
                    trimmed[1..trimmed.len() - 1].to_vec()
                } else {
                    trimmed.to_vec()
                }
            };
            let is_string = matches!(
                dest,
                Destination::Scalar { kind: ElementKind::Str, .. }
                    | Destination::Element { kind: ElementKind::Str, .. }
                    | Destination::Substr { .. }
            );
            let value = if is_string {
                Value::Str(BStr::temp(text))
            } else {
                let (neg, digits) = match text.first() {
                    Some(b'-') => (true, &text[1..]),
                    _ => (false, &text[..]),
                };
                match tokens::parse_number(digits) {
                    Ok((Value::Int32(v), _)) => Value::Int32(if neg { -v } else { v }),
                    Ok((Value::Int64(v), _)) => Value::Int64(if neg { -v } else { v }),
                    Ok((Value::Float(f), _)) => Value::Float(if neg { -f } else { f }),
                    _ => return raise(ErrorKind::BadConst),
                }
            };
            assign::plain_assign(self, &dest, value)?;
            if !cur.try_char(b',') {
                return Ok(Flow::Normal);
            }
        }
    }

    // ----- SWAP -----------------------------------------------------

    fn stmt_swap(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let a = assign::parse_destination(self, cur)?;
        cur.expect_char(b',', ErrorKind::ComMiss)?;
        let b = assign::parse_destination(self, cur)?;
        let va = assign::read_destination(self, &a)?;
        let vb = assign::read_destination(self, &b)?;
        if va.is_string() != vb.is_string() {
            return raise(ErrorKind::NoSwap);
        }
        assign::plain_assign(self, &a, vb)?;
        assign::plain_assign(self, &b, va)?;
        Ok(Flow::Normal)
    }

    // ----- definitions ----------------------------------------------

    /// Skip over a DEF PROC/FN body met in sequential flow. The body ends
    /// at ENDPROC (procedures) or at a statement-initial `=` (functions).
    fn stmt_def(&mut self, cur: &mut Cursor) -> BResult<Flow> {
        let is_fn = cur.peek_token() == Some(Token::Fn);
        // The rest of this line first; on it any `=` closes an FN body.
        if line_has_def_end(&cur.bytes, cur.pos, is_fn, true)? {
            return Ok(Flow::NextLine);
        }
        let Some(base) = cur.payload_base else {
            return Ok(Flow::NextLine);
        };
        let mut off = base - LINE_HDR;
        off += program::line_length(&self.ws, off)? as usize;
        loop {
            if program::at_progend(&self.ws, off)? {
                return Ok(Flow::Jump(StmtAddr { line_off: off, pos: 0 }));
            }
            let range = program::payload_range(&self.ws, off)?;
            let payload = self.ws.bytes(range)?.to_vec();
            let len = program::line_length(&self.ws, off)? as usize;
            if line_has_def_end(&payload, 0, is_fn, false)? {
                return Ok(Flow::Jump(StmtAddr { line_off: off + len, pos: 0 }));
            }
            off += len;
        }
    }
}

/// Does this payload (from `pos`) contain the end of a definition body?
fn line_has_def_end(payload: &[u8], mut pos: usize, is_fn: bool, def_line: bool) -> BResult<bool> {
    let mut statement_start = true;
    while pos < payload.len() {
        let (item, next) = tokens::item_at(payload, pos)?;
        match item {
            Item::Token(Token::Endproc) if !is_fn => return Ok(true),
            Item::Char(b'=') if is_fn && (statement_start || def_line) => return Ok(true),
            Item::Char(b':') => statement_start = true,
            Item::Char(b' ') | Item::Pad => {}
            _ => statement_start = false,
        }
        pos = next;
    }
    Ok(false)
}

/// Parse one line as a possible `DEF PROCname(...)` / `DEF FNname(...)`.
fn parse_def_line(
    payload: &[u8],
    want: &str,
    is_fn: bool,
    line_off: usize,
    _payload_base: usize,
    lineno: u16,
    library: Option<usize>,
) -> BResult<Option<ProcDef>> {
    let mut pos = 0;
    // Leading spaces.
    while pos < payload.len() && (payload[pos] == b' ' || payload[pos] == tokens::T_PAD) {
        pos += 1;
    }
    let Ok((Item::Token(Token::Def), next)) = tokens::item_at(payload, pos) else {
        return Ok(None);
    };
    pos = next;
    while pos < payload.len() && (payload[pos] == b' ' || payload[pos] == tokens::T_PAD) {
        pos += 1;
    }
    let want_token = if is_fn { Token::Fn } else { Token::Proc };
    let Ok((Item::Token(t), next)) = tokens::item_at(payload, pos) else {
        return Ok(None);
    };
    if t != want_token {
        return Ok(None);
    }
    pos = next;
    let Ok((Item::VarRef { name, .. }, next)) = tokens::item_at(payload, pos) else {
        return Ok(None);
    };
    if name != want.as_bytes() {
        return Ok(None);
    }
    pos = next;
    // Optional parameter list.
    let skip_blank = |payload: &[u8], mut p: usize| {
        while p < payload.len() && (payload[p] == b' ' || payload[p] == tokens::T_PAD) {
            p += 1;
        }
        p
    };
    let mut params = Vec::new();
    let save = pos;
    let mut cursor_pos = skip_blank(payload, pos);
    let mut ok = true;
    if cursor_pos < payload.len() && payload[cursor_pos] == b'(' {
        cursor_pos += 1;
        loop {
            cursor_pos = skip_blank(payload, cursor_pos);
            let mut mode = ParamMode::Value;
            if let Ok((Item::Token(Token::Return), next)) = tokens::item_at(payload, cursor_pos) {
                mode = ParamMode::Return;
                cursor_pos = skip_blank(payload, next);
            }
            match tokens::item_at(payload, cursor_pos) {
                Ok((Item::VarRef { name, .. }, next)) => {
                    let pname = String::from_utf8_lossy(name).into_owned();
                    params.push(ParamDef {
                        kind: crate::variables::kind_of_name(&pname),
                        name: pname,
                        mode,
                    });
                    cursor_pos = next;
                }
                _ => {
                    ok = false;
                    break;
                }
            }
            cursor_pos = skip_blank(payload, cursor_pos);
            if cursor_pos < payload.len() && payload[cursor_pos] == b',' {
                cursor_pos += 1;
                continue;
            }
            if cursor_pos < payload.len() && payload[cursor_pos] == b')' {
                cursor_pos += 1;
                break;
            }
            ok = false;
            break;
        }
    } else {
        cursor_pos = save;
    }
    let body_pos = if ok { cursor_pos } else { save };
    if !ok {
        params.clear();
    }
    Ok(Some(ProcDef {
        line_off,
        body_pos,
        line_no: lineno,
        params,
        library,
    }))
}

#[cfg(test)]
mod tests;
