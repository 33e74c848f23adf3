//! The immediate-command processor: program management, listing, editing,
//! saving, loading, renumbering, auto-numbering and help.
//!
//! Commands are tokenised into the prefixed command table and dispatched
//! here. While a program is running only the listing commands and HELP
//! are allowed; everything else is refused with `Command`.

use log::debug;

use crate::errors::{BResult, BasicError, ErrorKind, raise};
use crate::eval::Cursor;
use crate::host::LineRead;
use crate::interp::{Flow, Interpreter};
use crate::program;
use crate::tokens::{self, Cmd, Item, LineMode, Listo, Token, LINE_HDR, MAX_LINENO};
use crate::values::Value;
use crate::variables::{Library, VarValue};
use crate::workspace::{align_up, STACK_SAFETY};

const PAGE_LINES: usize = 20;

pub fn exec_command(ip: &mut Interpreter, cmd: Cmd, cur: &mut Cursor) -> BResult<Flow> {
    if ip.running
        && !matches!(
            cmd,
            Cmd::List | Cmd::Listb | Cmd::Listw | Cmd::Listl | Cmd::Listif | Cmd::Listo
                | Cmd::Lvar | Cmd::Help
        )
    {
        return raise(ErrorKind::Command);
    }
    match cmd {
        Cmd::New => cmd_new(ip, cur),
        Cmd::Old => raise(ErrorKind::Unsupported),
        Cmd::Load | Cmd::Textload => {
            let name = parse_filename(cur)?.ok_or_else(|| BasicError::new(ErrorKind::Filename))?;
            load_program(ip, &name)?;
            Ok(Flow::NextLine)
        }
        Cmd::Save | Cmd::Textsave => {
            let inline = parse_filename(cur)?;
            let name = get_savefile(ip, inline)?;
            save_program(ip, &name, Listo::empty())?;
            Ok(Flow::NextLine)
        }
        Cmd::Saveo | Cmd::Textsaveo => {
            let opts = parse_number(cur)?.unwrap_or(0);
            let _ = cur.try_char(b',');
            let inline = parse_filename(cur)?;
            let name = get_savefile(ip, inline)?;
            save_program(ip, &name, Listo::from_bits_truncate(opts as u32))?;
            Ok(Flow::NextLine)
        }
        Cmd::Install => {
            loop {
                let name = parse_filename(cur)?
                    .ok_or_else(|| BasicError::new(ErrorKind::Filename))?;
                install_library(ip, &name)?;
                if !cur.try_char(b',') {
                    break;
                }
            }
            Ok(Flow::NextLine)
        }
        Cmd::List => cmd_list(ip, cur),
        Cmd::Listb => cmd_list_bytes(ip, cur, 1),
        Cmd::Listw => cmd_list_bytes(ip, cur, 4),
        Cmd::Listl => {
            let n = parse_number(cur)?.ok_or_else(|| BasicError::new(ErrorKind::LineNo))? as u16;
            let off = program::find_exact(&ip.ws, n)?
                .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, n as i64))?;
            let text = expand_line(ip, off)?;
            ip.print_line(&text);
            Ok(Flow::Normal)
        }
        Cmd::Listif => cmd_listif(ip, cur),
        Cmd::Listo => {
            let n = parse_number(cur)?.unwrap_or(0);
            ip.listo = Listo::from_bits_truncate(n as u32);
            Ok(Flow::Normal)
        }
        Cmd::Lvar => cmd_lvar(ip, cur),
        Cmd::Renumber => {
            let start = parse_number(cur)?.unwrap_or(10) as u16;
            let step = if cur.try_char(b',') {
                parse_number(cur)?.unwrap_or(10) as u16
            } else {
                10
            };
            program::validate_program(&ip.ws)?;
            program::renumber_program(&mut ip.ws, start, step)?;
            Ok(Flow::NextLine)
        }
        Cmd::Delete => {
            let lo = parse_number(cur)?.ok_or_else(|| BasicError::new(ErrorKind::LineNo))? as u16;
            cur.expect_char(b',', ErrorKind::ComMiss)?;
            let hi = parse_number(cur)?.ok_or_else(|| BasicError::new(ErrorKind::LineNo))? as u16;
            program::delete_range(&mut ip.ws, lo, hi)?;
            ip.vars.clear();
            ip.ws.clear_heap();
            Ok(Flow::NextLine)
        }
        Cmd::Help => cmd_help(ip, cur),
        Cmd::Edit => cmd_edit(ip, cur),
        Cmd::Edito => {
            let n = parse_number(cur)?.unwrap_or(0);
            ip.edit_listo = Listo::from_bits_truncate(n as u32);
            Ok(Flow::Normal)
        }
        Cmd::Auto => cmd_auto(ip, cur),
        Cmd::Crunch => {
            // Accepted for compatibility; this interpreter has nothing to
            // crunch.
            let _ = parse_number(cur)?;
            Ok(Flow::Normal)
        }
        Cmd::Twin | Cmd::Twino => raise(ErrorKind::Unsupported),
    }
}

// ----- argument helpers ---------------------------------------------

/// Command arguments are plain text items; read an unsigned number.
fn parse_number(cur: &mut Cursor) -> BResult<Option<i64>> {
    cur.skip_spaces();
    match cur.read_number()? {
        Some(Value::Int32(v)) => Ok(Some(v as i64)),
        Some(Value::Int64(v)) => Ok(Some(v)),
        Some(Value::Float(f)) => Ok(Some(f as i64)),
        Some(_) => Ok(None),
        None => Ok(None),
    }
}

/// A filename argument: quoted, or bare text up to a comma or line end.
fn parse_filename(cur: &mut Cursor) -> BResult<Option<String>> {
    cur.skip_spaces();
    if let Some((Item::StrCon { content, .. }, next)) = cur.peek()? {
        let name = String::from_utf8_lossy(content).into_owned();
        cur.pos = next;
        return Ok(Some(name));
    }
    let mut name = String::new();
    loop {
        match cur.peek()? {
            Some((Item::Char(c), next)) if c != b',' && c != b':' => {
                name.push(c as char);
                cur.pos = next;
            }
            Some((Item::VarRef { name: n, .. }, next)) => {
                name.push_str(&String::from_utf8_lossy(n));
                cur.pos = next;
            }
            Some((Item::Token(t), next)) => {
                name.push_str(tokens::keyword_text(t));
                cur.pos = next;
            }
            Some((Item::LineRef { value, .. }, next)) => {
                name.push_str(&value.to_string());
                cur.pos = next;
            }
            _ => break,
        }
    }
    let name = name.trim().to_string();
    if name.is_empty() { Ok(None) } else { Ok(Some(name)) }
}

/// Resolve the name a SAVE should use: inline, in-core (`REM >name` on
/// the first line), or the last name used.
pub fn get_savefile(ip: &mut Interpreter, inline: Option<String>) -> BResult<String> {
    if let Some(name) = inline {
        return Ok(name);
    }
    if let Some(name) = incore_name(ip)? {
        return Ok(name);
    }
    if let Some(name) = ip.last_name.clone() {
        return Ok(name);
    }
    raise(ErrorKind::Filename)
}

/// Extract `>name` from a REM on the first program line.
fn incore_name(ip: &Interpreter) -> BResult<Option<String>> {
    let off = ip.ws.page;
    if program::at_progend(&ip.ws, off)? {
        return Ok(None);
    }
    let range = program::payload_range(&ip.ws, off)?;
    let payload = ip.ws.bytes(range)?;
    let mut pos = 0;
    while pos < payload.len() {
        let (item, next) = tokens::item_at(payload, pos)?;
        if item == Item::Token(Token::Rem) {
            let text: String = payload[next..]
                .iter()
                .filter(|&&b| b != tokens::T_PAD)
                .map(|&b| b as char)
                .collect();
            let trimmed = text.trim();
            if let Some(name) = trimmed.strip_prefix('>') {
                let name = name.trim();
                if !name.is_empty() {
                    return Ok(Some(name.to_string()));
                }
            }
            return Ok(None);
        }
        pos = next;
    }
    Ok(None)
}

// ----- NEW ----------------------------------------------------------

fn cmd_new(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Flow> {
    if let Some(size) = parse_number(cur)? {
        ip.ws.resize(size as usize)?;
    }
    program::clear(&mut ip.ws)?;
    ip.vars.clear();
    ip.vars.clear_libraries();
    let limit = ip.ws.stack_limit();
    ip.stack.reinit(limit);
    Ok(Flow::NextLine)
}

// ----- LIST and friends ---------------------------------------------

fn expand_line(ip: &Interpreter, off: usize) -> BResult<String> {
    let n = program::line_number(&ip.ws, off)?;
    let range = program::payload_range(&ip.ws, off)?;
    let payload = ip.ws.bytes(range)?;
    let mut indent = 0;
    tokens::expand(Some(n), payload, ip.listo, &mut indent)
}

/// Page control: returns false when the listing should stop.
fn page_pause(ip: &mut Interpreter, shown: &mut usize) -> BResult<bool> {
    *shown += 1;
    if !ip.listo.contains(Listo::PAGED) || *shown % PAGE_LINES != 0 {
        return Ok(true);
    }
    ip.print("-- More --");
    loop {
        let key = ip.host.keyboard.get_key()?;
        ip.print("\n");
        match key {
            32 => return Ok(true),
            13 | 10 => {
                *shown -= 1;
                return Ok(true);
            }
            27 | -1 => return Ok(false),
            _ => {
                ip.print("-- More --");
            }
        }
    }
}

fn parse_range(cur: &mut Cursor) -> BResult<(u16, u16)> {
    let lo = parse_number(cur)?.unwrap_or(0).clamp(0, MAX_LINENO as i64) as u16;
    let hi = if cur.try_char(b',') {
        parse_number(cur)?.unwrap_or(MAX_LINENO as i64).clamp(0, MAX_LINENO as i64) as u16
    } else if lo == 0 {
        MAX_LINENO
    } else {
        lo
    };
    Ok((lo, hi))
}

fn cmd_list(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Flow> {
    // LIST alone lists everything; LIST n lists one line; LIST a,b a range.
    cur.skip_spaces();
    let (lo, hi) = if cur.at_statement_end() {
        (0, MAX_LINENO)
    } else {
        parse_range(cur)?
    };
    let mut indent = 0usize;
    let mut shown = 0usize;
    let mut off = program::find_line(&ip.ws, lo.max(1))?;
    while !program::at_progend(&ip.ws, off)? {
        let n = program::line_number(&ip.ws, off)?;
        if n > hi {
            break;
        }
        let range = program::payload_range(&ip.ws, off)?;
        let payload = ip.ws.bytes(range)?.to_vec();
        let text = tokens::expand(Some(n), &payload, ip.listo, &mut indent)?;
        ip.print_line(&text);
        ip.check_escape()?;
        if !page_pause(ip, &mut shown)? {
            break;
        }
        off += program::line_length(&ip.ws, off)? as usize;
    }
    Ok(Flow::Normal)
}

/// LISTB / LISTW: dump the stored records of a line range as bytes or
/// 32-bit words.
fn cmd_list_bytes(ip: &mut Interpreter, cur: &mut Cursor, unit: usize) -> BResult<Flow> {
    let lo = parse_number(cur)?.ok_or_else(|| BasicError::new(ErrorKind::LineNo))? as u16;
    cur.expect_char(b',', ErrorKind::ComMiss)?;
    let hi = parse_number(cur)?.ok_or_else(|| BasicError::new(ErrorKind::LineNo))? as u16;
    let mut off = program::find_line(&ip.ws, lo.max(1))?;
    let mut shown = 0usize;
    while !program::at_progend(&ip.ws, off)? {
        let n = program::line_number(&ip.ws, off)?;
        if n > hi {
            break;
        }
        let len = program::line_length(&ip.ws, off)? as usize;
        let record = ip.ws.bytes(off..off + len)?.to_vec();
        let mut text = format!("{n:>5} ({len:>4}) ");
        if unit == 1 {
            for b in &record {
                text.push_str(&format!("{b:02X} "));
            }
        } else {
            for chunk in record.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                text.push_str(&format!("{:08X} ", u32::from_le_bytes(word)));
            }
        }
        ip.print_line(text.trim_end());
        if !page_pause(ip, &mut shown)? {
            break;
        }
        off += len;
    }
    Ok(Flow::Normal)
}

fn cmd_listif(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Flow> {
    cur.skip_spaces();
    let needle = match cur.peek()? {
        Some((Item::StrCon { content, .. }, next)) => {
            let s = String::from_utf8_lossy(content).into_owned();
            cur.pos = next;
            s
        }
        _ => ip.rest_of_statement_text(cur),
    };
    if needle.is_empty() {
        return raise(ErrorKind::Syntax);
    }
    let mut shown = 0usize;
    for off in program::line_offsets(&ip.ws)? {
        let n = program::line_number(&ip.ws, off)?;
        let range = program::payload_range(&ip.ws, off)?;
        let payload = ip.ws.bytes(range)?.to_vec();
        let text = tokens::normalise(Some(n), &payload)?;
        if text.contains(&needle) {
            let mut indent = 0;
            let shown_text = tokens::expand(Some(n), &payload, ip.listo, &mut indent)?;
            ip.print_line(&shown_text);
            if !page_pause(ip, &mut shown)? {
                break;
            }
        }
        ip.check_escape()?;
    }
    Ok(Flow::Normal)
}

fn cmd_lvar(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Flow> {
    cur.skip_spaces();
    // A quoted argument names a library whose definitions to list.
    if let Some((Item::StrCon { content, .. }, next)) = cur.peek()? {
        let name = String::from_utf8_lossy(content).into_owned();
        cur.pos = next;
        let lib = ip
            .vars
            .libraries()
            .iter()
            .find(|l| l.name == name)
            .cloned()
            .ok_or_else(|| BasicError::with_text(ErrorKind::NotFound, &name))?;
        ip.print_line(&format!("Library {}:", lib.name));
        let mut off = lib.base;
        while !program::at_progend(&ip.ws, off)? {
            let range = program::payload_range(&ip.ws, off)?;
            let payload = ip.ws.bytes(range)?.to_vec();
            let mut pos = 0;
            let mut is_def = false;
            while pos < payload.len() {
                let (item, next) = tokens::item_at(&payload, pos)?;
                match item {
                    Item::Token(Token::Def) => is_def = true,
                    Item::Char(b' ') | Item::Pad => {}
                    _ => break,
                }
                pos = next;
            }
            if is_def {
                let n = program::line_number(&ip.ws, off)?;
                let text = tokens::normalise(Some(n), &payload)?;
                ip.print_line(&text);
            }
            off += program::line_length(&ip.ws, off)? as usize;
        }
        return Ok(Flow::Normal);
    }
    let prefix = ip.rest_of_statement_text(cur);
    let mut lines = Vec::new();
    for slot in ip.vars.slots() {
        if !prefix.is_empty() && !slot.name.starts_with(&prefix) {
            continue;
        }
        let rendered = match &slot.value {
            VarValue::Int32(v) => format!("{} = {v}", slot.name),
            VarValue::Int64(v) => format!("{} = {v}", slot.name),
            VarValue::Uint8(v) => format!("{} = {v}", slot.name),
            VarValue::Float(v) => format!("{} = {v}", slot.name),
            VarValue::Str(s) => {
                format!("{} = \"{}\"", slot.name, String::from_utf8_lossy(s))
            }
            VarValue::Array(a) => {
                let dims: Vec<String> = a.shape.bounds.iter().map(|b| b.to_string()).collect();
                format!("{}{})", slot.name, dims.join(","))
            }
            VarValue::Proc(def) => format!("PROC{} (line {})", slot.name, def.line_no),
            VarValue::Fn(def) => format!("FN{} (line {})", slot.name, def.line_no),
        };
        lines.push(rendered);
    }
    for l in lines {
        ip.print_line(&l);
    }
    for (i, name) in ip
        .vars
        .libraries()
        .iter()
        .map(|l| l.name.clone())
        .collect::<Vec<_>>()
        .into_iter()
        .enumerate()
    {
        if i == 0 {
            ip.print_line("Installed libraries:");
        }
        ip.print_line(&format!("  {name}"));
    }
    Ok(Flow::Normal)
}

fn cmd_help(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Flow> {
    cur.skip_spaces();
    let topic = match cur.peek()? {
        Some((Item::StrCon { content, .. }, next)) => {
            let s = String::from_utf8_lossy(content).into_owned();
            cur.pos = next;
            Some(s)
        }
        Some((Item::Char(b'.'), next)) => {
            cur.pos = next;
            None
        }
        _ => None,
    };
    match topic {
        Some(word) => {
            let upper = word.to_ascii_uppercase();
            let known = [
                "AUTO", "CRUNCH", "DELETE", "EDIT", "EDITO", "HELP", "INSTALL", "LIST", "LISTB",
                "LISTIF", "LISTL", "LISTO", "LISTW", "LOAD", "LVAR", "NEW", "OLD", "RENUMBER",
                "SAVE", "SAVEO", "TEXTLOAD", "TEXTSAVE", "TEXTSAVEO", "TWIN", "TWINO",
            ]
            .contains(&upper.as_str());
            if known {
                ip.print_line(&format!("{upper} is an immediate command"));
            } else {
                ip.print_line(&format!("No help for '{word}'"));
            }
        }
        None => {
            ip.print_line("Immediate commands:");
            ip.print_line(
                "  NEW OLD LOAD TEXTLOAD SAVE SAVEO TEXTSAVE TEXTSAVEO INSTALL",
            );
            ip.print_line("  LIST LISTB LISTW LISTL LISTIF LISTO LVAR");
            ip.print_line("  RENUMBER DELETE EDIT EDITO AUTO HELP CRUNCH");
        }
    }
    Ok(Flow::Normal)
}

// ----- LOAD / SAVE --------------------------------------------------

/// Load a text program, replacing the current one. Lines without numbers
/// are auto-numbered after the previous line.
pub fn load_program(ip: &mut Interpreter, name: &str) -> BResult<()> {
    let path = ip
        .find_on_path(name)
        .ok_or_else(|| BasicError::with_text(ErrorKind::NotFound, name))?;
    let text = std::fs::read_to_string(&path)
        .map_err(|_| BasicError::with_text(ErrorKind::CantRead, name))?;
    program::clear(&mut ip.ws)?;
    ip.vars.clear();
    ip.ws.clear_heap();
    let mut last = 0u32;
    for raw in text.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let tok = tokens::tokenize(line, LineMode::HasLine, ip.lower)?;
        let number = match tok.number {
            Some(n) => n as u32,
            None => last + 10,
        };
        if number == 0 || number > MAX_LINENO as u32 || number <= last && tok.number.is_none() {
            return Err(BasicError::with_val(ErrorKind::LineNo, number as i64));
        }
        program::insert_line(&mut ip.ws, number as u16, &tok.payload)?;
        last = number;
    }
    program::validate_program(&ip.ws)?;
    ip.last_name = Some(name.to_string());
    debug!("loaded {} from {path}", name);
    Ok(())
}

/// Save the program as text, one line per source line.
pub fn save_program(ip: &mut Interpreter, name: &str, listo: Listo) -> BResult<()> {
    let mut out = String::new();
    let mut indent = 0usize;
    for off in program::line_offsets(&ip.ws)? {
        let n = program::line_number(&ip.ws, off)?;
        let range = program::payload_range(&ip.ws, off)?;
        let payload = ip.ws.bytes(range)?.to_vec();
        out.push_str(&tokens::expand(Some(n), &payload, listo, &mut indent)?);
        out.push('\n');
    }
    std::fs::write(name, out).map_err(|_| BasicError::with_text(ErrorKind::NotCreated, name))?;
    ip.last_name = Some(name.to_string());
    Ok(())
}

// ----- INSTALL ------------------------------------------------------

/// Install a library: tokenise its lines into a record block carved off
/// the top of the workspace. Its DEF PROC/FN entries become reachable
/// through the call dispatch.
pub fn install_library(ip: &mut Interpreter, name: &str) -> BResult<()> {
    if !ip.stack.is_safe() {
        return raise(ErrorKind::UnsupState);
    }
    let path = ip
        .find_on_path(name)
        .ok_or_else(|| BasicError::with_text(ErrorKind::NotFound, name))?;
    let text = std::fs::read_to_string(&path)
        .map_err(|_| BasicError::with_text(ErrorKind::CantRead, name))?;
    let mut block = Vec::new();
    let mut last = 0u32;
    for raw in text.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let tok = tokens::tokenize(line, LineMode::HasLine, ip.lower)?;
        let number = tok.number.map(|n| n as u32).unwrap_or(last + 10);
        last = number;
        let record_len = LINE_HDR + tok.payload.len();
        block.extend_from_slice(&(number as u16).to_le_bytes());
        block.extend_from_slice(&(record_len as u16).to_le_bytes());
        block.extend_from_slice(&tok.payload);
    }
    // End sentinel.
    block.extend_from_slice(&0u16.to_le_bytes());
    block.extend_from_slice(&(LINE_HDR as u16).to_le_bytes());

    let size = align_up(block.len());
    if ip.ws.himem < ip.ws.vartop + STACK_SAFETY + size {
        return raise(ErrorKind::NoRoom);
    }
    let base = ip.ws.himem - size;
    ip.ws.bytes_mut(base..base + block.len())?.copy_from_slice(&block);
    ip.ws.himem = base;
    let limit = ip.ws.stack_limit();
    ip.stack.reinit(limit);
    ip.vars.add_library(Library { name: name.to_string(), base, size });
    ip.last_name = Some(name.to_string());
    Ok(())
}

// ----- EDIT ---------------------------------------------------------

fn editor_command() -> String {
    std::env::var("BRANDY_EDITOR")
        .or_else(|_| std::env::var("EDITOR"))
        .or_else(|_| std::env::var("VISUAL"))
        .unwrap_or_else(|_| {
            if cfg!(windows) { "notepad".to_string() } else { "vi".to_string() }
        })
}

fn cmd_edit(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Flow> {
    cur.skip_spaces();
    if let Some(n) = parse_number(cur)? {
        // Single-line edit in place.
        let n = n as u16;
        let off = program::find_exact(&ip.ws, n)?
            .ok_or_else(|| BasicError::with_val(ErrorKind::LineMiss, n as i64))?;
        let nrange = program::payload_range(&ip.ws, off)?;
        let payload = ip.ws.bytes(nrange)?.to_vec();
        let mut indent = 0;
        let text = tokens::expand(Some(n), &payload, ip.edit_listo, &mut indent)?;
        match ip.host.keyboard.read_line_edit("", &text)? {
            LineRead::Line(edited) => {
                let tok = tokens::tokenize(&edited, LineMode::HasLine, ip.lower)?;
                match tok.number {
                    Some(num) => ip.edit_line(num, &tok.payload)?,
                    None => {
                        // Number removed: execute it instead.
                        ip.exec_immediate(tok.payload)?;
                    }
                }
            }
            LineRead::Escape => return raise(ErrorKind::Escape),
            LineRead::Eof => {}
        }
        // The statement pointer is gone; take the error transfer home.
        return Err(BasicError::new(ErrorKind::None));
    }
    // Whole-program edit through the external editor.
    let temp = std::env::temp_dir().join(format!("brandy_edit_{}.bas", std::process::id()));
    let temp_name = temp.to_string_lossy().into_owned();
    save_program(ip, &temp_name, ip.edit_listo)?;
    let editor = editor_command();
    let code = ip.host.editor.spawn_editor(&editor, &temp_name)?;
    if code != 0 {
        let _ = std::fs::remove_file(&temp);
        return Err(BasicError::with_text(ErrorKind::EditFail, editor));
    }
    load_program(ip, &temp_name)?;
    let _ = std::fs::remove_file(&temp);
    ip.last_name = None;
    Err(BasicError::new(ErrorKind::None))
}

// ----- AUTO ---------------------------------------------------------

fn cmd_auto(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Flow> {
    let start = parse_number(cur)?.unwrap_or(10).clamp(1, MAX_LINENO as i64) as u16;
    let step = if cur.try_char(b',') {
        parse_number(cur)?.unwrap_or(10).clamp(1, MAX_LINENO as i64) as u16
    } else {
        10
    };
    let mut n = start as u32;
    loop {
        if n > MAX_LINENO as u32 {
            return Err(BasicError::with_val(ErrorKind::LineNo, n as i64));
        }
        let prefill = format!("{n} ");
        match ip.host.keyboard.read_line_edit("", &prefill)? {
            LineRead::Line(line) => {
                let tok = tokens::tokenize(&line, LineMode::HasLine, ip.lower)?;
                match tok.number {
                    Some(num) => ip.edit_line(num, &tok.payload)?,
                    None => continue,
                }
            }
            // AUTO leaves through the error transfer; whatever the caller
            // had in flight is deliberately abandoned.
            LineRead::Escape => return raise(ErrorKind::Escape),
            LineRead::Eof => return Err(BasicError::new(ErrorKind::None)),
        }
        n += step as u32;
    }
}

/// Helper used by LISTIF and LVAR for bare-text arguments.
impl Interpreter {
    pub fn rest_of_statement_text(&self, cur: &mut Cursor) -> String {
        let mut out = String::new();
        loop {
            match cur.peek() {
                Ok(Some((Item::Char(b':'), _))) => break,
                Ok(Some((Item::Char(c), next))) => {
                    out.push(c as char);
                    cur.pos = next;
                }
                Ok(Some((Item::VarRef { name, .. }, next))) => {
                    out.push_str(&String::from_utf8_lossy(name));
                    cur.pos = next;
                }
                Ok(Some((Item::Token(t), next))) => {
                    out.push_str(tokens::keyword_text(t));
                    cur.pos = next;
                }
                Ok(Some((Item::Cmd(c), next))) => {
                    out.push_str(tokens::command_text(c));
                    cur.pos = next;
                }
                Ok(Some((Item::StrCon { content, .. }, next))) => {
                    out.push('"');
                    out.push_str(&String::from_utf8_lossy(content));
                    out.push('"');
                    cur.pos = next;
                }
                Ok(Some((Item::LineRef { value, .. }, next))) => {
                    out.push_str(&value.to_string());
                    cur.pos = next;
                }
                Ok(Some((Item::Pad, next))) => {
                    cur.pos = next;
                }
                _ => break,
            }
        }
        out.trim().to_string()
    }
}

/// Used by RUN-from-line and the `-load` CLI flag.
pub fn load_and_maybe_run(ip: &mut Interpreter, file: &str, run: bool) -> BResult<()> {
    load_program(ip, file)?;
    if run {
        ip.run_program(None)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TestHost;

    fn make_interp(input: Vec<&str>) -> (Interpreter, std::rc::Rc<std::cell::RefCell<String>>) {
        let (host, output, _) = TestHost::new(input);
        let ip = Interpreter::new(crate::workspace::MIN_SIZE, host).unwrap();
        (ip, output)
    }

    fn feed(ip: &mut Interpreter, line: &str) {
        ip.process_line(line).unwrap();
    }

    #[test]
    fn save_name_resolution_order() {
        let (mut ip, _) = make_interp(vec![]);
        // No program, no names at all.
        assert_eq!(
            get_savefile(&mut ip, None).unwrap_err().kind,
            ErrorKind::Filename
        );
        // In-core name from a first-line REM.
        feed(&mut ip, "10 REM >kept.bas");
        assert_eq!(get_savefile(&mut ip, None).unwrap(), "kept.bas");
        // Inline wins over everything.
        assert_eq!(
            get_savefile(&mut ip, Some("given.bas".into())).unwrap(),
            "given.bas"
        );
        // Last-used name when there is no in-core name.
        feed(&mut ip, "10 PRINT 1");
        ip.last_name = Some("old.bas".into());
        assert_eq!(get_savefile(&mut ip, None).unwrap(), "old.bas");
    }

    #[test]
    fn listif_matches_expanded_text() {
        let (mut ip, out) = make_interp(vec![]);
        feed(&mut ip, "10 PRINT \"alpha\"");
        feed(&mut ip, "20 PRINT \"beta\"");
        feed(&mut ip, "LISTIF alpha");
        assert!(out.borrow().contains("10 PRINT \"alpha\""));
        assert!(!out.borrow().contains("20"));
    }

    #[test]
    fn commands_refused_while_running() {
        let (mut ip, _) = make_interp(vec![]);
        feed(&mut ip, "10 PRINT 1");
        ip.running = true;
        let err = ip.process_line("NEW").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Command);
        ip.running = false;
    }

    #[test]
    fn auto_inserts_lines_until_escape() {
        let (mut ip, _) = make_interp(vec!["PRINT 1", "PRINT 2", "<ESC>"]);
        let err = ip.process_line("AUTO 10,10").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Escape);
        let listing: Vec<String> = program::line_offsets(&ip.ws)
            .unwrap()
            .into_iter()
            .map(|off| {
                let n = program::line_number(&ip.ws, off).unwrap();
                let payload = ip
                    .ws
                    .bytes(program::payload_range(&ip.ws, off).unwrap())
                    .unwrap();
                tokens::normalise(Some(n), payload).unwrap()
            })
            .collect();
        assert_eq!(listing, vec!["10 PRINT 1", "20 PRINT 2"]);
    }

    #[test]
    fn new_with_size_resizes_the_workspace() {
        let (mut ip, _) = make_interp(vec![]);
        feed(&mut ip, "NEW 131072");
        assert_eq!(ip.ws.size(), 131072);
    }
}
