//! The line store: tokenised program lines held between PAGE and TOP.
//!
//! Records are the §3.2 layout of `tokens`: a 4-byte header (line number,
//! record length) then the payload. A header with line number 0 is the
//! program-end sentinel; TOP points just past it. Lines are kept in
//! strictly ascending order and every mutation either leaves the program
//! parseable or rolls back.

use log::debug;

use crate::errors::{BResult, BasicError, ErrorKind, raise};
use crate::tokens::{self, Item, LINE_HDR, MAXSTATELEN, MAX_LINENO, MINSTATELEN};
use crate::workspace::Workspace;

/// Size of the end-of-program sentinel record.
const ENDMARKSIZE: usize = LINE_HDR;

/// Reset the store to an empty program.
pub fn clear(ws: &mut Workspace) -> BResult<()> {
    ws.clear_program();
    let page = ws.page;
    ws.open_gap(page, ENDMARKSIZE as isize)?;
    ws.write_u16(page, 0)?;
    ws.write_u16(page + 2, ENDMARKSIZE as u16)?;
    Ok(())
}

pub fn line_number(ws: &Workspace, off: usize) -> BResult<u16> {
    ws.read_u16(off)
}

pub fn line_length(ws: &Workspace, off: usize) -> BResult<u16> {
    ws.read_u16(off + 2)
}

pub fn at_progend(ws: &Workspace, off: usize) -> BResult<bool> {
    Ok(line_number(ws, off)? == 0)
}

/// Byte range of a line's payload.
pub fn payload_range(ws: &Workspace, off: usize) -> BResult<std::ops::Range<usize>> {
    let len = line_length(ws, off)? as usize;
    Ok(off + LINE_HDR..off + len)
}

/// Offset of the first line with number >= `n`, or of the end sentinel.
pub fn find_line(ws: &Workspace, n: u16) -> BResult<usize> {
    let mut off = ws.page;
    loop {
        let lineno = line_number(ws, off)?;
        if lineno == 0 || lineno >= n {
            return Ok(off);
        }
        off += line_length(ws, off)? as usize;
    }
}

/// Offset of the line numbered exactly `n`, if present.
pub fn find_exact(ws: &Workspace, n: u16) -> BResult<Option<usize>> {
    let off = find_line(ws, n)?;
    if !at_progend(ws, off)? && line_number(ws, off)? == n {
        Ok(Some(off))
    } else {
        Ok(None)
    }
}

/// Offsets of every stored line, in order.
pub fn line_offsets(ws: &Workspace) -> BResult<Vec<usize>> {
    let mut offs = Vec::new();
    let mut off = ws.page;
    while !at_progend(ws, off)? {
        offs.push(off);
        off += line_length(ws, off)? as usize;
    }
    Ok(offs)
}

/// Zero the variable caches of every stored line. Called after any
/// mutation, since record offsets (and so slot bindings) may have moved.
fn unbind_all(ws: &mut Workspace) -> BResult<()> {
    for off in line_offsets(ws)? {
        let range = payload_range(ws, off)?;
        tokens::clear_var_caches(ws.bytes_mut(range)?)?;
    }
    Ok(())
}

fn commit(ws: &mut Workspace) -> BResult<()> {
    unbind_all(ws)?;
    #[cfg(feature = "runtime_checks")]
    validate_program(ws)?;
    Ok(())
}

/// Insert or replace the line numbered `n`. An empty payload deletes it.
pub fn insert_line(ws: &mut Workspace, n: u16, payload: &[u8]) -> BResult<()> {
    if n == 0 || n > MAX_LINENO {
        return Err(BasicError::with_val(ErrorKind::LineNo, n as i64));
    }
    let record_len = LINE_HDR + payload.len();
    if !payload.is_empty() && (record_len < MINSTATELEN || record_len > MAXSTATELEN) {
        return raise(ErrorKind::StateLen);
    }
    let at = find_line(ws, n)?;
    let existing = !at_progend(ws, at)? && line_number(ws, at)? == n;

    if existing {
        let old_len = line_length(ws, at)? as usize;
        if payload.is_empty() {
            ws.open_gap(at + old_len, -(old_len as isize))?;
            return commit(ws);
        }
        let delta = record_len as isize - old_len as isize;
        ws.open_gap(at + old_len, delta)?;
    } else {
        if payload.is_empty() {
            return Ok(());
        }
        ws.open_gap(at, record_len as isize)?;
    }

    ws.write_u16(at, n)?;
    ws.write_u16(at + 2, record_len as u16)?;
    ws.bytes_mut(at + LINE_HDR..at + record_len)?.copy_from_slice(payload);
    commit(ws)
}

/// Delete every line numbered within `[lo, hi]`.
pub fn delete_range(ws: &mut Workspace, lo: u16, hi: u16) -> BResult<()> {
    let start = find_line(ws, lo)?;
    let mut end = start;
    loop {
        let lineno = line_number(ws, end)?;
        if lineno == 0 || lineno > hi {
            break;
        }
        end += line_length(ws, end)? as usize;
    }
    if end > start {
        ws.open_gap(end, -((end - start) as isize))?;
        commit(ws)?;
    }
    Ok(())
}

/// Rewrite every line number as `start + i*step` and remap the embedded
/// GOTO/GOSUB/RESTORE targets. A target with no matching line raises
/// `Renumber` and the program is left untouched.
pub fn renumber_program(ws: &mut Workspace, start: u16, step: u16) -> BResult<()> {
    let offsets = line_offsets(ws)?;
    if offsets.is_empty() {
        return Ok(());
    }
    if step == 0 {
        return raise(ErrorKind::Silly);
    }
    let last = start as u64 + (offsets.len() as u64 - 1) * step as u64;
    if start == 0 || last > MAX_LINENO as u64 {
        return Err(BasicError::with_val(ErrorKind::LineNo, last as i64));
    }

    let mut map = std::collections::HashMap::new();
    for (i, &off) in offsets.iter().enumerate() {
        map.insert(line_number(ws, off)?, start + i as u16 * step);
    }

    let snapshot = ws.bytes(ws.page..ws.top)?.to_vec();

    for (i, &off) in offsets.iter().enumerate() {
        ws.write_u16(off, start + i as u16 * step)?;
    }
    for &off in &offsets {
        let range = payload_range(ws, off)?;
        let payload = ws.bytes(range.clone())?.to_vec();
        let mut pos = 0;
        while pos < payload.len() {
            let (item, next) = tokens::item_at(&payload, pos)?;
            if let Item::LineRef { value, field_off } = item {
                match map.get(&value) {
                    Some(&new) => ws.write_u16(range.start + field_off, new)?,
                    None => {
                        let page = ws.page;
                        ws.bytes_mut(page..page + snapshot.len())?.copy_from_slice(&snapshot);
                        debug!("renumber rolled back: no line {value}");
                        return Err(BasicError::with_val(ErrorKind::Renumber, value as i64));
                    }
                }
            }
            pos = next;
        }
    }
    commit(ws)
}

/// Walk the whole store checking the record invariants.
pub fn validate_program(ws: &Workspace) -> BResult<()> {
    let mut off = ws.page;
    let mut prev = 0u16;
    loop {
        let lineno = line_number(ws, off)?;
        let len = line_length(ws, off)? as usize;
        if lineno == 0 {
            if len != ENDMARKSIZE || off + len != ws.top {
                return raise(ErrorKind::BadProg);
            }
            return Ok(());
        }
        if lineno > MAX_LINENO || len < MINSTATELEN || len > MAXSTATELEN {
            return raise(ErrorKind::BadProg);
        }
        if prev != 0 && lineno <= prev {
            return raise(ErrorKind::BadProg);
        }
        let payload = ws.bytes(off + LINE_HDR..off + len)?;
        let mut pos = 0;
        while pos < payload.len() {
            let (_, next) = tokens::item_at(payload, pos).map_err(|_| BasicError::new(ErrorKind::BadProg))?;
            pos = next;
        }
        if pos != payload.len() {
            return raise(ErrorKind::BadProg);
        }
        prev = lineno;
        off += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{tokenize, normalise, LineMode};
    use crate::workspace::MIN_SIZE;

    fn ws_with(lines: &[&str]) -> Workspace {
        let mut ws = Workspace::init(MIN_SIZE).unwrap();
        clear(&mut ws).unwrap();
        for src in lines {
            let t = tokenize(src, LineMode::HasLine, false).unwrap();
            insert_line(&mut ws, t.number.unwrap(), &t.payload).unwrap();
        }
        ws
    }

    fn listing(ws: &Workspace) -> Vec<String> {
        line_offsets(ws)
            .unwrap()
            .into_iter()
            .map(|off| {
                let n = line_number(ws, off).unwrap();
                let payload = ws.bytes(payload_range(ws, off).unwrap()).unwrap();
                normalise(Some(n), payload).unwrap()
            })
            .collect()
    }

    #[test]
    fn lines_stay_ordered_regardless_of_entry_order() {
        let ws = ws_with(&["30 PRINT 3", "10 PRINT 1", "20 PRINT 2"]);
        assert_eq!(listing(&ws), vec!["10 PRINT 1", "20 PRINT 2", "30 PRINT 3"]);
        validate_program(&ws).unwrap();
    }

    #[test]
    fn replacing_and_deleting_lines() {
        let mut ws = ws_with(&["10 PRINT 1", "20 PRINT 2"]);
        let t = tokenize("10 PRINT 99", LineMode::HasLine, false).unwrap();
        insert_line(&mut ws, 10, &t.payload).unwrap();
        assert_eq!(listing(&ws), vec!["10 PRINT 99", "20 PRINT 2"]);
        insert_line(&mut ws, 10, &[]).unwrap();
        assert_eq!(listing(&ws), vec!["20 PRINT 2"]);
        validate_program(&ws).unwrap();
    }

    #[test]
    fn delete_range_is_inclusive() {
        let mut ws = ws_with(&["10 PRINT 1", "20 PRINT 2", "30 PRINT 3", "40 PRINT 4"]);
        delete_range(&mut ws, 20, 30).unwrap();
        assert_eq!(listing(&ws), vec!["10 PRINT 1", "40 PRINT 4"]);
    }

    #[test]
    fn find_line_returns_first_at_or_after() {
        let ws = ws_with(&["10 PRINT 1", "30 PRINT 3"]);
        let off = find_line(&ws, 20).unwrap();
        assert_eq!(line_number(&ws, off).unwrap(), 30);
        assert!(find_exact(&ws, 20).unwrap().is_none());
        assert!(find_exact(&ws, 30).unwrap().is_some());
        let end = find_line(&ws, 65279).unwrap();
        assert!(at_progend(&ws, end).unwrap());
    }

    #[test]
    fn renumber_rewrites_targets_consistently() {
        let mut ws = ws_with(&["10 GOTO 20", "20 PRINT \"x\""]);
        renumber_program(&mut ws, 100, 100).unwrap();
        assert_eq!(listing(&ws), vec!["100 GOTO 200", "200 PRINT \"x\""]);
    }

    #[test]
    fn renumber_missing_target_rolls_back() {
        let mut ws = ws_with(&["10 GOTO 50", "20 PRINT \"x\""]);
        let before = listing(&ws);
        let err = renumber_program(&mut ws, 100, 10).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Renumber);
        assert_eq!(listing(&ws), before);
        validate_program(&ws).unwrap();
    }

    #[test]
    fn renumber_overflow_is_refused() {
        let mut ws = ws_with(&["10 PRINT 1", "20 PRINT 2"]);
        assert_eq!(
            renumber_program(&mut ws, 65270, 100).unwrap_err().kind,
            ErrorKind::LineNo
        );
    }

    #[test]
    fn empty_program_validates() {
        let mut ws = Workspace::init(MIN_SIZE).unwrap();
        clear(&mut ws).unwrap();
        validate_program(&ws).unwrap();
        assert_eq!(line_offsets(&ws).unwrap(), Vec::<usize>::new());
    }
}
