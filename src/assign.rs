//! The assignment engine.
//!
//! An assignment statement is parsed into a destination (the `typeinfo`
//! of the dialect: scalar, array, indirection or pseudo-variable shapes)
//! and an operator, then dispatched through a nested match over the two.
//! The match arms are the former per-operator dispatch tables; ill-typed
//! combinations land on the bad-type arms (`BadArith`, `BadBitwise`).

use log::trace;

use crate::errors::{BResult, BasicError, ErrorKind, raise};
use crate::eval::{self, Cursor};
use crate::interp::Interpreter;
use crate::pseudovars;
use crate::tokens::{Item, Token};
use crate::values::{
    narrow64, toint32, toint64, ArrayData, BStr, ElementKind, Value, MAXSTRING,
};
use crate::variables::{static_index, VarValue, AT_PERCENT};

/// Poll cadence inside long element loops.
const ESCAPE_POLL: usize = 64 * 1024;

/// Indirection shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndKind {
    Byte,
    Word32,
    Float,
    DolStr,
    Word64,
}

/// Substring-assignment functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFunc {
    Left,
    Mid,
    Right,
}

/// Where a substring assignment's base string lives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubBase {
    Var(usize),
    Addr(usize),
}

/// The left-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    StaticInt(usize),
    AtPercent,
    Scalar { slot: usize, kind: ElementKind },
    Element { slot: usize, flat: usize, kind: ElementKind },
    WholeArray { slot: usize, kind: ElementKind },
    Indirect { kind: IndKind, addr: usize },
    Substr { base: SubBase, func: SubFunc, n: Option<i32>, p: i32 },
    Himem,
    Lomem,
    Page,
    Time,
    TimeDol,
    FilepathDol,
    Ptr(i32),
    Ext(i32),
}

impl Destination {
    /// The stable destination-kind code used in diagnostics.
    pub fn typeinfo(&self) -> u8 {
        match self {
            Destination::StaticInt(_) | Destination::AtPercent => 2,
            Destination::Scalar { kind, .. } | Destination::Element { kind, .. } => {
                kind.scalar_code()
            }
            Destination::WholeArray { kind, .. } => kind.array_code(),
            Destination::Indirect { kind, .. } => match kind {
                IndKind::Byte => 17,
                IndKind::Word32 => 18,
                IndKind::Float => 19,
                IndKind::DolStr => 21,
                IndKind::Word64 => 22,
            },
            Destination::Substr { .. } => 4,
            _ => 2,
        }
    }
}

/// The assignment operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Plus,
    Minus,
    And,
    Or,
    Eor,
    Mod,
    Div,
}

/// Parse the destination of an assignment statement.
pub fn parse_destination(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Destination> {
    cur.skip_spaces();
    let Some((item, next)) = cur.peek()? else {
        return raise(ErrorKind::NameMiss);
    };
    match item {
        Item::VarRef { name, cache_off } => {
            let name = String::from_utf8_lossy(name).into_owned();
            cur.pos = next;
            if cur.try_char(b'(') {
                let array_name = format!("{name}(");
                let slot = ip
                    .vars
                    .lookup(&array_name)
                    .ok_or_else(|| BasicError::with_text(ErrorKind::VarMiss, &array_name))?;
                if cur.try_char(b')') {
                    let kind = ip.vars.array(slot)?.kind;
                    return Ok(Destination::WholeArray { slot, kind });
                }
                let indexes = eval::index_list(ip, cur)?;
                let arr = ip.vars.array(slot)?;
                let flat = arr.shape.flatten(&indexes)?;
                return Ok(Destination::Element { slot, flat, kind: arr.kind });
            }
            if let Some(idx) = static_index(&name) {
                if idx == AT_PERCENT {
                    return Ok(Destination::AtPercent);
                }
                return Ok(Destination::StaticInt(idx));
            }
            let kind = crate::variables::kind_of_name(&name);
            let slot = ip.resolve_or_create(cur, &name, cache_off);
            Ok(Destination::Scalar { slot, kind })
        }
        Item::Char(c @ (b'?' | b'!' | b'|' | b'$' | b']')) => {
            cur.pos = next;
            eval::factor(ip, cur)?;
            let addr = ip.stack.pop_anynum64()? as usize;
            let kind = match c {
                b'?' => IndKind::Byte,
                b'!' => IndKind::Word32,
                b'|' => IndKind::Float,
                b'$' => IndKind::DolStr,
                _ => IndKind::Word64,
            };
            Ok(Destination::Indirect { kind, addr })
        }
        Item::Token(t) => {
            cur.pos = next;
            match t {
                Token::Himem => Ok(Destination::Himem),
                Token::Lomem => Ok(Destination::Lomem),
                Token::Page => Ok(Destination::Page),
                Token::Time => Ok(Destination::Time),
                Token::TimeDol => Ok(Destination::TimeDol),
                Token::FilepathDol => Ok(Destination::FilepathDol),
                Token::Ptr => {
                    cur.expect_char(b'#', ErrorKind::HashMiss)?;
                    eval::factor(ip, cur)?;
                    Ok(Destination::Ptr(ip.stack.pop_anynum32()?))
                }
                Token::Ext => {
                    cur.expect_char(b'#', ErrorKind::HashMiss)?;
                    eval::factor(ip, cur)?;
                    Ok(Destination::Ext(ip.stack.pop_anynum32()?))
                }
                Token::LeftDol => parse_substr(ip, cur, SubFunc::Left),
                Token::MidDol => parse_substr(ip, cur, SubFunc::Mid),
                Token::RightDol => parse_substr(ip, cur, SubFunc::Right),
                _ => raise(ErrorKind::UnsuitableVar),
            }
        }
        _ => raise(ErrorKind::NameMiss),
    }
}

/// Parse `LEFT$(v [,n])`, `MID$(v, p [,n])`, `RIGHT$(v [,n])` as an
/// assignment target.
fn parse_substr(ip: &mut Interpreter, cur: &mut Cursor, func: SubFunc) -> BResult<Destination> {
    cur.skip_spaces();
    let base = match cur.peek()? {
        Some((Item::VarRef { name, cache_off }, next)) => {
            let name = String::from_utf8_lossy(name).into_owned();
            cur.pos = next;
            if !name.ends_with('$') {
                return Err(BasicError::with_text(ErrorKind::UnsuitableVar, name));
            }
            let slot = ip.resolve_variable(cur, &name, cache_off)?;
            SubBase::Var(slot)
        }
        Some((Item::Char(b'$'), next)) => {
            cur.pos = next;
            eval::factor(ip, cur)?;
            SubBase::Addr(ip.stack.pop_anynum64()? as usize)
        }
        _ => return raise(ErrorKind::NameMiss),
    };
    let mut p = 1;
    let mut n = None;
    if func == SubFunc::Mid {
        cur.expect_char(b',', ErrorKind::ComMiss)?;
        p = eval::eval_numeric32(ip, cur)?;
        if p < 1 {
            p = 1;
        }
    }
    if cur.try_char(b',') {
        n = Some(eval::eval_numeric32(ip, cur)?);
    }
    cur.expect_char(b')', ErrorKind::RpMiss)?;
    Ok(Destination::Substr { base, func, n, p })
}

/// Parse the assignment operator after the destination.
pub fn parse_assign_op(cur: &mut Cursor) -> BResult<AssignOp> {
    cur.skip_spaces();
    if cur.try_char(b'=') {
        return Ok(AssignOp::Assign);
    }
    if cur.try_char(b'+') {
        cur.expect_char(b'=', ErrorKind::EqMiss)?;
        return Ok(AssignOp::Plus);
    }
    if cur.try_char(b'-') {
        cur.expect_char(b'=', ErrorKind::EqMiss)?;
        return Ok(AssignOp::Minus);
    }
    for (token, op) in [
        (Token::And, AssignOp::And),
        (Token::Or, AssignOp::Or),
        (Token::Eor, AssignOp::Eor),
        (Token::Mod, AssignOp::Mod),
        (Token::Div, AssignOp::Div),
    ] {
        if cur.try_token(token) {
            cur.expect_char(b'=', ErrorKind::EqMiss)?;
            return Ok(op);
        }
    }
    raise(ErrorKind::EqMiss)
}

/// Execute one assignment statement from the cursor.
pub fn exec_assignment(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    let dest = parse_destination(ip, cur)?;
    let op = parse_assign_op(cur)?;
    trace!("assign typeinfo {} op {:?}", dest.typeinfo(), op);
    match &dest {
        Destination::WholeArray { slot, kind } => {
            return array_assign(ip, cur, *slot, *kind, op);
        }
        Destination::AtPercent if op == AssignOp::Assign => {
            let value = eval::eval_value(ip, cur)?;
            if let Value::Str(s) = value {
                pseudovars::assign_at_string(ip, &s.bytes);
            } else {
                ip.stack.push(value)?;
                ip.vars.statics[AT_PERCENT] = ip.stack.pop_anynum32()?;
            }
            return Ok(());
        }
        _ => {}
    }
    let value = eval::eval_value(ip, cur)?;
    apply_to_destination(ip, &dest, op, value)
}

/// Plain `=` assignment of an already evaluated value, for READ, INPUT
/// and FOR initialisation.
pub fn plain_assign(ip: &mut Interpreter, dest: &Destination, value: Value) -> BResult<()> {
    apply_to_destination(ip, dest, AssignOp::Assign, value)
}

fn apply_to_destination(
    ip: &mut Interpreter,
    dest: &Destination,
    op: AssignOp,
    value: Value,
) -> BResult<()> {
    match dest {
        Destination::StaticInt(idx) => {
            let old = ip.vars.statics[*idx];
            ip.vars.statics[*idx] = scalar_int32(op, old, value)?;
            Ok(())
        }
        Destination::AtPercent => {
            let old = ip.vars.statics[AT_PERCENT];
            ip.vars.statics[AT_PERCENT] = scalar_int32(op, old, value)?;
            Ok(())
        }
        Destination::Scalar { slot, kind } => scalar_assign(ip, *slot, *kind, op, value),
        Destination::Element { slot, flat, kind } => {
            element_assign(ip, *slot, *flat, *kind, op, value)
        }
        Destination::WholeArray { slot, kind } => {
            // Only reached through plain_assign.
            let _ = (slot, kind);
            Err(BasicError::broken("assign: array destination out of band"))
        }
        Destination::Indirect { kind, addr } => indirect_assign(ip, *kind, *addr, op, value),
        Destination::Substr { base, func, n, p } => {
            if op != AssignOp::Assign {
                return raise(ErrorKind::Syntax);
            }
            substr_assign(ip, base, *func, *n, *p, value)
        }
        Destination::Himem => {
            only_assign(op)?;
            let v = push_pop64(ip, value)?;
            pseudovars::assign_himem(ip, v)
        }
        Destination::Lomem => {
            only_assign(op)?;
            let v = push_pop64(ip, value)?;
            pseudovars::assign_lomem(ip, v)
        }
        Destination::Page => {
            only_assign(op)?;
            let v = push_pop64(ip, value)?;
            pseudovars::assign_page(ip, v)
        }
        Destination::Time => {
            only_assign(op)?;
            let v = push_pop64(ip, value)?;
            ip.host.clock.write_time(v);
            Ok(())
        }
        Destination::TimeDol => {
            only_assign(op)?;
            let s = as_string(value)?;
            let text = String::from_utf8_lossy(&s.bytes).into_owned();
            ip.host.clock.write_time_string(&text)
        }
        Destination::FilepathDol => {
            only_assign(op)?;
            let s = as_string(value)?;
            ip.filepath = String::from_utf8_lossy(&s.bytes).into_owned();
            Ok(())
        }
        Destination::Ptr(h) => {
            only_assign(op)?;
            let v = push_pop64(ip, value)?;
            ip.host.files.set_ptr(*h, v)
        }
        Destination::Ext(h) => {
            only_assign(op)?;
            let v = push_pop64(ip, value)?;
            ip.host.files.set_ext(*h, v)
        }
    }
}

fn only_assign(op: AssignOp) -> BResult<()> {
    if op == AssignOp::Assign {
        Ok(())
    } else {
        raise(ErrorKind::Syntax)
    }
}

fn as_string(value: Value) -> BResult<BStr> {
    match value {
        Value::Str(s) => Ok(s),
        _ => raise(ErrorKind::TypeStr),
    }
}

fn push_pop64(ip: &mut Interpreter, value: Value) -> BResult<i64> {
    ip.stack.push(value)?;
    ip.stack.pop_anynum64()
}

fn push_popfp(ip: &mut Interpreter, value: Value) -> BResult<f64> {
    ip.stack.push(value)?;
    ip.stack.pop_anynumfp()
}

fn scalar_int32(op: AssignOp, old: i32, value: Value) -> BResult<i32> {
    let rhs = coerce_check(&value)?;
    Ok(match op {
        AssignOp::Assign => rhs,
        AssignOp::Plus => old.wrapping_add(rhs),
        AssignOp::Minus => old.wrapping_sub(rhs),
        AssignOp::And => old & rhs,
        AssignOp::Or => old | rhs,
        AssignOp::Eor => old ^ rhs,
        AssignOp::Mod => {
            if rhs == 0 {
                return raise(ErrorKind::DivZero);
            }
            old.wrapping_rem(rhs)
        }
        AssignOp::Div => {
            if rhs == 0 {
                return raise(ErrorKind::DivZero);
            }
            old.wrapping_div(rhs)
        }
    })
}

fn scalar_int64(ip: &mut Interpreter, op: AssignOp, old: i64, value: Value) -> BResult<i64> {
    if matches!(value, Value::Str(_)) {
        return raise(ErrorKind::TypeNum);
    }
    let rhs = push_pop64(ip, value)?;
    Ok(match op {
        AssignOp::Assign => rhs,
        AssignOp::Plus => old.wrapping_add(rhs),
        AssignOp::Minus => old.wrapping_sub(rhs),
        AssignOp::And => old & rhs,
        AssignOp::Or => old | rhs,
        AssignOp::Eor => old ^ rhs,
        AssignOp::Mod => {
            if rhs == 0 {
                return raise(ErrorKind::DivZero);
            }
            old.wrapping_rem(rhs)
        }
        AssignOp::Div => {
            if rhs == 0 {
                return raise(ErrorKind::DivZero);
            }
            old.wrapping_div(rhs)
        }
    })
}

fn scalar_float(ip: &mut Interpreter, op: AssignOp, old: f64, value: Value) -> BResult<f64> {
    if matches!(value, Value::Str(_)) {
        return raise(ErrorKind::TypeNum);
    }
    match op {
        AssignOp::Assign => push_popfp(ip, value),
        AssignOp::Plus => Ok(old + push_popfp(ip, value)?),
        AssignOp::Minus => Ok(old - push_popfp(ip, value)?),
        // Bitwise and integer ops on a float go through INT64 and back,
        // losing precision above 2^53 as the dialect does.
        AssignOp::And | AssignOp::Or | AssignOp::Eor | AssignOp::Mod | AssignOp::Div => {
            let a = toint64(old)?;
            let b = push_pop64(ip, value)?;
            let v = match op {
                AssignOp::And => a & b,
                AssignOp::Or => a | b,
                AssignOp::Eor => a ^ b,
                AssignOp::Mod => {
                    if b == 0 {
                        return raise(ErrorKind::DivZero);
                    }
                    a.wrapping_rem(b)
                }
                AssignOp::Div => {
                    if b == 0 {
                        return raise(ErrorKind::DivZero);
                    }
                    a.wrapping_div(b)
                }
                _ => unreachable!(),
            };
            Ok(v as f64)
        }
    }
}

fn scalar_uint8(op: AssignOp, old: u8, value: Value) -> BResult<u8> {
    let v = scalar_int32(op, old as i32, value)?;
    Ok(v as u8)
}

/// String scalar semantics: adoption of temporaries, self-assignment
/// fast path, bounded append.
fn string_assign(
    ip: &mut Interpreter,
    slot: usize,
    op: AssignOp,
    value: Value,
) -> BResult<()> {
    let rhs = match value {
        Value::Str(s) => s,
        _ => return raise(ErrorKind::TypeStr),
    };
    match op {
        AssignOp::Assign => {
            if !rhs.temp && rhs.source == Some(slot) {
                // a$ = a$ leaves the storage alone.
                return Ok(());
            }
            // A temporary's storage is adopted; anything else is copied.
            let bytes = rhs.bytes;
            match &mut ip.vars.slot_mut(slot)?.value {
                VarValue::Str(dst) => *dst = bytes,
                _ => return raise(ErrorKind::TypeStr),
            }
            Ok(())
        }
        AssignOp::Plus => {
            match &mut ip.vars.slot_mut(slot)?.value {
                VarValue::Str(dst) => {
                    if dst.len() + rhs.bytes.len() > MAXSTRING {
                        return raise(ErrorKind::StringLen);
                    }
                    dst.extend_from_slice(&rhs.bytes);
                }
                _ => return raise(ErrorKind::TypeStr),
            }
            Ok(())
        }
        AssignOp::Minus | AssignOp::Mod | AssignOp::Div => raise(ErrorKind::BadArith),
        AssignOp::And | AssignOp::Or | AssignOp::Eor => raise(ErrorKind::BadBitwise),
    }
}

fn scalar_assign(
    ip: &mut Interpreter,
    slot: usize,
    kind: ElementKind,
    op: AssignOp,
    value: Value,
) -> BResult<()> {
    match kind {
        ElementKind::Str => string_assign(ip, slot, op, value),
        ElementKind::Int32 => {
            let old = match ip.vars.slot(slot)?.value {
                VarValue::Int32(v) => v,
                _ => 0,
            };
            let new = scalar_int32(op, old, value)?;
            ip.vars.slot_mut(slot)?.value = VarValue::Int32(new);
            Ok(())
        }
        ElementKind::Int64 => {
            let old = match ip.vars.slot(slot)?.value {
                VarValue::Int64(v) => v,
                _ => 0,
            };
            let new = scalar_int64(ip, op, old, value)?;
            ip.vars.slot_mut(slot)?.value = VarValue::Int64(new);
            Ok(())
        }
        ElementKind::Uint8 => {
            let old = match ip.vars.slot(slot)?.value {
                VarValue::Uint8(v) => v,
                _ => 0,
            };
            let new = scalar_uint8(op, old, value)?;
            ip.vars.slot_mut(slot)?.value = VarValue::Uint8(new);
            Ok(())
        }
        ElementKind::Float => {
            let old = match ip.vars.slot(slot)?.value {
                VarValue::Float(v) => v,
                _ => 0.0,
            };
            let new = scalar_float(ip, op, old, value)?;
            ip.vars.slot_mut(slot)?.value = VarValue::Float(new);
            Ok(())
        }
    }
}

fn element_assign(
    ip: &mut Interpreter,
    slot: usize,
    flat: usize,
    kind: ElementKind,
    op: AssignOp,
    value: Value,
) -> BResult<()> {
    match kind {
        ElementKind::Int32 => {
            let old = match &ip.vars.array(slot)?.data {
                ArrayData::Int32(d) => d[flat],
                _ => return Err(BasicError::broken("assign: element kind mismatch")),
            };
            let new = scalar_int32(op, old, value)?;
            if let ArrayData::Int32(d) = &mut ip.vars.array_mut(slot)?.data {
                d[flat] = new;
            }
            Ok(())
        }
        ElementKind::Int64 => {
            let old = match &ip.vars.array(slot)?.data {
                ArrayData::Int64(d) => d[flat],
                _ => return Err(BasicError::broken("assign: element kind mismatch")),
            };
            let new = scalar_int64(ip, op, old, value)?;
            if let ArrayData::Int64(d) = &mut ip.vars.array_mut(slot)?.data {
                d[flat] = new;
            }
            Ok(())
        }
        ElementKind::Uint8 => {
            let old = match &ip.vars.array(slot)?.data {
                ArrayData::Uint8(d) => d[flat],
                _ => return Err(BasicError::broken("assign: element kind mismatch")),
            };
            let new = scalar_uint8(op, old, value)?;
            if let ArrayData::Uint8(d) = &mut ip.vars.array_mut(slot)?.data {
                d[flat] = new;
            }
            Ok(())
        }
        ElementKind::Float => {
            let old = match &ip.vars.array(slot)?.data {
                ArrayData::Float(d) => d[flat],
                _ => return Err(BasicError::broken("assign: element kind mismatch")),
            };
            let new = scalar_float(ip, op, old, value)?;
            if let ArrayData::Float(d) = &mut ip.vars.array_mut(slot)?.data {
                d[flat] = new;
            }
            Ok(())
        }
        ElementKind::Str => {
            if op == AssignOp::Assign || op == AssignOp::Plus {
                let rhs = as_string(value)?;
                if let ArrayData::Str(d) = &mut ip.vars.array_mut(slot)?.data {
                    if op == AssignOp::Assign {
                        d[flat] = rhs.bytes;
                    } else {
                        if d[flat].len() + rhs.bytes.len() > MAXSTRING {
                            return raise(ErrorKind::StringLen);
                        }
                        d[flat].extend_from_slice(&rhs.bytes);
                    }
                }
                Ok(())
            } else if matches!(op, AssignOp::And | AssignOp::Or | AssignOp::Eor) {
                raise(ErrorKind::BadBitwise)
            } else {
                raise(ErrorKind::BadArith)
            }
        }
    }
}

fn indirect_assign(
    ip: &mut Interpreter,
    kind: IndKind,
    addr: usize,
    op: AssignOp,
    value: Value,
) -> BResult<()> {
    match kind {
        IndKind::Byte => {
            let old = ip.ws.read_byte(addr)? as i32;
            let new = scalar_int32(op, old, value)?;
            ip.ws.write_byte(addr, new as u8)?;
            ip.note_write(addr, 1);
            Ok(())
        }
        IndKind::Word32 => {
            let old = ip.ws.read_word32(addr)?;
            let new = scalar_int32(op, old, value)?;
            ip.ws.write_word32(addr, new)?;
            ip.note_write(addr, 4);
            Ok(())
        }
        IndKind::Word64 => {
            let old = ip.ws.read_word64(addr)?;
            let new = scalar_int64(ip, op, old, value)?;
            ip.ws.write_word64(addr, new)?;
            ip.note_write(addr, 8);
            Ok(())
        }
        IndKind::Float => {
            let old = ip.ws.read_float(addr)?;
            let new = scalar_float(ip, op, old, value)?;
            ip.ws.write_float(addr, new)?;
            ip.note_write(addr, 8);
            Ok(())
        }
        IndKind::DolStr => {
            let rhs = as_string(value)?;
            match op {
                AssignOp::Assign => {
                    ip.ws.write_cstring(addr, &rhs.bytes)?;
                    ip.note_write(addr, rhs.bytes.len() + 1);
                    Ok(())
                }
                AssignOp::Plus => {
                    let existing = ip.ws.read_cstring(addr)?;
                    let at = addr + existing.len();
                    ip.ws.write_cstring(at, &rhs.bytes)?;
                    ip.note_write(at, rhs.bytes.len() + 1);
                    Ok(())
                }
                AssignOp::Minus | AssignOp::Mod | AssignOp::Div => raise(ErrorKind::BadArith),
                AssignOp::And | AssignOp::Or | AssignOp::Eor => raise(ErrorKind::BadBitwise),
            }
        }
    }
}

/// Overwrite-in-place substring assignment. The base string never
/// changes length.
fn substr_assign(
    ip: &mut Interpreter,
    base: &SubBase,
    func: SubFunc,
    n: Option<i32>,
    p: i32,
    value: Value,
) -> BResult<()> {
    let rhs = as_string(value)?;
    let mut bytes = match base {
        SubBase::Var(slot) => match &ip.vars.slot(*slot)?.value {
            VarValue::Str(b) => b.clone(),
            _ => return raise(ErrorKind::TypeStr),
        },
        SubBase::Addr(addr) => ip.ws.read_cstring(*addr)?,
    };
    let slen = bytes.len();
    // Negative counts mean "omit"; zero is taken as 1.
    let n = match n {
        Some(v) if v < 0 => MAXSTRING,
        Some(0) => 1,
        Some(v) => v as usize,
        None => MAXSTRING,
    };
    let (start, count) = match func {
        SubFunc::Left => (0, n.min(rhs.bytes.len()).min(slen)),
        SubFunc::Right => {
            let count = n.min(rhs.bytes.len()).min(slen);
            (slen - count, count)
        }
        SubFunc::Mid => {
            let start = (p as usize - 1).min(slen);
            let count = n.min(rhs.bytes.len()).min(slen - start);
            (start, count)
        }
    };
    bytes[start..start + count].copy_from_slice(&rhs.bytes[..count]);
    match base {
        SubBase::Var(slot) => {
            if let VarValue::Str(dst) = &mut ip.vars.slot_mut(*slot)?.value {
                *dst = bytes;
            }
        }
        SubBase::Addr(addr) => {
            let range = *addr..*addr + bytes.len();
            ip.ws.bytes_mut(range)?.copy_from_slice(&bytes);
            ip.note_write(*addr, bytes.len());
        }
    }
    Ok(())
}

/// Whole-array assignment: scalar fill, comma list, or array source. The
/// input shape is told by the tag the expression left on top of the
/// stack: array tags (10 and up) mean a copy or elementwise source,
/// scalar tags a fill or comma list.
fn array_assign(
    ip: &mut Interpreter,
    cur: &mut Cursor,
    slot: usize,
    kind: ElementKind,
    op: AssignOp,
) -> BResult<()> {
    eval::expression(ip, cur)?;
    let tag = ip.stack.top_code();
    let first = ip.stack.pop_value()?;

    // Comma list: only plain `=` accepts it.
    if tag < 10 && cur.peek_char() == Some(b',') {
        if op != AssignOp::Assign {
            return raise(ErrorKind::Syntax);
        }
        let count = ip.vars.array(slot)?.data.len();
        store_element(ip, slot, kind, 0, first)?;
        let mut index = 1usize;
        while cur.try_char(b',') {
            if index >= count {
                return Err(BasicError::with_val(ErrorKind::BadIndex, index as i64));
            }
            let v = eval::eval_value(ip, cur)?;
            store_element(ip, slot, kind, index, v)?;
            index += 1;
        }
        return Ok(());
    }

    match first {
        Value::ArrayRef { slot: src, .. } => {
            let data = ip.vars.array(src)?.data.clone();
            let shape = ip.vars.array(src)?.shape.clone();
            array_from_array(ip, slot, kind, shape, data, op)
        }
        Value::ArrayTemp(t) => array_from_array(ip, slot, kind, t.shape, t.data, op),
        scalar => array_broadcast(ip, slot, kind, op, scalar),
    }
}

fn store_element(
    ip: &mut Interpreter,
    slot: usize,
    kind: ElementKind,
    flat: usize,
    value: Value,
) -> BResult<()> {
    element_assign(ip, slot, flat, kind, AssignOp::Assign, value)
}

/// Shape 1: broadcast one scalar over every element.
fn array_broadcast(
    ip: &mut Interpreter,
    slot: usize,
    kind: ElementKind,
    op: AssignOp,
    value: Value,
) -> BResult<()> {
    let count = ip.vars.array(slot)?.data.len();
    if kind == ElementKind::Str {
        let rhs = as_string(value)?;
        if !matches!(op, AssignOp::Assign | AssignOp::Plus) {
            return if matches!(op, AssignOp::And | AssignOp::Or | AssignOp::Eor) {
                raise(ErrorKind::BadBitwise)
            } else {
                raise(ErrorKind::BadArith)
            };
        }
        if let ArrayData::Str(d) = &mut ip.vars.array_mut(slot)?.data {
            for cell in d.iter_mut() {
                if op == AssignOp::Assign {
                    *cell = rhs.bytes.clone();
                } else {
                    if cell.len() + rhs.bytes.len() > MAXSTRING {
                        return raise(ErrorKind::StringLen);
                    }
                    cell.extend_from_slice(&rhs.bytes);
                }
            }
        }
        return Ok(());
    }
    for i in 0..count {
        if i % ESCAPE_POLL == 0 && i > 0 {
            ip.check_escape()?;
        }
        element_assign(ip, slot, i, kind, op, value.clone())?;
    }
    Ok(())
}

/// Shape 3: array-to-array, exact shape match required.
fn array_from_array(
    ip: &mut Interpreter,
    slot: usize,
    kind: ElementKind,
    src_shape: crate::values::ArrayShape,
    src_data: ArrayData,
    op: AssignOp,
) -> BResult<()> {
    let dst_shape = ip.vars.array(slot)?.shape.clone();
    if dst_shape != src_shape {
        return raise(ErrorKind::TypeArray);
    }
    if op == AssignOp::Assign && src_data.kind() == kind {
        // Identical element kinds: bulk copy.
        ip.vars.array_mut(slot)?.data = src_data;
        return Ok(());
    }
    let count = src_data.len();
    for i in 0..count {
        if i % ESCAPE_POLL == 0 && i > 0 {
            ip.check_escape()?;
        }
        let v = element_of(&src_data, i);
        element_assign(ip, slot, i, kind, op, v)?;
    }
    Ok(())
}

fn element_of(data: &ArrayData, i: usize) -> Value {
    match data {
        ArrayData::Int32(d) => Value::Int32(d[i]),
        ArrayData::Float(d) => Value::Float(d[i]),
        ArrayData::Int64(d) => Value::Int64(d[i]),
        ArrayData::Uint8(d) => Value::Uint8(d[i]),
        ArrayData::Str(d) => Value::Str(BStr::literal(d[i].clone())),
    }
}

/// The coercion contract at a 32-bit destination: INT64 sources must fit
/// signed-32 bounds, floats round half away from zero, UINT8 zero-extends.
/// Every INT32-shaped store (scalars, elements, statics, indirection)
/// funnels through this.
pub fn coerce_check(value: &Value) -> BResult<i32> {
    match value {
        Value::Int32(v) => Ok(*v),
        Value::Uint8(v) => Ok(*v as i32),
        Value::Int64(v) => narrow64(*v),
        Value::Float(f) => toint32(*f),
        _ => raise(ErrorKind::TypeNum),
    }
}

/// Read back a scalar-shaped destination (FOR and SWAP need this).
pub fn read_destination(ip: &Interpreter, dest: &Destination) -> BResult<Value> {
    match dest {
        Destination::StaticInt(idx) => Ok(Value::Int32(ip.vars.statics[*idx])),
        Destination::AtPercent => Ok(Value::Int32(ip.vars.statics[AT_PERCENT])),
        Destination::Scalar { slot, .. } => match &ip.vars.slot(*slot)?.value {
            VarValue::Int32(v) => Ok(Value::Int32(*v)),
            VarValue::Float(v) => Ok(Value::Float(*v)),
            VarValue::Int64(v) => Ok(Value::Int64(*v)),
            VarValue::Uint8(v) => Ok(Value::Uint8(*v)),
            VarValue::Str(b) => Ok(Value::Str(BStr::borrowed(b.clone(), *slot))),
            _ => raise(ErrorKind::UnsuitableVar),
        },
        Destination::Element { slot, flat, .. } => {
            Ok(element_of(&ip.vars.array(*slot)?.data, *flat))
        }
        _ => raise(ErrorKind::ForVariable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_codes_are_stable() {
        let scalar = |kind| Destination::Scalar { slot: 0, kind };
        assert_eq!(scalar(ElementKind::Int32).typeinfo(), 2);
        assert_eq!(scalar(ElementKind::Float).typeinfo(), 3);
        assert_eq!(scalar(ElementKind::Str).typeinfo(), 4);
        assert_eq!(scalar(ElementKind::Int64).typeinfo(), 6);
        assert_eq!(scalar(ElementKind::Uint8).typeinfo(), 7);
        let array = |kind| Destination::WholeArray { slot: 0, kind };
        assert_eq!(array(ElementKind::Int32).typeinfo(), 10);
        assert_eq!(array(ElementKind::Float).typeinfo(), 11);
        assert_eq!(array(ElementKind::Str).typeinfo(), 12);
        assert_eq!(array(ElementKind::Int64).typeinfo(), 14);
        assert_eq!(array(ElementKind::Uint8).typeinfo(), 15);
        let ind = |kind| Destination::Indirect { kind, addr: 0 };
        assert_eq!(ind(IndKind::Byte).typeinfo(), 17);
        assert_eq!(ind(IndKind::Word32).typeinfo(), 18);
        assert_eq!(ind(IndKind::Float).typeinfo(), 19);
        assert_eq!(ind(IndKind::DolStr).typeinfo(), 21);
        assert_eq!(ind(IndKind::Word64).typeinfo(), 22);
    }

    #[test]
    fn coercion_contract_at_the_assignment_boundary() {
        assert_eq!(coerce_check(&Value::Int64(i32::MAX as i64)).unwrap(), i32::MAX);
        assert_eq!(coerce_check(&Value::Int64(i32::MIN as i64)).unwrap(), i32::MIN);
        assert_eq!(
            coerce_check(&Value::Int64(i32::MAX as i64 + 1)).unwrap_err().kind,
            ErrorKind::Range
        );
        assert_eq!(coerce_check(&Value::Float(2.5)).unwrap(), 3);
        assert_eq!(coerce_check(&Value::Uint8(255)).unwrap(), 255);
    }
}
