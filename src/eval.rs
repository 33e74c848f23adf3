//! The expression evaluator: recursive descent over the dialect's
//! precedence ladder, reading token items from a [`Cursor`] and pushing
//! results onto the value stack as the most specific kind.
//!
//! Array arithmetic yields an owned array temporary; string concatenation
//! yields an owned string temporary. Evaluation never touches the program
//! store.

use crate::errors::{BResult, BasicError, ErrorKind, raise};
use crate::interp::Interpreter;
use crate::printfmt;
use crate::tokens::{self, Item, Token};
use crate::values::{toint64, ArrayData, ArrayShape, ArrayTemp, BStr, Value, MAXSTRING};
use crate::variables::{static_index, VarValue};

/// Poll the escape flag this often inside long element loops.
pub const ESCAPE_POLL: usize = 64 * 1024;

/// A statement stream: an owned copy of one line's payload plus the
/// workspace offset it came from (None for immediate lines), which is
/// where variable-cache patches land.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub bytes: Vec<u8>,
    pub pos: usize,
    pub payload_base: Option<usize>,
    pub lineno: u16,
}

impl Cursor {
    pub fn immediate(bytes: Vec<u8>) -> Cursor {
        Cursor { bytes, pos: 0, payload_base: None, lineno: 0 }
    }

    pub fn stored(bytes: Vec<u8>, payload_base: usize, lineno: u16) -> Cursor {
        Cursor { bytes, pos: 0, payload_base: Some(payload_base), lineno }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the item at the current position without consuming it.
    pub fn peek(&self) -> BResult<Option<(Item<'_>, usize)>> {
        let mut pos = self.pos;
        loop {
            if pos >= self.bytes.len() {
                return Ok(None);
            }
            let (item, next) = tokens::item_at(&self.bytes, pos)?;
            if item == Item::Pad {
                pos = next;
                continue;
            }
            return Ok(Some((item, next)));
        }
    }

    pub fn skip_spaces(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b' ' | tokens::T_PAD => self.pos += 1,
                _ => break,
            }
        }
    }

    /// Next significant character, if the next item is a plain char.
    pub fn peek_char(&mut self) -> Option<u8> {
        self.skip_spaces();
        match self.peek() {
            Ok(Some((Item::Char(c), _))) => Some(c),
            _ => None,
        }
    }

    pub fn try_char(&mut self, want: u8) -> bool {
        self.skip_spaces();
        if let Ok(Some((Item::Char(c), next))) = self.peek() {
            if c == want {
                self.pos = next;
                return true;
            }
        }
        false
    }

    pub fn expect_char(&mut self, want: u8, err: ErrorKind) -> BResult<()> {
        if self.try_char(want) {
            Ok(())
        } else {
            Err(BasicError::new(err))
        }
    }

    pub fn peek_token(&mut self) -> Option<Token> {
        self.skip_spaces();
        match self.peek() {
            Ok(Some((Item::Token(t), _))) => Some(t),
            _ => None,
        }
    }

    pub fn try_token(&mut self, want: Token) -> bool {
        self.skip_spaces();
        if let Ok(Some((Item::Token(t), next))) = self.peek() {
            if t == want {
                self.pos = next;
                return true;
            }
        }
        false
    }

    /// True at end of statement: line end, `:` or an ELSE clause.
    pub fn at_statement_end(&mut self) -> bool {
        self.skip_spaces();
        match self.peek() {
            Ok(None) => true,
            Ok(Some((Item::Char(b':'), _))) => true,
            Ok(Some((Item::Token(Token::Else), _))) => true,
            _ => false,
        }
    }

    /// Consume a numeric literal starting at the cursor, if one is there.
    pub fn read_number(&mut self) -> BResult<Option<Value>> {
        self.skip_spaces();
        if self.pos >= self.bytes.len() {
            return Ok(None);
        }
        let b = self.bytes[self.pos];
        let starts = b.is_ascii_digit()
            || b == b'.'
            || (b == b'&' || b == b'%') && self.bytes.get(self.pos + 1).is_some();
        if !starts {
            return Ok(None);
        }
        match tokens::parse_number(&self.bytes[self.pos..]) {
            Ok((v, used)) => {
                self.pos += used;
                Ok(Some(v))
            }
            Err(e) if b == b'&' || b == b'%' => Err(e),
            Err(_) => Ok(None),
        }
    }
}

/// Evaluate one expression and leave its value on the stack.
pub fn expression(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    or_level(ip, cur)
}

/// Evaluate and pop, for callers that want the value directly.
pub fn eval_value(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Value> {
    expression(ip, cur)?;
    ip.stack.pop_value()
}

pub fn eval_numeric_fp(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<f64> {
    expression(ip, cur)?;
    ip.stack.pop_anynumfp()
}

pub fn eval_numeric32(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<i32> {
    expression(ip, cur)?;
    ip.stack.pop_anynum32()
}

pub fn eval_numeric64(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<i64> {
    expression(ip, cur)?;
    ip.stack.pop_anynum64()
}

pub fn eval_string(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<BStr> {
    expression(ip, cur)?;
    ip.stack.pop_string()
}

fn or_level(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    and_level(ip, cur)?;
    loop {
        if cur.try_token(Token::Or) {
            and_level(ip, cur)?;
            apply_bitwise(ip, BitOp::Or)?;
        } else if cur.try_token(Token::Eor) {
            and_level(ip, cur)?;
            apply_bitwise(ip, BitOp::Eor)?;
        } else {
            return Ok(());
        }
    }
}

fn and_level(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    compare_level(ip, cur)?;
    while cur.try_token(Token::And) {
        compare_level(ip, cur)?;
        apply_bitwise(ip, BitOp::And)?;
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Rel {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

fn compare_level(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    shift_level(ip, cur)?;
    loop {
        cur.skip_spaces();
        let rel = if cur.try_char(b'=') {
            Rel::Eq
        } else if cur.peek_char() == Some(b'<') {
            // Distinguish <, <=, <> and << (shift handled below us).
            let save = cur.pos;
            cur.try_char(b'<');
            if cur.try_char(b'=') {
                Rel::Le
            } else if cur.try_char(b'>') {
                Rel::Ne
            } else if cur.peek_char() == Some(b'<') {
                cur.pos = save;
                return Ok(());
            } else {
                Rel::Lt
            }
        } else if cur.peek_char() == Some(b'>') {
            let save = cur.pos;
            cur.try_char(b'>');
            if cur.try_char(b'=') {
                Rel::Ge
            } else if cur.peek_char() == Some(b'>') {
                cur.pos = save;
                return Ok(());
            } else {
                Rel::Gt
            }
        } else {
            return Ok(());
        };
        shift_level(ip, cur)?;
        apply_compare(ip, rel)?;
    }
}

fn shift_level(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    add_level(ip, cur)?;
    loop {
        cur.skip_spaces();
        let save = cur.pos;
        if cur.try_char(b'<') && cur.try_char(b'<') {
            add_level(ip, cur)?;
            let shift = ip.stack.pop_anynum32()? & 63;
            let v = ip.stack.pop_anynum64()?;
            push_int_result(ip, v.wrapping_shl(shift as u32))?;
            continue;
        }
        cur.pos = save;
        if cur.try_char(b'>') && cur.try_char(b'>') {
            let logical = cur.try_char(b'>');
            add_level(ip, cur)?;
            let shift = ip.stack.pop_anynum32()? & 63;
            let v = ip.stack.pop_anynum64()?;
            let out = if logical {
                ((v as u64) >> shift) as i64
            } else {
                v >> shift
            };
            push_int_result(ip, out)?;
            continue;
        }
        cur.pos = save;
        return Ok(());
    }
}

fn add_level(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    mul_level(ip, cur)?;
    loop {
        if cur.try_char(b'+') {
            mul_level(ip, cur)?;
            apply_add(ip)?;
        } else if cur.try_char(b'-') {
            mul_level(ip, cur)?;
            apply_arith(ip, Arith::Sub)?;
        } else {
            return Ok(());
        }
    }
}

fn mul_level(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    power_level(ip, cur)?;
    loop {
        if cur.try_char(b'*') {
            power_level(ip, cur)?;
            apply_arith(ip, Arith::Mul)?;
        } else if cur.try_char(b'/') {
            power_level(ip, cur)?;
            apply_arith(ip, Arith::FDiv)?;
        } else if cur.try_token(Token::Div) {
            power_level(ip, cur)?;
            apply_arith(ip, Arith::IDiv)?;
        } else if cur.try_token(Token::Mod) {
            power_level(ip, cur)?;
            apply_arith(ip, Arith::Mod)?;
        } else {
            return Ok(());
        }
    }
}

fn power_level(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    factor(ip, cur)?;
    while cur.try_char(b'^') {
        factor(ip, cur)?;
        let exp = ip.stack.pop_anynumfp()?;
        let base = ip.stack.pop_anynumfp()?;
        let v = base.powf(exp);
        if !v.is_finite() {
            return raise(ErrorKind::Arithmetic);
        }
        ip.stack.push_float(v)?;
    }
    Ok(())
}

fn push_int_result(ip: &mut Interpreter, v: i64) -> BResult<()> {
    if let Ok(small) = i32::try_from(v) {
        ip.stack.push_int(small)
    } else {
        ip.stack.push_int64(v)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Arith {
    Sub,
    Mul,
    FDiv,
    IDiv,
    Mod,
}

#[derive(Clone, Copy, PartialEq)]
enum BitOp {
    And,
    Or,
    Eor,
}

fn numeric_pair(ip: &mut Interpreter) -> BResult<(Value, Value)> {
    let right = ip.stack.pop_value()?;
    let left = ip.stack.pop_value()?;
    Ok((left, right))
}

fn is_array(v: &Value) -> bool {
    matches!(v, Value::ArrayRef { .. } | Value::ArrayTemp(_))
}

/// `+` is addition or concatenation depending on the operands.
fn apply_add(ip: &mut Interpreter) -> BResult<()> {
    let (left, right) = numeric_pair(ip)?;
    match (&left, &right) {
        (Value::Str(a), Value::Str(b)) => {
            if a.bytes.len() + b.bytes.len() > MAXSTRING {
                return raise(ErrorKind::StringLen);
            }
            let mut bytes = a.bytes.clone();
            bytes.extend_from_slice(&b.bytes);
            ip.stack.push_string(BStr::temp(bytes))
        }
        (Value::Str(_), _) | (_, Value::Str(_)) => raise(ErrorKind::TypeNum),
        _ if is_array(&left) || is_array(&right) => {
            let out = array_binary(ip, left, right, b'+')?;
            ip.stack.push(Value::ArrayTemp(out))
        }
        _ => {
            ip.stack.push(left)?;
            ip.stack.push(right)?;
            apply_arith(ip, ArithAdd)
        }
    }
}

/// Marker so `apply_arith` can share the scalar addition path.
#[derive(Clone, Copy)]
struct ArithAdd;

trait ArithLike {
    fn ints(self, a: i64, b: i64) -> BResult<i64>;
    fn floats(self, a: f64, b: f64) -> BResult<f64>;
    fn is_float_only(self) -> bool
    where
        Self: Sized,
    {
        false
    }
}

impl ArithLike for ArithAdd {
    fn ints(self, a: i64, b: i64) -> BResult<i64> {
        Ok(a.wrapping_add(b))
    }

    fn floats(self, a: f64, b: f64) -> BResult<f64> {
        Ok(a + b)
    }
}

impl ArithLike for Arith {
    fn ints(self, a: i64, b: i64) -> BResult<i64> {
        match self {
            Arith::Sub => Ok(a.wrapping_sub(b)),
            Arith::Mul => Ok(a.wrapping_mul(b)),
            Arith::IDiv => {
                if b == 0 {
                    return raise(ErrorKind::DivZero);
                }
                Ok(a.wrapping_div(b))
            }
            Arith::Mod => {
                if b == 0 {
                    return raise(ErrorKind::DivZero);
                }
                Ok(a.wrapping_rem(b))
            }
            Arith::FDiv => unreachable!(),
        }
    }

    fn floats(self, a: f64, b: f64) -> BResult<f64> {
        match self {
            Arith::Sub => Ok(a - b),
            Arith::Mul => Ok(a * b),
            Arith::FDiv => {
                if b == 0.0 {
                    return raise(ErrorKind::DivZero);
                }
                Ok(a / b)
            }
            Arith::IDiv | Arith::Mod => {
                let a = toint64(a)?;
                let b = toint64(b)?;
                if b == 0 {
                    return raise(ErrorKind::DivZero);
                }
                Ok(if self == Arith::IDiv { (a / b) as f64 } else { (a % b) as f64 })
            }
        }
    }

    fn is_float_only(self) -> bool {
        self == Arith::FDiv
    }
}

fn scalar_arith<A: ArithLike + Copy>(op: A, left: &Value, right: &Value) -> BResult<Value> {
    let float = op.is_float_only()
        || matches!(left, Value::Float(_))
        || matches!(right, Value::Float(_));
    if float {
        let a = scalar_fp(left)?;
        let b = scalar_fp(right)?;
        Ok(Value::Float(op.floats(a, b)?))
    } else {
        let a = scalar_i64(left)?;
        let b = scalar_i64(right)?;
        let v = op.ints(a, b)?;
        let wide = matches!(left, Value::Int64(_)) || matches!(right, Value::Int64(_));
        if !wide {
            // 32-bit operands wrap in 32 bits.
            Ok(Value::Int32(v as i32))
        } else {
            Ok(Value::Int64(v))
        }
    }
}

fn scalar_fp(v: &Value) -> BResult<f64> {
    match v {
        Value::Int32(v) => Ok(*v as f64),
        Value::Int64(v) => Ok(*v as f64),
        Value::Uint8(v) => Ok(*v as f64),
        Value::Float(f) => Ok(*f),
        _ => raise(ErrorKind::TypeNum),
    }
}

fn scalar_i64(v: &Value) -> BResult<i64> {
    match v {
        Value::Int32(v) => Ok(*v as i64),
        Value::Int64(v) => Ok(*v),
        Value::Uint8(v) => Ok(*v as i64),
        Value::Float(f) => toint64(*f),
        _ => raise(ErrorKind::TypeNum),
    }
}

fn apply_arith(ip: &mut Interpreter, op: impl ArithLike + Copy + Into<ArithKind>) -> BResult<()> {
    let (left, right) = numeric_pair(ip)?;
    if is_array(&left) || is_array(&right) {
        let symbol = op.into().symbol();
        let out = array_binary(ip, left, right, symbol)?;
        return ip.stack.push(Value::ArrayTemp(out));
    }
    let v = scalar_arith(op, &left, &right)?;
    ip.stack.push(v)
}

/// Which concrete operation an `ArithLike` stands for, so the array path
/// can re-dispatch elementwise.
#[derive(Clone, Copy)]
enum ArithKind {
    Add,
    Sub,
    Mul,
    FDiv,
    IDiv,
    Mod,
}

impl ArithKind {
    fn symbol(self) -> u8 {
        match self {
            ArithKind::Add => b'+',
            ArithKind::Sub => b'-',
            ArithKind::Mul => b'*',
            ArithKind::FDiv => b'/',
            ArithKind::IDiv => b'\\',
            ArithKind::Mod => b'%',
        }
    }
}

impl From<ArithAdd> for ArithKind {
    fn from(_: ArithAdd) -> Self {
        ArithKind::Add
    }
}

impl From<Arith> for ArithKind {
    fn from(a: Arith) -> Self {
        match a {
            Arith::Sub => ArithKind::Sub,
            Arith::Mul => ArithKind::Mul,
            Arith::FDiv => ArithKind::FDiv,
            Arith::IDiv => ArithKind::IDiv,
            Arith::Mod => ArithKind::Mod,
        }
    }
}

/// Fetch an array operand's shape and float elements.
fn array_operand(ip: &Interpreter, v: &Value) -> BResult<Option<(ArrayShape, Vec<f64>)>> {
    match v {
        Value::ArrayRef { slot, .. } => {
            let arr = ip.vars.array(*slot)?;
            let elems = match &arr.data {
                ArrayData::Int32(d) => d.iter().map(|&x| x as f64).collect(),
                ArrayData::Float(d) => d.clone(),
                ArrayData::Int64(d) => d.iter().map(|&x| x as f64).collect(),
                ArrayData::Uint8(d) => d.iter().map(|&x| x as f64).collect(),
                ArrayData::Str(_) => return raise(ErrorKind::NumArray),
            };
            Ok(Some((arr.shape.clone(), elems)))
        }
        Value::ArrayTemp(t) => {
            let elems = match &t.data {
                ArrayData::Int32(d) => d.iter().map(|&x| x as f64).collect(),
                ArrayData::Float(d) => d.clone(),
                ArrayData::Int64(d) => d.iter().map(|&x| x as f64).collect(),
                ArrayData::Uint8(d) => d.iter().map(|&x| x as f64).collect(),
                ArrayData::Str(_) => return raise(ErrorKind::NumArray),
            };
            Ok(Some((t.shape.clone(), elems)))
        }
        _ => Ok(None),
    }
}

/// Elementwise array arithmetic; scalars broadcast. The result is always
/// a float array temporary whose storage the consumer owns.
fn array_binary(ip: &mut Interpreter, left: Value, right: Value, op: u8) -> BResult<ArrayTemp> {
    let la = array_operand(ip, &left)?;
    let ra = array_operand(ip, &right)?;
    let (shape, a, b): (ArrayShape, Vec<f64>, Vec<f64>) = match (la, ra) {
        (Some((ls, le)), Some((rs, re))) => {
            if ls != rs {
                return raise(ErrorKind::TypeArray);
            }
            (ls, le, re)
        }
        (Some((ls, le)), None) => {
            let s = scalar_fp(&right)?;
            let n = le.len();
            (ls, le, vec![s; n])
        }
        (None, Some((rs, re))) => {
            let s = scalar_fp(&left)?;
            let n = re.len();
            (rs, vec![s; n], re)
        }
        (None, None) => return Err(BasicError::broken("eval: array op without arrays")),
    };
    let mut out = Vec::with_capacity(a.len());
    for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
        if i % ESCAPE_POLL == 0 {
            ip.check_escape()?;
        }
        let v = match op {
            b'+' => x + y,
            b'-' => x - y,
            b'*' => x * y,
            b'/' => {
                if y == 0.0 {
                    return raise(ErrorKind::DivZero);
                }
                x / y
            }
            b'\\' => {
                let d = toint64(y)?;
                if d == 0 {
                    return raise(ErrorKind::DivZero);
                }
                (toint64(x)? / d) as f64
            }
            b'%' => {
                let d = toint64(y)?;
                if d == 0 {
                    return raise(ErrorKind::DivZero);
                }
                (toint64(x)? % d) as f64
            }
            _ => return Err(BasicError::broken("eval: bad array operator")),
        };
        out.push(v);
    }
    Ok(ArrayTemp { shape, data: ArrayData::Float(out) })
}

fn apply_compare(ip: &mut Interpreter, rel: Rel) -> BResult<()> {
    let (left, right) = numeric_pair(ip)?;
    let truth = match (&left, &right) {
        (Value::Str(a), Value::Str(b)) => match rel {
            Rel::Eq => a.bytes == b.bytes,
            Rel::Ne => a.bytes != b.bytes,
            Rel::Lt => a.bytes < b.bytes,
            Rel::Gt => a.bytes > b.bytes,
            Rel::Le => a.bytes <= b.bytes,
            Rel::Ge => a.bytes >= b.bytes,
        },
        (Value::Str(_), _) | (_, Value::Str(_)) => return raise(ErrorKind::TypeNum),
        _ => {
            let a = scalar_fp(&left)?;
            let b = scalar_fp(&right)?;
            match rel {
                Rel::Eq => a == b,
                Rel::Ne => a != b,
                Rel::Lt => a < b,
                Rel::Gt => a > b,
                Rel::Le => a <= b,
                Rel::Ge => a >= b,
            }
        }
    };
    ip.stack.push_int(if truth { -1 } else { 0 })
}

fn apply_bitwise(ip: &mut Interpreter, op: BitOp) -> BResult<()> {
    let b = ip.stack.pop_value()?;
    let a = ip.stack.pop_value()?;
    let wide = matches!(a, Value::Int64(_)) || matches!(b, Value::Int64(_));
    let x = scalar_i64(&a)?;
    let y = scalar_i64(&b)?;
    let v = match op {
        BitOp::And => x & y,
        BitOp::Or => x | y,
        BitOp::Eor => x ^ y,
    };
    if wide {
        ip.stack.push_int64(v)
    } else {
        ip.stack.push_int(v as i32)
    }
}

/// Read a (possibly subscripted) variable reference and push its value.
fn variable_factor(
    ip: &mut Interpreter,
    cur: &mut Cursor,
    name: &str,
    cache_off: usize,
) -> BResult<()> {
    // Array element or whole-array reference?
    if cur.try_char(b'(') {
        let array_name = format!("{name}(");
        if cur.try_char(b')') {
            let slot = ip
                .vars
                .lookup(&array_name)
                .ok_or_else(|| BasicError::with_text(ErrorKind::VarMiss, &array_name))?;
            let kind = ip.vars.array(slot)?.kind;
            return ip.stack.push(Value::ArrayRef { slot, kind });
        }
        let indexes = index_list(ip, cur)?;
        let slot = ip
            .vars
            .lookup(&array_name)
            .ok_or_else(|| BasicError::with_text(ErrorKind::VarMiss, &array_name))?;
        let arr = ip.vars.array(slot)?;
        let flat = arr.shape.flatten(&indexes)?;
        let value = match &arr.data {
            ArrayData::Int32(d) => Value::Int32(d[flat]),
            ArrayData::Float(d) => Value::Float(d[flat]),
            ArrayData::Int64(d) => Value::Int64(d[flat]),
            ArrayData::Uint8(d) => Value::Uint8(d[flat]),
            ArrayData::Str(d) => Value::Str(BStr::literal(d[flat].clone())),
        };
        return ip.stack.push(value);
    }

    if let Some(idx) = static_index(name) {
        return ip.stack.push_int(ip.vars.statics[idx]);
    }

    let slot = ip.resolve_variable(cur, name, cache_off)?;
    let value = match &ip.vars.slot(slot)?.value {
        VarValue::Int32(v) => Value::Int32(*v),
        VarValue::Float(v) => Value::Float(*v),
        VarValue::Int64(v) => Value::Int64(*v),
        VarValue::Uint8(v) => Value::Uint8(*v),
        VarValue::Str(bytes) => Value::Str(BStr::borrowed(bytes.clone(), slot)),
        VarValue::Array(_) | VarValue::Proc(_) | VarValue::Fn(_) => {
            return Err(BasicError::with_text(ErrorKind::UnsuitableVar, name));
        }
    };
    ip.stack.push(value)
}

/// Parse `i1, i2, …)` as array subscripts.
pub fn index_list(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<Vec<usize>> {
    let mut indexes = Vec::new();
    loop {
        let v = eval_numeric32(ip, cur)?;
        if v < 0 {
            return Err(BasicError::with_val(ErrorKind::BadIndex, v as i64));
        }
        indexes.push(v as usize);
        if cur.try_char(b',') {
            continue;
        }
        cur.expect_char(b')', ErrorKind::RpMiss)?;
        return Ok(indexes);
    }
}

fn builtin_fp(ip: &mut Interpreter, cur: &mut Cursor, f: impl Fn(f64) -> BResult<f64>) -> BResult<()> {
    factor(ip, cur)?;
    let v = ip.stack.pop_anynumfp()?;
    ip.stack.push_float(f(v)?)
}

/// One atom of an expression.
pub fn factor(ip: &mut Interpreter, cur: &mut Cursor) -> BResult<()> {
    cur.skip_spaces();
    if let Some(v) = cur.read_number()? {
        return ip.stack.push(v);
    }
    let Some((item, next)) = cur.peek()? else {
        return raise(ErrorKind::BadExpr);
    };
    match item {
        Item::StrCon { content, .. } => {
            let bytes = content.to_vec();
            cur.pos = next;
            ip.stack.push_string(BStr::literal(bytes))
        }
        Item::VarRef { name, cache_off } => {
            let name = String::from_utf8_lossy(name).into_owned();
            cur.pos = next;
            variable_factor(ip, cur, &name, cache_off)
        }
        Item::Char(c) => {
            cur.pos = next;
            match c {
                b'(' => {
                    expression(ip, cur)?;
                    cur.expect_char(b')', ErrorKind::RpMiss)
                }
                b'-' => {
                    factor(ip, cur)?;
                    match ip.stack.pop_value()? {
                        Value::Int32(v) => ip.stack.push_int(v.wrapping_neg()),
                        Value::Int64(v) => ip.stack.push_int64(v.wrapping_neg()),
                        Value::Uint8(v) => ip.stack.push_int(-(v as i32)),
                        Value::Float(f) => ip.stack.push_float(-f),
                        _ => raise(ErrorKind::TypeNum),
                    }
                }
                b'+' => factor(ip, cur),
                b'?' => {
                    factor(ip, cur)?;
                    let addr = ip.stack.pop_anynum64()? as usize;
                    let v = ip.ws.read_byte(addr)?;
                    ip.stack.push_uint8(v)
                }
                b'!' => {
                    factor(ip, cur)?;
                    let addr = ip.stack.pop_anynum64()? as usize;
                    let v = ip.ws.read_word32(addr)?;
                    ip.stack.push_int(v)
                }
                b']' => {
                    factor(ip, cur)?;
                    let addr = ip.stack.pop_anynum64()? as usize;
                    let v = ip.ws.read_word64(addr)?;
                    ip.stack.push_int64(v)
                }
                b'|' => {
                    factor(ip, cur)?;
                    let addr = ip.stack.pop_anynum64()? as usize;
                    let v = ip.ws.read_float(addr)?;
                    ip.stack.push_float(v)
                }
                b'$' => {
                    factor(ip, cur)?;
                    let addr = ip.stack.pop_anynum64()? as usize;
                    let bytes = ip.ws.read_cstring(addr)?;
                    ip.stack.push_string(BStr::temp(bytes))
                }
                _ => raise(ErrorKind::BadExpr),
            }
        }
        Item::Token(t) => {
            cur.pos = next;
            token_factor(ip, cur, t)
        }
        Item::Cmd(_) => raise(ErrorKind::BadExpr),
        Item::LineRef { .. } | Item::Pad => raise(ErrorKind::BadExpr),
    }
}

fn token_factor(ip: &mut Interpreter, cur: &mut Cursor, t: Token) -> BResult<()> {
    match t {
        Token::True => ip.stack.push_int(-1),
        Token::False => ip.stack.push_int(0),
        Token::Pi => ip.stack.push_float(std::f64::consts::PI),
        Token::Not => {
            factor(ip, cur)?;
            let v = ip.stack.pop_anynum64()?;
            push_int_result(ip, !v)
        }
        Token::Abs => {
            factor(ip, cur)?;
            match ip.stack.pop_value()? {
                Value::Int32(v) => ip.stack.push_int(v.wrapping_abs()),
                Value::Int64(v) => ip.stack.push_int64(v.wrapping_abs()),
                Value::Uint8(v) => ip.stack.push_uint8(v),
                Value::Float(f) => ip.stack.push_float(f.abs()),
                _ => raise(ErrorKind::TypeNum),
            }
        }
        Token::Sgn => {
            factor(ip, cur)?;
            let v = ip.stack.pop_anynumfp()?;
            ip.stack.push_int(if v > 0.0 {
                1
            } else if v < 0.0 {
                -1
            } else {
                0
            })
        }
        Token::Int => {
            factor(ip, cur)?;
            let v = ip.stack.pop_anynumfp()?;
            let f = v.floor();
            if f >= i32::MIN as f64 && f <= i32::MAX as f64 {
                ip.stack.push_int(f as i32)
            } else if f >= i64::MIN as f64 && f < i64::MAX as f64 {
                ip.stack.push_int64(f as i64)
            } else {
                raise(ErrorKind::Range)
            }
        }
        Token::Sqr => builtin_fp(ip, cur, |v| {
            if v < 0.0 {
                raise(ErrorKind::NegRoot)
            } else {
                Ok(v.sqrt())
            }
        }),
        Token::Ln => builtin_fp(ip, cur, |v| {
            if v <= 0.0 {
                raise(ErrorKind::LogRange)
            } else {
                Ok(v.ln())
            }
        }),
        Token::Log => builtin_fp(ip, cur, |v| {
            if v <= 0.0 {
                raise(ErrorKind::LogRange)
            } else {
                Ok(v.log10())
            }
        }),
        Token::Exp => builtin_fp(ip, cur, |v| {
            let r = v.exp();
            if r.is_finite() {
                Ok(r)
            } else {
                raise(ErrorKind::ExpOflo)
            }
        }),
        Token::Sin => builtin_fp(ip, cur, |v| Ok(v.sin())),
        Token::Cos => builtin_fp(ip, cur, |v| Ok(v.cos())),
        Token::Tan => builtin_fp(ip, cur, |v| Ok(v.tan())),
        Token::Atn => builtin_fp(ip, cur, |v| Ok(v.atan())),
        Token::Asn => builtin_fp(ip, cur, |v| {
            if !(-1.0..=1.0).contains(&v) {
                raise(ErrorKind::Arithmetic)
            } else {
                Ok(v.asin())
            }
        }),
        Token::Acs => builtin_fp(ip, cur, |v| {
            if !(-1.0..=1.0).contains(&v) {
                raise(ErrorKind::Arithmetic)
            } else {
                Ok(v.acos())
            }
        }),
        Token::Rad => builtin_fp(ip, cur, |v| Ok(v.to_radians())),
        Token::Deg => builtin_fp(ip, cur, |v| Ok(v.to_degrees())),
        Token::Len => {
            factor(ip, cur)?;
            let s = ip.stack.pop_string()?;
            ip.stack.push_int(s.bytes.len() as i32)
        }
        Token::Asc => {
            factor(ip, cur)?;
            let s = ip.stack.pop_string()?;
            match s.bytes.first() {
                Some(&b) => ip.stack.push_int(b as i32),
                None => ip.stack.push_int(-1),
            }
        }
        Token::ChrDol => {
            factor(ip, cur)?;
            let v = ip.stack.pop_anynum32()?;
            ip.stack.push_string(BStr::temp(vec![(v & 0xFF) as u8]))
        }
        Token::StrDol => {
            // STR$~ gives hexadecimal.
            let hex = cur.try_char(b'~');
            factor(ip, cur)?;
            let v = ip.stack.pop_value()?;
            if !v.is_numeric() {
                return raise(ErrorKind::TypeNum);
            }
            let text = if hex {
                match v {
                    Value::Int32(i) => format!("{:X}", i),
                    Value::Int64(i) => format!("{:X}", i),
                    Value::Uint8(i) => format!("{:X}", i),
                    Value::Float(f) => format!("{:X}", toint64(f)?),
                    _ => unreachable!(),
                }
            } else {
                printfmt::str_dollar(&v, ip.vars.statics[crate::variables::AT_PERCENT] as u32)
            };
            ip.stack.push_string(BStr::temp(text.into_bytes()))
        }
        Token::Val => {
            factor(ip, cur)?;
            let s = ip.stack.pop_string()?;
            let trimmed: Vec<u8> = s.bytes.iter().copied().skip_while(|&b| b == b' ').collect();
            let (neg, digits) = match trimmed.first() {
                Some(b'-') => (true, &trimmed[1..]),
                Some(b'+') => (false, &trimmed[1..]),
                _ => (false, &trimmed[..]),
            };
            match tokens::parse_number(digits) {
                Ok((Value::Int32(v), _)) => {
                    ip.stack.push_int(if neg { v.wrapping_neg() } else { v })
                }
                Ok((Value::Int64(v), _)) => {
                    ip.stack.push_int64(if neg { v.wrapping_neg() } else { v })
                }
                Ok((Value::Float(f), _)) => ip.stack.push_float(if neg { -f } else { f }),
                _ => ip.stack.push_int(0),
            }
        }
        Token::Eval => {
            factor(ip, cur)?;
            let s = ip.stack.pop_string()?;
            let text = String::from_utf8_lossy(&s.bytes).into_owned();
            let t = tokens::tokenize(&text, tokens::LineMode::NoLine, false)?;
            let mut sub = Cursor::immediate(t.payload);
            expression(ip, &mut sub)
        }
        Token::LeftDol => {
            expression(ip, cur)?;
            let s = ip.stack.pop_string()?;
            let n = if cur.try_char(b',') {
                eval_numeric32(ip, cur)?.max(0) as usize
            } else {
                s.bytes.len().saturating_sub(1)
            };
            cur.expect_char(b')', ErrorKind::RpMiss)?;
            let n = n.min(s.bytes.len());
            ip.stack.push_string(BStr::temp(s.bytes[..n].to_vec()))
        }
        Token::RightDol => {
            expression(ip, cur)?;
            let s = ip.stack.pop_string()?;
            let n = if cur.try_char(b',') {
                eval_numeric32(ip, cur)?.max(0) as usize
            } else {
                1
            };
            cur.expect_char(b')', ErrorKind::RpMiss)?;
            let n = n.min(s.bytes.len());
            ip.stack
                .push_string(BStr::temp(s.bytes[s.bytes.len() - n..].to_vec()))
        }
        Token::MidDol => {
            expression(ip, cur)?;
            let s = ip.stack.pop_string()?;
            cur.expect_char(b',', ErrorKind::ComMiss)?;
            let p = eval_numeric32(ip, cur)?.max(1) as usize;
            let n = if cur.try_char(b',') {
                let n = eval_numeric32(ip, cur)?;
                if n < 0 { MAXSTRING } else { n as usize }
            } else {
                MAXSTRING
            };
            cur.expect_char(b')', ErrorKind::RpMiss)?;
            let start = (p - 1).min(s.bytes.len());
            let end = start.saturating_add(n).min(s.bytes.len());
            ip.stack.push_string(BStr::temp(s.bytes[start..end].to_vec()))
        }
        Token::InstrLp => {
            expression(ip, cur)?;
            let haystack = ip.stack.pop_string()?;
            cur.expect_char(b',', ErrorKind::ComMiss)?;
            expression(ip, cur)?;
            let needle = ip.stack.pop_string()?;
            let start = if cur.try_char(b',') {
                eval_numeric32(ip, cur)?.max(1) as usize
            } else {
                1
            };
            cur.expect_char(b')', ErrorKind::RpMiss)?;
            let from = start - 1;
            let found = if needle.bytes.is_empty() {
                Some(from.min(haystack.bytes.len()))
            } else if from >= haystack.bytes.len() {
                None
            } else {
                haystack.bytes[from..]
                    .windows(needle.bytes.len())
                    .position(|w| w == needle.bytes.as_slice())
                    .map(|p| from + p)
            };
            ip.stack.push_int(found.map(|p| p as i32 + 1).unwrap_or(0))
        }
        Token::StringDol => {
            expression(ip, cur)?;
            let n = ip.stack.pop_anynum32()?.max(0) as usize;
            cur.expect_char(b',', ErrorKind::ComMiss)?;
            expression(ip, cur)?;
            let s = ip.stack.pop_string()?;
            cur.expect_char(b')', ErrorKind::RpMiss)?;
            if n.saturating_mul(s.bytes.len()) > MAXSTRING {
                return raise(ErrorKind::StringLen);
            }
            ip.stack.push_string(BStr::temp(s.bytes.repeat(n)))
        }
        Token::Sum => {
            factor(ip, cur)?;
            let v = ip.stack.pop_value()?;
            match array_operand(ip, &v)? {
                Some((_, elems)) => ip.stack.push_float(elems.iter().sum()),
                None => raise(ErrorKind::NumArray),
            }
        }
        Token::Rnd => {
            if cur.try_char(b'(') {
                let n = eval_numeric32(ip, cur)?;
                cur.expect_char(b')', ErrorKind::RpMiss)?;
                match n {
                    n if n < 0 => {
                        ip.reseed(n);
                        ip.stack.push_int(n)
                    }
                    0 => {
                        let v = ip.last_rnd();
                        ip.stack.push_float(v)
                    }
                    1 => {
                        let v = ip.next_rnd();
                        ip.stack.push_float(v)
                    }
                    n => {
                        let v = ip.next_rnd();
                        ip.stack.push_int((v * n as f64) as i32 + 1)
                    }
                }
            } else {
                let v = ip.next_rnd();
                ip.stack.push_int((v * 4294967296.0) as i64 as i32)
            }
        }
        Token::Get => {
            let key = ip.host.keyboard.get_key()?;
            ip.stack.push_int(key)
        }
        Token::GetDol => {
            let key = ip.host.keyboard.get_key()?;
            let bytes = if key < 0 { Vec::new() } else { vec![key as u8] };
            ip.stack.push_string(BStr::temp(bytes))
        }
        Token::Inkey => {
            factor(ip, cur)?;
            let _timeout = ip.stack.pop_anynum32()?;
            let key = ip.host.keyboard.get_key()?;
            ip.stack.push_int(key)
        }
        Token::InkeyDol => {
            factor(ip, cur)?;
            let _timeout = ip.stack.pop_anynum32()?;
            let key = ip.host.keyboard.get_key()?;
            let bytes = if key < 0 { Vec::new() } else { vec![key as u8] };
            ip.stack.push_string(BStr::temp(bytes))
        }
        Token::Pos | Token::Vpos => ip.stack.push_int(0),
        Token::Count => ip.stack.push_int(ip.print_count as i32),
        Token::Err => {
            let code = ip.error_slot.as_ref().map(|e| e.code()).unwrap_or(0);
            ip.stack.push_int(code)
        }
        Token::Erl => {
            let line = ip.error_slot.as_ref().map(|e| e.line).unwrap_or(0);
            ip.stack.push_int(line as i32)
        }
        Token::ReportDol => {
            let msg = ip.error_slot.as_ref().map(|e| e.message()).unwrap_or_default();
            ip.stack.push_string(BStr::temp(msg.into_bytes()))
        }
        Token::Time => {
            let t = ip.host.clock.read_time();
            push_int_result(ip, t)
        }
        Token::TimeDol => {
            let s = ip.host.clock.read_time_string();
            ip.stack.push_string(BStr::temp(s.into_bytes()))
        }
        Token::FilepathDol => {
            let s = ip.filepath.clone();
            ip.stack.push_string(BStr::temp(s.into_bytes()))
        }
        Token::Himem => push_int_result(ip, ip.ws.himem as i64),
        Token::Lomem => push_int_result(ip, ip.ws.lomem as i64),
        Token::Page => push_int_result(ip, ip.ws.page as i64),
        Token::Top => push_int_result(ip, ip.ws.top as i64),
        Token::Eof => {
            cur.expect_char(b'#', ErrorKind::HashMiss)?;
            factor(ip, cur)?;
            let h = ip.stack.pop_anynum32()?;
            let eof = ip.host.files.at_eof(h)?;
            ip.stack.push_int(if eof { -1 } else { 0 })
        }
        Token::Ptr => {
            cur.expect_char(b'#', ErrorKind::HashMiss)?;
            factor(ip, cur)?;
            let h = ip.stack.pop_anynum32()?;
            let p = ip.host.files.get_ptr(h)?;
            push_int_result(ip, p)
        }
        Token::Ext => {
            cur.expect_char(b'#', ErrorKind::HashMiss)?;
            factor(ip, cur)?;
            let h = ip.stack.pop_anynum32()?;
            let e = ip.host.files.get_ext(h)?;
            push_int_result(ip, e)
        }
        Token::Bget => {
            cur.expect_char(b'#', ErrorKind::HashMiss)?;
            factor(ip, cur)?;
            let h = ip.stack.pop_anynum32()?;
            let b = ip.host.files.read_byte(h)?;
            ip.stack.push_int(b)
        }
        Token::Openin => {
            // A missing file yields handle 0, not an error.
            factor(ip, cur)?;
            let name = ip.stack.pop_string()?;
            match ip.open_file(&name.bytes, OpenMode::In) {
                Ok(h) => ip.stack.push_int(h),
                Err(e) if e.kind == ErrorKind::NotFound || e.kind == ErrorKind::OpenIn => {
                    ip.stack.push_int(0)
                }
                Err(e) => Err(e),
            }
        }
        Token::Openout => {
            factor(ip, cur)?;
            let name = ip.stack.pop_string()?;
            let h = ip.open_file(&name.bytes, OpenMode::Out)?;
            ip.stack.push_int(h)
        }
        Token::Openup => {
            factor(ip, cur)?;
            let name = ip.stack.pop_string()?;
            let h = ip.open_file(&name.bytes, OpenMode::Up)?;
            ip.stack.push_int(h)
        }
        Token::Fn => {
            let Some((Item::VarRef { name, .. }, next)) = cur.peek()? else {
                return raise(ErrorKind::NameMiss);
            };
            let name = String::from_utf8_lossy(name).into_owned();
            cur.pos = next;
            let mut args = Vec::new();
            if cur.try_char(b'(') {
                if !cur.try_char(b')') {
                    loop {
                        args.push(eval_value(ip, cur)?);
                        if cur.try_char(b',') {
                            continue;
                        }
                        cur.expect_char(b')', ErrorKind::RpMiss)?;
                        break;
                    }
                }
            }
            let v = ip.call_fn(&name, args)?;
            ip.stack.push(v)
        }
        Token::Usr => raise(ErrorKind::Unsupported),
        _ => raise(ErrorKind::BadExpr),
    }
}

/// File-open modes used by the OPEN* factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    In,
    Out,
    Up,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{
        Host, Keyboard, LineRead, StdClock, StdEditor, StdFileIo, StdOsCli, StdScreen, TestHost,
    };
    use crate::interp::Interpreter;
    use crate::workspace::MIN_SIZE;

    use std::cell::RefCell;
    use std::rc::Rc;

    fn interp() -> Interpreter {
        let (host, _, _) = TestHost::new(vec![]);
        Interpreter::new(MIN_SIZE, host).unwrap()
    }

    fn eval_text(ip: &mut Interpreter, src: &str) -> BResult<Value> {
        let t = tokens::tokenize(src, tokens::LineMode::NoLine, false)?;
        let mut cur = Cursor::immediate(t.payload);
        eval_value(ip, &mut cur)
    }

    fn num(ip: &mut Interpreter, src: &str) -> f64 {
        match eval_text(ip, src).unwrap() {
            Value::Int32(v) => v as f64,
            Value::Int64(v) => v as f64,
            Value::Uint8(v) => v as f64,
            Value::Float(f) => f,
            other => panic!("'{src}' is not numeric: {other:?}"),
        }
    }

    #[test]
    fn precedence_follows_the_ladder() {
        let mut ip = interp();
        assert_eq!(num(&mut ip, "1+2*3"), 7.0);
        assert_eq!(num(&mut ip, "(1+2)*3"), 9.0);
        assert_eq!(num(&mut ip, "10-4-3"), 3.0);
        assert_eq!(num(&mut ip, "2^3^2"), 64.0);
        assert_eq!(num(&mut ip, "7 MOD 3 + 1"), 2.0);
        assert_eq!(num(&mut ip, "9 DIV 2 * 2"), 8.0);
        // Shifts bind below addition, above comparison.
        assert_eq!(num(&mut ip, "1+1<<2"), 8.0);
        assert_eq!(num(&mut ip, "-2+1"), -1.0);
    }

    #[test]
    fn comparisons_yield_minus_one_for_true() {
        let mut ip = interp();
        assert_eq!(eval_text(&mut ip, "2<3").unwrap(), Value::Int32(-1));
        assert_eq!(eval_text(&mut ip, "2>3").unwrap(), Value::Int32(0));
        assert_eq!(eval_text(&mut ip, "2<=2").unwrap(), Value::Int32(-1));
        assert_eq!(eval_text(&mut ip, "2<>3").unwrap(), Value::Int32(-1));
        assert_eq!(eval_text(&mut ip, "\"abc\"<\"abd\"").unwrap(), Value::Int32(-1));
        assert_eq!(eval_text(&mut ip, "\"abc\"=\"abc\"").unwrap(), Value::Int32(-1));
    }

    #[test]
    fn integer_arithmetic_wraps_in_its_width() {
        let mut ip = interp();
        assert_eq!(eval_text(&mut ip, "&7FFFFFFF+1").unwrap(), Value::Int32(i32::MIN));
        assert_eq!(
            eval_text(&mut ip, "&7FFFFFFFFFFFFFFF+1").unwrap(),
            Value::Int64(i64::MIN)
        );
    }

    #[test]
    fn mixed_operands_promote_to_float() {
        let mut ip = interp();
        assert_eq!(eval_text(&mut ip, "1+2.5").unwrap(), Value::Float(3.5));
        assert_eq!(eval_text(&mut ip, "1/2").unwrap(), Value::Float(0.5));
        assert_eq!(eval_text(&mut ip, "TRUE AND 6").unwrap(), Value::Int32(6));
        assert_eq!(eval_text(&mut ip, "NOT 0").unwrap(), Value::Int32(-1));
        assert_eq!(eval_text(&mut ip, "1 OR 4 EOR 5").unwrap(), Value::Int32(0));
    }

    #[test]
    fn shifts_are_arithmetic_unless_tripled() {
        let mut ip = interp();
        assert_eq!(eval_text(&mut ip, "1<<4").unwrap(), Value::Int32(16));
        assert_eq!(eval_text(&mut ip, "-8>>1").unwrap(), Value::Int32(-4));
        assert_eq!(
            eval_text(&mut ip, "-8>>>1").unwrap(),
            Value::Int64(((-8i64 as u64) >> 1) as i64)
        );
    }

    #[test]
    fn division_operators_guard_zero() {
        let mut ip = interp();
        assert_eq!(eval_text(&mut ip, "1/0").unwrap_err().kind, ErrorKind::DivZero);
        assert_eq!(eval_text(&mut ip, "1 DIV 0").unwrap_err().kind, ErrorKind::DivZero);
        assert_eq!(eval_text(&mut ip, "1 MOD 0").unwrap_err().kind, ErrorKind::DivZero);
        assert_eq!(num(&mut ip, "5 DIV 2"), 2.0);
        assert_eq!(num(&mut ip, "5 MOD 3"), 2.0);
    }

    #[test]
    fn string_concatenation_yields_a_temporary() {
        let mut ip = interp();
        match eval_text(&mut ip, "\"ab\"+\"cd\"").unwrap() {
            Value::Str(s) => {
                assert_eq!(s.bytes, b"abcd");
                assert!(s.temp);
            }
            other => panic!("expected a string, got {other:?}"),
        }
        assert_eq!(
            eval_text(&mut ip, "\"a\"+1").unwrap_err().kind,
            ErrorKind::TypeNum
        );
    }

    #[test]
    fn builtin_functions_evaluate() {
        let mut ip = interp();
        assert_eq!(num(&mut ip, "LEN\"abc\""), 3.0);
        assert_eq!(num(&mut ip, "ASC\"A\""), 65.0);
        assert_eq!(num(&mut ip, "ASC\"\""), -1.0);
        assert_eq!(num(&mut ip, "INT(-2.5)"), -3.0);
        assert_eq!(num(&mut ip, "ABS(-3)"), 3.0);
        assert_eq!(num(&mut ip, "SGN(-9)"), -1.0);
        assert_eq!(num(&mut ip, "INSTR(\"hello\",\"ll\")"), 3.0);
        assert_eq!(num(&mut ip, "INSTR(\"hello\",\"zz\")"), 0.0);
        assert_eq!(num(&mut ip, "VAL(\"-12\")"), -12.0);
        assert_eq!(num(&mut ip, "EVAL(\"2*3+1\")"), 7.0);
        match eval_text(&mut ip, "CHR$(65)").unwrap() {
            Value::Str(s) => assert_eq!(s.bytes, b"A"),
            other => panic!("expected a string, got {other:?}"),
        }
        match eval_text(&mut ip, "STRING$(3,\"ab\")").unwrap() {
            Value::Str(s) => assert_eq!(s.bytes, b"ababab"),
            other => panic!("expected a string, got {other:?}"),
        }
        match eval_text(&mut ip, "STR$~255").unwrap() {
            Value::Str(s) => assert_eq!(s.bytes, b"FF"),
            other => panic!("expected a string, got {other:?}"),
        }
        assert_eq!(eval_text(&mut ip, "SQR(-1)").unwrap_err().kind, ErrorKind::NegRoot);
        assert_eq!(eval_text(&mut ip, "LN 0").unwrap_err().kind, ErrorKind::LogRange);
    }

    fn float_array(ip: &mut Interpreter, name: &str, values: Vec<f64>) -> usize {
        let slot = ip.vars.dim_array(name, vec![values.len() - 1]).unwrap();
        ip.vars.array_mut(slot).unwrap().data = ArrayData::Float(values);
        slot
    }

    #[test]
    fn array_arithmetic_is_elementwise_with_broadcast() {
        let mut ip = interp();
        float_array(&mut ip, "a(", vec![1.0, 2.0, 3.0]);
        float_array(&mut ip, "b(", vec![10.0, 20.0, 30.0]);
        match eval_text(&mut ip, "a()+b()").unwrap() {
            Value::ArrayTemp(t) => assert_eq!(t.data, ArrayData::Float(vec![11.0, 22.0, 33.0])),
            other => panic!("expected an array temporary, got {other:?}"),
        }
        match eval_text(&mut ip, "a()*2").unwrap() {
            Value::ArrayTemp(t) => assert_eq!(t.data, ArrayData::Float(vec![2.0, 4.0, 6.0])),
            other => panic!("expected an array temporary, got {other:?}"),
        }
        assert_eq!(num(&mut ip, "SUM a()"), 6.0);
    }

    #[test]
    fn array_shape_mismatch_is_refused() {
        let mut ip = interp();
        float_array(&mut ip, "a(", vec![1.0, 2.0, 3.0]);
        float_array(&mut ip, "b(", vec![1.0, 2.0]);
        assert_eq!(
            eval_text(&mut ip, "a()+b()").unwrap_err().kind,
            ErrorKind::TypeArray
        );
        assert_eq!(
            eval_text(&mut ip, "a()/0").unwrap_err().kind,
            ErrorKind::DivZero
        );
    }

    /// Keyboard whose escape flag comes up on the second poll, so the
    /// first in-loop sample passes and the next one fires mid-loop.
    struct CountingKeyboard {
        polls: Rc<RefCell<usize>>,
    }

    impl Keyboard for CountingKeyboard {
        fn get_key(&mut self) -> BResult<i32> {
            Ok(-1)
        }

        fn poll_escape(&mut self) -> bool {
            let mut polls = self.polls.borrow_mut();
            *polls += 1;
            *polls >= 2
        }

        fn clear_escape(&mut self) {}

        fn read_line_edit(&mut self, _prompt: &str, _prefill: &str) -> BResult<LineRead> {
            Ok(LineRead::Eof)
        }
    }

    #[test]
    fn long_array_loops_poll_escape_every_64k_elements() {
        let polls = Rc::new(RefCell::new(0usize));
        let host = Host {
            files: Box::new(StdFileIo::new()),
            clock: Box::new(StdClock::new()),
            screen: Box::new(StdScreen),
            keyboard: Box::new(CountingKeyboard { polls: Rc::clone(&polls) }),
            editor: Box::new(StdEditor),
            oscli: Box::new(StdOsCli),
        };
        let mut ip = Interpreter::new(MIN_SIZE, host).unwrap();
        let slot = ip.vars.dim_array("big(", vec![ESCAPE_POLL + 10]).unwrap();
        let count = ip.vars.array(slot).unwrap().shape.count();
        assert!(count > ESCAPE_POLL);
        let err = eval_text(&mut ip, "big()+1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Escape);
        // One pass at element 0, the interrupting one at ESCAPE_POLL.
        assert_eq!(*polls.borrow(), 2);
    }
}
