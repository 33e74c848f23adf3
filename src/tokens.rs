//! Tokeniser and detokeniser.
//!
//! A tokenised line is a 4-byte header (line number, record length, both
//! u16 little-endian) followed by a payload of token bytes. Three payload
//! constructs carry fixed-width embedded fields:
//!
//! - line-number targets after GOTO/GOSUB/RESTORE/THEN/ELSE: a marker byte
//!   plus an OFFSIZE (2 byte) field, rewritten by RENUMBER;
//! - string literals: a marker byte plus an OFFSIZE length field plus the
//!   content bytes, the source-string side references used by LISTIF and
//!   LVAR;
//! - identifier references: a marker byte, the name length, an LOFFSIZE
//!   (4 byte) cache field that is late-bound to a variable slot on first
//!   use, and the name bytes.
//!
//! Embedded fields are aligned to their own width from the start of the
//! line record; padding bytes are inserted ahead of the marker to achieve
//! this and skipped on expansion. Keyword tokens occupy 0x80.. (one byte)
//! with 0xFF prefixing the second table of immediate commands. All other
//! source characters, numeric literals included, are stored verbatim, so
//! expanding a tokenised line reproduces the source spelling exactly.
//! Byte 0 never appears in a payload outside an embedded field; it marks
//! the end of the program.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::errors::{BResult, BasicError, ErrorKind, raise};
use crate::values::Value;

/// Width of a line-number or string-length field.
pub const OFFSIZE: usize = 2;
/// Width of a variable-cache field.
pub const LOFFSIZE: usize = 4;

/// Record header: line number then record length.
pub const LINE_HDR: usize = 4;
/// Smallest legal record: header plus one payload byte.
pub const MINSTATELEN: usize = LINE_HDR + 1;
pub const MAXSTATELEN: usize = 1024;

/// Highest usable line number; 0 and 65280.. are reserved.
pub const MAX_LINENO: u16 = 65279;

/// Payload marker bytes (below 0x20, never confusable with source text).
pub const T_PAD: u8 = 0x01;
pub const T_LINEREF: u8 = 0x02;
pub const T_STRCON: u8 = 0x03;
pub const T_VARREF: u8 = 0x04;
/// Prefix for the immediate-command token table.
pub const T_CMD: u8 = 0xFF;

/// Single-byte keyword tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Token {
    And = 0x80,
    Abs,
    Acs,
    Asc,
    Asn,
    Atn,
    Bget,
    Bput,
    ChrDol,
    Clear,
    Close,
    Cls,
    Cos,
    Count,
    Data,
    Def,
    Deg,
    Dim,
    Div,
    Else,
    End,
    Endcase,
    Endif,
    Endproc,
    Endwhile,
    Eof,
    Eor,
    Erl,
    Err,
    Error,
    Eval,
    Exp,
    Ext,
    False,
    FilepathDol,
    Fn,
    For,
    Get,
    GetDol,
    Gosub,
    Goto,
    Himem,
    If,
    Inkey,
    InkeyDol,
    Input,
    InstrLp,
    Int,
    LeftDol,
    Len,
    Let,
    Library,
    Ln,
    Local,
    Log,
    Lomem,
    MidDol,
    Mod,
    Mode,
    Next,
    Not,
    Of,
    Off,
    On,
    Openin,
    Openout,
    Openup,
    Or,
    Oscli,
    Otherwise,
    Page,
    Pi,
    Pos,
    Print,
    Proc,
    Ptr,
    Quit,
    Rad,
    Read,
    Rem,
    Repeat,
    Report,
    ReportDol,
    Restore,
    Return,
    RightDol,
    Rnd,
    Run,
    Sgn,
    Sin,
    Spc,
    Sqr,
    Step,
    Stop,
    StrDol,
    StringDol,
    Sum,
    Swap,
    TabLp,
    Tan,
    Then,
    Time,
    TimeDol,
    To,
    Top,
    Trace,
    True,
    Until,
    Usr,
    Val,
    Vdu,
    Vpos,
    Wait,
    When,
    While,
    Width,
    Case,
    Chain,
    Colour,
    Draw,
    Gcol,
    Move,
    Plot,
    PointLp,
    Sound,
    Sys,
    Circle,
}

/// Immediate-command tokens, reached through the `T_CMD` prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Cmd {
    Auto = 0x01,
    Crunch,
    Delete,
    Edit,
    Edito,
    Help,
    Install,
    List,
    Listb,
    Listif,
    Listl,
    Listo,
    Listw,
    Load,
    Lvar,
    New,
    Old,
    Renumber,
    Save,
    Saveo,
    Textload,
    Textsave,
    Textsaveo,
    Twin,
    Twino,
}

/// Keyword spellings. Matching is longest-first; a keyword ending in a
/// letter is rejected when the next character would extend an identifier,
/// so `TIMER` stays a variable while `TIME` tokenises.
const KEYWORDS: &[(&str, Token)] = &[
    ("ABS", Token::Abs),
    ("ACS", Token::Acs),
    ("AND", Token::And),
    ("ASC", Token::Asc),
    ("ASN", Token::Asn),
    ("ATN", Token::Atn),
    ("BGET", Token::Bget),
    ("BPUT", Token::Bput),
    ("CASE", Token::Case),
    ("CHAIN", Token::Chain),
    ("CHR$", Token::ChrDol),
    ("CIRCLE", Token::Circle),
    ("CLEAR", Token::Clear),
    ("CLOSE", Token::Close),
    ("CLS", Token::Cls),
    ("COLOUR", Token::Colour),
    ("COS", Token::Cos),
    ("COUNT", Token::Count),
    ("DATA", Token::Data),
    ("DEF", Token::Def),
    ("DEG", Token::Deg),
    ("DIM", Token::Dim),
    ("DIV", Token::Div),
    ("DRAW", Token::Draw),
    ("ELSE", Token::Else),
    ("END", Token::End),
    ("ENDCASE", Token::Endcase),
    ("ENDIF", Token::Endif),
    ("ENDPROC", Token::Endproc),
    ("ENDWHILE", Token::Endwhile),
    ("EOF", Token::Eof),
    ("EOR", Token::Eor),
    ("ERL", Token::Erl),
    ("ERR", Token::Err),
    ("ERROR", Token::Error),
    ("EVAL", Token::Eval),
    ("EXP", Token::Exp),
    ("EXT", Token::Ext),
    ("FALSE", Token::False),
    ("FILEPATH$", Token::FilepathDol),
    ("FN", Token::Fn),
    ("FOR", Token::For),
    ("GCOL", Token::Gcol),
    ("GET", Token::Get),
    ("GET$", Token::GetDol),
    ("GOSUB", Token::Gosub),
    ("GOTO", Token::Goto),
    ("HIMEM", Token::Himem),
    ("IF", Token::If),
    ("INKEY", Token::Inkey),
    ("INKEY$", Token::InkeyDol),
    ("INPUT", Token::Input),
    ("INSTR(", Token::InstrLp),
    ("INT", Token::Int),
    ("LEFT$(", Token::LeftDol),
    ("LEN", Token::Len),
    ("LET", Token::Let),
    ("LIBRARY", Token::Library),
    ("LN", Token::Ln),
    ("LOCAL", Token::Local),
    ("LOG", Token::Log),
    ("LOMEM", Token::Lomem),
    ("MID$(", Token::MidDol),
    ("MOD", Token::Mod),
    ("MODE", Token::Mode),
    ("MOVE", Token::Move),
    ("NEXT", Token::Next),
    ("NOT", Token::Not),
    ("OF", Token::Of),
    ("OFF", Token::Off),
    ("ON", Token::On),
    ("OPENIN", Token::Openin),
    ("OPENOUT", Token::Openout),
    ("OPENUP", Token::Openup),
    ("OR", Token::Or),
    ("OSCLI", Token::Oscli),
    ("OTHERWISE", Token::Otherwise),
    ("PAGE", Token::Page),
    ("PI", Token::Pi),
    ("PLOT", Token::Plot),
    ("POINT(", Token::PointLp),
    ("POS", Token::Pos),
    ("PRINT", Token::Print),
    ("PROC", Token::Proc),
    ("PTR", Token::Ptr),
    ("QUIT", Token::Quit),
    ("RAD", Token::Rad),
    ("READ", Token::Read),
    ("REM", Token::Rem),
    ("REPEAT", Token::Repeat),
    ("REPORT", Token::Report),
    ("REPORT$", Token::ReportDol),
    ("RESTORE", Token::Restore),
    ("RETURN", Token::Return),
    ("RIGHT$(", Token::RightDol),
    ("RND", Token::Rnd),
    ("RUN", Token::Run),
    ("SGN", Token::Sgn),
    ("SIN", Token::Sin),
    ("SOUND", Token::Sound),
    ("SPC", Token::Spc),
    ("SQR", Token::Sqr),
    ("STEP", Token::Step),
    ("STOP", Token::Stop),
    ("STR$", Token::StrDol),
    ("STRING$(", Token::StringDol),
    ("SUM", Token::Sum),
    ("SWAP", Token::Swap),
    ("SYS", Token::Sys),
    ("TAB(", Token::TabLp),
    ("TAN", Token::Tan),
    ("THEN", Token::Then),
    ("TIME", Token::Time),
    ("TIME$", Token::TimeDol),
    ("TO", Token::To),
    ("TOP", Token::Top),
    ("TRACE", Token::Trace),
    ("TRUE", Token::True),
    ("UNTIL", Token::Until),
    ("USR", Token::Usr),
    ("VAL", Token::Val),
    ("VDU", Token::Vdu),
    ("VPOS", Token::Vpos),
    ("WAIT", Token::Wait),
    ("WHEN", Token::When),
    ("WHILE", Token::While),
    ("WIDTH", Token::Width),
];

const COMMANDS: &[(&str, Cmd)] = &[
    ("AUTO", Cmd::Auto),
    ("CRUNCH", Cmd::Crunch),
    ("DELETE", Cmd::Delete),
    ("EDIT", Cmd::Edit),
    ("EDITO", Cmd::Edito),
    ("HELP", Cmd::Help),
    ("INSTALL", Cmd::Install),
    ("LIST", Cmd::List),
    ("LISTB", Cmd::Listb),
    ("LISTIF", Cmd::Listif),
    ("LISTL", Cmd::Listl),
    ("LISTO", Cmd::Listo),
    ("LISTW", Cmd::Listw),
    ("LOAD", Cmd::Load),
    ("LVAR", Cmd::Lvar),
    ("NEW", Cmd::New),
    ("OLD", Cmd::Old),
    ("RENUMBER", Cmd::Renumber),
    ("SAVE", Cmd::Save),
    ("SAVEO", Cmd::Saveo),
    ("TEXTLOAD", Cmd::Textload),
    ("TEXTSAVE", Cmd::Textsave),
    ("TEXTSAVEO", Cmd::Textsaveo),
    ("TWIN", Cmd::Twin),
    ("TWINO", Cmd::Twino),
];

pub fn keyword_text(token: Token) -> &'static str {
    KEYWORDS
        .iter()
        .find(|(_, t)| *t == token)
        .map(|(s, _)| *s)
        .unwrap_or("?")
}

pub fn command_text(cmd: Cmd) -> &'static str {
    COMMANDS
        .iter()
        .find(|(_, c)| *c == cmd)
        .map(|(s, _)| *s)
        .unwrap_or("?")
}

bitflags! {
    /// The LISTO flag word controlling detokenised output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Listo: u32 {
        const SPACE = 1 << 0;
        const INDENT = 1 << 1;
        const SPLIT = 1 << 2;
        const NONUMBER = 1 << 3;
        const LOWER = 1 << 4;
        const PAGED = 1 << 5;
        const EXPAND = 1 << 6;
    }
}

/// Whether a leading line number may be present on the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    HasLine,
    NoLine,
}

/// A tokenised line. `number` is None when the text carried no line
/// number (under `HasLine` this is the had-its-number-removed state and
/// the line executes immediately instead of being stored).
#[derive(Debug, Clone, PartialEq)]
pub struct Tokenised {
    pub number: Option<u16>,
    pub payload: Vec<u8>,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'`'
}

fn is_ident_cont(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'`'
}

/// Longest keyword or command matching at the head of `text`.
fn match_word(text: &[u8], lower: bool) -> Option<(usize, u8, Option<u8>)> {
    let mut best: Option<(usize, u8, Option<u8>)> = None;
    let candidate = |spelling: &str| -> Option<usize> {
        let sp = spelling.as_bytes();
        if text.len() < sp.len() {
            return None;
        }
        let head = &text[..sp.len()];
        let matches = head == sp
            || (lower && head.iter().zip(sp).all(|(a, b)| a.eq_ignore_ascii_case(b)));
        if !matches {
            return None;
        }
        // A keyword ending in a letter must not run into an identifier.
        let last = sp[sp.len() - 1];
        if last.is_ascii_alphabetic() {
            if let Some(&next) = text.get(sp.len()) {
                if is_ident_cont(next) {
                    return None;
                }
            }
        }
        Some(sp.len())
    };
    for (spelling, token) in KEYWORDS {
        if let Some(len) = candidate(spelling) {
            if best.map(|(l, _, _)| len > l).unwrap_or(true) {
                best = Some((len, *token as u8, None));
            }
        }
    }
    for (spelling, cmd) in COMMANDS {
        if let Some(len) = candidate(spelling) {
            if best.map(|(l, _, _)| len > l).unwrap_or(true) {
                best = Some((len, T_CMD, Some(*cmd as u8)));
            }
        }
    }
    best
}

/// Tokens that may be followed by a literal line-number target.
fn starts_lineno_context(token: u8) -> bool {
    token == Token::Goto as u8
        || token == Token::Gosub as u8
        || token == Token::Restore as u8
        || token == Token::Then as u8
        || token == Token::Else as u8
}

struct Emitter {
    out: Vec<u8>,
}

impl Emitter {
    /// Pad so that a field `lead` bytes after the next marker byte lands
    /// on an `align` boundary, measured from the start of the record.
    fn align_field(&mut self, lead: usize, align: usize) {
        while (LINE_HDR + self.out.len() + lead) % align != 0 {
            self.out.push(T_PAD);
        }
    }

    fn lineref(&mut self, value: u16) {
        self.align_field(1, OFFSIZE);
        self.out.push(T_LINEREF);
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn strcon(&mut self, content: &[u8]) {
        self.align_field(1, OFFSIZE);
        self.out.push(T_STRCON);
        self.out.extend_from_slice(&(content.len() as u16).to_le_bytes());
        self.out.extend_from_slice(content);
    }

    fn varref(&mut self, name: &[u8]) {
        self.align_field(2, LOFFSIZE);
        self.out.push(T_VARREF);
        self.out.push(name.len() as u8);
        self.out.extend_from_slice(&0u32.to_le_bytes());
        self.out.extend_from_slice(name);
    }
}

/// Convert one line of source text to its tokenised form.
///
/// Tokenisation depends only on the text: the same input always produces
/// the same record.
pub fn tokenize(text: &str, mode: LineMode, lower: bool) -> BResult<Tokenised> {
    let bytes = text.as_bytes();
    let mut pos = 0;

    // Optional leading line number.
    let mut number = None;
    if mode == LineMode::HasLine {
        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }
        let digits = bytes[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits > 0 {
            let n: u32 = std::str::from_utf8(&bytes[pos..pos + digits])
                .unwrap()
                .parse()
                .map_err(|_| BasicError::new(ErrorKind::LineNo))?;
            if n == 0 || n > MAX_LINENO as u32 {
                return Err(BasicError::with_val(ErrorKind::LineNo, n as i64));
            }
            number = Some(n as u16);
            pos += digits;
        }
    }

    let mut em = Emitter { out: Vec::new() };
    let mut lineno_ctx = false;

    while pos < bytes.len() {
        let b = bytes[pos];
        match b {
            b'"' => {
                lineno_ctx = false;
                let mut content = Vec::new();
                let mut scan = pos + 1;
                loop {
                    match bytes.get(scan) {
                        Some(b'"') if bytes.get(scan + 1) == Some(&b'"') => {
                            content.push(b'"');
                            scan += 2;
                        }
                        Some(b'"') => {
                            scan += 1;
                            break;
                        }
                        Some(&c) => {
                            content.push(c);
                            scan += 1;
                        }
                        None => return raise(ErrorKind::QuoteMiss),
                    }
                }
                em.strcon(&content);
                pos = scan;
            }
            b'0'..=b'9' if lineno_ctx => {
                let digits = bytes[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
                let n: u32 = std::str::from_utf8(&bytes[pos..pos + digits])
                    .unwrap()
                    .parse()
                    .map_err(|_| BasicError::new(ErrorKind::LineNo))?;
                if n == 0 || n > MAX_LINENO as u32 {
                    return Err(BasicError::with_val(ErrorKind::LineNo, n as i64));
                }
                em.lineref(n as u16);
                pos += digits;
                // A comma keeps the context alive for ON … GOTO lists.
                let mut peek = pos;
                while bytes.get(peek) == Some(&b' ') {
                    peek += 1;
                }
                if bytes.get(peek) != Some(&b',') {
                    lineno_ctx = false;
                }
            }
            b' ' => {
                em.out.push(b' ');
                pos += 1;
            }
            // Numeric literals are copied whole so that hex digits and
            // exponent letters cannot be taken for identifiers.
            b'&' if bytes.get(pos + 1).is_some_and(|b| b.is_ascii_hexdigit()) => {
                lineno_ctx = false;
                let digits = bytes[pos + 1..]
                    .iter()
                    .take_while(|b| b.is_ascii_hexdigit())
                    .count();
                em.out.extend_from_slice(&bytes[pos..pos + 1 + digits]);
                pos += 1 + digits;
            }
            b'%' if bytes.get(pos + 1).is_some_and(|&b| b == b'0' || b == b'1') => {
                lineno_ctx = false;
                let digits = bytes[pos + 1..]
                    .iter()
                    .take_while(|&&b| b == b'0' || b == b'1')
                    .count();
                em.out.extend_from_slice(&bytes[pos..pos + 1 + digits]);
                pos += 1 + digits;
            }
            b'0'..=b'9' | b'.' => {
                lineno_ctx = false;
                let mut end = pos;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if bytes.get(end) == Some(&b'.') {
                    end += 1;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                }
                if matches!(bytes.get(end), Some(b'E') | Some(b'e')) {
                    let mut exp_end = end + 1;
                    if matches!(bytes.get(exp_end), Some(b'+') | Some(b'-')) {
                        exp_end += 1;
                    }
                    let exp_digits = bytes[exp_end..]
                        .iter()
                        .take_while(|b| b.is_ascii_digit())
                        .count();
                    if exp_digits > 0 {
                        end = exp_end + exp_digits;
                    }
                }
                if end == pos {
                    // A lone dot is ordinary punctuation.
                    end = pos + 1;
                }
                em.out.extend_from_slice(&bytes[pos..end]);
                pos = end;
            }
            _ if is_ident_start(b) => {
                if let Some((len, token, cmd)) = match_word(&bytes[pos..], lower) {
                    em.out.push(token);
                    if let Some(c) = cmd {
                        em.out.push(c);
                    }
                    pos += len;
                    if token == Token::Rem as u8 || token == Token::Data as u8 {
                        // The rest of the line is verbatim text.
                        em.out
                            .extend(bytes[pos..].iter().filter(|b| matches!(**b, 0x20..=0x7E)));
                        pos = bytes.len();
                    }
                    lineno_ctx = starts_lineno_context(token);
                } else {
                    let mut end = pos + 1;
                    while end < bytes.len() && is_ident_cont(bytes[end]) {
                        end += 1;
                    }
                    // Type suffix is part of the name.
                    while let Some(&s) = bytes.get(end) {
                        if s == b'%' || s == b'&' || s == b'$' {
                            end += 1;
                        } else {
                            break;
                        }
                    }
                    em.varref(&bytes[pos..end]);
                    pos = end;
                    lineno_ctx = false;
                }
            }
            0x20..=0x7E => {
                if !b.is_ascii_digit() && b != b',' {
                    lineno_ctx = false;
                }
                em.out.push(b);
                pos += 1;
            }
            _ => {
                return Err(BasicError::with_val(ErrorKind::BadToken, b as i64));
            }
        }
    }

    if LINE_HDR + em.out.len() > MAXSTATELEN {
        return raise(ErrorKind::StateLen);
    }
    if em.out.is_empty() {
        em.out.push(b' ');
    }
    Ok(Tokenised { number, payload: em.out })
}

/// One decoded payload construct.
#[derive(Debug, Clone, PartialEq)]
pub enum Item<'a> {
    Token(Token),
    Cmd(Cmd),
    Char(u8),
    StrCon { content: &'a [u8], field_off: usize },
    LineRef { value: u16, field_off: usize },
    VarRef { name: &'a [u8], cache_off: usize },
    Pad,
}

/// Decode the construct at `pos` within a payload. `pos` is relative to
/// the start of the payload; reported field offsets are too.
pub fn item_at(payload: &[u8], pos: usize) -> BResult<(Item<'_>, usize)> {
    let b = *payload
        .get(pos)
        .ok_or_else(|| BasicError::broken("tokens: scan past end of line"))?;
    match b {
        T_PAD => Ok((Item::Pad, pos + 1)),
        T_LINEREF => {
            let field = pos + 1;
            let bytes: [u8; 2] = payload
                .get(field..field + OFFSIZE)
                .ok_or(BasicError::new(ErrorKind::BadProg))?
                .try_into()
                .unwrap();
            Ok((
                Item::LineRef { value: u16::from_le_bytes(bytes), field_off: field },
                field + OFFSIZE,
            ))
        }
        T_STRCON => {
            let field = pos + 1;
            let bytes: [u8; 2] = payload
                .get(field..field + OFFSIZE)
                .ok_or(BasicError::new(ErrorKind::BadProg))?
                .try_into()
                .unwrap();
            let len = u16::from_le_bytes(bytes) as usize;
            let start = field + OFFSIZE;
            let content = payload
                .get(start..start + len)
                .ok_or(BasicError::new(ErrorKind::BadProg))?;
            Ok((Item::StrCon { content, field_off: field }, start + len))
        }
        T_VARREF => {
            let namelen = *payload
                .get(pos + 1)
                .ok_or(BasicError::new(ErrorKind::BadProg))? as usize;
            let cache = pos + 2;
            let start = cache + LOFFSIZE;
            let name = payload
                .get(start..start + namelen)
                .ok_or(BasicError::new(ErrorKind::BadProg))?;
            Ok((Item::VarRef { name, cache_off: cache }, start + namelen))
        }
        T_CMD => {
            let c = *payload
                .get(pos + 1)
                .ok_or(BasicError::new(ErrorKind::BadProg))?;
            let cmd = Cmd::try_from(c)
                .map_err(|_| BasicError::with_val(ErrorKind::BadToken, c as i64))?;
            Ok((Item::Cmd(cmd), pos + 2))
        }
        0x20..=0x7E => Ok((Item::Char(b), pos + 1)),
        0x80..=0xFE => {
            let token = Token::try_from(b)
                .map_err(|_| BasicError::with_val(ErrorKind::BadToken, b as i64))?;
            Ok((Item::Token(token), pos + 1))
        }
        _ => Err(BasicError::with_val(ErrorKind::BadToken, b as i64)),
    }
}

/// Offsets (within the payload) of every string-literal length field, the
/// side references consulted by LISTIF and LVAR.
pub fn string_fields(payload: &[u8]) -> BResult<Vec<usize>> {
    let mut offs = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let (item, next) = item_at(payload, pos)?;
        if let Item::StrCon { field_off, .. } = item {
            offs.push(field_off);
        }
        pos = next;
    }
    Ok(offs)
}

/// Zero every variable-cache field in a payload (identifiers unbind).
pub fn clear_var_caches(payload: &mut [u8]) -> BResult<()> {
    let mut pos = 0;
    while pos < payload.len() {
        let (item, next) = item_at(payload, pos)?;
        if let Item::VarRef { cache_off, .. } = item {
            payload[cache_off..cache_off + LOFFSIZE].fill(0);
        }
        pos = next;
    }
    Ok(())
}

fn keyword_is_operator(token: Token) -> bool {
    matches!(
        token,
        Token::And
            | Token::Or
            | Token::Eor
            | Token::Mod
            | Token::Div
            | Token::Step
            | Token::To
            | Token::Of
    )
}

/// Reconstruct the source text of a payload under the LISTO flags.
/// `indent` carries the structure-indent depth across lines when
/// `Listo::INDENT` is set.
pub fn expand(
    number: Option<u16>,
    payload: &[u8],
    listo: Listo,
    indent: &mut usize,
) -> BResult<String> {
    let mut out = String::new();
    if let Some(n) = number {
        if !listo.contains(Listo::NONUMBER) {
            out.push_str(&n.to_string());
            if listo.contains(Listo::SPACE) && payload.first() != Some(&b' ') {
                out.push(' ');
            }
        }
    }

    let mut depth_delta: isize = 0;
    let mut body = String::new();
    let mut pos = 0;
    while pos < payload.len() {
        let (item, next) = item_at(payload, pos)?;
        match item {
            Item::Pad => {}
            Item::Token(t) => {
                let text = keyword_text(t);
                let spaced = listo.contains(Listo::EXPAND) && keyword_is_operator(t);
                if spaced && !body.ends_with(' ') {
                    body.push(' ');
                }
                if listo.contains(Listo::LOWER) {
                    body.push_str(&text.to_ascii_lowercase());
                } else {
                    body.push_str(text);
                }
                if spaced {
                    body.push(' ');
                }
                match t {
                    Token::For | Token::Repeat | Token::While => depth_delta += 1,
                    Token::Next | Token::Until | Token::Endwhile => depth_delta -= 1,
                    _ => {}
                }
                if t == Token::Rem || t == Token::Data {
                    // Verbatim trailing text.
                    for &c in &payload[next..] {
                        if c != T_PAD {
                            body.push(c as char);
                        }
                    }
                    pos = payload.len();
                    continue;
                }
            }
            Item::Cmd(c) => {
                let text = command_text(c);
                if listo.contains(Listo::LOWER) {
                    body.push_str(&text.to_ascii_lowercase());
                } else {
                    body.push_str(text);
                }
            }
            Item::Char(c) => {
                if c == b':' && listo.contains(Listo::SPLIT) {
                    body.push('\n');
                    let pad = *indent;
                    for _ in 0..pad {
                        body.push_str("  ");
                    }
                } else {
                    body.push(c as char);
                }
            }
            Item::StrCon { content, .. } => {
                body.push('"');
                for &c in content {
                    if c == b'"' {
                        body.push_str("\"\"");
                    } else {
                        body.push(c as char);
                    }
                }
                body.push('"');
            }
            Item::LineRef { value, .. } => {
                body.push_str(&value.to_string());
            }
            Item::VarRef { name, .. } => {
                for &c in name {
                    body.push(c as char);
                }
            }
        }
        pos = next;
    }

    if listo.contains(Listo::INDENT) {
        if depth_delta < 0 {
            *indent = indent.saturating_sub(depth_delta.unsigned_abs());
        }
        for _ in 0..*indent {
            out.push_str("  ");
        }
        if depth_delta > 0 {
            *indent += depth_delta as usize;
        }
    }
    out.push_str(&body);
    Ok(out)
}

/// Canonical text of a line: expansion with LISTO 0.
pub fn normalise(number: Option<u16>, payload: &[u8]) -> BResult<String> {
    let mut indent = 0;
    expand(number, payload, Listo::empty(), &mut indent)
}

/// Parse a numeric literal at `pos` in expanded text form. Returns the
/// value and the number of bytes consumed.
pub fn parse_number(text: &[u8]) -> BResult<(Value, usize)> {
    if text.is_empty() {
        return raise(ErrorKind::BadConst);
    }
    match text[0] {
        b'&' => {
            let digits = text[1..]
                .iter()
                .take_while(|b| b.is_ascii_hexdigit())
                .count();
            if digits == 0 {
                return raise(ErrorKind::BadHex);
            }
            if digits > 16 {
                return raise(ErrorKind::ExpOflo);
            }
            let s = std::str::from_utf8(&text[1..1 + digits]).unwrap();
            let v = u64::from_str_radix(s, 16).map_err(|_| BasicError::new(ErrorKind::BadHex))?;
            let value = if v <= u32::MAX as u64 {
                Value::Int32(v as u32 as i32)
            } else {
                Value::Int64(v as i64)
            };
            Ok((value, 1 + digits))
        }
        b'%' => {
            let digits = text[1..]
                .iter()
                .take_while(|&&b| b == b'0' || b == b'1')
                .count();
            if digits == 0 {
                return raise(ErrorKind::BadBin);
            }
            if digits > 64 {
                return raise(ErrorKind::ExpOflo);
            }
            let s = std::str::from_utf8(&text[1..1 + digits]).unwrap();
            let v = u64::from_str_radix(s, 2).map_err(|_| BasicError::new(ErrorKind::BadBin))?;
            let value = if v <= u32::MAX as u64 {
                Value::Int32(v as u32 as i32)
            } else {
                Value::Int64(v as i64)
            };
            Ok((value, 1 + digits))
        }
        b'0'..=b'9' | b'.' => {
            let mut end = 0;
            let mut fractional = false;
            while end < text.len() && text[end].is_ascii_digit() {
                end += 1;
            }
            if text.get(end) == Some(&b'.') {
                fractional = true;
                end += 1;
                while end < text.len() && text[end].is_ascii_digit() {
                    end += 1;
                }
            }
            if matches!(text.get(end), Some(b'E') | Some(b'e')) {
                let mut exp_end = end + 1;
                if matches!(text.get(exp_end), Some(b'+') | Some(b'-')) {
                    exp_end += 1;
                }
                let exp_digits = text[exp_end..]
                    .iter()
                    .take_while(|b| b.is_ascii_digit())
                    .count();
                if exp_digits > 0 {
                    fractional = true;
                    end = exp_end + exp_digits;
                }
            }
            let s = std::str::from_utf8(&text[..end]).unwrap();
            if fractional {
                let f: f64 = s.parse().map_err(|_| BasicError::new(ErrorKind::BadConst))?;
                if !f.is_finite() {
                    return raise(ErrorKind::ExpOflo);
                }
                Ok((Value::Float(f), end))
            } else if let Ok(v) = s.parse::<i32>() {
                Ok((Value::Int32(v), end))
            } else if let Ok(v) = s.parse::<i64>() {
                Ok((Value::Int64(v), end))
            } else {
                raise(ErrorKind::ExpOflo)
            }
        }
        _ => raise(ErrorKind::BadConst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(src: &str) -> String {
        let t = tokenize(src, LineMode::HasLine, false).unwrap();
        normalise(t.number, &t.payload).unwrap()
    }

    #[test]
    fn simple_lines_round_trip() {
        for src in [
            "10 PRINT \"HELLO\"",
            "20 A%=5 : A%+=3 : PRINT A%",
            "30 FOR I%=1 TO 10 STEP 2",
            "40 IF A%>3 THEN PRINT \"big\" ELSE PRINT \"small\"",
            "50 rate=1.5E3+&1FE-%1010",
            "60 REM anything goes here, even PRINT",
        ] {
            assert_eq!(roundtrip(src), src);
        }
    }

    #[test]
    fn tokenising_is_deterministic() {
        let a = tokenize("10 PRINT A$", LineMode::HasLine, false).unwrap();
        let b = tokenize("10 PRINT A$", LineMode::HasLine, false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn keywords_shrink_to_one_byte() {
        let t = tokenize("PRINT", LineMode::NoLine, false).unwrap();
        assert_eq!(t.payload, vec![Token::Print as u8]);
        let t = tokenize("LIST", LineMode::NoLine, false).unwrap();
        assert_eq!(t.payload, vec![T_CMD, Cmd::List as u8]);
    }

    #[test]
    fn keyword_does_not_swallow_identifier() {
        let t = tokenize("TIMER=1", LineMode::NoLine, false).unwrap();
        let (item, _) = item_at(&t.payload, 0).unwrap();
        match item {
            Item::VarRef { name, .. } => assert_eq!(name, b"TIMER"),
            other => panic!("expected identifier, got {other:?}"),
        }
    }

    #[test]
    fn lowercase_keywords_need_the_flag() {
        let t = tokenize("print", LineMode::NoLine, false).unwrap();
        assert!(matches!(item_at(&t.payload, 0).unwrap().0, Item::VarRef { .. }));
        let t = tokenize("print", LineMode::NoLine, true).unwrap();
        assert_eq!(t.payload, vec![Token::Print as u8]);
    }

    #[test]
    fn goto_target_becomes_embedded_field() {
        let t = tokenize("10 GOTO 20", LineMode::HasLine, false).unwrap();
        let mut found = false;
        let mut pos = 0;
        while pos < t.payload.len() {
            let (item, next) = item_at(&t.payload, pos).unwrap();
            if let Item::LineRef { value, field_off } = item {
                assert_eq!(value, 20);
                assert_eq!((LINE_HDR + field_off) % OFFSIZE, 0);
                found = true;
            }
            pos = next;
        }
        assert!(found);
        assert_eq!(roundtrip("10 GOTO 20"), "10 GOTO 20");
    }

    #[test]
    fn on_goto_list_embeds_every_target() {
        let t = tokenize("ON X% GOTO 10,20,30", LineMode::NoLine, false).unwrap();
        let mut targets = Vec::new();
        let mut pos = 0;
        while pos < t.payload.len() {
            let (item, next) = item_at(&t.payload, pos).unwrap();
            if let Item::LineRef { value, .. } = item {
                targets.push(value);
            }
            pos = next;
        }
        assert_eq!(targets, vec![10, 20, 30]);
    }

    #[test]
    fn string_literals_keep_doubled_quotes() {
        assert_eq!(roundtrip("10 PRINT \"say \"\"hi\"\"\""), "10 PRINT \"say \"\"hi\"\"\"");
        let t = tokenize("PRINT \"say \"\"hi\"\"\"", LineMode::NoLine, false).unwrap();
        let fields = string_fields(&t.payload).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!((LINE_HDR + fields[0]) % OFFSIZE, 0);
    }

    #[test]
    fn unterminated_string_is_refused() {
        assert_eq!(
            tokenize("PRINT \"oops", LineMode::NoLine, false).unwrap_err().kind,
            ErrorKind::QuoteMiss
        );
    }

    #[test]
    fn var_cache_fields_are_aligned_and_clearable() {
        let t = tokenize("alpha=beta+1", LineMode::NoLine, false).unwrap();
        let mut payload = t.payload.clone();
        let mut pos = 0;
        let mut seen = 0;
        while pos < payload.len() {
            let (item, next) = item_at(&payload, pos).unwrap();
            if let Item::VarRef { cache_off, .. } = item {
                assert_eq!((LINE_HDR + cache_off) % LOFFSIZE, 0);
                payload[cache_off..cache_off + LOFFSIZE]
                    .copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
                seen += 1;
            }
            pos = next;
        }
        assert_eq!(seen, 2);
        clear_var_caches(&mut payload).unwrap();
        let mut pos = 0;
        while pos < payload.len() {
            let (item, next) = item_at(&payload, pos).unwrap();
            if let Item::VarRef { cache_off, .. } = item {
                assert_eq!(&payload[cache_off..cache_off + LOFFSIZE], &[0, 0, 0, 0]);
            }
            pos = next;
        }
    }

    #[test]
    fn no_payload_byte_is_zero_outside_fields() {
        let t = tokenize("10 GOTO 20 : PRINT \"x\"", LineMode::HasLine, false).unwrap();
        let mut pos = 0;
        let mut field_bytes = vec![false; t.payload.len()];
        while pos < t.payload.len() {
            let (item, next) = item_at(&t.payload, pos).unwrap();
            match item {
                Item::LineRef { field_off, .. } => {
                    for i in field_off..field_off + OFFSIZE {
                        field_bytes[i] = true;
                    }
                }
                Item::StrCon { field_off, .. } => {
                    for i in field_off..field_off + OFFSIZE {
                        field_bytes[i] = true;
                    }
                }
                Item::VarRef { cache_off, .. } => {
                    for i in cache_off..cache_off + LOFFSIZE {
                        field_bytes[i] = true;
                    }
                }
                _ => {}
            }
            pos = next;
        }
        for (i, &b) in t.payload.iter().enumerate() {
            if !field_bytes[i] {
                assert_ne!(b, 0, "payload byte {i} is a stray zero");
            }
        }
    }

    #[test]
    fn line_number_range_is_enforced() {
        assert_eq!(
            tokenize("0 PRINT", LineMode::HasLine, false).unwrap_err().kind,
            ErrorKind::LineNo
        );
        assert_eq!(
            tokenize("65280 PRINT", LineMode::HasLine, false).unwrap_err().kind,
            ErrorKind::LineNo
        );
        assert!(tokenize("65279 PRINT", LineMode::HasLine, false).is_ok());
    }

    #[test]
    fn overlong_line_is_refused() {
        let long = format!("10 PRINT \"{}\"", "x".repeat(1100));
        assert_eq!(
            tokenize(&long, LineMode::HasLine, false).unwrap_err().kind,
            ErrorKind::StateLen
        );
    }

    #[test]
    fn numeric_literal_parse_rules() {
        assert_eq!(parse_number(b"123").unwrap().0, Value::Int32(123));
        assert_eq!(parse_number(b"1.5").unwrap().0, Value::Float(1.5));
        assert_eq!(parse_number(b"1E3").unwrap().0, Value::Float(1000.0));
        assert_eq!(parse_number(b"&1FE").unwrap().0, Value::Int32(0x1FE));
        assert_eq!(parse_number(b"&FFFFFFFF").unwrap().0, Value::Int32(-1));
        assert_eq!(
            parse_number(b"&FFFFFFFFFFFF").unwrap().0,
            Value::Int64(0xFFFF_FFFF_FFFF)
        );
        assert_eq!(parse_number(b"%1010").unwrap().0, Value::Int32(10));
        assert_eq!(
            parse_number(b"3000000000").unwrap().0,
            Value::Int64(3_000_000_000)
        );
        assert_eq!(
            parse_number(b"99999999999999999999").unwrap_err().kind,
            ErrorKind::ExpOflo
        );
        assert_eq!(parse_number(b"&XYZ").unwrap_err().kind, ErrorKind::BadHex);
    }

    #[test]
    fn listo_formatting_variants() {
        let t = tokenize("10PRINT\"X\":PRINT\"Y\"", LineMode::HasLine, false).unwrap();
        let mut indent = 0;
        let plain = expand(t.number, &t.payload, Listo::empty(), &mut indent).unwrap();
        assert_eq!(plain, "10PRINT\"X\":PRINT\"Y\"");
        let mut indent = 0;
        let spaced = expand(t.number, &t.payload, Listo::SPACE, &mut indent).unwrap();
        assert_eq!(spaced, "10 PRINT\"X\":PRINT\"Y\"");
        let mut indent = 0;
        let lower = expand(t.number, &t.payload, Listo::LOWER, &mut indent).unwrap();
        assert_eq!(lower, "10print\"X\":print\"Y\"");
        let mut indent = 0;
        let nonum = expand(t.number, &t.payload, Listo::NONUMBER, &mut indent).unwrap();
        assert_eq!(nonum, "PRINT\"X\":PRINT\"Y\"");
    }
}
