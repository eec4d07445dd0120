//! Pickle opcodes and the instruction reader.
//!
//! [`read_instruction`] decodes one opcode and its inline argument; the
//! decoder and the disassembler both build on it.

use std::borrow::Cow;
use std::fmt;

use num_bigint::BigInt;

use crate::codec::primitives::Reader;
use crate::error::{DecodeError, DecodeErrorKind};
use crate::limits::MAX_LONG_BYTES;

macro_rules! opcodes {
    ($($variant:ident = $byte:literal, $name:literal;)*) => {
        /// A pickle opcode (protocols 0 through 5).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $byte,)*
        }

        impl Opcode {
            /// Returns the opcode for a byte, if it is one.
            pub fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $($byte => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            /// The opcode's name as used by `pickletools`.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }
        }
    };
}

opcodes! {
    // protocol 0 and 1
    Mark = b'(', "MARK";
    Stop = b'.', "STOP";
    Pop = b'0', "POP";
    PopMark = b'1', "POP_MARK";
    Dup = b'2', "DUP";
    Float = b'F', "FLOAT";
    Int = b'I', "INT";
    BinInt = b'J', "BININT";
    BinInt1 = b'K', "BININT1";
    Long = b'L', "LONG";
    BinInt2 = b'M', "BININT2";
    None = b'N', "NONE";
    PersId = b'P', "PERSID";
    BinPersId = b'Q', "BINPERSID";
    Reduce = b'R', "REDUCE";
    String = b'S', "STRING";
    BinString = b'T', "BINSTRING";
    ShortBinString = b'U', "SHORT_BINSTRING";
    Unicode = b'V', "UNICODE";
    BinUnicode = b'X', "BINUNICODE";
    Append = b'a', "APPEND";
    Build = b'b', "BUILD";
    Global = b'c', "GLOBAL";
    Dict = b'd', "DICT";
    EmptyDict = b'}', "EMPTY_DICT";
    Appends = b'e', "APPENDS";
    Get = b'g', "GET";
    BinGet = b'h', "BINGET";
    Inst = b'i', "INST";
    LongBinGet = b'j', "LONG_BINGET";
    List = b'l', "LIST";
    EmptyList = b']', "EMPTY_LIST";
    Obj = b'o', "OBJ";
    Put = b'p', "PUT";
    BinPut = b'q', "BINPUT";
    LongBinPut = b'r', "LONG_BINPUT";
    SetItem = b's', "SETITEM";
    Tuple = b't', "TUPLE";
    EmptyTuple = b')', "EMPTY_TUPLE";
    SetItems = b'u', "SETITEMS";
    BinFloat = b'G', "BINFLOAT";
    // protocol 2
    Proto = 0x80, "PROTO";
    NewObj = 0x81, "NEWOBJ";
    Ext1 = 0x82, "EXT1";
    Ext2 = 0x83, "EXT2";
    Ext4 = 0x84, "EXT4";
    Tuple1 = 0x85, "TUPLE1";
    Tuple2 = 0x86, "TUPLE2";
    Tuple3 = 0x87, "TUPLE3";
    NewTrue = 0x88, "NEWTRUE";
    NewFalse = 0x89, "NEWFALSE";
    Long1 = 0x8a, "LONG1";
    Long4 = 0x8b, "LONG4";
    // protocol 3
    BinBytes = b'B', "BINBYTES";
    ShortBinBytes = b'C', "SHORT_BINBYTES";
    // protocol 4
    ShortBinUnicode = 0x8c, "SHORT_BINUNICODE";
    BinUnicode8 = 0x8d, "BINUNICODE8";
    BinBytes8 = 0x8e, "BINBYTES8";
    EmptySet = 0x8f, "EMPTY_SET";
    AddItems = 0x90, "ADDITEMS";
    FrozenSet = 0x91, "FROZENSET";
    NewObjEx = 0x92, "NEWOBJ_EX";
    StackGlobal = 0x93, "STACK_GLOBAL";
    Memoize = 0x94, "MEMOIZE";
    Frame = 0x95, "FRAME";
    // protocol 5
    ByteArray8 = 0x96, "BYTEARRAY8";
    NextBuffer = 0x97, "NEXT_BUFFER";
    ReadOnlyBuffer = 0x98, "READONLY_BUFFER";
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The inline argument of an instruction, already parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg<'a> {
    None,
    /// Small integer literals (`INT`, `BININT*`).
    Int(i64),
    /// Integers that may exceed 64 bits (`LONG*`, large `INT`).
    Long(BigInt),
    /// `INT` written as `01`/`00`, the protocol 0 booleans.
    Bool(bool),
    Float(f64),
    /// Byte-string literals. Protocol 0 `STRING` needs unescaping and owns
    /// its bytes; binary forms borrow from the input.
    Bytes(Cow<'a, [u8]>),
    Text(Cow<'a, str>),
    /// Memo keys, protocol numbers, frame lengths and extension codes.
    Uint(u64),
    /// `GLOBAL` and `INST` name pairs.
    Global { module: &'a str, name: &'a str },
}

impl fmt::Display for Arg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::None => Ok(()),
            Arg::Int(v) => write!(f, "{v}"),
            Arg::Long(v) => write!(f, "{v}L"),
            Arg::Bool(v) => f.write_str(if *v { "True" } else { "False" }),
            Arg::Float(v) => write!(f, "{v:?}"),
            Arg::Bytes(b) => write!(f, "b'{}'", b.escape_ascii()),
            Arg::Text(s) => write!(f, "{s:?}"),
            Arg::Uint(v) => write!(f, "{v}"),
            Arg::Global { module, name } => write!(f, "'{module} {name}'"),
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction<'a> {
    /// Byte offset of the opcode.
    pub offset: usize,
    pub opcode: Opcode,
    pub arg: Arg<'a>,
}

/// Reads the next instruction. Errors are located at the opcode's offset.
pub fn read_instruction<'a>(reader: &mut Reader<'a>) -> Result<Instruction<'a>, DecodeError> {
    let offset = reader.position();
    let byte = reader.read_byte("opcode")?;
    let opcode = Opcode::from_u8(byte)
        .ok_or_else(|| DecodeError::new(offset, DecodeErrorKind::UnknownOpcode { opcode: byte }))?;
    let arg = read_arg(reader, opcode).map_err(|e| DecodeError::new(offset, e.kind))?;
    Ok(Instruction {
        offset,
        opcode,
        arg,
    })
}

/// Decodes a whole stream into instructions, up to and including `STOP`.
pub fn disassemble(input: &[u8]) -> Result<Vec<Instruction<'_>>, DecodeError> {
    let mut reader = Reader::new(input);
    let mut out = Vec::new();
    while !reader.is_empty() {
        let instruction = read_instruction(&mut reader)?;
        let stop = instruction.opcode == Opcode::Stop;
        out.push(instruction);
        if stop {
            return Ok(out);
        }
    }
    Err(DecodeError::new(input.len(), DecodeErrorKind::MissingStop))
}

fn read_arg<'a>(r: &mut Reader<'a>, opcode: Opcode) -> Result<Arg<'a>, DecodeError> {
    use Opcode as Op;

    let arg = match opcode {
        Op::Int => {
            let line = utf8(r.read_line("INT")?, "INT")?;
            match line {
                "01" => Arg::Bool(true),
                "00" => Arg::Bool(false),
                _ => match line.parse::<i64>() {
                    Ok(v) => Arg::Int(v),
                    Err(_) => Arg::Long(parse_long(line, "INT")?),
                },
            }
        }
        Op::BinInt => Arg::Int(r.read_i32_le("BININT")?.into()),
        Op::BinInt1 => Arg::Int(r.read_byte("BININT1")?.into()),
        Op::BinInt2 => Arg::Int(r.read_u16_le("BININT2")?.into()),
        Op::Long => {
            let line = utf8(r.read_line("LONG")?, "LONG")?;
            Arg::Long(parse_long(line.strip_suffix('L').unwrap_or(line), "LONG")?)
        }
        Op::Long1 => {
            let len = r.read_byte("LONG1 length")?;
            Arg::Long(BigInt::from_signed_bytes_le(r.read_bytes(len.into(), "LONG1")?))
        }
        Op::Long4 => {
            let len = signed_len(r, "LONG4 length")?;
            if len > MAX_LONG_BYTES {
                return Err(DecodeError::new(
                    r.position(),
                    DecodeErrorKind::LengthExceedsLimit {
                        field: "LONG4",
                        len,
                        max: MAX_LONG_BYTES,
                    },
                ));
            }
            Arg::Long(BigInt::from_signed_bytes_le(r.read_bytes(len, "LONG4")?))
        }
        Op::Float => {
            let line = utf8(r.read_line("FLOAT")?, "FLOAT")?;
            Arg::Float(line.trim().parse().map_err(|_| invalid(r, "FLOAT", line))?)
        }
        Op::BinFloat => Arg::Float(r.read_f64_be("BINFLOAT")?),

        Op::String => {
            let line = r.read_line("STRING")?;
            let bytes = unquote(line).ok_or_else(|| invalid(r, "STRING", &String::from_utf8_lossy(line)))?;
            Arg::Bytes(Cow::Owned(bytes))
        }
        Op::BinString => {
            let len = signed_len(r, "BINSTRING length")?;
            Arg::Bytes(Cow::Borrowed(r.read_sized(len as u64, "BINSTRING")?))
        }
        Op::ShortBinString => {
            let len = r.read_byte("SHORT_BINSTRING length")?;
            Arg::Bytes(Cow::Borrowed(r.read_bytes(len.into(), "SHORT_BINSTRING")?))
        }
        Op::BinBytes => {
            let len = r.read_u32_le("BINBYTES length")?;
            Arg::Bytes(Cow::Borrowed(r.read_sized(len.into(), "BINBYTES")?))
        }
        Op::ShortBinBytes => {
            let len = r.read_byte("SHORT_BINBYTES length")?;
            Arg::Bytes(Cow::Borrowed(r.read_bytes(len.into(), "SHORT_BINBYTES")?))
        }
        Op::BinBytes8 | Op::ByteArray8 => {
            let len = r.read_u64_le("BINBYTES8 length")?;
            Arg::Bytes(Cow::Borrowed(r.read_sized(len, opcode.name())?))
        }

        Op::Unicode => {
            let line = r.read_line("UNICODE")?;
            Arg::Text(Cow::Owned(raw_unicode_unescape(line).ok_or_else(|| {
                invalid(r, "UNICODE", &String::from_utf8_lossy(line))
            })?))
        }
        Op::BinUnicode => {
            let len = r.read_u32_le("BINUNICODE length")?;
            Arg::Text(Cow::Borrowed(utf8(r.read_sized(len.into(), "BINUNICODE")?, "BINUNICODE")?))
        }
        Op::ShortBinUnicode => {
            let len = r.read_byte("SHORT_BINUNICODE length")?;
            let bytes = r.read_bytes(len.into(), "SHORT_BINUNICODE")?;
            Arg::Text(Cow::Borrowed(utf8(bytes, "SHORT_BINUNICODE")?))
        }
        Op::BinUnicode8 => {
            let len = r.read_u64_le("BINUNICODE8 length")?;
            Arg::Text(Cow::Borrowed(utf8(r.read_sized(len, "BINUNICODE8")?, "BINUNICODE8")?))
        }

        Op::Get | Op::Put => {
            let line = utf8(r.read_line(opcode.name())?, opcode.name())?;
            Arg::Uint(line.parse().map_err(|_| invalid(r, opcode.name(), line))?)
        }
        Op::BinGet | Op::BinPut => Arg::Uint(r.read_byte(opcode.name())?.into()),
        Op::LongBinGet | Op::LongBinPut => Arg::Uint(r.read_u32_le(opcode.name())?.into()),

        Op::Global | Op::Inst => {
            let module = utf8(r.read_line("global module")?, "global module")?;
            let name = utf8(r.read_line("global name")?, "global name")?;
            Arg::Global { module, name }
        }

        Op::Proto => Arg::Uint(r.read_byte("PROTO")?.into()),
        Op::Frame => Arg::Uint(r.read_u64_le("FRAME")?),
        Op::Ext1 => Arg::Uint(r.read_byte("EXT1")?.into()),
        Op::Ext2 => Arg::Uint(r.read_u16_le("EXT2")?.into()),
        Op::Ext4 => Arg::Uint(r.read_u32_le("EXT4")?.into()),
        Op::PersId => {
            let line = r.read_line("PERSID")?;
            Arg::Text(String::from_utf8_lossy(line))
        }

        Op::Mark
        | Op::Stop
        | Op::Pop
        | Op::PopMark
        | Op::Dup
        | Op::None
        | Op::BinPersId
        | Op::Reduce
        | Op::Append
        | Op::Build
        | Op::Dict
        | Op::EmptyDict
        | Op::Appends
        | Op::List
        | Op::EmptyList
        | Op::Obj
        | Op::SetItem
        | Op::Tuple
        | Op::EmptyTuple
        | Op::SetItems
        | Op::NewObj
        | Op::Tuple1
        | Op::Tuple2
        | Op::Tuple3
        | Op::NewTrue
        | Op::NewFalse
        | Op::EmptySet
        | Op::AddItems
        | Op::FrozenSet
        | Op::NewObjEx
        | Op::StackGlobal
        | Op::Memoize
        | Op::NextBuffer
        | Op::ReadOnlyBuffer => Arg::None,
    };
    Ok(arg)
}

fn invalid(r: &Reader<'_>, context: &'static str, text: &str) -> DecodeError {
    DecodeError::new(
        r.position(),
        DecodeErrorKind::InvalidLiteral {
            context,
            text: text.to_owned(),
        },
    )
}

fn utf8<'a>(bytes: &'a [u8], context: &'static str) -> Result<&'a str, DecodeError> {
    std::str::from_utf8(bytes).map_err(|_| DecodeError::new(0, DecodeErrorKind::InvalidUtf8 { context }))
}

/// Reads a 4-byte length that the format declares as signed.
fn signed_len(r: &mut Reader<'_>, context: &'static str) -> Result<usize, DecodeError> {
    let len = r.read_i32_le(context)?;
    usize::try_from(len).map_err(|_| invalid(r, context, &len.to_string()))
}

fn parse_long(text: &str, context: &'static str) -> Result<BigInt, DecodeError> {
    text.trim().parse().map_err(|_| {
        DecodeError::new(
            0,
            DecodeErrorKind::InvalidLiteral {
                context,
                text: text.to_owned(),
            },
        )
    })
}

/// Decodes a quoted protocol 0 `STRING` argument (`'...'` or `"..."` with
/// backslash escapes).
fn unquote(line: &[u8]) -> Option<Vec<u8>> {
    let (&quote, rest) = line.split_first()?;
    if quote != b'\'' && quote != b'"' {
        return None;
    }
    let body = rest.strip_suffix(&[quote])?;

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let esc = *body.get(i)?;
        i += 1;
        match esc {
            b'\n' => {}
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'x' => {
                let hex = body.get(i..i + 2)?;
                out.push(u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                let mut digits = 1;
                while digits < 3 {
                    match body.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Some(out)
}

/// Decodes a protocol 0 `UNICODE` argument: `\uXXXX` and `\UXXXXXXXX`
/// escapes, every other byte is a Latin-1 character.
fn raw_unicode_unescape(line: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        let width = match (b, line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => {
                out.push(char::from(b));
                i += 1;
                continue;
            }
        };
        let hex = std::str::from_utf8(line.get(i + 2..i + 2 + width)?).ok()?;
        out.push(char::from_u32(u32::from_str_radix(hex, 16).ok()?)?);
        i += 2 + width;
    }
    Some(out)
}
