// Chunk serializer/deserializer
// Binary layout: u64 magic, u8 version, u8 has-upvalues flag, then the root
// proto. Integers are LEB128 varints (signed ones zigzag encoded) and each
// instruction stores only the fields its opcode uses.

use std::io::{Cursor, Read};
use std::rc::Rc;

use smol_str::SmolStr;

use super::{Chunk, SourceRef, SymbolKind, SymbolRef, UpvalueDesc};
use crate::lua_vm::{ChunkLoadError, Instruction, OpCode};

pub const CHUNK_MAGIC: u64 = 0x1A0D_234E_4F4F_4D1D;
pub const CHUNK_VERSION: u8 = 1;

/// Nested protos deeper than this are rejected as malformed.
const MAX_PROTO_NESTING: usize = 200;

const SOURCE_NONE: u8 = 0;
const SOURCE_SAME: u8 = 1;
const SOURCE_NEW: u8 = 2;

type LoadResult<T> = Result<T, ChunkLoadError>;

/// Serialize `chunk` and its nested protos.
pub fn dump_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + chunk.code.len() * 4);
    buf.extend_from_slice(&CHUNK_MAGIC.to_le_bytes());
    buf.push(CHUNK_VERSION);
    write_bool(&mut buf, !chunk.upvalue_descs.is_empty());
    write_proto(&mut buf, chunk);
    buf
}

/// Deserialize a chunk produced by `dump_chunk`.
pub fn load_chunk(data: &[u8]) -> LoadResult<Chunk> {
    let mut cursor = Cursor::new(data);

    let mut magic = [0u8; 8];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| ChunkLoadError::NotAChunk)?;
    if u64::from_le_bytes(magic) != CHUNK_MAGIC {
        return Err(ChunkLoadError::NotAChunk);
    }

    let version = read_u8(&mut cursor)?;
    if version != CHUNK_VERSION {
        return Err(ChunkLoadError::VersionMismatch {
            expected: CHUNK_VERSION,
            found: version,
        });
    }

    let has_upvalues = read_bool(&mut cursor)?;
    let chunk = read_proto(&mut cursor, 0)?;
    if has_upvalues == chunk.upvalue_descs.is_empty() {
        return Err(ChunkLoadError::Malformed(
            "upvalue flag disagrees with root proto".to_string(),
        ));
    }
    if (cursor.position() as usize) < data.len() {
        return Err(ChunkLoadError::Malformed("trailing bytes".to_string()));
    }
    Ok(chunk)
}

// ============ Writing ============

fn write_proto(buf: &mut Vec<u8>, chunk: &Chunk) {
    write_string(buf, &chunk.name);
    write_string(buf, &chunk.source_name);
    write_varint(buf, chunk.param_count as u64);
    write_bool(buf, chunk.is_vararg);

    write_varint(buf, chunk.locals.len() as u64);
    for local in &chunk.locals {
        write_string(buf, local);
    }

    write_varint(buf, chunk.strings.len() as u64);
    for s in &chunk.strings {
        write_string(buf, s);
    }
    write_varint(buf, chunk.numbers.len() as u64);
    for n in &chunk.numbers {
        buf.extend_from_slice(&n.to_bits().to_le_bytes());
    }

    write_varint(buf, chunk.symbols.len() as u64);
    for symbol in &chunk.symbols {
        buf.push(symbol.kind as u8);
        write_varint(buf, symbol.index as u64);
        write_string(buf, &symbol.name);
    }
    // Environment links go after the whole table so they can point forward.
    for symbol in &chunk.symbols {
        write_varint(buf, symbol.env.map_or(0, |env| env as u64 + 1));
    }

    write_varint(buf, chunk.upvalue_descs.len() as u64);
    for desc in &chunk.upvalue_descs {
        write_bool(buf, desc.from_parent_local);
        write_varint(buf, desc.index as u64);
        write_string(buf, &desc.name);
    }

    write_varint(buf, chunk.code.len() as u64);
    for instr in &chunk.code {
        write_instruction(buf, *instr);
    }

    let mut previous: Option<SourceRef> = None;
    for pc in 0..chunk.code.len() {
        match chunk.source_ref_at(pc) {
            None => buf.push(SOURCE_NONE),
            Some(sref) if previous == Some(sref) => buf.push(SOURCE_SAME),
            Some(sref) => {
                buf.push(SOURCE_NEW);
                write_varint(buf, sref.source_id as u64);
                write_varint(buf, sref.from_line as u64);
                write_varint(buf, sref.to_line as u64);
                write_varint(buf, sref.from_char as u64);
                write_varint(buf, sref.to_char as u64);
                previous = Some(sref);
            }
        }
    }

    write_varint(buf, chunk.protos.len() as u64);
    for proto in &chunk.protos {
        write_proto(buf, proto);
    }
}

fn write_instruction(buf: &mut Vec<u8>, instr: Instruction) {
    let Some(op) = instr.get_opcode() else {
        buf.push(u8::MAX);
        return;
    };
    buf.push(op as u8);
    let usage = op.field_usage();
    if usage.uses_a() {
        write_signed(buf, instr.get_a() as i64);
    }
    if usage.uses_b() {
        write_varint(buf, instr.get_b() as u64);
    }
    if usage.uses_c() {
        write_varint(buf, instr.get_c() as u64);
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn write_signed(buf: &mut Vec<u8>, value: i64) {
    write_varint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

fn write_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(value as u8);
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

// ============ Reading ============

fn read_proto(cursor: &mut Cursor<&[u8]>, depth: usize) -> LoadResult<Chunk> {
    if depth > MAX_PROTO_NESTING {
        return Err(ChunkLoadError::Malformed("protos nested too deeply".to_string()));
    }

    let name = read_string(cursor)?;
    let source_name = read_string(cursor)?;
    let param_count = read_u32(cursor)?;
    let is_vararg = read_bool(cursor)?;

    let local_count = read_len(cursor)?;
    let mut locals = Vec::with_capacity(local_count);
    for _ in 0..local_count {
        locals.push(read_string(cursor)?);
    }

    let string_count = read_len(cursor)?;
    let mut strings = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        strings.push(read_string(cursor)?);
    }
    let number_count = read_len(cursor)?;
    let mut numbers = Vec::with_capacity(number_count);
    for _ in 0..number_count {
        let mut bits = [0u8; 8];
        read_exact(cursor, &mut bits)?;
        numbers.push(f64::from_bits(u64::from_le_bytes(bits)));
    }

    let symbol_count = read_len(cursor)?;
    let mut symbols = Vec::with_capacity(symbol_count);
    for _ in 0..symbol_count {
        let kind_byte = read_u8(cursor)?;
        let kind = SymbolKind::from_u8(kind_byte).ok_or_else(|| {
            ChunkLoadError::Malformed(format!("unknown symbol kind {}", kind_byte))
        })?;
        let index = read_u32(cursor)?;
        let name = read_string(cursor)?;
        symbols.push(SymbolRef {
            kind,
            index,
            name,
            env: None,
        });
    }
    for i in 0..symbols.len() {
        let link = read_varint(cursor)?;
        if link > 0 {
            let env = link - 1;
            if env as usize >= symbols.len() {
                return Err(ChunkLoadError::Malformed(format!(
                    "environment link {} out of range",
                    env
                )));
            }
            symbols[i].env = Some(env as u32);
        }
    }

    let upvalue_count = read_len(cursor)?;
    let mut upvalue_descs = Vec::with_capacity(upvalue_count);
    for _ in 0..upvalue_count {
        let from_parent_local = read_bool(cursor)?;
        let index = read_u32(cursor)?;
        let name = read_string(cursor)?;
        upvalue_descs.push(UpvalueDesc {
            from_parent_local,
            index,
            name,
        });
    }

    let code_len = read_len(cursor)?;
    let mut code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        code.push(read_instruction(cursor)?);
    }

    let mut source_refs = Vec::with_capacity(code_len);
    let mut previous: Option<SourceRef> = None;
    for _ in 0..code_len {
        match read_u8(cursor)? {
            SOURCE_NONE => source_refs.push(None),
            SOURCE_SAME => {
                if previous.is_none() {
                    return Err(ChunkLoadError::Malformed(
                        "source ref repeats before the first one".to_string(),
                    ));
                }
                source_refs.push(previous);
            }
            SOURCE_NEW => {
                let sref = SourceRef {
                    source_id: read_u32(cursor)?,
                    from_line: read_u32(cursor)?,
                    to_line: read_u32(cursor)?,
                    from_char: read_u32(cursor)?,
                    to_char: read_u32(cursor)?,
                };
                previous = Some(sref);
                source_refs.push(previous);
            }
            tag => {
                return Err(ChunkLoadError::Malformed(format!(
                    "unknown source ref tag {}",
                    tag
                )));
            }
        }
    }

    let proto_count = read_len(cursor)?;
    let mut protos = Vec::with_capacity(proto_count);
    for _ in 0..proto_count {
        protos.push(Rc::new(read_proto(cursor, depth + 1)?));
    }

    Ok(Chunk {
        name,
        source_name,
        code,
        source_refs,
        strings,
        numbers,
        symbols,
        locals,
        param_count,
        is_vararg,
        upvalue_descs,
        protos,
    })
}

fn read_instruction(cursor: &mut Cursor<&[u8]>) -> LoadResult<Instruction> {
    let byte = read_u8(cursor)?;
    let op = OpCode::from_u8(byte)
        .ok_or_else(|| ChunkLoadError::Malformed(format!("unknown opcode {}", byte)))?;
    let usage = op.field_usage();
    let a = if usage.uses_a() {
        let a = read_signed(cursor)?;
        if a < Instruction::MIN_SIGNED_A as i64 || a > Instruction::MAX_SIGNED_A as i64 {
            return Err(ChunkLoadError::Malformed(format!("operand A {} out of range", a)));
        }
        a as i32
    } else {
        0
    };
    let b = if usage.uses_b() { read_field(cursor, Instruction::MAX_B)? } else { 0 };
    let c = if usage.uses_c() { read_field(cursor, Instruction::MAX_C)? } else { 0 };
    Ok(Instruction::new(op, a, b, c))
}

fn read_field(cursor: &mut Cursor<&[u8]>, max: u32) -> LoadResult<u32> {
    let value = read_varint(cursor)?;
    if value > max as u64 {
        return Err(ChunkLoadError::Malformed(format!("operand {} out of range", value)));
    }
    Ok(value as u32)
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> LoadResult<()> {
    cursor
        .read_exact(buf)
        .map_err(|_| ChunkLoadError::Truncated)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> LoadResult<u8> {
    let mut byte = [0u8; 1];
    read_exact(cursor, &mut byte)?;
    Ok(byte[0])
}

fn read_bool(cursor: &mut Cursor<&[u8]>) -> LoadResult<bool> {
    match read_u8(cursor)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ChunkLoadError::Malformed(format!("invalid boolean {}", other))),
    }
}

fn read_varint(cursor: &mut Cursor<&[u8]>) -> LoadResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_u8(cursor)?;
        if shift >= 64 {
            return Err(ChunkLoadError::Malformed("varint too long".to_string()));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn read_signed(cursor: &mut Cursor<&[u8]>) -> LoadResult<i64> {
    let raw = read_varint(cursor)?;
    Ok((raw >> 1) as i64 ^ -((raw & 1) as i64))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> LoadResult<u32> {
    let value = read_varint(cursor)?;
    u32::try_from(value)
        .map_err(|_| ChunkLoadError::Malformed(format!("value {} exceeds 32 bits", value)))
}

/// Element count, bounded by the bytes left so corrupt input cannot
/// trigger huge allocations.
fn read_len(cursor: &mut Cursor<&[u8]>) -> LoadResult<usize> {
    let len = read_varint(cursor)?;
    let remaining = cursor.get_ref().len() as u64 - cursor.position().min(cursor.get_ref().len() as u64);
    if len > remaining {
        return Err(ChunkLoadError::Truncated);
    }
    Ok(len as usize)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> LoadResult<SmolStr> {
    let len = read_len(cursor)?;
    let mut bytes = vec![0u8; len];
    read_exact(cursor, &mut bytes)?;
    let text = String::from_utf8(bytes)
        .map_err(|_| ChunkLoadError::Malformed("string is not valid UTF-8".to_string()))?;
    Ok(SmolStr::new(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_value::ChunkBuilder;

    fn sample() -> Chunk {
        let mut inner = ChunkBuilder::new("inner");
        inner.upvalue("x", true, 0);
        inner.line(3).load(0).ret(1);
        let inner = inner.build().unwrap();

        let mut b = ChunkBuilder::new("main");
        b.set_source_name("sample.lua");
        let x = b.local("x");
        let print = b.global("print");
        let proto = b.add_proto(inner);
        b.line(1).load_num(-2.5).store(x);
        b.line(2).load(print).load_str("hi").call(1).pop(1);
        b.set_source(None).closure(proto).ret(1);
        b.build().unwrap()
    }

    #[test]
    fn test_round_trip_is_structural_identity() {
        let chunk = sample();
        let bytes = dump_chunk(&chunk);
        let loaded = load_chunk(&bytes).unwrap();
        assert_eq!(loaded, chunk);
        assert_eq!(loaded.protos[0].source_ref_at(2), Some(SourceRef::line(3)));
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut bytes = dump_chunk(&sample());
        assert_eq!(load_chunk(b"nope"), Err(ChunkLoadError::NotAChunk));

        bytes[8] = CHUNK_VERSION + 1;
        assert_eq!(
            load_chunk(&bytes),
            Err(ChunkLoadError::VersionMismatch {
                expected: CHUNK_VERSION,
                found: CHUNK_VERSION + 1
            })
        );
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = dump_chunk(&sample());
        for cut in [10, bytes.len() / 2, bytes.len() - 1] {
            assert!(load_chunk(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
        assert_eq!(
            load_chunk(&bytes[..bytes.len() - 1]),
            Err(ChunkLoadError::Truncated)
        );
    }

    #[test]
    fn test_varints() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 300);
        write_signed(&mut buf, -3);
        let mut cursor = Cursor::new(buf.as_slice());
        assert_eq!(read_varint(&mut cursor).unwrap(), 300);
        assert_eq!(read_signed(&mut cursor).unwrap(), -3);
    }
}
