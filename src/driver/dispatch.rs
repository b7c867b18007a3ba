use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::common::{ElemType, Error, Result};
use crate::ir::{BaseId, Constant, Instruction, Opcode, Operand, View};

/// Message kinds crossing the cluster boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DispatchTag {
    Init = 1,
    Shutdown,
    Ufunc,
    Execute,
}

/// A typed envelope: one tag plus a length-prefixed byte payload. Only
/// the codec lives here; transport belongs to the cluster layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: DispatchTag,
    payload: Vec<u8>,
}

impl Envelope {
    pub fn new(tag: DispatchTag) -> Envelope {
        Envelope { tag, payload: Vec::new() }
    }

    /// Start over with a new tag, keeping the allocation.
    pub fn reset(&mut self, tag: DispatchTag) {
        self.tag = tag;
        self.payload.clear();
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    fn push_u8(&mut self, v: u8) {
        self.payload.push(v);
    }

    fn push_u32(&mut self, v: u32) {
        self.payload.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u64(&mut self, v: u64) {
        self.payload.extend_from_slice(&v.to_le_bytes());
    }

    fn push_i64(&mut self, v: i64) {
        self.payload.extend_from_slice(&v.to_le_bytes());
    }

    fn push_str(&mut self, s: &str) {
        self.push_u32(s.len() as u32);
        self.payload.extend_from_slice(s.as_bytes());
    }

    /// Component-name announcement.
    pub fn init(component: &str) -> Envelope {
        let mut e = Envelope::new(DispatchTag::Init);
        e.push_str(component);
        e
    }

    pub fn shutdown() -> Envelope {
        Envelope::new(DispatchTag::Shutdown)
    }

    /// Extension-method registration broadcast.
    pub fn ufunc(id: u32, name: &str) -> Envelope {
        let mut e = Envelope::new(DispatchTag::Ufunc);
        e.push_u32(id);
        e.push_str(name);
        e
    }

    /// An instruction batch.
    pub fn execute(batch: &[Instruction]) -> Envelope {
        let mut e = Envelope::new(DispatchTag::Execute);
        e.push_u32(batch.len() as u32);
        for instr in batch {
            e.push_u32(instr.opcode.code());
            match &instr.constant {
                Some(c) => {
                    e.push_u8(1);
                    e.push_u8(c.dtype().into());
                    e.payload.extend_from_slice(&c.to_bytes());
                }
                None => e.push_u8(0),
            }
            e.push_u32(instr.operands.len() as u32);
            for op in &instr.operands {
                match op {
                    Operand::Const => e.push_u8(0),
                    Operand::View(v) => {
                        e.push_u8(1);
                        e.push_u64(v.base.0 as u64);
                        e.push_i64(v.start);
                        e.push_u32(v.ndim() as u32);
                        for &s in &v.shape {
                            e.push_i64(s);
                        }
                        for &s in &v.stride {
                            e.push_i64(s);
                        }
                    }
                }
            }
        }
        e
    }

    /// Wire form: tag byte, `u64` payload length, payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.payload.len());
        out.push(self.tag.into());
        out.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        if bytes.len() < 9 {
            return Err(Error::Structural("dispatch envelope too short".into()));
        }
        let tag = DispatchTag::try_from(bytes[0])
            .map_err(|_| Error::Structural(format!("unknown dispatch tag {}", bytes[0])))?;
        let len = u64::from_le_bytes(bytes[1..9].try_into().unwrap()) as usize;
        if bytes.len() != 9 + len {
            return Err(Error::Structural("dispatch envelope length mismatch".into()));
        }
        Ok(Envelope { tag, payload: bytes[9..].to_vec() })
    }

    pub fn decode_init(&self) -> Result<String> {
        Reader::new(&self.payload).str()
    }

    pub fn decode_ufunc(&self) -> Result<(u32, String)> {
        let mut r = Reader::new(&self.payload);
        let id = r.u32()?;
        let name = r.str()?;
        Ok((id, name))
    }

    pub fn decode_execute(&self) -> Result<Vec<Instruction>> {
        let mut r = Reader::new(&self.payload);
        let count = r.u32()? as usize;
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            let code = r.u32()?;
            let opcode = Opcode::from_code(code)
                .ok_or_else(|| Error::Structural(format!("unknown opcode code {code}")))?;
            let constant = match r.u8()? {
                0 => None,
                _ => {
                    let dtype = ElemType::try_from(r.u8()?)
                        .map_err(|e| Error::Structural(e.to_string()))?;
                    Some(Constant::from_bytes(dtype, &r.bytes16()?))
                }
            };
            let noperands = r.u32()? as usize;
            let mut operands = Vec::with_capacity(noperands);
            for _ in 0..noperands {
                match r.u8()? {
                    0 => operands.push(Operand::Const),
                    _ => {
                        let base = BaseId(r.u64()? as usize);
                        let start = r.i64()?;
                        let ndim = r.u32()? as usize;
                        let mut shape = Vec::with_capacity(ndim);
                        for _ in 0..ndim {
                            shape.push(r.i64()?);
                        }
                        let mut stride = Vec::with_capacity(ndim);
                        for _ in 0..ndim {
                            stride.push(r.i64()?);
                        }
                        operands.push(Operand::View(View { base, start, shape, stride }));
                    }
                }
            }
            let mut instr = Instruction::new(opcode, operands);
            instr.constant = constant;
            batch.push(instr);
        }
        Ok(batch)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.at + n > self.bytes.len() {
            return Err(Error::Structural("dispatch payload truncated".into()));
        }
        let out = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes16(&mut self) -> Result<[u8; 16]> {
        Ok(self.take(16)?.try_into().unwrap())
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Structural(format!("dispatch string not utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_ufunc_round_trip() {
        let init = Envelope::init("ve-cpu");
        let back = Envelope::decode(&init.encode()).unwrap();
        assert_eq!(back.tag, DispatchTag::Init);
        assert_eq!(back.decode_init().unwrap(), "ve-cpu");

        let ufunc = Envelope::ufunc(3, "matmul");
        let back = Envelope::decode(&ufunc.encode()).unwrap();
        assert_eq!(back.decode_ufunc().unwrap(), (3, "matmul".to_string()));

        assert_eq!(Envelope::shutdown().encode().len(), 9);
    }

    #[test]
    fn execute_round_trip() {
        let scale = Instruction::with_constant(
            Opcode::Multiply,
            vec![
                Operand::View(View::contiguous(BaseId(1), &[4, 3])),
                Operand::View(View { base: BaseId(0), start: 2, shape: vec![4, 3], stride: vec![6, 2] }),
                Operand::Const,
            ],
            Constant::Float64(0.5),
        );
        let free = Instruction::new(Opcode::Free, vec![Operand::View(View::flat(BaseId(0), 12))]);
        let batch = vec![scale, free];
        let envelope = Envelope::execute(&batch);
        let back = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(back.tag, DispatchTag::Execute);
        assert_eq!(back.decode_execute().unwrap(), batch);
    }

    #[test]
    fn corrupt_envelopes_are_rejected() {
        assert!(Envelope::decode(&[]).is_err());
        assert!(Envelope::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        let mut bytes = Envelope::init("x").encode();
        bytes.truncate(bytes.len() - 1);
        assert!(Envelope::decode(&bytes).is_err());
    }
}
