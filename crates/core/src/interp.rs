//! Concrete interpreter for subroutine IR.
//!
//! Good enough to run instrumented subroutines end-to-end in tests: a
//! byte-addressed memory with freed-region poisoning, the handful of external
//! calls the site patchers care about, and an observation log (returned
//! value, disclosure-sink output, merge-point selections, external calls in
//! order) that behavior-preservation tests compare across a splice.

use crate::ir::{
    BinOp, CastOp, FOp, InstrKind, Operand, Pred, Subroutine, Terminator, Ty, ValueId,
};
use crate::numeric::Width;
use crate::result::{Error, Result};
use petgraph::graph::NodeIndex;
use std::collections::HashMap;

const STEP_LIMIT: usize = 200_000;
const HEAP_BASE: usize = 0x1000;

/// Runtime value; pointers travel as integers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RtVal {
    I(i64),
    F(f64),
}

impl RtVal {
    pub fn as_int(self) -> Result<i64> {
        match self {
            RtVal::I(v) => Ok(v),
            RtVal::F(_) => Err(Error::TypeMismatch("expected integer value".into())),
        }
    }

    pub fn as_f64(self) -> Result<f64> {
        match self {
            RtVal::F(v) => Ok(v),
            RtVal::I(_) => Err(Error::TypeMismatch("expected float value".into())),
        }
    }
}

struct Region {
    base: usize,
    size: usize,
    heap: bool,
    freed: bool,
}

/// Flat byte memory with region tracking. Reads and writes must land inside
/// a live allocation; touching a freed region is a fault, which is what the
/// placement tests rely on to catch instrumentation that outlives a buffer.
pub struct Memory {
    data: Vec<u8>,
    regions: Vec<Region>,
    next: usize,
}

impl Memory {
    fn new() -> Self {
        Self {
            data: vec![0; HEAP_BASE],
            regions: Vec::new(),
            next: HEAP_BASE,
        }
    }

    pub fn alloc(&mut self, size: usize, heap: bool) -> usize {
        let base = self.next;
        self.next += size.max(1);
        self.data.resize(self.next, 0);
        self.regions.push(Region {
            base,
            size: size.max(1),
            heap,
            freed: false,
        });
        base
    }

    pub fn free(&mut self, ptr: usize) -> Result<()> {
        match self
            .regions
            .iter_mut()
            .find(|r| r.base == ptr && r.heap && !r.freed)
        {
            Some(region) => {
                region.freed = true;
                Ok(())
            }
            None => Err(Error::MemoryFault(format!(
                "free of invalid pointer 0x{ptr:x}"
            ))),
        }
    }

    fn region_of(&self, addr: usize, len: usize) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| addr >= r.base && addr + len <= r.base + r.size)
            .ok_or_else(|| Error::MemoryFault(format!("access outside any region at 0x{addr:x}")))
    }

    fn check(&self, addr: usize, len: usize) -> Result<()> {
        let region = self.region_of(addr, len)?;
        if region.freed {
            return Err(Error::MemoryFault(format!(
                "use of freed region at 0x{addr:x}"
            )));
        }
        Ok(())
    }

    pub fn read(&self, addr: usize, len: usize) -> Result<&[u8]> {
        self.check(addr, len)?;
        Ok(&self.data[addr..addr + len])
    }

    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.check(addr, bytes.len())?;
        self.data[addr..addr + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// NUL-terminated byte string at `addr`, bounded by the region end.
    pub fn cstr(&self, addr: usize) -> Result<Vec<u8>> {
        let region = self.region_of(addr, 1)?;
        if region.freed {
            return Err(Error::MemoryFault(format!(
                "use of freed region at 0x{addr:x}"
            )));
        }
        let end = region.base + region.size;
        let slice = &self.data[addr..end];
        let len = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
        Ok(slice[..len].to_vec())
    }
}

/// External world supplied to a run.
#[derive(Debug, Clone, Default)]
pub struct ExecEnv {
    /// Line delivered by the read family, without a trailing newline.
    pub input_line: Vec<u8>,
    /// Seconds since the epoch reported by the time family.
    pub now: i64,
}

/// Observations collected by one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub ret: Option<RtVal>,
    /// Byte strings handed to the disclosure sink, in call order.
    pub disclosures: Vec<Vec<u8>>,
    /// Every merge-point selection, in execution order.
    pub merge_log: Vec<(ValueId, RtVal)>,
    /// External call names, in execution order.
    pub extern_log: Vec<String>,
}

pub struct Machine<'s> {
    sub: &'s Subroutine,
    pub mem: Memory,
    pub env: ExecEnv,
    regs: HashMap<ValueId, RtVal>,
}

impl<'s> Machine<'s> {
    pub fn new(sub: &'s Subroutine, env: ExecEnv) -> Self {
        Self {
            sub,
            mem: Memory::new(),
            env,
            regs: HashMap::new(),
        }
    }

    /// Allocates a buffer of `capacity` bytes pre-filled with `bytes` and
    /// returns its address. Used by tests to stage arguments.
    pub fn alloc_buffer(&mut self, bytes: &[u8], capacity: usize, heap: bool) -> i64 {
        let base = self.mem.alloc(capacity.max(bytes.len()), heap);
        self.mem.data[base..base + bytes.len()].copy_from_slice(bytes);
        base as i64
    }

    /// Allocates a NUL-terminated copy of `bytes`.
    pub fn alloc_cstr(&mut self, bytes: &[u8]) -> i64 {
        let base = self.mem.alloc(bytes.len() + 1, false);
        self.mem.data[base..base + bytes.len()].copy_from_slice(bytes);
        self.mem.data[base + bytes.len()] = 0;
        base as i64
    }

    pub fn run(&mut self, args: &[RtVal]) -> Result<Outcome> {
        if args.len() != self.sub.args().len() {
            return Err(Error::TypeMismatch(format!(
                "subroutine '{}' expects {} arguments, got {}",
                self.sub.name,
                self.sub.args().len(),
                args.len()
            )));
        }
        for ((id, _), value) in self.sub.args().iter().zip(args) {
            self.regs.insert(*id, *value);
        }

        let mut outcome = Outcome::default();
        let mut cur = self
            .sub
            .entry_block()
            .ok_or_else(|| Error::InvalidBlockStructure("subroutine has no entry block".into()))?;
        let mut prev: Option<NodeIndex> = None;
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > STEP_LIMIT {
                return Err(Error::StepLimit(self.sub.name.clone()));
            }

            self.run_merge_points(cur, prev, &mut outcome)?;

            let instrs = self.sub.body(cur)?.instrs.clone();
            for instr in &instrs {
                if let Some(value) = self.eval_instr(&instr.kind, &mut outcome)? {
                    self.regs.insert(instr.id, value);
                }
            }

            match self.sub.body(cur)?.term.clone() {
                Some(Terminator::Jump(target)) => {
                    prev = Some(cur);
                    cur = target;
                }
                Some(Terminator::Branch {
                    cond,
                    then_to,
                    else_to,
                }) => {
                    let taken = self.eval(cond)?.as_int()? != 0;
                    prev = Some(cur);
                    cur = if taken { then_to } else { else_to };
                }
                Some(Terminator::Return(value)) => {
                    outcome.ret = match value {
                        Some(op) => Some(self.eval(op)?),
                        None => None,
                    };
                    return Ok(outcome);
                }
                None => {
                    return Err(Error::InvalidBlockStructure(format!(
                        "block {} has no terminator",
                        cur.index()
                    )));
                }
            }
        }
    }

    /// Evaluates the block's merge points simultaneously against the
    /// arriving edge: all operands are read before any result is bound.
    fn run_merge_points(
        &mut self,
        block: NodeIndex,
        prev: Option<NodeIndex>,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let phis = self.sub.body(block)?.phis.clone();
        if phis.is_empty() {
            return Ok(());
        }
        let pred = prev.ok_or_else(|| {
            Error::InvalidBlockStructure(format!(
                "entry block {} must not contain merge points",
                block.index()
            ))
        })?;

        let mut staged = Vec::with_capacity(phis.len());
        for phi in &phis {
            let operand = phi
                .incomings
                .iter()
                .find(|(from, _)| *from == pred)
                .map(|(_, op)| *op)
                .ok_or_else(|| {
                    Error::StructuralInvariant(format!(
                        "merge point {:?} in block {} has no binding for predecessor {}",
                        phi.id,
                        block.index(),
                        pred.index()
                    ))
                })?;
            staged.push((phi.id, self.eval(operand)?));
        }
        for (id, value) in staged {
            outcome.merge_log.push((id, value));
            self.regs.insert(id, value);
        }
        Ok(())
    }

    fn eval(&self, operand: Operand) -> Result<RtVal> {
        match operand {
            Operand::Const(v, _) => Ok(RtVal::I(v)),
            Operand::ConstF(v) => Ok(RtVal::F(v)),
            Operand::Value(id) => self.regs.get(&id).copied().ok_or_else(|| {
                Error::TypeMismatch(format!("use of undefined value {:?}", id))
            }),
        }
    }

    fn eval_instr(&mut self, kind: &InstrKind, outcome: &mut Outcome) -> Result<Option<RtVal>> {
        match kind {
            InstrKind::Bin { op, width, lhs, rhs } => {
                let a = self.eval(*lhs)?.as_int()?;
                let b = self.eval(*rhs)?.as_int()?;
                let w = *width;
                let v = match op {
                    BinOp::Add => w.add(a, b),
                    BinOp::Sub => w.sub(a, b),
                    BinOp::Mul => w.mul(a, b),
                    BinOp::SDiv => w.sdiv(a, b)?,
                    BinOp::SRem => w.srem(a, b)?,
                    BinOp::Shl => w.shl(a, b),
                    BinOp::LShr => w.lshr(a, b),
                    BinOp::And => w.and(a, b),
                    BinOp::Or => w.or(a, b),
                    BinOp::Xor => w.xor(a, b),
                };
                Ok(Some(RtVal::I(v)))
            }
            InstrKind::FBin { op, lhs, rhs } => {
                let a = self.eval(*lhs)?.as_f64()?;
                let b = self.eval(*rhs)?.as_f64()?;
                let v = match op {
                    FOp::FAdd => a + b,
                    FOp::FMul => a * b,
                };
                Ok(Some(RtVal::F(v)))
            }
            InstrKind::Cmp {
                pred,
                width,
                lhs,
                rhs,
            } => {
                let a = width.wrap(self.eval(*lhs)?.as_int()?);
                let b = width.wrap(self.eval(*rhs)?.as_int()?);
                let hit = match pred {
                    Pred::Eq => a == b,
                    Pred::Ne => a != b,
                    Pred::Slt => a < b,
                    Pred::Sle => a <= b,
                    Pred::Ult => width.unsigned(a) < width.unsigned(b),
                };
                Ok(Some(RtVal::I(hit as i64)))
            }
            InstrKind::Cast {
                op,
                from,
                to,
                value,
            } => {
                let v = self.eval(*value)?;
                let out = match op {
                    CastOp::SExt => RtVal::I(v.as_int()?),
                    CastOp::ZExt => {
                        let w = from.width().ok_or_else(|| {
                            Error::TypeMismatch("zext from non-integer".into())
                        })?;
                        RtVal::I(w.unsigned(v.as_int()?) as i64)
                    }
                    CastOp::Trunc => {
                        let w = to
                            .width()
                            .ok_or_else(|| Error::TypeMismatch("trunc to non-integer".into()))?;
                        RtVal::I(w.wrap(v.as_int()?))
                    }
                    CastOp::SiToFp => RtVal::F(v.as_int()? as f64),
                    CastOp::FpToSi => {
                        let w = to
                            .width()
                            .ok_or_else(|| Error::TypeMismatch("fptosi to non-integer".into()))?;
                        RtVal::I(w.wrap(v.as_f64()?.trunc() as i64))
                    }
                };
                Ok(Some(out))
            }
            InstrKind::Call { callee, args, .. } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(*arg)?);
                }
                outcome.extern_log.push(callee.clone());
                self.call_extern(callee, &values, outcome).map(Some)
            }
            InstrKind::Alloc { heap, size } => {
                let size = self.eval(*size)?.as_int()?;
                if size < 0 {
                    return Err(Error::MemoryFault(format!(
                        "allocation of negative size {size}"
                    )));
                }
                Ok(Some(RtVal::I(self.mem.alloc(size as usize, *heap) as i64)))
            }
            InstrKind::Free { ptr } => {
                let ptr = self.eval(*ptr)?.as_int()?;
                self.mem.free(ptr as usize)?;
                Ok(None)
            }
            InstrKind::Load { ty, ptr } => {
                let addr = self.eval(*ptr)?.as_int()? as usize;
                let bytes = self.mem.read(addr, ty.size())?;
                let v = match ty {
                    Ty::I8 => RtVal::I(bytes[0] as i8 as i64),
                    Ty::I32 => RtVal::I(i32::from_le_bytes(bytes.try_into().unwrap()) as i64),
                    Ty::I64 | Ty::Ptr => RtVal::I(i64::from_le_bytes(bytes.try_into().unwrap())),
                    Ty::F64 => RtVal::F(f64::from_le_bytes(bytes.try_into().unwrap())),
                };
                Ok(Some(v))
            }
            InstrKind::Store { ty, value, ptr } => {
                let addr = self.eval(*ptr)?.as_int()? as usize;
                let v = self.eval(*value)?;
                let bytes: Vec<u8> = match ty {
                    Ty::I8 => vec![v.as_int()? as u8],
                    Ty::I32 => (v.as_int()? as i32).to_le_bytes().to_vec(),
                    Ty::I64 | Ty::Ptr => v.as_int()?.to_le_bytes().to_vec(),
                    Ty::F64 => v.as_f64()?.to_le_bytes().to_vec(),
                };
                self.mem.write(addr, &bytes)?;
                Ok(None)
            }
            InstrKind::Gep { base, offset } => {
                let base = self.eval(*base)?.as_int()?;
                let offset = self.eval(*offset)?.as_int()?;
                Ok(Some(RtVal::I(base + offset)))
            }
            InstrKind::EndScope { .. } => Ok(None),
        }
    }

    fn call_extern(
        &mut self,
        callee: &str,
        args: &[RtVal],
        outcome: &mut Outcome,
    ) -> Result<RtVal> {
        match callee {
            "atoi" => {
                let s = self.mem.cstr(args[0].as_int()? as usize)?;
                Ok(RtVal::I(Width::W32.wrap(parse_c_long(&s, 10))))
            }
            "atol" => {
                let s = self.mem.cstr(args[0].as_int()? as usize)?;
                Ok(RtVal::I(parse_c_long(&s, 10)))
            }
            "strtol" | "__isoc23_strtol" | "xstrtol" => {
                let s = self.mem.cstr(args[0].as_int()? as usize)?;
                let base = args[2].as_int()? as u32;
                Ok(RtVal::I(parse_c_long(&s, base)))
            }
            "strlen" => {
                let s = self.mem.cstr(args[0].as_int()? as usize)?;
                Ok(RtVal::I(s.len() as i64))
            }
            "gets" => {
                let buf = args[0].as_int()? as usize;
                let line = self.env.input_line.clone();
                let mut bytes = line;
                bytes.push(0);
                self.mem.write(buf, &bytes)?;
                Ok(RtVal::I(buf as i64))
            }
            "fgets" => {
                let buf = args[0].as_int()? as usize;
                let cap = args[1].as_int()?.max(1) as usize;
                let mut bytes = self.env.input_line.clone();
                bytes.push(b'\n');
                bytes.truncate(cap - 1);
                bytes.push(0);
                self.mem.write(buf, &bytes)?;
                Ok(RtVal::I(buf as i64))
            }
            "fread" => {
                let buf = args[0].as_int()? as usize;
                let size = args[1].as_int()?.max(0) as usize;
                let nmemb = args[2].as_int()?.max(0) as usize;
                let mut bytes = self.env.input_line.clone();
                bytes.truncate(size * nmemb);
                let copied = bytes.len();
                self.mem.write(buf, &bytes)?;
                Ok(RtVal::I(if size == 0 { 0 } else { (copied / size) as i64 }))
            }
            "getline" => {
                let line_ptr = args[0].as_int()? as usize;
                let mut bytes = self.env.input_line.clone();
                bytes.push(b'\n');
                let len = bytes.len();
                bytes.push(0);
                let buf = self.mem.alloc(bytes.len(), true);
                self.mem.write(buf, &bytes)?;
                self.mem.write(line_ptr, &(buf as i64).to_le_bytes())?;
                Ok(RtVal::I(len as i64))
            }
            "time" => {
                let out = args.first().map(|a| a.as_int()).transpose()?.unwrap_or(0);
                if out != 0 {
                    let now = self.env.now;
                    self.mem.write(out as usize, &now.to_le_bytes())?;
                }
                Ok(RtVal::I(self.env.now))
            }
            "gettimeofday" => {
                let tv = args[0].as_int()? as usize;
                let now = self.env.now;
                self.mem.write(tv, &now.to_le_bytes())?;
                Ok(RtVal::I(0))
            }
            "printf" => {
                let s = self.mem.cstr(args[0].as_int()? as usize)?;
                let len = s.len() as i64;
                outcome.disclosures.push(s);
                Ok(RtVal::I(len))
            }
            other => Err(Error::UnknownExtern(other.into())),
        }
    }
}

/// C-style prefix integer parse: leading whitespace, optional sign, then
/// digits valid for `base`; stops at the first non-digit.
pub fn parse_c_long(bytes: &[u8], base: u32) -> i64 {
    let mut i = 0usize;
    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t' || bytes[i] == b'\n') {
        i += 1;
    }
    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }
    let base = if base == 0 { 10 } else { base };
    if !(2..=36).contains(&base) {
        return 0;
    }
    if base == 16
        && i + 1 < bytes.len()
        && bytes[i] == b'0'
        && (bytes[i + 1] == b'x' || bytes[i + 1] == b'X')
    {
        i += 2;
    }
    let mut acc: i64 = 0;
    while i < bytes.len() {
        let digit = match (bytes[i] as char).to_digit(base) {
            Some(d) => d as i64,
            None => break,
        };
        acc = acc.wrapping_mul(base as i64).wrapping_add(digit);
        i += 1;
    }
    if negative {
        acc.wrapping_neg()
    } else {
        acc
    }
}
