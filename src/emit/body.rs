//! Encodes statement trees into IL (ECMA-335, III) with stack tracking,
//! branch fixups and exception clauses.

use super::{
    symbols::{MethodDebug, ScopeEvent, SequencePoint},
    Session,
};
use crate::{
    binary::{
        index::Token,
        method::{self as encoded, Exception, CLAUSE_FAULT, CLAUSE_FILTER, CLAUSE_FINALLY, CLAUSE_TYPED},
        opcodes::*,
        table::Kind,
    },
    error::{Error, Result},
    model::{
        body::*,
        members::{BodyFormat, FieldRef, Method, MethodRef},
        signature::{MethodSignature, TypeSig},
        DocumentId, MethodId,
    },
    utils::align,
};
use scroll::Pwrite;
use scroll_buffer::DynamicBuffer;
use std::collections::{HashMap, HashSet};
use tracing::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
enum Label {
    Block(BlockId),
    Internal(u32),
}

/// A forward branch operand waiting for its target to be placed.
#[derive(Debug, Copy, Clone)]
struct Fixup {
    at: usize,
    base: usize,
    /// Branch ordinal and requested form of a one-byte operand; `None` for four bytes.
    short: Option<(usize, BranchForm)>,
    next: Option<usize>,
}

pub(super) struct EncodedBody {
    pub method: encoded::Method,
    pub debug: Option<MethodDebug>,
}

enum Pass {
    Done(EncodedBody),
    /// These auto branches overflowed their short form.
    Widen(Vec<usize>),
}

/// Protected regions of a body. The method itself is region 0; every try block,
/// filter, handler and finally block opens a region nested in the one around it.
#[derive(Debug)]
struct Regions {
    parents: Vec<usize>,
    blocks: HashMap<BlockId, usize>,
}

impl Regions {
    fn new(root: &Block) -> Self {
        let mut regions = Regions {
            parents: vec![0],
            blocks: HashMap::new(),
        };
        regions.visit(root, 0);
        regions
    }

    fn open(&mut self, parent: usize, block: &Block) {
        self.parents.push(parent);
        let region = self.parents.len() - 1;
        self.visit(block, region);
    }

    fn visit(&mut self, block: &Block, region: usize) {
        self.blocks.insert(block.id, region);
        for s in &block.statements {
            match s {
                Statement::Block(b) => self.visit(b, region),
                Statement::Try(t) => {
                    self.open(region, &t.body);
                    for h in &t.handlers {
                        match h {
                            Handler::Catch { block, .. } => self.open(region, block),
                            Handler::Filter { filter, block, .. } => {
                                self.open(region, filter);
                                self.open(region, block);
                            }
                        }
                    }
                    if let Some((_, block)) = &t.finally {
                        self.open(region, block);
                    }
                }
                _ => {}
            }
        }
    }

    /// Whether `inner` is `outer` or nested in it.
    fn within(&self, mut inner: usize, outer: usize) -> bool {
        while inner != outer {
            if inner == 0 {
                return false;
            }
            inner = self.parents[inner];
        }
        true
    }
}

#[derive(Debug, Default)]
struct Recorder {
    scopes: Vec<ScopeEvent>,
    points: Vec<(DocumentId, SequencePoint)>,
}

fn ldelem(element: &TypeSig) -> Option<Opcode> {
    use TypeSig::*;
    Some(match element {
        Boolean | UInt8 => LDELEM_U1,
        Int8 => LDELEM_I1,
        Int16 => LDELEM_I2,
        Char | UInt16 => LDELEM_U2,
        Int32 => LDELEM_I4,
        UInt32 => LDELEM_U4,
        Int64 | UInt64 => LDELEM_I8,
        IntPtr | UIntPtr => LDELEM_I,
        Float32 => LDELEM_R4,
        Float64 => LDELEM_R8,
        _ => return None,
    })
}

fn stelem(element: &TypeSig) -> Option<Opcode> {
    use TypeSig::*;
    Some(match element {
        Boolean | Int8 | UInt8 => STELEM_I1,
        Char | Int16 | UInt16 => STELEM_I2,
        Int32 | UInt32 => STELEM_I4,
        Int64 | UInt64 => STELEM_I8,
        IntPtr | UIntPtr => STELEM_I,
        Float32 => STELEM_R4,
        Float64 => STELEM_R8,
        _ => return None,
    })
}

fn ldind(pointee: &TypeSig) -> Option<Opcode> {
    use TypeSig::*;
    Some(match pointee {
        Boolean | UInt8 => LDIND_U1,
        Int8 => LDIND_I1,
        Int16 => LDIND_I2,
        Char | UInt16 => LDIND_U2,
        Int32 => LDIND_I4,
        UInt32 => LDIND_U4,
        Int64 | UInt64 => LDIND_I8,
        IntPtr | UIntPtr | Pointer(_) | FunctionPointer(_) => LDIND_I,
        Float32 => LDIND_R4,
        Float64 => LDIND_R8,
        _ => return None,
    })
}

fn stind(pointee: &TypeSig) -> Option<Opcode> {
    use TypeSig::*;
    Some(match pointee {
        Boolean | Int8 | UInt8 => STIND_I1,
        Char | Int16 | UInt16 => STIND_I2,
        Int32 | UInt32 => STIND_I4,
        Int64 | UInt64 => STIND_I8,
        IntPtr | UIntPtr | Pointer(_) | FunctionPointer(_) => STIND_I,
        Float32 => STIND_R4,
        Float64 => STIND_R8,
        _ => return None,
    })
}

fn binary_op(op: BinaryOp, unsigned: bool, checked: bool) -> Opcode {
    use BinaryOp::*;
    match (op, checked, unsigned) {
        (Add, false, _) => ADD,
        (Add, true, false) => ADD_OVF,
        (Add, true, true) => ADD_OVF_UN,
        (Subtract, false, _) => SUB,
        (Subtract, true, false) => SUB_OVF,
        (Subtract, true, true) => SUB_OVF_UN,
        (Multiply, false, _) => MUL,
        (Multiply, true, false) => MUL_OVF,
        (Multiply, true, true) => MUL_OVF_UN,
        (Divide, _, false) => DIV,
        (Divide, _, true) => DIV_UN,
        (Remainder, _, false) => REM,
        (Remainder, _, true) => REM_UN,
        (And, ..) => AND,
        (Or, ..) => OR,
        (Xor, ..) => XOR,
        (ShiftLeft, ..) => SHL,
        (ShiftRight, _, false) => SHR,
        (ShiftRight, _, true) => SHR_UN,
    }
}

fn convert_ops(to: NumericType, checked: bool, unsigned_source: bool) -> &'static [Opcode] {
    use NumericType::*;
    match (to, checked, unsigned_source) {
        (Float32, _, false) => &[CONV_R4],
        (Float32, _, true) => &[CONV_R_UN, CONV_R4],
        (Float64, _, false) => &[CONV_R8],
        (Float64, _, true) => &[CONV_R_UN, CONV_R8],

        (Int8, false, _) => &[CONV_I1],
        (UInt8, false, _) => &[CONV_U1],
        (Int16, false, _) => &[CONV_I2],
        (UInt16, false, _) => &[CONV_U2],
        (Int32, false, _) => &[CONV_I4],
        (UInt32, false, _) => &[CONV_U4],
        (Int64, false, _) => &[CONV_I8],
        (UInt64, false, _) => &[CONV_U8],
        (IntPtr, false, _) => &[CONV_I],
        (UIntPtr, false, _) => &[CONV_U],

        (Int8, true, false) => &[CONV_OVF_I1],
        (UInt8, true, false) => &[CONV_OVF_U1],
        (Int16, true, false) => &[CONV_OVF_I2],
        (UInt16, true, false) => &[CONV_OVF_U2],
        (Int32, true, false) => &[CONV_OVF_I4],
        (UInt32, true, false) => &[CONV_OVF_U4],
        (Int64, true, false) => &[CONV_OVF_I8],
        (UInt64, true, false) => &[CONV_OVF_U8],
        (IntPtr, true, false) => &[CONV_OVF_I],
        (UIntPtr, true, false) => &[CONV_OVF_U],

        (Int8, true, true) => &[CONV_OVF_I1_UN],
        (UInt8, true, true) => &[CONV_OVF_U1_UN],
        (Int16, true, true) => &[CONV_OVF_I2_UN],
        (UInt16, true, true) => &[CONV_OVF_U2_UN],
        (Int32, true, true) => &[CONV_OVF_I4_UN],
        (UInt32, true, true) => &[CONV_OVF_U4_UN],
        (Int64, true, true) => &[CONV_OVF_I8_UN],
        (UInt64, true, true) => &[CONV_OVF_U8_UN],
        (IntPtr, true, true) => &[CONV_OVF_I_UN],
        (UIntPtr, true, true) => &[CONV_OVF_U_UN],
    }
}

fn compare_branch(op: CompareOp, unsigned: bool) -> Opcode {
    use CompareOp::*;
    match (op, unsigned) {
        (Equal, _) => BEQ,
        (NotEqual, _) => BNE_UN,
        (Less, false) => BLT,
        (Less, true) => BLT_UN,
        (LessOrEqual, false) => BLE,
        (LessOrEqual, true) => BLE_UN,
        (Greater, false) => BGT,
        (Greater, true) => BGT_UN,
        (GreaterOrEqual, false) => BGE,
        (GreaterOrEqual, true) => BGE_UN,
    }
}

fn negate(op: CompareOp) -> CompareOp {
    use CompareOp::*;
    match op {
        Equal => NotEqual,
        NotEqual => Equal,
        Less => GreaterOrEqual,
        LessOrEqual => Greater,
        Greater => LessOrEqual,
        GreaterOrEqual => Less,
    }
}

fn is_terminator(op: Opcode) -> bool {
    matches!(
        op,
        RET | THROW | RETHROW | BR | BR_S | LEAVE | LEAVE_S | ENDFINALLY | ENDFILTER | JMP
    )
}

struct Encoder<'s, 'm> {
    session: &'s mut Session<'m>,
    method: &'m Method,
    body: &'m Body,
    widen: &'s HashSet<usize>,

    code: Vec<u8>,
    labels: HashMap<Label, usize>,
    pending: HashMap<Label, usize>,
    fixups: Vec<Fixup>,
    referenced: HashSet<Label>,
    overflow: Vec<usize>,
    branches: usize,
    internal: u32,

    height: usize,
    max_height: usize,
    exit_total: usize,
    terminated: bool,
    /// Catch handlers around the current statement, where `rethrow` is allowed.
    handler_depth: usize,
    regions: Regions,
    region: usize,

    exceptions: Vec<Exception>,
    recorder: Option<Recorder>,
}

impl<'s, 'm> Encoder<'s, 'm> {
    fn new(session: &'s mut Session<'m>, method: &'m Method, body: &'m Body, widen: &'s HashSet<usize>) -> Self {
        let recorder = session.options.debug_symbols.then(Recorder::default);
        Encoder {
            session,
            method,
            body,
            widen,
            code: vec![],
            labels: HashMap::new(),
            pending: HashMap::new(),
            fixups: vec![],
            referenced: HashSet::new(),
            overflow: vec![],
            branches: 0,
            internal: 0,
            height: 0,
            max_height: 0,
            exit_total: 0,
            terminated: false,
            handler_depth: 0,
            regions: Regions::new(&body.root),
            region: 0,
            exceptions: vec![],
            recorder,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidBody {
            method: self.method.name.clone(),
            reason: reason.into(),
        }
    }

    fn push(&mut self, n: usize) {
        self.height += n;
        self.max_height = self.max_height.max(self.height);
    }

    fn pop(&mut self, n: usize) {
        self.height = self.height.saturating_sub(n);
    }

    fn op(&mut self, op: Opcode) {
        write_opcode(&mut self.code, op);
        self.terminated = is_terminator(op);
    }

    fn op_token(&mut self, op: Opcode, token: Token) -> Result<()> {
        self.op(op);
        let raw = token.encode()?;
        self.code.extend_from_slice(&raw.to_le_bytes());
        Ok(())
    }

    fn type_token(&mut self, op: Opcode, sig: &TypeSig) -> Result<()> {
        let token = self.session.type_metadata_token(sig)?;
        self.op_token(op, token)
    }

    fn new_label(&mut self) -> Label {
        self.internal += 1;
        Label::Internal(self.internal)
    }

    fn falls_through(&self) -> bool {
        let end = self.code.len();
        !self.terminated
            || self
                .labels
                .iter()
                .any(|(l, &at)| at == end && self.referenced.contains(l))
    }

    fn mark(&mut self, label: Label) -> Result<()> {
        let pc = self.code.len();
        if self.labels.insert(label, pc).is_some() {
            return Err(self.invalid(format!("{:?} is placed twice", label)));
        }

        let mut next = self.pending.remove(&label);
        while let Some(i) = next {
            let fixup = self.fixups[i];
            let offset = pc as i64 - fixup.base as i64;

            match fixup.short {
                Some((ordinal, form)) => {
                    if offset > i8::MAX as i64 {
                        if form == BranchForm::Short {
                            return Err(Error::BranchOutOfRange { offset });
                        }
                        self.overflow.push(ordinal);
                    } else {
                        self.code[fixup.at] = offset as i8 as u8;
                    }
                }
                None => {
                    self.code.pwrite_with(offset as i32, fixup.at, scroll::LE)?;
                }
            }

            next = fixup.next;
        }

        Ok(())
    }

    fn defer(&mut self, label: Label, at: usize, base: usize, short: Option<(usize, BranchForm)>) {
        let next = self.pending.get(&label).copied();
        self.fixups.push(Fixup { at, base, short, next });
        self.pending.insert(label, self.fixups.len() - 1);
    }

    fn branch(&mut self, long: Opcode, target: Label, form: BranchForm) -> Result<()> {
        let short_op =
            short_branch(long).ok_or_else(|| Error::InvariantViolation(format!("{:#x} is not a branch", long)))?;
        let ordinal = self.branches;
        self.branches += 1;
        self.referenced.insert(target);

        if let Some(&at) = self.labels.get(&target) {
            let short_offset = at as i64 - (self.code.len() + 2) as i64;
            let fits = (i8::MIN as i64..=i8::MAX as i64).contains(&short_offset);
            let short = match form {
                BranchForm::Long => false,
                BranchForm::Short if !fits => return Err(Error::BranchOutOfRange { offset: short_offset }),
                BranchForm::Short => true,
                BranchForm::Auto => fits,
            };

            if short {
                self.op(short_op);
                self.code.push(short_offset as i8 as u8);
            } else {
                self.op(long);
                let offset = at as i64 - (self.code.len() + 4) as i64;
                self.code.extend_from_slice(&(offset as i32).to_le_bytes());
            }
            return Ok(());
        }

        let short = form == BranchForm::Short || (form == BranchForm::Auto && !self.widen.contains(&ordinal));
        if short {
            self.op(short_op);
            let at = self.code.len();
            self.code.push(0);
            self.defer(target, at, at + 1, Some((ordinal, form)));
        } else {
            self.op(long);
            let at = self.code.len();
            self.code.extend_from_slice(&[0; 4]);
            self.defer(target, at, at + 4, None);
        }
        Ok(())
    }

    /// `br` and `switch` stay inside their region; `leave` may also exit to an enclosing one.
    fn check_target(&self, target: BlockId, leaving: bool) -> Result<()> {
        // unknown blocks are reported once the body is done
        let Some(&region) = self.regions.blocks.get(&target) else {
            return Ok(());
        };

        let allowed = if leaving {
            self.regions.within(self.region, region)
        } else {
            region == self.region
        };
        if allowed {
            Ok(())
        } else if leaving {
            Err(self.invalid(format!("leave to {:?} enters a protected region", target)))
        } else {
            Err(self.invalid(format!("branch to {:?} crosses a protected region, use leave", target)))
        }
    }

    fn leave(&mut self, target: Label, form: BranchForm) -> Result<()> {
        self.branch(LEAVE, target, form)?;
        self.height = 0;
        Ok(())
    }

    fn local(&self, index: usize) -> Result<usize> {
        if index < self.body.locals.len() && index <= u16::MAX as usize {
            Ok(index)
        } else {
            Err(self.invalid(format!("local {} is out of range", index)))
        }
    }

    fn argument(&self, index: usize) -> Result<usize> {
        let signature = &self.method.signature;
        let n = index + usize::from(signature.instance);
        if index >= signature.parameters.len() || n > u16::MAX as usize {
            return Err(self.invalid(format!("parameter {} is out of range", index)));
        }
        Ok(n)
    }

    fn variable(&mut self, n: usize, fixed: Option<Opcode>, short: Opcode, long: Opcode) {
        match (fixed, n) {
            (Some(base), 0..=3) => self.op(base + n as Opcode),
            (_, 0..=255) => {
                self.op(short);
                self.code.push(n as u8);
            }
            _ => {
                self.op(long);
                self.code.extend_from_slice(&(n as u16).to_le_bytes());
            }
        }
    }

    fn load_local(&mut self, index: usize) -> Result<()> {
        let n = self.local(index)?;
        self.variable(n, Some(LDLOC_0), LDLOC_S, LDLOC);
        self.push(1);
        Ok(())
    }

    fn store_local(&mut self, index: usize) -> Result<()> {
        let n = self.local(index)?;
        self.variable(n, Some(STLOC_0), STLOC_S, STLOC);
        self.pop(1);
        Ok(())
    }

    fn ldc_i4(&mut self, value: i32) {
        match value {
            -1 => self.op(LDC_I4_M1),
            0..=8 => self.op(LDC_I4_0 + value as Opcode),
            -128..=127 => {
                self.op(LDC_I4_S);
                self.code.push(value as i8 as u8);
            }
            _ => {
                self.op(LDC_I4);
                self.code.extend_from_slice(&value.to_le_bytes());
            }
        }
        self.push(1);
    }

    fn literal(&mut self, literal: &Literal) -> Result<()> {
        match literal {
            Literal::Null => {
                self.op(LDNULL);
                self.push(1);
            }
            Literal::Boolean(b) => self.ldc_i4(i32::from(*b)),
            Literal::Char(c) => self.ldc_i4(i32::from(*c)),
            Literal::Int32(v) => self.ldc_i4(*v),
            Literal::Int64(v) => match i32::try_from(*v) {
                Ok(small) => {
                    self.ldc_i4(small);
                    self.op(CONV_I8);
                }
                Err(_) => {
                    self.op(LDC_I8);
                    self.code.extend_from_slice(&v.to_le_bytes());
                    self.push(1);
                }
            },
            Literal::Float32(v) => {
                self.op(LDC_R4);
                self.code.extend_from_slice(&v.to_le_bytes());
                self.push(1);
            }
            Literal::Float64(v) => {
                self.op(LDC_R8);
                self.code.extend_from_slice(&v.to_le_bytes());
                self.push(1);
            }
            Literal::String(s) => {
                let token = self.session.user_string(s)?;
                self.op_token(LDSTR, token)?;
                self.push(1);
            }
        }
        Ok(())
    }

    fn is_reference(&self, sig: &TypeSig) -> Result<bool> {
        Ok(match sig.unmodified() {
            TypeSig::Object | TypeSig::String | TypeSig::Vector(_) | TypeSig::Array(..) => true,
            TypeSig::Named(id) | TypeSig::GenericInstance(id, _) => {
                !self.session.module.type_node(*id)?.kind.is_value_type()
            }
            _ => false,
        })
    }

    fn element_access(&self, array_type: &'m TypeSig, indices: usize) -> Result<(&'m TypeSig, Option<u32>)> {
        if indices == 0 {
            return Err(self.invalid("element access without indices"));
        }
        match array_type.unmodified() {
            TypeSig::Vector(element) if indices == 1 => Ok((element, None)),
            TypeSig::Array(element, shape) if indices == shape.rank as usize => Ok((element, Some(shape.rank))),
            TypeSig::Vector(_) | TypeSig::Array(..) => Err(self.invalid("index count does not match the array rank")),
            _ => Err(self.invalid("element access on a non-array type")),
        }
    }

    fn array_call(
        &mut self,
        array_type: &TypeSig,
        name: &str,
        return_type: TypeSig,
        rank: u32,
        value: Option<&TypeSig>,
    ) -> Result<()> {
        let mut parameters = vec![TypeSig::Int32; rank as usize];
        parameters.extend(value.cloned());
        let signature = MethodSignature::instance(return_type, parameters);
        let token = self.session.array_method(array_type, name, &signature)?;
        self.op_token(CALL, token)
    }

    fn field_access(&mut self, instance: Option<&'m Expression>, field: &FieldRef) -> Result<(bool, Token)> {
        let module = self.session.module;
        let definition = module.field(field.field)?;
        let token = self.session.field_token(field)?;

        match (definition.static_member, instance) {
            (true, None) => Ok((true, token)),
            (false, Some(i)) => {
                self.expression(i)?;
                Ok((false, token))
            }
            (true, Some(_)) => Err(self.invalid(format!(
                "static field {} accessed through an instance",
                definition.name
            ))),
            (false, None) => Err(self.invalid(format!("instance field {} accessed without a target", definition.name))),
        }
    }

    fn load(&mut self, target: &'m Target) -> Result<()> {
        match target {
            Target::Local(i) => self.load_local(*i)?,
            Target::Parameter(p) => {
                let n = self.argument(*p)?;
                self.variable(n, Some(LDARG_0), LDARG_S, LDARG);
                self.push(1);
            }
            Target::Field { instance, field } => {
                let (is_static, token) = self.field_access(instance.as_deref(), field)?;
                if is_static {
                    self.op_token(LDSFLD, token)?;
                } else {
                    self.op_token(LDFLD, token)?;
                    self.pop(1);
                }
                self.push(1);
            }
            Target::Element {
                array,
                array_type,
                indices,
            } => {
                let (element, rank) = self.element_access(array_type, indices.len())?;
                self.expression(array)?;
                for i in indices {
                    self.expression(i)?;
                }
                match rank {
                    None => match ldelem(element.unmodified()) {
                        Some(op) => self.op(op),
                        None if self.is_reference(element)? => self.op(LDELEM_REF),
                        None => self.type_token(LDELEM, element)?,
                    },
                    Some(rank) => self.array_call(array_type, "Get", element.clone(), rank, None)?,
                }
                self.pop(1 + indices.len());
                self.push(1);
            }
            Target::Indirect { address, pointee } => {
                self.expression(address)?;
                match ldind(pointee.unmodified()) {
                    Some(op) => self.op(op),
                    None if self.is_reference(pointee)? => self.op(LDIND_REF),
                    None => self.type_token(LDOBJ, pointee)?,
                }
            }
        }
        Ok(())
    }

    fn store(&mut self, target: &'m Target, value: &'m Expression) -> Result<()> {
        match target {
            Target::Local(i) => {
                self.expression(value)?;
                self.store_local(*i)?;
            }
            Target::Parameter(p) => {
                let n = self.argument(*p)?;
                self.expression(value)?;
                self.variable(n, None, STARG_S, STARG);
                self.pop(1);
            }
            Target::Field { instance, field } => {
                let (is_static, token) = self.field_access(instance.as_deref(), field)?;
                self.expression(value)?;
                if is_static {
                    self.op_token(STSFLD, token)?;
                    self.pop(1);
                } else {
                    self.op_token(STFLD, token)?;
                    self.pop(2);
                }
            }
            Target::Element {
                array,
                array_type,
                indices,
            } => {
                let (element, rank) = self.element_access(array_type, indices.len())?;
                self.expression(array)?;
                for i in indices {
                    self.expression(i)?;
                }
                self.expression(value)?;
                match rank {
                    None => match stelem(element.unmodified()) {
                        Some(op) => self.op(op),
                        None if self.is_reference(element)? => self.op(STELEM_REF),
                        None => self.type_token(STELEM, element)?,
                    },
                    Some(rank) => self.array_call(array_type, "Set", TypeSig::Void, rank, Some(element))?,
                }
                self.pop(2 + indices.len());
            }
            Target::Indirect { address, pointee } => {
                self.expression(address)?;
                self.expression(value)?;
                match stind(pointee.unmodified()) {
                    Some(op) => self.op(op),
                    None if self.is_reference(pointee)? => self.op(STIND_REF),
                    None => self.type_token(STOBJ, pointee)?,
                }
                self.pop(2);
            }
        }
        Ok(())
    }

    fn address_of(&mut self, target: &'m Target) -> Result<()> {
        match target {
            Target::Local(i) => {
                let n = self.local(*i)?;
                self.variable(n, None, LDLOCA_S, LDLOCA);
                self.push(1);
            }
            Target::Parameter(p) => {
                let n = self.argument(*p)?;
                self.variable(n, None, LDARGA_S, LDARGA);
                self.push(1);
            }
            Target::Field { instance, field } => {
                let (is_static, token) = self.field_access(instance.as_deref(), field)?;
                if is_static {
                    self.op_token(LDSFLDA, token)?;
                } else {
                    self.op_token(LDFLDA, token)?;
                    self.pop(1);
                }
                self.push(1);
            }
            Target::Element {
                array,
                array_type,
                indices,
            } => {
                let (element, rank) = self.element_access(array_type, indices.len())?;
                self.expression(array)?;
                for i in indices {
                    self.expression(i)?;
                }
                match rank {
                    None => self.type_token(LDELEMA, element)?,
                    Some(rank) => {
                        self.array_call(array_type, "Address", TypeSig::reference(element.clone()), rank, None)?
                    }
                }
                self.pop(1 + indices.len());
                self.push(1);
            }
            Target::Indirect { address, .. } => self.expression(address)?,
        }
        Ok(())
    }

    fn call(
        &mut self,
        method: &'m MethodRef,
        instance: Option<&'m Expression>,
        arguments: &'m [Expression],
        virtual_call: bool,
        tail_call: bool,
        constrained: Option<&'m TypeSig>,
    ) -> Result<()> {
        let module = self.session.module;
        let definition = module.method(method.method)?;
        let signature = &definition.signature;

        let expected = signature.parameters.len() + method.vararg_types.len();
        if arguments.len() != expected {
            return Err(self.invalid(format!(
                "call to {} passes {} arguments, expected {}",
                definition.name,
                arguments.len(),
                expected
            )));
        }

        match (signature.instance, instance) {
            (true, Some(i)) => self.expression(i)?,
            (false, None) => {}
            (true, None) => return Err(self.invalid(format!("instance call to {} without a target", definition.name))),
            (false, Some(_)) => return Err(self.invalid(format!("static call to {} with a target", definition.name))),
        }
        for a in arguments {
            self.expression(a)?;
        }

        let token = self.session.method_token(method)?;
        if let Some(c) = constrained {
            self.type_token(CONSTRAINED, c)?;
        }
        if tail_call {
            self.op(TAIL);
        }
        let op = if virtual_call || constrained.is_some() { CALLVIRT } else { CALL };
        self.op_token(op, token)?;

        self.pop(arguments.len() + usize::from(signature.instance));
        if !signature.returns_void() {
            self.push(1);
        }
        Ok(())
    }

    fn compare(&mut self, op: CompareOp, left: &'m Expression, right: &'m Expression, unsigned: bool) -> Result<()> {
        self.expression(left)?;
        self.expression(right)?;

        let (cmp, invert) = match (op, unsigned) {
            (CompareOp::Equal, _) => (CEQ, false),
            (CompareOp::NotEqual, _) => (CEQ, true),
            (CompareOp::Less, false) => (CLT, false),
            (CompareOp::Less, true) => (CLT_UN, false),
            (CompareOp::Greater, false) => (CGT, false),
            (CompareOp::Greater, true) => (CGT_UN, false),
            (CompareOp::LessOrEqual, false) => (CGT, true),
            (CompareOp::LessOrEqual, true) => (CGT_UN, true),
            (CompareOp::GreaterOrEqual, false) => (CLT, true),
            (CompareOp::GreaterOrEqual, true) => (CLT_UN, true),
        };
        self.op(cmp);
        self.pop(2);
        self.push(1);

        if invert {
            self.ldc_i4(0);
            self.op(CEQ);
            self.pop(1);
        }
        Ok(())
    }

    /// Branches to `target` when the condition evaluates to `when`.
    fn condition_branch(
        &mut self,
        condition: &'m Condition,
        target: Label,
        form: BranchForm,
        when: bool,
    ) -> Result<()> {
        match condition {
            Condition::True(e) | Condition::False(e) => {
                self.expression(e)?;
                self.pop(1);
                let on_true = matches!(condition, Condition::True(_)) == when;
                self.branch(if on_true { BRTRUE } else { BRFALSE }, target, form)
            }
            Condition::Compare {
                op,
                left,
                right,
                unsigned,
            } => {
                self.expression(left)?;
                self.expression(right)?;
                self.pop(2);
                let op = if when { *op } else { negate(*op) };
                self.branch(compare_branch(op, *unsigned), target, form)
            }
        }
    }

    fn expression(&mut self, expression: &'m Expression) -> Result<()> {
        use Expression::*;

        match expression {
            Expression::Literal(l) => self.literal(l)?,
            Local(i) => self.load_local(*i)?,
            Parameter(p) => {
                let n = self.argument(*p)?;
                self.variable(n, Some(LDARG_0), LDARG_S, LDARG);
                self.push(1);
            }
            This => {
                if self.method.is_static() {
                    return Err(self.invalid("`this` used in a static method"));
                }
                self.op(LDARG_0);
                self.push(1);
            }
            Load(target) => self.load(target)?,
            AddressOf(target) => self.address_of(target)?,
            Call {
                method,
                instance,
                arguments,
                virtual_call,
                tail_call,
                constrained,
            } => self.call(
                method,
                instance.as_deref(),
                arguments,
                *virtual_call,
                *tail_call,
                constrained.as_ref(),
            )?,
            CallIndirect {
                signature,
                function,
                arguments,
            } => {
                for a in arguments {
                    self.expression(a)?;
                }
                self.expression(function)?;
                let blob = self.session.method_sig(signature, 0, &[])?;
                let token = self.session.stand_alone_sig(&blob)?;
                self.op_token(CALLI, token)?;
                self.pop(arguments.len() + 1);
                if !signature.returns_void() {
                    self.push(1);
                }
            }
            Construct { constructor, arguments } => {
                let module = self.session.module;
                let definition = module.method(constructor.method)?;
                if arguments.len() != definition.signature.parameters.len() {
                    return Err(self.invalid(format!(
                        "constructor call passes {} arguments, expected {}",
                        arguments.len(),
                        definition.signature.parameters.len()
                    )));
                }
                for a in arguments {
                    self.expression(a)?;
                }
                let token = self.session.method_token(constructor)?;
                self.op_token(NEWOBJ, token)?;
                self.pop(arguments.len());
                self.push(1);
            }
            NewArray { array_type, sizes } => {
                match array_type.unmodified() {
                    TypeSig::Vector(element) if sizes.len() == 1 => {
                        self.expression(&sizes[0])?;
                        self.type_token(NEWARR, element)?;
                    }
                    TypeSig::Array(_, shape) if sizes.len() == shape.rank as usize => {
                        for s in sizes {
                            self.expression(s)?;
                        }
                        let signature = MethodSignature::instance(TypeSig::Void, vec![TypeSig::Int32; sizes.len()]);
                        let token = self.session.array_method(array_type, ".ctor", &signature)?;
                        self.op_token(NEWOBJ, token)?;
                    }
                    _ => return Err(self.invalid("array creation does not match the array type")),
                }
                self.pop(sizes.len());
                self.push(1);
            }
            ArrayLength(array) => {
                self.expression(array)?;
                self.op(LDLEN);
                self.op(CONV_I4);
            }
            Binary {
                op,
                left,
                right,
                unsigned,
                checked,
            } => {
                self.expression(left)?;
                self.expression(right)?;
                self.op(binary_op(*op, *unsigned, *checked));
                self.pop(1);
            }
            Unary { op, operand } => {
                self.expression(operand)?;
                self.op(match op {
                    UnaryOp::Negate => NEG,
                    UnaryOp::Not => NOT,
                });
            }
            Compare {
                op,
                left,
                right,
                unsigned,
            } => self.compare(*op, left, right, *unsigned)?,
            Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let otherwise = self.new_label();
                let end = self.new_label();
                self.condition_branch(condition, otherwise, BranchForm::Auto, false)?;

                let height = self.height;
                self.expression(if_true)?;
                self.branch(BR, end, BranchForm::Auto)?;

                self.height = height;
                self.mark(otherwise)?;
                self.expression(if_false)?;
                self.mark(end)?;
            }
            Convert {
                to,
                operand,
                checked,
                unsigned_source,
            } => {
                self.expression(operand)?;
                for &op in convert_ops(*to, *checked, *unsigned_source) {
                    self.op(op);
                }
            }
            BoxValue { value_type, operand } => {
                self.expression(operand)?;
                self.type_token(BOX, value_type)?;
            }
            Unbox {
                value_type,
                operand,
                address_only,
            } => {
                self.expression(operand)?;
                self.type_token(if *address_only { UNBOX } else { UNBOX_ANY }, value_type)?;
            }
            CastClass { target_type, operand } => {
                self.expression(operand)?;
                self.type_token(CASTCLASS, target_type)?;
            }
            IsInstance { target_type, operand } => {
                self.expression(operand)?;
                self.type_token(ISINST, target_type)?;
            }
            SizeOf(sig) => {
                self.type_token(SIZEOF, sig)?;
                self.push(1);
            }
            Expression::Token(source) => {
                let token = match source {
                    TokenSource::Type(sig) => self.session.type_metadata_token(sig)?,
                    TokenSource::Method(m) => self.session.method_token(m)?,
                    TokenSource::Field(f) => self.session.field_token(f)?,
                };
                self.op_token(LDTOKEN, token)?;
                self.push(1);
            }
            FunctionPointer { method, instance } => {
                let token = self.session.method_token(method)?;
                match instance {
                    Some(i) => {
                        self.expression(i)?;
                        self.op_token(LDVIRTFTN, token)?;
                    }
                    None => {
                        self.op_token(LDFTN, token)?;
                        self.push(1);
                    }
                }
            }
            StackAlloc(size) => {
                self.expression(size)?;
                self.op(LOCALLOC);
            }
        }

        Ok(())
    }

    fn sequence_point(&mut self, source: &SourceContext) {
        let offset = self.code.len() as u32;
        if let Some(recorder) = &mut self.recorder {
            let point = SequencePoint {
                offset,
                start_line: source.start_line,
                start_column: source.start_column,
                end_line: source.end_line,
                end_column: source.end_column,
            };
            match recorder.points.last_mut() {
                Some((document, last)) if last.offset == offset => {
                    *document = source.document;
                    *last = point;
                }
                _ => recorder.points.push((source.document, point)),
            }
        }
    }

    fn block(&mut self, block: &'m Block) -> Result<()> {
        let outer = self.region;
        self.region = self.regions.blocks.get(&block.id).copied().unwrap_or(outer);
        self.block_statements(block)?;
        self.region = outer;
        Ok(())
    }

    fn block_statements(&mut self, block: &'m Block) -> Result<()> {
        self.mark(Label::Block(block.id))?;
        if let Some(source) = &block.source {
            self.sequence_point(source);
        }

        let scoped = self.recorder.is_some() && !block.locals.is_empty();
        if scoped {
            let offset = self.code.len() as u32;
            let mut events = vec![ScopeEvent::Open(offset)];
            for &slot in &block.locals {
                let body = self.body;
                let local = &body.locals[self.local(slot)?];
                if let Some(name) = &local.name {
                    let signature = self.session.type_sig_blob(&local.variable_type)?;
                    events.push(ScopeEvent::Local {
                        name: name.clone(),
                        slot: slot as u32,
                        signature,
                    });
                }
            }
            if let Some(recorder) = &mut self.recorder {
                recorder.scopes.extend(events);
            }
        }

        for s in &block.statements {
            self.statement(s)?;
        }

        if self.height > 0 {
            self.exit_total += self.height;
            self.height = 0;
        }

        if scoped {
            let offset = self.code.len() as u32;
            if let Some(recorder) = &mut self.recorder {
                recorder.scopes.push(ScopeEvent::Close(offset));
            }
        }
        Ok(())
    }

    fn handler_entry(&mut self, variable: Option<usize>) -> Result<()> {
        self.height = 0;
        self.push(1);
        match variable {
            Some(v) => self.store_local(v),
            None => {
                self.op(POP);
                self.pop(1);
                Ok(())
            }
        }
    }

    fn try_statement(&mut self, statement: &'m TryStatement) -> Result<()> {
        if statement.handlers.is_empty() && statement.finally.is_none() {
            return Err(self.invalid("try statement without handlers"));
        }

        let end = self.new_label();
        let try_start = self.code.len();
        self.block(&statement.body)?;
        if self.falls_through() {
            self.leave(end, BranchForm::Auto)?;
        }
        let try_length = self.code.len() - try_start;

        for handler in &statement.handlers {
            match handler {
                Handler::Catch {
                    exception_type,
                    variable,
                    block,
                } => {
                    let class = self.session.type_metadata_token(exception_type)?.encode()?;
                    let start = self.code.len();
                    self.handler_entry(*variable)?;
                    self.handler_depth += 1;
                    self.block(block)?;
                    self.handler_depth -= 1;
                    if self.falls_through() {
                        self.leave(end, BranchForm::Auto)?;
                    }
                    self.exceptions.push(Exception {
                        flags: CLAUSE_TYPED,
                        try_offset: try_start,
                        try_length,
                        handler_offset: start,
                        handler_length: self.code.len() - start,
                        class_token_or_filter: class,
                    });
                }
                Handler::Filter {
                    variable,
                    filter,
                    condition,
                    block,
                } => {
                    let filter_start = self.code.len();
                    self.handler_entry(*variable)?;
                    let depth = std::mem::replace(&mut self.handler_depth, 0);
                    self.block(filter)?;
                    self.expression(condition)?;
                    self.handler_depth = depth;
                    self.op(ENDFILTER);
                    self.pop(1);

                    let start = self.code.len();
                    self.handler_entry(*variable)?;
                    self.handler_depth += 1;
                    self.block(block)?;
                    self.handler_depth -= 1;
                    if self.falls_through() {
                        self.leave(end, BranchForm::Auto)?;
                    }
                    self.exceptions.push(Exception {
                        flags: CLAUSE_FILTER,
                        try_offset: try_start,
                        try_length,
                        handler_offset: start,
                        handler_length: self.code.len() - start,
                        class_token_or_filter: filter_start as u32,
                    });
                }
            }
        }

        if let Some((kind, block)) = &statement.finally {
            let protected_length = self.code.len() - try_start;
            let start = self.code.len();
            self.height = 0;
            let depth = std::mem::replace(&mut self.handler_depth, 0);
            self.block(block)?;
            self.handler_depth = depth;
            self.op(ENDFINALLY);
            self.exceptions.push(Exception {
                flags: match kind {
                    FinallyKind::Finally => CLAUSE_FINALLY,
                    FinallyKind::Fault => CLAUSE_FAULT,
                },
                try_offset: try_start,
                try_length: protected_length,
                handler_offset: start,
                handler_length: self.code.len() - start,
                class_token_or_filter: 0,
            });
        }

        self.mark(end)
    }

    fn statement(&mut self, statement: &'m Statement) -> Result<()> {
        match statement {
            Statement::Block(b) => self.block(b)?,
            Statement::Expression(e) => {
                let height = self.height;
                self.expression(e)?;
                while self.height > height {
                    self.op(POP);
                    self.pop(1);
                }
            }
            Statement::Assign { target, value } => self.store(target, value)?,
            Statement::Branch { condition, target, form } => {
                self.check_target(*target, false)?;
                match condition {
                    None => self.branch(BR, Label::Block(*target), *form)?,
                    Some(c) => self.condition_branch(c, Label::Block(*target), *form, true)?,
                }
            }
            Statement::Leave { target, form } => {
                self.check_target(*target, true)?;
                self.leave(Label::Block(*target), *form)?
            }
            Statement::Switch { value, targets } => {
                for &t in targets {
                    self.check_target(t, false)?;
                }
                self.expression(value)?;
                self.op(SWITCH);
                self.code.extend_from_slice(&(targets.len() as u32).to_le_bytes());
                self.pop(1);

                let base = self.code.len() + targets.len() * 4;
                for &t in targets {
                    let label = Label::Block(t);
                    self.referenced.insert(label);
                    let at = self.code.len();
                    match self.labels.get(&label) {
                        Some(&position) => {
                            let offset = position as i64 - base as i64;
                            self.code.extend_from_slice(&(offset as i32).to_le_bytes());
                        }
                        None => {
                            self.code.extend_from_slice(&[0; 4]);
                            self.defer(label, at, base, None);
                        }
                    }
                }
            }
            Statement::Return(value) => {
                if self.region != 0 {
                    return Err(self.invalid("return inside a protected region, use leave"));
                }
                match (value, self.method.signature.returns_void()) {
                    (Some(v), false) => {
                        self.expression(v)?;
                        self.pop(1);
                    }
                    (None, true) => {}
                    (Some(_), true) => return Err(self.invalid("void method returns a value")),
                    (None, false) => return Err(self.invalid("return without a value")),
                }
                self.op(RET);
            }
            Statement::Throw(Some(e)) => {
                self.expression(e)?;
                self.op(THROW);
                self.pop(1);
            }
            Statement::Throw(None) => {
                if self.handler_depth == 0 {
                    return Err(self.invalid("rethrow outside of a catch handler"));
                }
                self.op(RETHROW);
            }
            Statement::Try(t) => self.try_statement(t)?,
            Statement::InitObject { address, value_type } => {
                self.expression(address)?;
                self.type_token(INITOBJ, value_type)?;
                self.pop(1);
            }
            Statement::SequencePoint(source) => self.sequence_point(source),
            Statement::Break => self.op(BREAK),
            Statement::Nop => self.op(NOP),
        }
        Ok(())
    }

    fn run(mut self, token: u32) -> Result<Pass> {
        let body = self.body;
        self.block(&body.root)?;

        if self.falls_through() {
            if !self.method.signature.returns_void() {
                return Err(self.invalid("control reaches the end of a method that returns a value"));
            }
            self.op(RET);
        }

        if let Some(&label) = self.pending.keys().min() {
            return Err(match label {
                Label::Block(id) => Error::UnresolvedBranchTarget(id),
                Label::Internal(_) => Error::InvariantViolation("internal label was never placed".to_string()),
            });
        }

        if !self.overflow.is_empty() {
            return Ok(Pass::Widen(self.overflow));
        }

        let locals = if self.body.locals.is_empty() {
            0
        } else {
            let signature = self.session.local_sig(&self.body.locals)?;
            self.session.stand_alone_sig(&signature)?.encode()?
        };
        let max_stack = (self.exit_total + self.max_height).min(u16::MAX as usize) as u16;

        let code_size = self.code.len() as u32;
        let debug = self
            .recorder
            .filter(|r| !r.scopes.is_empty() || !r.points.is_empty())
            .map(|r| MethodDebug {
                token,
                code_size,
                scopes: r.scopes,
                points: r.points,
            });

        Ok(Pass::Done(EncodedBody {
            method: encoded::Method::new(self.code, max_stack, locals, self.body.init_locals, self.exceptions),
            debug,
        }))
    }
}

impl<'m> Session<'m> {
    fn encode_body(&mut self, row: usize, method: &'m Method, body: &'m Body) -> Result<EncodedBody> {
        let token = Token::new(Kind::MethodDef, row).encode()?;
        let mut widen = HashSet::new();
        loop {
            match Encoder::new(self, method, body, &widen).run(token)? {
                Pass::Done(encoded) => return Ok(encoded),
                Pass::Widen(ordinals) => {
                    trace!(method = %method.name, count = ordinals.len(), "widening short branches");
                    widen.extend(ordinals);
                }
            }
        }
    }

    pub(super) fn encode_bodies(&mut self) -> Result<()> {
        let module = self.module;
        for type_id in self.tokens.type_order.clone() {
            for (index, method) in module.type_node(type_id)?.methods.iter().enumerate() {
                let Some(body) = &method.body else {
                    continue;
                };
                if method.abstract_member
                    || method.pinvoke.is_some()
                    || method.impl_flags.internal_call
                    || method.impl_flags.format == BodyFormat::Runtime
                {
                    return Err(Error::InvalidBody {
                        method: method.name.clone(),
                        reason: "method cannot carry an IL body".to_string(),
                    });
                }

                let row = self.method_def(MethodId::new(type_id, index))?;
                let encoded = self.encode_body(row, method, body)?;

                let mut buf = DynamicBuffer::with_increment(16);
                buf.pwrite(&encoded.method, 0)?;

                align(&mut self.bodies, 4);
                let start = self.bodies.len();
                self.bodies.extend_from_slice(buf.get());
                self.body_ranges[row - 1] = Some(start..self.bodies.len());
                trace!(
                    method = %method.name,
                    row,
                    offset = start,
                    size = encoded.method.body.len(),
                    "encoded method body"
                );

                if let Some(debug) = encoded.debug {
                    self.debug.push(debug);
                }
            }
        }
        Ok(())
    }
}
