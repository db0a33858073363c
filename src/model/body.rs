//! Method bodies as statement and expression trees.
//!
//! Control flow targets blocks by [`BlockId`]; a branch lands on the first
//! instruction of the block carrying that id.

use super::{
    members::{FieldRef, MethodRef},
    signature::{MethodSignature, TypeSig},
    DocumentId,
};
use ilemit_macros::From;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// A source span for sequence points.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SourceContext {
    pub document: DocumentId,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone)]
pub struct LocalVariable {
    pub name: Option<String>,
    pub variable_type: TypeSig,
    pub pinned: bool,
}

impl LocalVariable {
    pub fn new(variable_type: TypeSig) -> Self {
        LocalVariable {
            name: None,
            variable_type,
            pinned: false,
        }
    }

    pub fn named(name: impl Into<String>, variable_type: TypeSig) -> Self {
        LocalVariable {
            name: Some(name.into()),
            ..LocalVariable::new(variable_type)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Body {
    pub locals: Vec<LocalVariable>,
    pub init_locals: bool,
    pub root: Block,
}

impl Body {
    pub fn new(root: Block) -> Self {
        Body {
            locals: vec![],
            init_locals: false,
            root,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub statements: Vec<Statement>,
    /// Indices into [`Body::locals`] scoped to this block, for debug symbols.
    pub locals: Vec<usize>,
    pub source: Option<SourceContext>,
}

impl Block {
    pub fn new(id: BlockId, statements: Vec<Statement>) -> Self {
        Block {
            id,
            statements,
            locals: vec![],
            source: None,
        }
    }
}

/// How a branch offset is encoded.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum BranchForm {
    /// Short when the final offset fits in a signed byte, long otherwise.
    #[default]
    Auto,
    /// Always short; an offset that does not fit is an error.
    Short,
    Long,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Debug, Clone)]
pub enum Condition {
    True(Expression),
    False(Expression),
    Compare {
        op: CompareOp,
        left: Expression,
        right: Expression,
        /// Unsigned integers, or unordered floating point.
        unsigned: bool,
    },
}

#[derive(Debug, Clone)]
pub enum Handler {
    Catch {
        exception_type: TypeSig,
        /// Local receiving the exception; discarded when absent.
        variable: Option<usize>,
        block: Block,
    },
    Filter {
        variable: Option<usize>,
        filter: Block,
        condition: Expression,
        block: Block,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FinallyKind {
    Finally,
    Fault,
}

#[derive(Debug, Clone)]
pub struct TryStatement {
    pub body: Block,
    pub handlers: Vec<Handler>,
    pub finally: Option<(FinallyKind, Block)>,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Block(Block),
    /// Evaluates an expression and discards any value it leaves.
    Expression(Expression),
    Assign {
        target: Target,
        value: Expression,
    },
    Branch {
        condition: Option<Condition>,
        target: BlockId,
        form: BranchForm,
    },
    /// Exits a protected region or handler.
    Leave {
        target: BlockId,
        form: BranchForm,
    },
    Switch {
        value: Expression,
        targets: Vec<BlockId>,
    },
    Return(Option<Expression>),
    /// `None` rethrows the exception being handled.
    Throw(Option<Expression>),
    Try(TryStatement),
    InitObject {
        address: Expression,
        value_type: TypeSig,
    },
    SequencePoint(SourceContext),
    Break,
    Nop,
}

/// Storage locations.
#[derive(Debug, Clone)]
pub enum Target {
    Local(usize),
    /// Declared parameter position, not counting `this`.
    Parameter(usize),
    Field {
        instance: Option<Box<Expression>>,
        field: FieldRef,
    },
    /// Array element; `array_type` is a vector or a general array.
    Element {
        array: Box<Expression>,
        array_type: TypeSig,
        indices: Vec<Expression>,
    },
    Indirect {
        address: Box<Expression>,
        pointee: TypeSig,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Char(u16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NumericType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    IntPtr,
    UIntPtr,
    Float32,
    Float64,
}

#[derive(Debug, Clone, From)]
pub enum TokenSource {
    Type(TypeSig),
    Method(MethodRef),
    Field(FieldRef),
}

#[derive(Debug, Clone)]
pub enum Expression {
    Literal(Literal),
    Local(usize),
    Parameter(usize),
    This,
    Load(Box<Target>),
    AddressOf(Box<Target>),
    Call {
        method: MethodRef,
        instance: Option<Box<Expression>>,
        arguments: Vec<Expression>,
        virtual_call: bool,
        tail_call: bool,
        constrained: Option<TypeSig>,
    },
    CallIndirect {
        signature: MethodSignature,
        function: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Construct {
        constructor: MethodRef,
        arguments: Vec<Expression>,
    },
    /// `newarr` for vectors; general arrays call the array constructor.
    NewArray {
        array_type: TypeSig,
        sizes: Vec<Expression>,
    },
    ArrayLength(Box<Expression>),
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
        unsigned: bool,
        checked: bool,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
        unsigned: bool,
    },
    Conditional {
        condition: Box<Condition>,
        if_true: Box<Expression>,
        if_false: Box<Expression>,
    },
    Convert {
        to: NumericType,
        operand: Box<Expression>,
        checked: bool,
        unsigned_source: bool,
    },
    BoxValue {
        value_type: TypeSig,
        operand: Box<Expression>,
    },
    Unbox {
        value_type: TypeSig,
        operand: Box<Expression>,
        address_only: bool,
    },
    CastClass {
        target_type: TypeSig,
        operand: Box<Expression>,
    },
    IsInstance {
        target_type: TypeSig,
        operand: Box<Expression>,
    },
    SizeOf(TypeSig),
    Token(TokenSource),
    FunctionPointer {
        method: MethodRef,
        /// Present for `ldvirtftn`.
        instance: Option<Box<Expression>>,
    },
    StackAlloc(Box<Expression>),
}

impl Expression {
    pub fn int(value: i32) -> Self {
        Expression::Literal(Literal::Int32(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expression::Literal(Literal::String(value.into()))
    }

    pub fn call(method: impl Into<MethodRef>, arguments: Vec<Expression>) -> Self {
        Expression::Call {
            method: method.into(),
            instance: None,
            arguments,
            virtual_call: false,
            tail_call: false,
            constrained: None,
        }
    }

    pub fn load(target: Target) -> Self {
        Expression::Load(Box::new(target))
    }
}
