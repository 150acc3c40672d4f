//! An in-memory, arena-indexed view of a compiled module.
//! Functions, blocks, instructions, types and globals live in owned tables
//! and are referred to by small integer handles, so analyses can freely keep
//! ids in maps without borrowing the module.
//! The module is immutable once `ModuleBuilder::finish` has produced it;
//! def-use chains (`users`) are computed at that point.
mod builder;
mod loader;

pub use builder::ModuleBuilder;
pub use loader::{load_module, parse_module};

use std::fmt;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_type!(
    /// Index of a function in `Module::functions`.
    FunctionId
);
id_type!(BlockId);
id_type!(InstId);
id_type!(
    /// Interned type: two equal `TypeKind`s always share one `TypeId`.
    TypeId
);
id_type!(GlobalId);

/// Anything that can appear as an operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueRef {
    Inst(InstId),
    Arg { func: FunctionId, index: u32 },
    Global(GlobalId),
    ConstInt(i64),
}

impl ValueRef {
    pub fn as_inst(self) -> Option<InstId> {
        match self {
            ValueRef::Inst(id) => Some(id),
            _ => None,
        }
    }
}

impl From<InstId> for ValueRef {
    fn from(id: InstId) -> Self {
        ValueRef::Inst(id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Int(u32),
    Pointer(TypeId),
    Struct { name: String, fields: Vec<TypeId> },
    Opaque(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DebugLoc {
    pub directory: String,
    pub file: String,
    pub line: u32,
}

impl DebugLoc {
    pub fn new(directory: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            directory: directory.into(),
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for DebugLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.directory, self.file, self.line)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callee {
    Direct(FunctionId),
    /// Not statically resolvable, e.g. a call through a vtable slot.
    Indirect(ValueRef),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstKind {
    Call {
        callee: Callee,
        args: Vec<ValueRef>,
    },
    /// A call terminating its block, with a normal and an unwind edge.
    Invoke {
        callee: Callee,
        args: Vec<ValueRef>,
        normal: BlockId,
        unwind: BlockId,
    },
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: ValueRef,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Ret {
        value: Option<ValueRef>,
    },
    Unreachable,
    Load {
        ptr: ValueRef,
    },
    Store {
        value: ValueRef,
        ptr: ValueRef,
    },
    /// Address of a (nested) struct field; indices are constant, the first
    /// one steps over the base pointer as in `getelementptr`.
    FieldAddr {
        base: ValueRef,
        indices: Vec<i64>,
    },
    Cast {
        value: ValueRef,
    },
    ICmp {
        pred: IntPredicate,
        lhs: ValueRef,
        rhs: ValueRef,
    },
    Alloca,
    Phi {
        incoming: Vec<(ValueRef, BlockId)>,
    },
    DebugIntrinsic {
        operands: Vec<ValueRef>,
    },
    LandingPad,
    Other {
        operands: Vec<ValueRef>,
    },
}

impl InstKind {
    pub fn operands(&self) -> SmallVec<[ValueRef; 4]> {
        match self {
            InstKind::Call { callee, args } | InstKind::Invoke { callee, args, .. } => {
                let mut ops: SmallVec<[ValueRef; 4]> = args.iter().copied().collect();
                if let Callee::Indirect(value) = callee {
                    ops.push(*value);
                }
                ops
            }
            InstKind::CondBr { cond, .. } => smallvec::smallvec![*cond],
            InstKind::Ret { value } => value.iter().copied().collect(),
            InstKind::Load { ptr } => smallvec::smallvec![*ptr],
            InstKind::Store { value, ptr } => smallvec::smallvec![*value, *ptr],
            InstKind::FieldAddr { base, .. } => smallvec::smallvec![*base],
            InstKind::Cast { value } => smallvec::smallvec![*value],
            InstKind::ICmp { lhs, rhs, .. } => smallvec::smallvec![*lhs, *rhs],
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            InstKind::DebugIntrinsic { operands } | InstKind::Other { operands } => {
                operands.iter().copied().collect()
            }
            InstKind::Br { .. } | InstKind::Unreachable | InstKind::Alloca | InstKind::LandingPad => {
                SmallVec::new()
            }
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Invoke { .. }
                | InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Ret { .. }
                | InstKind::Unreachable
        )
    }
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub kind: InstKind,
    /// Result type, `Void` when the instruction produces no value.
    pub ty: TypeId,
    pub block: BlockId,
    pub loc: Option<DebugLoc>,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub label: String,
    pub func: FunctionId,
    pub insts: Vec<InstId>,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    /// Empty for declarations.
    pub blocks: Vec<BlockId>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    /// Type of the global's storage; the global itself is a pointer to it.
    pub ty: TypeId,
    pub ptr_ty: TypeId,
}

/// The whole program under analysis.
#[derive(Debug, Default)]
pub struct Module {
    pub(crate) types: Vec<TypeKind>,
    pub(crate) functions: Vec<Function>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) insts: Vec<Instruction>,
    pub(crate) globals: Vec<Global>,
    pub(crate) users: FxHashMap<ValueRef, Vec<InstId>>,
    pub(crate) void_ty: TypeId,
    pub(crate) int_ty: TypeId,
}

impl Module {
    pub fn function_ids(&self) -> impl Iterator<Item = FunctionId> + '_ {
        (0..self.functions.len() as u32).map(FunctionId)
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|idx| FunctionId(idx as u32))
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.index()]
    }

    pub fn ty(&self, id: TypeId) -> &TypeKind {
        &self.types[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.index()]
    }

    /// Instructions of `func` in layout order.
    pub fn insts_of(&self, func: FunctionId) -> impl Iterator<Item = InstId> + '_ {
        self.function(func)
            .blocks
            .iter()
            .flat_map(move |bb| self.block(*bb).insts.iter().copied())
    }

    pub fn function_of(&self, inst: InstId) -> FunctionId {
        self.block(self.inst(inst).block).func
    }

    pub fn loc_of(&self, inst: InstId) -> Option<&DebugLoc> {
        self.inst(inst).loc.as_ref()
    }

    /// Consumers of `value`, in the order they were created.
    pub fn users(&self, value: ValueRef) -> &[InstId] {
        self.users.get(&value).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn value_type(&self, value: ValueRef) -> TypeId {
        match value {
            ValueRef::Inst(id) => self.inst(id).ty,
            ValueRef::Arg { func, index } => self
                .function(func)
                .params
                .get(index as usize)
                .copied()
                .unwrap_or(self.void_ty),
            ValueRef::Global(id) => self.global(id).ptr_ty,
            ValueRef::ConstInt(_) => self.int_ty,
        }
    }

    pub fn pointee(&self, ty: TypeId) -> Option<TypeId> {
        match self.ty(ty) {
            TypeKind::Pointer(inner) => Some(*inner),
            _ => None,
        }
    }

    pub fn is_struct(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty), TypeKind::Struct { .. })
    }

    pub fn is_void(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty), TypeKind::Void)
    }

    pub fn type_name(&self, ty: TypeId) -> String {
        match self.ty(ty) {
            TypeKind::Void => "void".to_owned(),
            TypeKind::Int(bits) => format!("i{}", bits),
            TypeKind::Pointer(inner) => format!("*{}", self.type_name(*inner)),
            TypeKind::Struct { name, .. } | TypeKind::Opaque(name) => name.clone(),
        }
    }

    pub fn terminator(&self, bb: BlockId) -> Option<InstId> {
        let last = *self.block(bb).insts.last()?;
        if self.inst(last).kind.is_terminator() {
            Some(last)
        } else {
            None
        }
    }

    /// Successor blocks in terminator operand order.
    /// For `invoke` the normal destination comes first.
    pub fn successors(&self, bb: BlockId) -> SmallVec<[BlockId; 2]> {
        let term = match self.terminator(bb) {
            Some(term) => term,
            None => return SmallVec::new(),
        };
        match &self.inst(term).kind {
            InstKind::Invoke { normal, unwind, .. } => smallvec::smallvec![*normal, *unwind],
            InstKind::Br { dest } => smallvec::smallvec![*dest],
            InstKind::CondBr {
                then_dest,
                else_dest,
                ..
            } => smallvec::smallvec![*then_dest, *else_dest],
            _ => SmallVec::new(),
        }
    }

    /// Phi-nodes and debug pseudo-instructions carry no behaviour of interest.
    pub fn skip_inst(&self, inst: InstId) -> bool {
        matches!(
            self.inst(inst).kind,
            InstKind::Phi { .. } | InstKind::DebugIntrinsic { .. }
        )
    }

    pub fn first_non_phi_or_dbg(&self, bb: BlockId) -> Option<InstId> {
        self.block(bb)
            .insts
            .iter()
            .copied()
            .find(|inst| !self.skip_inst(*inst))
    }

    pub fn is_landing_pad_block(&self, bb: BlockId) -> bool {
        self.first_non_phi_or_dbg(bb)
            .map_or(false, |inst| matches!(self.inst(inst).kind, InstKind::LandingPad))
    }

    pub fn is_call(&self, inst: InstId) -> bool {
        matches!(
            self.inst(inst).kind,
            InstKind::Call { .. } | InstKind::Invoke { .. }
        )
    }

    /// The statically resolved callee of a call-like instruction.
    pub fn called_function(&self, inst: InstId) -> Option<FunctionId> {
        if self.skip_inst(inst) {
            return None;
        }
        match &self.inst(inst).kind {
            InstKind::Call {
                callee: Callee::Direct(f),
                ..
            }
            | InstKind::Invoke {
                callee: Callee::Direct(f),
                ..
            } => Some(*f),
            _ => None,
        }
    }

    pub fn called_name(&self, inst: InstId) -> Option<&str> {
        self.called_function(inst)
            .map(|f| self.function(f).name.as_str())
    }

    pub fn call_args(&self, inst: InstId) -> Option<&[ValueRef]> {
        match &self.inst(inst).kind {
            InstKind::Call { args, .. } | InstKind::Invoke { args, .. } => Some(args),
            _ => None,
        }
    }

    /// Follow pointer casts back to their source.
    pub fn strip_pointer_casts(&self, mut value: ValueRef) -> ValueRef {
        while let ValueRef::Inst(id) = value {
            match &self.inst(id).kind {
                InstKind::Cast { value: src } => value = *src,
                _ => break,
            }
        }
        value
    }

    /// Follow casts and field address computations back to the object they
    /// are derived from.
    pub fn underlying_object(&self, mut value: ValueRef) -> ValueRef {
        while let ValueRef::Inst(id) = value {
            match &self.inst(id).kind {
                InstKind::Cast { value: src } => value = *src,
                InstKind::FieldAddr { base, .. } => value = *base,
                _ => break,
            }
        }
        value
    }

    pub fn field_indices(&self, inst: InstId) -> Option<&[i64]> {
        match &self.inst(inst).kind {
            InstKind::FieldAddr { indices, .. } => Some(indices),
            _ => None,
        }
    }

    /// Short human-readable description of where `inst` lives.
    pub fn describe(&self, inst: InstId) -> String {
        match self.loc_of(inst) {
            Some(loc) => loc.to_string(),
            None => format!(
                "{}: <unknown location>",
                self.function(self.function_of(inst)).name
            ),
        }
    }
}
